pub const CREATE_CLIPS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS clips (
        id TEXT PRIMARY KEY,
        description TEXT,
        is_hidden INTEGER NOT NULL DEFAULT 0,
        images_size INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

pub const CREATE_CLIP_ITEMS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS clip_items (
        id TEXT PRIMARY KEY,
        clip_id TEXT NOT NULL,
        site_url TEXT,
        image_id TEXT NOT NULL,
        image_file_name TEXT NOT NULL,
        image_url TEXT,
        image_width INTEGER NOT NULL,
        image_height INTEGER NOT NULL,
        image_data_size INTEGER NOT NULL,
        item_index INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (clip_id) REFERENCES clips(id) ON DELETE CASCADE
    )
";

// Tag names are not UNIQUE here: replicas may deliver the same name under
// different ids, and deduplication collapses them afterwards.
pub const CREATE_TAGS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS tags (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        is_hidden INTEGER NOT NULL DEFAULT 0
    )
";

pub const CREATE_CLIP_TAGS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS clip_tags (
        clip_id TEXT NOT NULL,
        tag_id TEXT NOT NULL,
        PRIMARY KEY (clip_id, tag_id),
        FOREIGN KEY (clip_id) REFERENCES clips(id) ON DELETE CASCADE,
        FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE
    )
";

pub const CREATE_ALBUMS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS albums (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        is_hidden INTEGER NOT NULL DEFAULT 0,
        album_index INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

pub const CREATE_ALBUM_ITEMS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS album_items (
        id TEXT PRIMARY KEY,
        album_id TEXT NOT NULL,
        clip_id TEXT NOT NULL,
        item_index INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (album_id) REFERENCES albums(id) ON DELETE CASCADE,
        FOREIGN KEY (clip_id) REFERENCES clips(id) ON DELETE CASCADE,
        UNIQUE(album_id, clip_id)
    )
";

pub const CREATE_HISTORY_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS history (
        token INTEGER PRIMARY KEY AUTOINCREMENT,
        author TEXT NOT NULL,
        entity TEXT NOT NULL,
        object_id TEXT NOT NULL,
        change TEXT NOT NULL,
        recorded_at TEXT NOT NULL
    )
";

pub const CREATE_INDEX_ITEMS_CLIP_ID: &str =
    "CREATE INDEX IF NOT EXISTS idx_clip_items_clip_id ON clip_items(clip_id)";

pub const CREATE_INDEX_ITEMS_SITE_URL: &str =
    "CREATE INDEX IF NOT EXISTS idx_clip_items_site_url ON clip_items(site_url)";

pub const CREATE_INDEX_CLIPS_CREATED_AT: &str =
    "CREATE INDEX IF NOT EXISTS idx_clips_created_at ON clips(created_at)";

pub const CREATE_INDEX_TAGS_NAME: &str =
    "CREATE INDEX IF NOT EXISTS idx_tags_name ON tags(name)";

pub const CREATE_INDEX_CLIP_TAGS_TAG_ID: &str =
    "CREATE INDEX IF NOT EXISTS idx_clip_tags_tag_id ON clip_tags(tag_id)";

pub const CREATE_INDEX_ALBUM_ITEMS_CLIP_ID: &str =
    "CREATE INDEX IF NOT EXISTS idx_album_items_clip_id ON album_items(clip_id)";

pub const ALL: &[&str] = &[
    CREATE_CLIPS_TABLE,
    CREATE_CLIP_ITEMS_TABLE,
    CREATE_TAGS_TABLE,
    CREATE_CLIP_TAGS_TABLE,
    CREATE_ALBUMS_TABLE,
    CREATE_ALBUM_ITEMS_TABLE,
    CREATE_HISTORY_TABLE,
    CREATE_INDEX_ITEMS_CLIP_ID,
    CREATE_INDEX_ITEMS_SITE_URL,
    CREATE_INDEX_CLIPS_CREATED_AT,
    CREATE_INDEX_TAGS_NAME,
    CREATE_INDEX_CLIP_TAGS_TAG_ID,
    CREATE_INDEX_ALBUM_ITEMS_CLIP_ID,
];
