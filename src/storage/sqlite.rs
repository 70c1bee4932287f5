use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, ToSql, params};
use tracing::{debug, warn};

use crate::errors::{Result, StorageError};
use super::history::{self, ChangeKind, EntityKind, HistoryBatch, HistoryToken};
use super::models::{
    Album, AlbumId, AlbumItem, AlbumItemId, AlbumRecipe, Clip, ClipCreation, ClipId, ClipItem,
    ClipItemId, ClipItemRecipe, ClipMerge, ClipPurge, ClipRecipe, ImageId, ImageSize, Tag, TagId,
    TagRecipe,
};
use super::ordering;
use super::schema;
use super::{ClipReader, ClipStorage, Transactional};

macro_rules! impl_sql_id {
    ($($name:ty),* $(,)?) => {$(
        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.0.to_string()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: uuid::Error| FromSqlError::Other(Box::new(e)))
            }
        }
    )*};
}

impl_sql_id!(ClipId, ClipItemId, TagId, AlbumId, AlbumItemId, ImageId);

const CLIP_COLUMNS: &str = "id, description, is_hidden, images_size, created_at, updated_at";

const ITEM_COLUMNS: &str = "id, clip_id, site_url, image_id, image_file_name, image_url,
    image_width, image_height, image_data_size, item_index, created_at, updated_at";

const ALBUM_COLUMNS: &str = "id, title, is_hidden, album_index, created_at, updated_at";

const ALBUM_ITEM_COLUMNS: &str = "id, album_id, clip_id, item_index, created_at, updated_at";

/// Relational backend. One connection per instance; all access is serialized
/// through the connection mutex.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    author: String,
}

struct ClipRow {
    id: ClipId,
    description: Option<String>,
    is_hidden: bool,
    images_size: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ClipRow {
    fn into_clip(self, items: Vec<ClipItem>, tags: Vec<Tag>) -> Clip {
        Clip {
            id: self.id,
            description: self.description,
            items,
            tags,
            is_hidden: self.is_hidden,
            images_size: self.images_size,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

fn row_to_clip_row(row: &Row) -> rusqlite::Result<ClipRow> {
    Ok(ClipRow {
        id: row.get(0)?,
        description: row.get(1)?,
        is_hidden: row.get(2)?,
        images_size: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn row_to_item(row: &Row) -> rusqlite::Result<ClipItem> {
    Ok(ClipItem {
        id: row.get(0)?,
        clip_id: row.get(1)?,
        site_url: row.get(2)?,
        image_id: row.get(3)?,
        image_file_name: row.get(4)?,
        image_url: row.get(5)?,
        image_size: ImageSize::new(row.get(6)?, row.get(7)?),
        image_data_size: row.get(8)?,
        index: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn tag_at(row: &Row, offset: usize) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(offset)?,
        name: row.get(offset + 1)?,
        is_hidden: row.get(offset + 2)?,
    })
}

fn row_to_tag(row: &Row) -> rusqlite::Result<Tag> {
    tag_at(row, 0)
}

fn row_to_album_item(row: &Row) -> rusqlite::Result<AlbumItem> {
    Ok(AlbumItem {
        id: row.get(0)?,
        album_id: row.get(1)?,
        clip_id: row.get(2)?,
        index: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn row_to_album(row: &Row) -> rusqlite::Result<Album> {
    Ok(Album {
        id: row.get(0)?,
        title: row.get(1)?,
        is_hidden: row.get(2)?,
        index: row.get(3)?,
        items: Vec::new(),
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

// --- Reads ---

fn fetch_items_of_clip(conn: &Connection, clip_id: ClipId) -> Result<Vec<ClipItem>> {
    let sql = format!(
        "SELECT {} FROM clip_items WHERE clip_id = ? ORDER BY item_index, id",
        ITEM_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params![clip_id], row_to_item)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items)
}

fn fetch_tags_of_clip(conn: &Connection, clip_id: ClipId) -> Result<Vec<Tag>> {
    let mut stmt = conn.prepare(
        "SELECT tags.id, tags.name, tags.is_hidden FROM clip_tags
         INNER JOIN tags ON tags.id = clip_tags.tag_id
         WHERE clip_tags.clip_id = ? ORDER BY tags.name, tags.id",
    )?;
    let tags = stmt
        .query_map(params![clip_id], row_to_tag)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(tags)
}

fn fetch_clip(conn: &Connection, id: ClipId) -> Result<Option<Clip>> {
    let sql = format!("SELECT {} FROM clips WHERE id = ?", CLIP_COLUMNS);
    let Some(row) = conn.query_row(&sql, params![id], row_to_clip_row).optional()? else {
        return Ok(None);
    };
    let items = fetch_items_of_clip(conn, id)?;
    let tags = fetch_tags_of_clip(conn, id)?;
    Ok(Some(row.into_clip(items, tags)))
}

fn fetch_all_clips(conn: &Connection) -> Result<Vec<Clip>> {
    let mut items_by_clip: HashMap<ClipId, Vec<ClipItem>> = HashMap::new();
    let sql = format!("SELECT {} FROM clip_items ORDER BY clip_id, item_index, id", ITEM_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    for item in stmt.query_map([], row_to_item)? {
        let item = item?;
        items_by_clip.entry(item.clip_id).or_default().push(item);
    }

    let mut tags_by_clip: HashMap<ClipId, Vec<Tag>> = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT clip_tags.clip_id, tags.id, tags.name, tags.is_hidden FROM clip_tags
         INNER JOIN tags ON tags.id = clip_tags.tag_id ORDER BY tags.name, tags.id",
    )?;
    let links = stmt.query_map([], |row| Ok((row.get::<_, ClipId>(0)?, tag_at(row, 1)?)))?;
    for link in links {
        let (clip_id, tag) = link?;
        tags_by_clip.entry(clip_id).or_default().push(tag);
    }

    let sql = format!("SELECT {} FROM clips ORDER BY created_at DESC, id", CLIP_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], row_to_clip_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let items = items_by_clip.remove(&row.id).unwrap_or_default();
            let tags = tags_by_clip.remove(&row.id).unwrap_or_default();
            row.into_clip(items, tags)
        })
        .collect())
}

fn fetch_item(conn: &Connection, id: ClipItemId) -> Result<Option<ClipItem>> {
    let sql = format!("SELECT {} FROM clip_items WHERE id = ?", ITEM_COLUMNS);
    Ok(conn.query_row(&sql, params![id], row_to_item).optional()?)
}

fn fetch_tag(conn: &Connection, id: TagId) -> Result<Option<Tag>> {
    Ok(conn
        .query_row("SELECT id, name, is_hidden FROM tags WHERE id = ?", params![id], row_to_tag)
        .optional()?)
}

fn fetch_all_tags(conn: &Connection) -> Result<Vec<Tag>> {
    let mut stmt = conn.prepare("SELECT id, name, is_hidden FROM tags ORDER BY name, id")?;
    let tags = stmt
        .query_map([], row_to_tag)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(tags)
}

fn fetch_tag_ids_named(conn: &Connection, name: &str) -> Result<Vec<TagId>> {
    let mut stmt = conn.prepare("SELECT id FROM tags WHERE name = ? ORDER BY id")?;
    let ids = stmt
        .query_map(params![name], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn fetch_album_items(conn: &Connection, album_id: AlbumId) -> Result<Vec<AlbumItem>> {
    let sql = format!(
        "SELECT {} FROM album_items WHERE album_id = ? ORDER BY item_index, id",
        ALBUM_ITEM_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params![album_id], row_to_album_item)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items)
}

fn fetch_album(conn: &Connection, id: AlbumId) -> Result<Option<Album>> {
    let sql = format!("SELECT {} FROM albums WHERE id = ?", ALBUM_COLUMNS);
    let Some(mut album) = conn.query_row(&sql, params![id], row_to_album).optional()? else {
        return Ok(None);
    };
    album.items = fetch_album_items(conn, id)?;
    Ok(Some(album))
}

fn fetch_all_albums(conn: &Connection) -> Result<Vec<Album>> {
    let mut items_by_album: HashMap<AlbumId, Vec<AlbumItem>> = HashMap::new();
    let sql = format!(
        "SELECT {} FROM album_items ORDER BY album_id, item_index, id",
        ALBUM_ITEM_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    for item in stmt.query_map([], row_to_album_item)? {
        let item = item?;
        items_by_album.entry(item.album_id).or_default().push(item);
    }

    let sql = format!("SELECT {} FROM albums ORDER BY album_index, id", ALBUM_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let mut albums = stmt
        .query_map([], row_to_album)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for album in albums.iter_mut() {
        album.items = items_by_album.remove(&album.id).unwrap_or_default();
    }
    Ok(albums)
}

fn fetch_album_ids_containing(conn: &Connection, clip_id: ClipId) -> Result<Vec<AlbumId>> {
    let mut stmt = conn.prepare("SELECT album_id FROM album_items WHERE clip_id = ?")?;
    let ids = stmt
        .query_map(params![clip_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn require_clip(conn: &Connection, id: ClipId) -> Result<Clip> {
    fetch_clip(conn, id)?.ok_or_else(|| StorageError::NotFound(format!("clip {}", id)))
}

fn require_album(conn: &Connection, id: AlbumId) -> Result<Album> {
    fetch_album(conn, id)?.ok_or_else(|| StorageError::NotFound(format!("album {}", id)))
}

fn require_tag(conn: &Connection, id: TagId) -> Result<Tag> {
    fetch_tag(conn, id)?.ok_or_else(|| StorageError::NotFound(format!("tag {}", id)))
}

// --- Writes ---

/// Write helpers bound to one connection and the author recorded in history.
struct Writer<'a> {
    conn: &'a Connection,
    author: &'a str,
}

impl Writer<'_> {
    fn record(&self, entity: EntityKind, id: impl ToString, kind: ChangeKind) -> Result<()> {
        history::record(self.conn, self.author, entity, &id.to_string(), kind)
    }

    fn insert_clip_row(&self, recipe: &ClipRecipe, images_size: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO clips (id, description, is_hidden, images_size, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                recipe.id,
                recipe.description,
                recipe.is_hidden,
                images_size,
                recipe.created_at,
                recipe.updated_at,
            ],
        )?;
        self.record(EntityKind::Clip, recipe.id, ChangeKind::Insert)
    }

    fn insert_item(&self, clip_id: ClipId, item: &ClipItemRecipe) -> Result<()> {
        self.conn.execute(
            "INSERT INTO clip_items (id, clip_id, site_url, image_id, image_file_name, image_url,
                 image_width, image_height, image_data_size, item_index, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                item.id,
                clip_id,
                item.site_url,
                item.image_id,
                item.image_file_name,
                item.image_url,
                item.image_size.width,
                item.image_size.height,
                item.image_data_size,
                item.index,
                item.created_at,
                item.updated_at,
            ],
        )?;
        self.record(EntityKind::ClipItem, item.id, ChangeKind::Insert)
    }

    fn link_tag(&self, clip_id: ClipId, tag_id: TagId) -> Result<bool> {
        let changes = self.conn.execute(
            "INSERT OR IGNORE INTO clip_tags (clip_id, tag_id) VALUES (?, ?)",
            params![clip_id, tag_id],
        )?;
        Ok(changes > 0)
    }

    fn unlink_tag(&self, clip_id: ClipId, tag_id: TagId) -> Result<bool> {
        let changes = self.conn.execute(
            "DELETE FROM clip_tags WHERE clip_id = ? AND tag_id = ?",
            params![clip_id, tag_id],
        )?;
        Ok(changes > 0)
    }

    fn touch_clip(&self, id: ClipId, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute("UPDATE clips SET updated_at = ? WHERE id = ?", params![now, id])?;
        self.record(EntityKind::Clip, id, ChangeKind::Update)
    }

    fn refresh_images_size(&self, id: ClipId) -> Result<()> {
        self.conn.execute(
            "UPDATE clips SET images_size =
                (SELECT COALESCE(SUM(image_data_size), 0) FROM clip_items WHERE clip_id = ?)
             WHERE id = ?",
            params![id, id],
        )?;
        Ok(())
    }

    fn set_item_index(&self, id: ClipItemId, index: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE clip_items SET item_index = ?, updated_at = ? WHERE id = ?",
            params![index, now, id],
        )?;
        self.record(EntityKind::ClipItem, id, ChangeKind::Update)
    }

    fn renumber_clip_items(&self, clip_id: ClipId, now: DateTime<Utc>) -> Result<()> {
        let entries: Vec<(ClipItemId, i64)> = fetch_items_of_clip(self.conn, clip_id)?
            .iter()
            .map(|i| (i.id, i.index))
            .collect();
        for (id, index) in ordering::renumber(&entries) {
            self.set_item_index(id, index, now)?;
        }
        Ok(())
    }

    fn insert_album_item(&self, album_id: AlbumId, clip_id: ClipId, index: i64, now: DateTime<Utc>) -> Result<()> {
        let id = AlbumItemId::new();
        self.conn.execute(
            "INSERT INTO album_items (id, album_id, clip_id, item_index, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![id, album_id, clip_id, index, now, now],
        )?;
        self.record(EntityKind::AlbumItem, id, ChangeKind::Insert)
    }

    fn set_album_item_index(&self, id: AlbumItemId, index: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE album_items SET item_index = ?, updated_at = ? WHERE id = ?",
            params![index, now, id],
        )?;
        self.record(EntityKind::AlbumItem, id, ChangeKind::Update)
    }

    fn touch_album(&self, id: AlbumId, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute("UPDATE albums SET updated_at = ? WHERE id = ?", params![now, id])?;
        self.record(EntityKind::Album, id, ChangeKind::Update)
    }

    fn renumber_album_items(&self, album_id: AlbumId, now: DateTime<Utc>) -> Result<()> {
        let entries: Vec<(AlbumItemId, i64)> = fetch_album_items(self.conn, album_id)?
            .iter()
            .map(|i| (i.id, i.index))
            .collect();
        for (id, index) in ordering::renumber(&entries) {
            self.set_album_item_index(id, index, now)?;
        }
        Ok(())
    }

    /// Rewrites an album so its members are exactly `order`, in that order.
    fn rewrite_album_members(&self, album_id: AlbumId, order: &[ClipId], now: DateTime<Utc>) -> Result<()> {
        let existing = fetch_album_items(self.conn, album_id)?;
        for item in existing.iter().filter(|i| !order.contains(&i.clip_id)) {
            self.conn
                .execute("DELETE FROM album_items WHERE id = ?", params![item.id])?;
            self.record(EntityKind::AlbumItem, item.id, ChangeKind::Delete)?;
        }
        for (clip_id, index) in ordering::dense_positions(order) {
            match existing.iter().find(|i| i.clip_id == clip_id) {
                Some(item) if item.index == index => {}
                Some(item) => self.set_album_item_index(item.id, index, now)?,
                None => self.insert_album_item(album_id, clip_id, index, now)?,
            }
        }
        self.touch_album(album_id, now)
    }

    fn renumber_albums(&self, now: DateTime<Utc>) -> Result<()> {
        let entries: Vec<(AlbumId, i64)> = fetch_all_albums(self.conn)?
            .iter()
            .map(|a| (a.id, a.index))
            .collect();
        for (id, index) in ordering::renumber(&entries) {
            self.set_album_index(id, index, now)?;
        }
        Ok(())
    }

    fn set_album_index(&self, id: AlbumId, index: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE albums SET album_index = ?, updated_at = ? WHERE id = ?",
            params![index, now, id],
        )?;
        self.record(EntityKind::Album, id, ChangeKind::Update)
    }

    fn delete_clip_row(&self, clip: &Clip) -> Result<()> {
        self.conn.execute("DELETE FROM clips WHERE id = ?", params![clip.id])?;
        for item in &clip.items {
            self.record(EntityKind::ClipItem, item.id, ChangeKind::Delete)?;
        }
        self.record(EntityKind::Clip, clip.id, ChangeKind::Delete)
    }

    fn move_item(&self, item_id: ClipItemId, clip_id: ClipId, index: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE clip_items SET clip_id = ?, item_index = ?, updated_at = ? WHERE id = ?",
            params![clip_id, index, now, item_id],
        )?;
        self.record(EntityKind::ClipItem, item_id, ChangeKind::Update)
    }

    fn create_clip(&self, recipe: &ClipRecipe, overwrite: bool) -> Result<ClipCreation> {
        let items = recipe.normalized_items();
        let images_size: i64 = items.iter().map(|i| i.image_data_size).sum();

        for item in &items {
            if let Some(other) = fetch_item(self.conn, item.id)?
                && !(overwrite && other.clip_id == recipe.id)
            {
                return Err(StorageError::Duplicated(format!("clip item {}", item.id)));
            }
        }

        if let Some(existing) = fetch_clip(self.conn, recipe.id)? {
            if !overwrite {
                return Err(StorageError::Duplicated(format!("clip {}", recipe.id)));
            }
            let now = Utc::now();
            self.conn
                .execute("DELETE FROM clip_items WHERE clip_id = ?", params![recipe.id])?;
            for item in &existing.items {
                self.record(EntityKind::ClipItem, item.id, ChangeKind::Delete)?;
            }
            for item in &items {
                self.insert_item(recipe.id, item)?;
            }
            // Tag links survive an overwrite.
            self.conn.execute(
                "UPDATE clips SET description = ?, is_hidden = ?, images_size = ?, updated_at = ?
                 WHERE id = ?",
                params![recipe.description, recipe.is_hidden, images_size, now, recipe.id],
            )?;
            self.record(EntityKind::Clip, recipe.id, ChangeKind::Update)?;
            let clip = require_clip(self.conn, recipe.id)?;
            return Ok(ClipCreation {
                clip,
                replaced: Some(existing),
            });
        }

        self.insert_clip_row(recipe, images_size)?;
        for item in &items {
            self.insert_item(recipe.id, item)?;
        }
        for tag_id in ordering::unique(&recipe.tag_ids) {
            if fetch_tag(self.conn, tag_id)?.is_none() {
                warn!(clip = %recipe.id, tag = %tag_id, "dropping link to missing tag");
                continue;
            }
            self.link_tag(recipe.id, tag_id)?;
        }
        Ok(ClipCreation {
            clip: require_clip(self.conn, recipe.id)?,
            replaced: None,
        })
    }

    fn create_tag(&self, recipe: &TagRecipe) -> Result<Tag> {
        if fetch_tag(self.conn, recipe.id)?.is_some() {
            return Err(StorageError::Duplicated(format!("tag {}", recipe.id)));
        }
        if !fetch_tag_ids_named(self.conn, &recipe.name)?.is_empty() {
            return Err(StorageError::Duplicated(format!("tag named {:?}", recipe.name)));
        }
        self.conn.execute(
            "INSERT INTO tags (id, name, is_hidden) VALUES (?, ?, ?)",
            params![recipe.id, recipe.name, recipe.is_hidden],
        )?;
        self.record(EntityKind::Tag, recipe.id, ChangeKind::Insert)?;
        require_tag(self.conn, recipe.id)
    }

    fn create_album(&self, recipe: &AlbumRecipe) -> Result<Album> {
        if fetch_album(self.conn, recipe.id)?.is_some() {
            return Err(StorageError::Duplicated(format!("album {}", recipe.id)));
        }
        let albums = fetch_all_albums(self.conn)?;
        if albums.iter().any(|a| a.title == recipe.title) {
            return Err(StorageError::Duplicated(format!("album titled {:?}", recipe.title)));
        }
        let index = ordering::next_index(albums.iter().map(|a| a.index));
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO albums (id, title, is_hidden, album_index, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![recipe.id, recipe.title, recipe.is_hidden, index, now, now],
        )?;
        self.record(EntityKind::Album, recipe.id, ChangeKind::Insert)?;
        require_album(self.conn, recipe.id)
    }

    fn update_clips_hiding(&self, ids: &[ClipId], is_hidden: bool) -> Result<Vec<Clip>> {
        let clips = ordering::resolve_all(ids, "clip", |id| fetch_clip(self.conn, id))?;
        let now = Utc::now();
        for clip in &clips {
            self.conn.execute(
                "UPDATE clips SET is_hidden = ?, updated_at = ? WHERE id = ?",
                params![is_hidden, now, clip.id],
            )?;
            self.record(EntityKind::Clip, clip.id, ChangeKind::Update)?;
        }
        clips.iter().map(|c| require_clip(self.conn, c.id)).collect()
    }

    fn resolve_clips_and_tags(&self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<(Vec<Clip>, Vec<Tag>)> {
        let clips = ordering::resolve_all(ids, "clip", |id| fetch_clip(self.conn, id))?;
        let tags = ordering::resolve_all(tag_ids, "tag", |id| fetch_tag(self.conn, id))?;
        Ok((clips, tags))
    }

    fn update_clips_adding_tags(&self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<Vec<Clip>> {
        let (clips, tags) = self.resolve_clips_and_tags(ids, tag_ids)?;
        let now = Utc::now();
        for clip in &clips {
            let mut changed = false;
            for tag in &tags {
                changed |= self.link_tag(clip.id, tag.id)?;
            }
            if changed {
                self.touch_clip(clip.id, now)?;
            }
        }
        clips.iter().map(|c| require_clip(self.conn, c.id)).collect()
    }

    fn update_clips_deleting_tags(&self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<Vec<Clip>> {
        let (clips, tags) = self.resolve_clips_and_tags(ids, tag_ids)?;
        let now = Utc::now();
        for clip in &clips {
            let mut changed = false;
            for tag in &tags {
                changed |= self.unlink_tag(clip.id, tag.id)?;
            }
            if changed {
                self.touch_clip(clip.id, now)?;
            }
        }
        clips.iter().map(|c| require_clip(self.conn, c.id)).collect()
    }

    fn update_clips_replacing_tags(&self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<Vec<Clip>> {
        let (clips, tags) = self.resolve_clips_and_tags(ids, tag_ids)?;
        let now = Utc::now();
        for clip in &clips {
            self.conn
                .execute("DELETE FROM clip_tags WHERE clip_id = ?", params![clip.id])?;
            for tag in &tags {
                self.link_tag(clip.id, tag.id)?;
            }
            self.touch_clip(clip.id, now)?;
        }
        clips.iter().map(|c| require_clip(self.conn, c.id)).collect()
    }

    fn update_clip_reordering_items(&self, id: ClipId, item_ids: &[ClipItemId]) -> Result<Clip> {
        let clip = require_clip(self.conn, id)?;
        ordering::require_same_members(item_ids, &clip.item_ids(), "clip item")?;
        let now = Utc::now();
        for (item_id, index) in ordering::dense_positions(item_ids) {
            let current = clip.items.iter().find(|i| i.id == item_id).map(|i| i.index);
            if current != Some(index) {
                self.set_item_index(item_id, index, now)?;
            }
        }
        self.touch_clip(id, now)?;
        require_clip(self.conn, id)
    }

    fn update_clip_items_site_url(&self, item_ids: &[ClipItemId], site_url: Option<&str>) -> Result<Vec<ClipItem>> {
        let items = ordering::resolve_all(item_ids, "clip item", |id| fetch_item(self.conn, id))?;
        let now = Utc::now();
        for item in &items {
            self.conn.execute(
                "UPDATE clip_items SET site_url = ?, updated_at = ? WHERE id = ?",
                params![site_url, now, item.id],
            )?;
            self.record(EntityKind::ClipItem, item.id, ChangeKind::Update)?;
        }
        items
            .iter()
            .map(|i| {
                fetch_item(self.conn, i.id)?
                    .ok_or_else(|| StorageError::NotFound(format!("clip item {}", i.id)))
            })
            .collect()
    }

    fn update_album_adding_clips(&self, id: AlbumId, clip_ids: &[ClipId]) -> Result<Album> {
        let album = require_album(self.conn, id)?;
        let clips = ordering::resolve_all(clip_ids, "clip", |cid| fetch_clip(self.conn, cid))?;
        if let Some(existing) = clips.iter().find(|c| album.contains(c.id)) {
            return Err(StorageError::Duplicated(format!(
                "clip {} already in album {}",
                existing.id, id
            )));
        }
        let now = Utc::now();
        let start = ordering::next_index(album.items.iter().map(|i| i.index));
        for (offset, clip) in clips.iter().enumerate() {
            self.insert_album_item(id, clip.id, start + offset as i64, now)?;
        }
        self.touch_album(id, now)?;
        require_album(self.conn, id)
    }

    fn update_album_deleting_clips(&self, id: AlbumId, clip_ids: &[ClipId]) -> Result<Album> {
        let album = require_album(self.conn, id)?;
        if let Some(missing) = clip_ids.iter().find(|cid| !album.contains(**cid)) {
            return Err(StorageError::NotFound(format!("clip {} in album {}", missing, id)));
        }
        let now = Utc::now();
        for item in album.items.iter().filter(|i| clip_ids.contains(&i.clip_id)) {
            self.conn
                .execute("DELETE FROM album_items WHERE id = ?", params![item.id])?;
            self.record(EntityKind::AlbumItem, item.id, ChangeKind::Delete)?;
        }
        self.renumber_album_items(id, now)?;
        self.touch_album(id, now)?;
        require_album(self.conn, id)
    }

    fn update_album_reordering_clips(&self, id: AlbumId, clip_ids: &[ClipId]) -> Result<Album> {
        let album = require_album(self.conn, id)?;
        ordering::require_same_members(clip_ids, &album.clip_ids(), "album clip")?;
        let now = Utc::now();
        for (clip_id, index) in ordering::dense_positions(clip_ids) {
            if let Some(item) = album.items.iter().find(|i| i.clip_id == clip_id)
                && item.index != index
            {
                self.set_album_item_index(item.id, index, now)?;
            }
        }
        self.touch_album(id, now)?;
        require_album(self.conn, id)
    }

    fn update_album_title(&self, id: AlbumId, title: &str) -> Result<Album> {
        require_album(self.conn, id)?;
        let clash: Option<AlbumId> = self
            .conn
            .query_row(
                "SELECT id FROM albums WHERE title = ? AND id != ? LIMIT 1",
                params![title, id],
                |row| row.get(0),
            )
            .optional()?;
        if clash.is_some() {
            return Err(StorageError::Duplicated(format!("album titled {:?}", title)));
        }
        self.conn.execute(
            "UPDATE albums SET title = ?, updated_at = ? WHERE id = ?",
            params![title, Utc::now(), id],
        )?;
        self.record(EntityKind::Album, id, ChangeKind::Update)?;
        require_album(self.conn, id)
    }

    fn update_album_hiding(&self, id: AlbumId, is_hidden: bool) -> Result<Album> {
        require_album(self.conn, id)?;
        self.conn.execute(
            "UPDATE albums SET is_hidden = ?, updated_at = ? WHERE id = ?",
            params![is_hidden, Utc::now(), id],
        )?;
        self.record(EntityKind::Album, id, ChangeKind::Update)?;
        require_album(self.conn, id)
    }

    fn update_albums_reordering(&self, ids: &[AlbumId]) -> Result<Vec<Album>> {
        let albums = fetch_all_albums(self.conn)?;
        let current: Vec<AlbumId> = albums.iter().map(|a| a.id).collect();
        ordering::require_same_members(ids, &current, "album")?;
        let now = Utc::now();
        for (id, index) in ordering::dense_positions(ids) {
            if albums.iter().any(|a| a.id == id && a.index != index) {
                self.set_album_index(id, index, now)?;
            }
        }
        fetch_all_albums(self.conn)
    }

    fn update_tag_name(&self, id: TagId, name: &str) -> Result<Tag> {
        require_tag(self.conn, id)?;
        if fetch_tag_ids_named(self.conn, name)?.iter().any(|other| *other != id) {
            return Err(StorageError::Duplicated(format!("tag named {:?}", name)));
        }
        self.conn
            .execute("UPDATE tags SET name = ? WHERE id = ?", params![name, id])?;
        self.record(EntityKind::Tag, id, ChangeKind::Update)?;
        require_tag(self.conn, id)
    }

    fn update_tag_hiding(&self, id: TagId, is_hidden: bool) -> Result<Tag> {
        require_tag(self.conn, id)?;
        self.conn
            .execute("UPDATE tags SET is_hidden = ? WHERE id = ?", params![is_hidden, id])?;
        self.record(EntityKind::Tag, id, ChangeKind::Update)?;
        require_tag(self.conn, id)
    }

    fn delete_clips(&self, ids: &[ClipId]) -> Result<Vec<Clip>> {
        let clips = ordering::resolve_all(ids, "clip", |id| fetch_clip(self.conn, id))?;
        let mut affected_albums: Vec<AlbumId> = Vec::new();
        for clip in &clips {
            for album_id in fetch_album_ids_containing(self.conn, clip.id)? {
                if !affected_albums.contains(&album_id) {
                    affected_albums.push(album_id);
                }
            }
            self.delete_clip_row(clip)?;
        }
        let now = Utc::now();
        for album_id in affected_albums {
            self.renumber_album_items(album_id, now)?;
        }
        Ok(clips)
    }

    fn delete_clip_item(&self, id: ClipItemId) -> Result<ClipItem> {
        let item = fetch_item(self.conn, id)?
            .ok_or_else(|| StorageError::NotFound(format!("clip item {}", id)))?;
        let now = Utc::now();
        self.conn.execute("DELETE FROM clip_items WHERE id = ?", params![id])?;
        self.record(EntityKind::ClipItem, id, ChangeKind::Delete)?;
        self.renumber_clip_items(item.clip_id, now)?;
        self.refresh_images_size(item.clip_id)?;
        self.touch_clip(item.clip_id, now)?;
        Ok(item)
    }

    fn delete_album(&self, id: AlbumId) -> Result<Album> {
        let album = require_album(self.conn, id)?;
        self.conn.execute("DELETE FROM albums WHERE id = ?", params![id])?;
        for item in &album.items {
            self.record(EntityKind::AlbumItem, item.id, ChangeKind::Delete)?;
        }
        self.record(EntityKind::Album, id, ChangeKind::Delete)?;
        self.renumber_albums(Utc::now())?;
        Ok(album)
    }

    fn delete_tags(&self, ids: &[TagId]) -> Result<Vec<Tag>> {
        let tags = ordering::resolve_all(ids, "tag", |id| fetch_tag(self.conn, id))?;
        for tag in &tags {
            self.conn.execute("DELETE FROM tags WHERE id = ?", params![tag.id])?;
            self.record(EntityKind::Tag, tag.id, ChangeKind::Delete)?;
        }
        Ok(tags)
    }

    fn purge_clip_items(&self, id: ClipId) -> Result<ClipPurge> {
        let original = require_clip(self.conn, id)?;
        if original.items.is_empty() {
            return Err(StorageError::InvalidParameter(format!("clip {} has no items", id)));
        }
        let now = Utc::now();
        let mut created_ids = Vec::with_capacity(original.items.len());
        for item in &original.items {
            let recipe = ClipRecipe {
                id: ClipId::new(),
                description: original.description.clone(),
                items: Vec::new(),
                tag_ids: original.tag_ids(),
                is_hidden: original.is_hidden,
                created_at: original.created_at,
                updated_at: now,
            };
            self.insert_clip_row(&recipe, item.image_data_size)?;
            self.move_item(item.id, recipe.id, 1, now)?;
            for tag in &original.tags {
                self.link_tag(recipe.id, tag.id)?;
            }
            created_ids.push(recipe.id);
        }
        for album_id in fetch_album_ids_containing(self.conn, id)? {
            let album = require_album(self.conn, album_id)?;
            if let Some(order) = ordering::splice_members(&album.clip_ids(), &[id], &created_ids) {
                self.rewrite_album_members(album_id, &order, now)?;
            }
        }
        self.conn.execute("DELETE FROM clips WHERE id = ?", params![id])?;
        self.record(EntityKind::Clip, id, ChangeKind::Delete)?;
        let created = created_ids
            .iter()
            .map(|cid| require_clip(self.conn, *cid))
            .collect::<Result<Vec<_>>>()?;
        Ok(ClipPurge { original, created })
    }

    fn merge_clip_items(&self, item_ids: &[ClipItemId], tag_ids: &[TagId], clip_ids: &[ClipId]) -> Result<ClipMerge> {
        if clip_ids.is_empty() {
            return Err(StorageError::InvalidParameter("no clips to merge".into()));
        }
        let (sources, tags) = self.resolve_clips_and_tags(clip_ids, tag_ids)?;
        let all_items: Vec<ClipItemId> = sources.iter().flat_map(|c| c.item_ids()).collect();
        ordering::require_same_members(item_ids, &all_items, "merged item")?;
        // Merged blobs share one directory.
        ordering::require_distinct(
            sources
                .iter()
                .flat_map(|c| c.items.iter().map(|i| i.image_file_name.as_str())),
            "merged image file name",
        )?;

        let now = Utc::now();
        let source_ids: Vec<ClipId> = sources.iter().map(|c| c.id).collect();
        let recipe = ClipRecipe {
            id: ClipId::new(),
            description: None,
            items: Vec::new(),
            tag_ids: Vec::new(),
            is_hidden: false,
            created_at: now,
            updated_at: now,
        };
        self.insert_clip_row(&recipe, 0)?;
        for (item_id, index) in ordering::dense_positions(item_ids) {
            self.move_item(item_id, recipe.id, index, now)?;
        }
        self.refresh_images_size(recipe.id)?;
        for tag in &tags {
            self.link_tag(recipe.id, tag.id)?;
        }

        let mut albums: Vec<AlbumId> = Vec::new();
        for source in &source_ids {
            for album_id in fetch_album_ids_containing(self.conn, *source)? {
                if !albums.contains(&album_id) {
                    albums.push(album_id);
                }
            }
        }
        for album_id in albums {
            let album = require_album(self.conn, album_id)?;
            if let Some(order) = ordering::splice_members(&album.clip_ids(), &source_ids, &[recipe.id]) {
                self.rewrite_album_members(album_id, &order, now)?;
            }
        }

        for source in &source_ids {
            self.conn.execute("DELETE FROM clips WHERE id = ?", params![source])?;
            self.record(EntityKind::Clip, source, ChangeKind::Delete)?;
        }
        Ok(ClipMerge {
            merged: require_clip(self.conn, recipe.id)?,
            removed: sources,
        })
    }

    fn deduplicate_tag(&self, id: TagId) -> Result<Vec<TagId>> {
        let winner = require_tag(self.conn, id)?;
        let losers: Vec<TagId> = fetch_tag_ids_named(self.conn, &winner.name)?
            .into_iter()
            .filter(|other| *other != id)
            .collect();
        for loser in &losers {
            self.conn.execute(
                "INSERT OR IGNORE INTO clip_tags (clip_id, tag_id)
                 SELECT clip_id, ? FROM clip_tags WHERE tag_id = ?",
                params![id, loser],
            )?;
            self.conn.execute("DELETE FROM tags WHERE id = ?", params![loser])?;
            self.record(EntityKind::Tag, loser, ChangeKind::Delete)?;
        }
        if !losers.is_empty() {
            debug!(tag = %id, removed = losers.len(), "collapsed duplicated tags");
        }
        Ok(losers)
    }
}

impl SqliteStorage {
    pub fn new(conn: Connection) -> Result<Self> {
        Self::with_author(conn, history::new_author())
    }

    /// `author` tags every history row written through this connection.
    pub fn with_author(conn: Connection, author: impl Into<String>) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        for statement in schema::ALL {
            conn.execute(statement, [])?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
            author: author.into(),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::new(conn)
    }

    pub fn open(path: &Path, author: impl Into<String>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_author(conn, author)
    }

    /// Opens a connection that can only read; writes fail with `Internal`.
    pub fn open_read_only(path: &Path, author: impl Into<String>) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn: Mutex::new(conn),
            author: author.into(),
        })
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    /// Locks the connection for a write, opening an implicit scope when no
    /// transaction is running. The scope stays open until committed or until
    /// the next `begin_transaction` discards it.
    fn write_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        let conn = self.conn.lock();
        if conn.is_autocommit() {
            debug!("opening implicit write scope");
            conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        Ok(conn)
    }

    fn write<T>(&self, f: impl FnOnce(&Writer<'_>) -> Result<T>) -> Result<T> {
        let conn = self.write_conn()?;
        let writer = Writer {
            conn: &conn,
            author: &self.author,
        };
        f(&writer)
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// History rows after `after` that another author wrote.
    pub fn changes_since(&self, after: Option<HistoryToken>) -> Result<HistoryBatch> {
        self.read(|conn| history::read_since(conn, after, &self.author))
    }

    pub fn purge_history(&self, through: HistoryToken) -> Result<usize> {
        self.read(|conn| history::purge_before(conn, through))
    }

    /// Lands tags delivered by a replica. Names are not checked for uniqueness:
    /// the replica validated them against its own data, and collisions are
    /// repaired by deduplication.
    pub fn import_remote_tags(&self, author: &str, tags: &[Tag]) -> Result<()> {
        let conn = self.conn.lock();
        let owns_scope = conn.is_autocommit();
        if owns_scope {
            conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        let result = (|| -> Result<()> {
            for tag in tags {
                let existed: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM tags WHERE id = ?)",
                    params![tag.id],
                    |row| row.get(0),
                )?;
                // An upsert keeps the row, so clip_tags links survive a rename or hide.
                conn.execute(
                    "INSERT INTO tags (id, name, is_hidden) VALUES (?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET name = excluded.name, is_hidden = excluded.is_hidden",
                    params![tag.id, tag.name, tag.is_hidden],
                )?;
                let kind = if existed { ChangeKind::Update } else { ChangeKind::Insert };
                history::record(&conn, author, EntityKind::Tag, &tag.id.to_string(), kind)?;
            }
            Ok(())
        })();
        if owns_scope {
            match &result {
                Ok(()) => conn.execute_batch("COMMIT")?,
                Err(_) => conn.execute_batch("ROLLBACK")?,
            }
        }
        result
    }

    #[cfg(test)]
    pub(crate) fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        f(&self.conn.lock())
    }
}

impl Transactional for SqliteStorage {
    fn is_in_transaction(&self) -> bool {
        !self.conn.lock().is_autocommit()
    }

    fn begin_transaction(&self) -> Result<()> {
        let conn = self.conn.lock();
        if !conn.is_autocommit() {
            warn!("discarding uncommitted changes left in the write context");
            conn.execute_batch("ROLLBACK")?;
        }
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit_transaction(&self) -> Result<()> {
        let conn = self.conn.lock();
        if !conn.is_autocommit() {
            conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    fn cancel_transaction_if_needed(&self) -> Result<()> {
        let conn = self.conn.lock();
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }
}

impl ClipReader for SqliteStorage {
    fn read_clip(&self, id: ClipId) -> Result<Option<Clip>> {
        self.read(|conn| fetch_clip(conn, id))
    }

    fn read_all_clips(&self) -> Result<Vec<Clip>> {
        self.read(fetch_all_clips)
    }

    fn read_clip_item(&self, id: ClipItemId) -> Result<Option<ClipItem>> {
        self.read(|conn| fetch_item(conn, id))
    }

    fn read_tag(&self, id: TagId) -> Result<Option<Tag>> {
        self.read(|conn| fetch_tag(conn, id))
    }

    fn read_all_tags(&self) -> Result<Vec<Tag>> {
        self.read(fetch_all_tags)
    }

    fn read_album(&self, id: AlbumId) -> Result<Option<Album>> {
        self.read(|conn| fetch_album(conn, id))
    }

    fn read_all_albums(&self) -> Result<Vec<Album>> {
        self.read(fetch_all_albums)
    }
}

impl ClipStorage for SqliteStorage {
    fn create_clip(&self, recipe: &ClipRecipe, overwrite: bool) -> Result<ClipCreation> {
        self.write(|w| w.create_clip(recipe, overwrite))
    }

    fn create_tag(&self, recipe: &TagRecipe) -> Result<Tag> {
        self.write(|w| w.create_tag(recipe))
    }

    fn create_album(&self, recipe: &AlbumRecipe) -> Result<Album> {
        self.write(|w| w.create_album(recipe))
    }

    fn update_clips_hiding(&self, ids: &[ClipId], is_hidden: bool) -> Result<Vec<Clip>> {
        self.write(|w| w.update_clips_hiding(ids, is_hidden))
    }

    fn update_clips_adding_tags(&self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<Vec<Clip>> {
        self.write(|w| w.update_clips_adding_tags(ids, tag_ids))
    }

    fn update_clips_deleting_tags(&self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<Vec<Clip>> {
        self.write(|w| w.update_clips_deleting_tags(ids, tag_ids))
    }

    fn update_clips_replacing_tags(&self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<Vec<Clip>> {
        self.write(|w| w.update_clips_replacing_tags(ids, tag_ids))
    }

    fn update_clip_reordering_items(&self, id: ClipId, item_ids: &[ClipItemId]) -> Result<Clip> {
        self.write(|w| w.update_clip_reordering_items(id, item_ids))
    }

    fn update_clip_items_site_url(&self, item_ids: &[ClipItemId], site_url: Option<&str>) -> Result<Vec<ClipItem>> {
        self.write(|w| w.update_clip_items_site_url(item_ids, site_url))
    }

    fn update_album_adding_clips(&self, id: AlbumId, clip_ids: &[ClipId]) -> Result<Album> {
        self.write(|w| w.update_album_adding_clips(id, clip_ids))
    }

    fn update_album_deleting_clips(&self, id: AlbumId, clip_ids: &[ClipId]) -> Result<Album> {
        self.write(|w| w.update_album_deleting_clips(id, clip_ids))
    }

    fn update_album_reordering_clips(&self, id: AlbumId, clip_ids: &[ClipId]) -> Result<Album> {
        self.write(|w| w.update_album_reordering_clips(id, clip_ids))
    }

    fn update_album_title(&self, id: AlbumId, title: &str) -> Result<Album> {
        self.write(|w| w.update_album_title(id, title))
    }

    fn update_album_hiding(&self, id: AlbumId, is_hidden: bool) -> Result<Album> {
        self.write(|w| w.update_album_hiding(id, is_hidden))
    }

    fn update_albums_reordering(&self, ids: &[AlbumId]) -> Result<Vec<Album>> {
        self.write(|w| w.update_albums_reordering(ids))
    }

    fn update_tag_name(&self, id: TagId, name: &str) -> Result<Tag> {
        self.write(|w| w.update_tag_name(id, name))
    }

    fn update_tag_hiding(&self, id: TagId, is_hidden: bool) -> Result<Tag> {
        self.write(|w| w.update_tag_hiding(id, is_hidden))
    }

    fn delete_clips(&self, ids: &[ClipId]) -> Result<Vec<Clip>> {
        self.write(|w| w.delete_clips(ids))
    }

    fn delete_clip_item(&self, id: ClipItemId) -> Result<ClipItem> {
        self.write(|w| w.delete_clip_item(id))
    }

    fn delete_album(&self, id: AlbumId) -> Result<Album> {
        self.write(|w| w.delete_album(id))
    }

    fn delete_tags(&self, ids: &[TagId]) -> Result<Vec<Tag>> {
        self.write(|w| w.delete_tags(ids))
    }

    fn purge_clip_items(&self, id: ClipId) -> Result<ClipPurge> {
        self.write(|w| w.purge_clip_items(id))
    }

    fn merge_clip_items(&self, item_ids: &[ClipItemId], tag_ids: &[TagId], clip_ids: &[ClipId]) -> Result<ClipMerge> {
        self.write(|w| w.merge_clip_items(item_ids, tag_ids, clip_ids))
    }

    fn deduplicate_tag(&self, id: TagId) -> Result<Vec<TagId>> {
        self.write(|w| w.deduplicate_tag(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_storage() -> SqliteStorage {
        SqliteStorage::in_memory().unwrap()
    }

    fn recipe(names: &[&str]) -> ClipRecipe {
        ClipRecipe::new(
            names
                .iter()
                .enumerate()
                .map(|(i, name)| ClipItemRecipe::new(*name, i as i64 + 1, 10))
                .collect(),
        )
    }

    fn committed<T>(storage: &SqliteStorage, f: impl FnOnce(&SqliteStorage) -> Result<T>) -> T {
        storage.begin_transaction().unwrap();
        let value = f(storage).unwrap();
        storage.commit_transaction().unwrap();
        value
    }

    // --- Schema ---

    #[test]
    fn test_in_memory_creates_tables() {
        let storage = test_storage();
        let count: i64 = storage.with_connection(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
                 AND name IN ('clips', 'clip_items', 'tags', 'clip_tags', 'albums', 'album_items', 'history')",
                [],
                |row| row.get(0),
            )
            .unwrap()
        });
        assert_eq!(count, 7);
    }

    // --- Transactions ---

    #[test]
    fn test_cancel_discards_writes_and_history() {
        let storage = test_storage();
        storage.begin_transaction().unwrap();
        storage.create_tag(&TagRecipe::named("temp")).unwrap();
        storage.cancel_transaction_if_needed().unwrap();
        assert!(storage.read_all_tags().unwrap().is_empty());
        let rows: i64 = storage
            .with_connection(|conn| conn.query_row("SELECT COUNT(*) FROM history", [], |r| r.get(0)).unwrap());
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_write_outside_transaction_opens_implicit_scope() {
        let storage = test_storage();
        assert!(!storage.is_in_transaction());
        storage.create_tag(&TagRecipe::named("implicit")).unwrap();
        assert!(storage.is_in_transaction());
    }

    #[test]
    fn test_begin_discards_dirty_implicit_scope() {
        let storage = test_storage();
        storage.create_tag(&TagRecipe::named("left over")).unwrap();
        storage.begin_transaction().unwrap();
        assert!(storage.read_all_tags().unwrap().is_empty());
        storage.commit_transaction().unwrap();
        assert!(!storage.is_in_transaction());
    }

    #[test]
    fn test_cancel_without_transaction_is_noop() {
        let storage = test_storage();
        assert!(storage.cancel_transaction_if_needed().is_ok());
        assert!(storage.commit_transaction().is_ok());
    }

    // --- Clips ---

    #[test]
    fn test_create_clip_persists_items_in_order() {
        let storage = test_storage();
        let clip = committed(&storage, |s| s.create_clip(&recipe(&["a", "b", "c"]), false)).clip;
        let names: Vec<&str> = clip.items.iter().map(|i| i.image_file_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(clip.images_size, 30);
    }

    #[test]
    fn test_create_clip_drops_missing_tag_links() {
        let storage = test_storage();
        let tag = committed(&storage, |s| s.create_tag(&TagRecipe::named("kept")));
        let mut r = recipe(&["a"]);
        r.tag_ids = vec![tag.id, TagId::new(), tag.id];
        let clip = committed(&storage, |s| s.create_clip(&r, false)).clip;
        assert_eq!(clip.tags, vec![tag]);
    }

    #[test]
    fn test_delete_clip_cascades_items_and_links() {
        let storage = test_storage();
        let tag = committed(&storage, |s| s.create_tag(&TagRecipe::named("t")));
        let mut r = recipe(&["a", "b"]);
        r.tag_ids = vec![tag.id];
        let clip = committed(&storage, |s| s.create_clip(&r, false)).clip;
        committed(&storage, |s| s.delete_clips(&[clip.id]));
        let (items, links): (i64, i64) = storage.with_connection(|conn| {
            (
                conn.query_row("SELECT COUNT(*) FROM clip_items", [], |r| r.get(0)).unwrap(),
                conn.query_row("SELECT COUNT(*) FROM clip_tags", [], |r| r.get(0)).unwrap(),
            )
        });
        assert_eq!((items, links), (0, 0));
        assert!(storage.read_tag(tag.id).unwrap().is_some());
    }

    #[test]
    fn test_read_all_clips_newest_first() {
        let storage = test_storage();
        let mut older = recipe(&["a"]);
        older.created_at = Utc::now() - chrono::Duration::days(1);
        let older = committed(&storage, |s| s.create_clip(&older, false)).clip;
        let newer = committed(&storage, |s| s.create_clip(&recipe(&["b"]), false)).clip;
        let ids: Vec<ClipId> = storage.read_all_clips().unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    // --- History ---

    #[test]
    fn test_writes_are_recorded_with_author() {
        let conn = Connection::open_in_memory().unwrap();
        let storage = SqliteStorage::with_author(conn, "device-a").unwrap();
        committed(&storage, |s| s.create_tag(&TagRecipe::named("x")));
        let author: String = storage.with_connection(|conn| {
            conn.query_row("SELECT author FROM history LIMIT 1", [], |r| r.get(0)).unwrap()
        });
        assert_eq!(author, "device-a");
        assert!(storage.changes_since(None).unwrap().is_empty());
    }

    #[test]
    fn test_import_remote_tags_allows_duplicate_names() {
        let storage = test_storage();
        let local = committed(&storage, |s| s.create_tag(&TagRecipe::named("dup")));
        let remote = Tag { id: TagId::new(), name: "dup".into(), is_hidden: false };
        storage.import_remote_tags("device-b", &[remote.clone()]).unwrap();
        assert_eq!(storage.read_all_tags().unwrap().len(), 2);
        let batch = storage.changes_since(None).unwrap();
        assert_eq!(batch.inserted_or_updated_tag_ids(), vec![remote.id]);
        assert_ne!(local.id, remote.id);
    }

    #[test]
    fn test_import_remote_tags_updates_in_place() {
        let storage = test_storage();
        let tag = committed(&storage, |s| s.create_tag(&TagRecipe::named("t")));
        let clip = committed(&storage, |s| s.create_clip(&recipe(&["a"]), false)).clip;
        committed(&storage, |s| s.update_clips_adding_tags(&[clip.id], &[tag.id]));

        let hidden = Tag { is_hidden: true, ..tag.clone() };
        storage.import_remote_tags("device-b", &[hidden.clone()]).unwrap();
        assert_eq!(storage.read_tag(tag.id).unwrap(), Some(hidden));
        assert_eq!(storage.read_clip(clip.id).unwrap().unwrap().tag_ids(), vec![tag.id]);
        let kinds: Vec<ChangeKind> = storage.changes_since(None).unwrap().changes.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Update]);
    }

    #[test]
    fn test_read_only_connection_rejects_writes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("clips.sqlite");
        drop(SqliteStorage::with_author(Connection::open(&path).unwrap(), "me").unwrap());
        let reader = SqliteStorage::open_read_only(&path, "me").unwrap();
        assert!(reader.read_all_clips().unwrap().is_empty());
        let result = reader.create_tag(&TagRecipe::named("nope"));
        assert!(matches!(result, Err(StorageError::Internal(_))));
    }
}
