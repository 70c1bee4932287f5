use std::process;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use clipbox::config::{AppPaths, Settings};
use clipbox::errors::{Result, StorageError};
use clipbox::service::query::{ClipSortKey, SortOrder};
use clipbox::service::{
    ChangeObserver, ClipCommandService, ClipQueryService, ClipSearchQuery, IntegrityValidationService,
    TemporariesPersistService, TransactionCoordinator,
};
use clipbox::storage::container::{ContextObserver, PersistentContainer};
use clipbox::storage::history::{HistoryTokenStore, RemoteChangeMonitor};
use clipbox::storage::images::{FsImageStorage, ImageStorage};
use clipbox::storage::models::{Album, AlbumId, Clip, ClipId, Tag, TagId};
use clipbox::storage::object_store::ObjectStore;
use clipbox::storage::sqlite::SqliteStorage;
use clipbox::storage::{ClipReader, ClipStorage};

#[derive(Parser)]
#[command(name = "clipbox", version, about = "Inspect and maintain a clipbox library")]
struct Cli {
    /// Output results as JSON
    #[arg(short = 'j', long = "json", global = true)]
    json: bool,

    /// Include hidden clips, tags and albums regardless of settings
    #[arg(long, global = true)]
    show_hidden: bool,

    /// Append logs to the library's log file instead of stderr
    #[arg(long, global = true)]
    log_to_file: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List clips, newest first
    List {
        /// Only clips carrying this tag (name or id)
        #[arg(long)]
        tag: Option<String>,

        /// Only clips in this album (title or id)
        #[arg(long, conflicts_with = "tag")]
        album: Option<String>,

        /// Only clips without any tag
        #[arg(long, conflicts_with_all = ["tag", "album"])]
        uncategorized: bool,
    },

    /// Search clips by site URL keywords
    Search {
        /// Space separated keywords
        query: String,

        /// Require this tag (name or id); may be repeated
        #[arg(long)]
        tag: Vec<String>,

        #[arg(long, value_enum, default_value = "created")]
        sort: SortArg,

        #[arg(long)]
        ascending: bool,
    },

    /// Show a clip with its items and albums
    Get {
        /// Clip ID
        id: ClipId,
    },

    /// List tags, optionally filtered by name
    Tags {
        filter: Option<String>,
    },

    /// List albums, optionally filtered by title
    Albums {
        filter: Option<String>,
    },

    /// Create a tag
    TagCreate {
        name: String,
    },

    /// Create an album
    AlbumCreate {
        title: String,
    },

    /// Hide or unhide clips
    Hide {
        ids: Vec<ClipId>,

        #[arg(short, long)]
        unhide: bool,
    },

    /// Delete clips and their images
    Delete {
        ids: Vec<ClipId>,
    },

    /// Deduplicate tags, sweep orphaned images and refresh the reference store
    Validate,

    /// Move staged temporary clips into the library
    PersistTemporaries,

    /// Apply changes made by other devices since the last sync
    Sync,

    /// Show storage statistics
    Stats,
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Created,
    Updated,
    Size,
}

impl From<SortArg> for ClipSortKey {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Created => ClipSortKey::CreatedDate,
            SortArg::Updated => ClipSortKey::UpdatedDate,
            SortArg::Size => ClipSortKey::Size,
        }
    }
}

#[derive(Serialize)]
struct StatusResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    affected: Option<usize>,
}

#[derive(Serialize)]
struct Stats {
    clips: usize,
    hidden_clips: usize,
    items: usize,
    images_size: i64,
    tags: usize,
    albums: usize,
    image_dirs: usize,
    oldest: Option<chrono::DateTime<Utc>>,
    newest: Option<chrono::DateTime<Utc>>,
    remote_sync_enabled: bool,
}

/// Services wired the way the application runs them.
struct App {
    paths: AppPaths,
    settings: Settings,
    container: PersistentContainer,
    images: Arc<FsImageStorage>,
    commands: Arc<ClipCommandService<SqliteStorage, Arc<FsImageStorage>>>,
    queries: Arc<ClipQueryService<SqliteStorage>>,
}

impl App {
    fn open(show_hidden: bool, log_to_file: bool) -> Result<Self> {
        let paths = AppPaths::new()?;
        let settings = Settings::load_or_init(&paths.settings_path)?;
        let log_file = log_to_file.then_some(paths.log_file.as_path());
        clipbox::logging::init(&settings.log_filter, log_file)?;

        let container = PersistentContainer::open(&paths.db_path, settings.author.clone(), settings.remote_sync_enabled)?;
        let images = Arc::new(FsImageStorage::new(&paths.images_dir));
        let coordinator = Arc::new(TransactionCoordinator::new());
        let commands = Arc::new(ClipCommandService::new(
            Arc::new(container.new_background_context()?),
            images.clone(),
            coordinator,
        ));
        let queries = Arc::new(ClipQueryService::new(
            container.view_context(),
            show_hidden || settings.show_hidden_items,
        ));

        let change_observer: Arc<dyn ChangeObserver> = queries.clone();
        commands.register_observer(&change_observer);
        let command_context: Arc<dyn ContextObserver> = commands.clone();
        container.register_observer(&command_context);
        let query_context: Arc<dyn ContextObserver> = queries.clone();
        container.register_observer(&query_context);

        Ok(Self {
            paths,
            settings,
            container,
            images,
            commands,
            queries,
        })
    }

    fn integrity(&self) -> IntegrityValidationService<SqliteStorage, Arc<FsImageStorage>> {
        IntegrityValidationService::new(
            self.commands.storage(),
            self.images.clone(),
            self.commands.coordinator().clone(),
        )
    }

    fn resolve_tag(&self, key: &str) -> Result<Tag> {
        let tags = self.queries.tags()?;
        let id = key.parse::<TagId>().ok();
        tags.into_iter()
            .find(|t| Some(t.id) == id || t.name == key)
            .ok_or_else(|| StorageError::NotFound(format!("tag {}", key)))
    }

    fn resolve_album(&self, key: &str) -> Result<Album> {
        let albums = self.queries.albums()?;
        let id = key.parse::<AlbumId>().ok();
        albums
            .into_iter()
            .find(|a| Some(a.id) == id || a.title == key)
            .ok_or_else(|| StorageError::NotFound(format!("album {}", key)))
    }
}

fn main() {
    let cli = Cli::parse();
    let json = cli.json;

    if let Err(e) = run(cli) {
        if json {
            eprintln!("{}", serde_json::json!({"error": e.to_string()}));
        } else {
            eprintln!("error: {}", e);
        }
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let app = App::open(cli.show_hidden, cli.log_to_file)?;
    let json = cli.json;

    match cli.command {
        None => cmd_list(&app, None, None, false, json),
        Some(Commands::List { tag, album, uncategorized }) => {
            cmd_list(&app, tag.as_deref(), album.as_deref(), uncategorized, json)
        }
        Some(Commands::Search {
            query,
            tag,
            sort,
            ascending,
        }) => cmd_search(&app, query, &tag, sort, ascending, json),
        Some(Commands::Get { id }) => cmd_get(&app, id, json),
        Some(Commands::Tags { filter }) => cmd_tags(&app, filter.as_deref(), json),
        Some(Commands::Albums { filter }) => cmd_albums(&app, filter.as_deref(), json),
        Some(Commands::TagCreate { name }) => {
            let tag = app.commands.create_tag(&name)?;
            print_status(json, format!("Created tag {} ({}).", tag.name, tag.id), None)
        }
        Some(Commands::AlbumCreate { title }) => {
            let album = app.commands.create_album(&title)?;
            print_status(json, format!("Created album {} ({}).", album.title, album.id), None)
        }
        Some(Commands::Hide { ids, unhide }) => {
            let clips = app.commands.update_clips_hiding(&ids, !unhide)?;
            let verb = if unhide { "Unhid" } else { "Hid" };
            print_status(json, format!("{} {} clip(s).", verb, clips.len()), Some(clips.len()))
        }
        Some(Commands::Delete { ids }) => {
            let clips = app.commands.delete_clips(&ids)?;
            print_status(json, format!("Deleted {} clip(s).", clips.len()), Some(clips.len()))
        }
        Some(Commands::Validate) => cmd_validate(&app, json),
        Some(Commands::PersistTemporaries) => cmd_persist_temporaries(&app, json),
        Some(Commands::Sync) => cmd_sync(&app, json),
        Some(Commands::Stats) => cmd_stats(&app, json),
    }
}

fn print_status(json: bool, message: String, affected: Option<usize>) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string(&StatusResponse {
                success: true,
                message,
                affected,
            })?
        );
    } else {
        println!("{}", message);
    }
    Ok(())
}

fn cmd_list(app: &App, tag: Option<&str>, album: Option<&str>, uncategorized: bool, json: bool) -> Result<()> {
    let clips = match (tag, album) {
        (Some(tag), _) => app.queries.clips_tagged(app.resolve_tag(tag)?.id)?,
        (None, Some(album)) => app.queries.album_clips(app.resolve_album(album)?.id)?,
        (None, None) if uncategorized => app.queries.uncategorized_clips()?,
        (None, None) => app.queries.clips()?,
    };

    if json {
        println!("{}", serde_json::to_string(&clips)?);
        return Ok(());
    }

    if clips.is_empty() {
        println!("No clips.");
        return Ok(());
    }
    for clip in &clips {
        print_clip_row(clip);
    }
    Ok(())
}

fn cmd_search(app: &App, text: String, tags: &[String], sort: SortArg, ascending: bool, json: bool) -> Result<()> {
    let tag_ids = tags
        .iter()
        .map(|t| app.resolve_tag(t).map(|t| t.id))
        .collect::<Result<Vec<_>>>()?;
    let query = ClipSearchQuery {
        text,
        tag_ids,
        album_id: None,
        sort_key: sort.into(),
        sort_order: if ascending { SortOrder::Ascending } else { SortOrder::Descending },
    };
    let clips = app.queries.search_clips(&query)?;

    if json {
        println!("{}", serde_json::to_string(&clips)?);
        return Ok(());
    }

    if clips.is_empty() {
        println!("No results for \"{}\".", query.text);
        return Ok(());
    }
    for clip in &clips {
        print_clip_row(clip);
    }
    Ok(())
}

fn cmd_get(app: &App, id: ClipId, json: bool) -> Result<()> {
    let clip = app.queries.read_clip(id)?;
    let albums = app.queries.read_albums_containing(id)?;

    if json {
        println!("{}", serde_json::json!({ "clip": clip, "albums": albums }));
        return Ok(());
    }

    print_clip_detail(&clip, &albums);
    Ok(())
}

fn cmd_tags(app: &App, filter: Option<&str>, json: bool) -> Result<()> {
    let tags = match filter {
        Some(text) => app.queries.search_tags(text)?,
        None => app.queries.tags()?,
    };

    if json {
        println!("{}", serde_json::to_string(&tags)?);
        return Ok(());
    }

    for tag in &tags {
        let hidden = if tag.is_hidden { " (hidden)" } else { "" };
        println!("{}  {}{}", tag.id, tag.name, hidden);
    }
    Ok(())
}

fn cmd_albums(app: &App, filter: Option<&str>, json: bool) -> Result<()> {
    let albums = match filter {
        Some(text) => app.queries.search_albums(text)?,
        None => app.queries.albums()?,
    };

    if json {
        println!("{}", serde_json::to_string(&albums)?);
        return Ok(());
    }

    for album in &albums {
        let hidden = if album.is_hidden { " (hidden)" } else { "" };
        println!("{}  {:>3} clip(s)  {}{}", album.id, album.items.len(), album.title, hidden);
    }
    Ok(())
}

fn cmd_validate(app: &App, json: bool) -> Result<()> {
    let integrity = app.integrity();
    let removed_tags = integrity.deduplicate_all_tags()?;
    let removed_dirs = integrity.sweep_orphaned_images()?;
    let reference = ObjectStore::open(&app.paths.reference_path)?;
    let references = integrity.synchronize_references(&reference)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "removed_tags": removed_tags,
                "removed_image_dirs": removed_dirs,
                "reference_tags": references,
            })
        );
    } else {
        println!("Removed duplicate tags:  {}", removed_tags.len());
        println!("Removed image dirs:      {}", removed_dirs.len());
        println!("Reference tags:          {}", references);
    }
    Ok(())
}

fn cmd_persist_temporaries(app: &App, json: bool) -> Result<()> {
    let temporaries: Arc<dyn ClipStorage> = Arc::new(ObjectStore::open(&app.paths.temporaries_path)?);
    let temporary_images: Arc<dyn ImageStorage> = Arc::new(FsImageStorage::new(&app.paths.temporary_images_dir));
    let service = TemporariesPersistService::new(temporaries, temporary_images, app.commands.clone());
    let report = service.persist_all()?;

    if json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        println!("Persisted: {}", report.persisted.len());
        println!("Dropped:   {}", report.dropped.len());
        println!("Failed:    {}", report.failed.len());
    }
    Ok(())
}

fn cmd_sync(app: &App, json: bool) -> Result<()> {
    if !app.container.is_remote_sync_enabled() {
        return print_status(json, "Remote sync is disabled in settings.".into(), None);
    }
    let monitor = RemoteChangeMonitor::new(HistoryTokenStore::new(&app.paths.history_token_path));
    let report = app.integrity().poll_and_repair(&monitor)?;
    let purged = monitor.purge_consumed(&app.commands.storage())?;

    if json {
        println!("{}", serde_json::json!({ "report": report, "purged_history": purged }));
    } else {
        println!("Removed duplicate tags:  {}", report.removed_tags.len());
        println!("Removed image dirs:      {}", report.removed_image_dirs.len());
        println!("Skipped:                 {}", report.skipped);
        println!("Purged history rows:     {}", purged);
    }
    Ok(())
}

fn cmd_stats(app: &App, json: bool) -> Result<()> {
    let storage = app.container.view_context();
    let clips = storage.read_all_clips()?;
    let stats = Stats {
        clips: clips.len(),
        hidden_clips: clips.iter().filter(|c| c.is_hidden).count(),
        items: clips.iter().map(|c| c.items.len()).sum(),
        images_size: clips.iter().map(|c| c.images_size).sum(),
        tags: storage.read_all_tags()?.len(),
        albums: storage.read_all_albums()?.len(),
        image_dirs: app.images.clip_ids()?.len(),
        oldest: clips.iter().map(|c| c.created_at).min(),
        newest: clips.iter().map(|c| c.created_at).max(),
        remote_sync_enabled: app.settings.remote_sync_enabled,
    };

    if json {
        println!("{}", serde_json::to_string(&stats)?);
        return Ok(());
    }

    println!("Library Statistics");
    println!("──────────────────");
    println!("Clips:        {} ({} hidden)", stats.clips, stats.hidden_clips);
    println!("Items:        {}", stats.items);
    println!("Images size:  {}", format_bytes(stats.images_size));
    println!("Tags:         {}", stats.tags);
    println!("Albums:       {}", stats.albums);
    println!("Image dirs:   {}", stats.image_dirs);
    if let Some(oldest) = stats.oldest {
        println!("Oldest:       {}", oldest.format("%Y-%m-%d %H:%M"));
    }
    if let Some(newest) = stats.newest {
        println!("Newest:       {}", newest.format("%Y-%m-%d %H:%M"));
    }
    println!(
        "Remote sync:  {}",
        if stats.remote_sync_enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

fn print_clip_row(clip: &Clip) {
    let hidden = if clip.is_hidden { "h" } else { " " };
    let preview = clip
        .primary_item()
        .and_then(|i| i.site_url.clone())
        .unwrap_or_else(|| "(no url)".to_string());
    let preview = if preview.chars().count() > 60 {
        format!("{}...", preview.chars().take(57).collect::<String>())
    } else {
        preview
    };
    let tags = if clip.tags.is_empty() {
        String::new()
    } else {
        let names: Vec<&str> = clip.tags.iter().map(|t| t.name.as_str()).collect();
        format!(" [{}]", names.join(", "))
    };

    println!(
        "{} {}{:>2} {:>6}  {}{}",
        clip.id,
        hidden,
        clip.items.len(),
        format_age(clip.created_at),
        preview,
        tags
    );
}

fn print_clip_detail(clip: &Clip, albums: &[Album]) {
    println!("ID:          {}", clip.id);
    println!("Hidden:      {}", clip.is_hidden);
    println!("Created:     {}", clip.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Updated:     {}", clip.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Images size: {}", format_bytes(clip.images_size));
    if let Some(description) = &clip.description {
        println!("Description: {}", description);
    }
    if !clip.tags.is_empty() {
        let names: Vec<&str> = clip.tags.iter().map(|t| t.name.as_str()).collect();
        println!("Tags:        {}", names.join(", "));
    }
    if !albums.is_empty() {
        let titles: Vec<&str> = albums.iter().map(|a| a.title.as_str()).collect();
        println!("Albums:      {}", titles.join(", "));
    }

    println!("─────────────────────────");
    for item in &clip.items {
        println!(
            "{:>2}. {}  {}x{}  {}  {}",
            item.index,
            item.image_file_name,
            item.image_size.width,
            item.image_size.height,
            format_bytes(item.image_data_size),
            item.site_url.as_deref().unwrap_or("-")
        );
    }
}

fn format_age(dt: chrono::DateTime<Utc>) -> String {
    let dur = Utc::now() - dt;
    if dur.num_seconds() < 60 {
        "now".to_string()
    } else if dur.num_minutes() < 60 {
        format!("{}m", dur.num_minutes())
    } else if dur.num_hours() < 24 {
        format!("{}h", dur.num_hours())
    } else {
        format!("{}d", dur.num_days())
    }
}

fn format_bytes(bytes: i64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
