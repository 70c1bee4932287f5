use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::errors::Result;
use crate::observers::{ObserverId, ObserverRegistry};
use super::sqlite::SqliteStorage;

/// Told when the container swaps its view context. Readers rebind to the new
/// view context, writers open a fresh background context.
pub trait ContextObserver: Send + Sync {
    fn context_did_change(&self, container: &PersistentContainer);
}

/// Owner of the relational database file.
///
/// Hands out one shared view context for reads and fresh connections for
/// background writes. `reload` replaces the view context, e.g. after remote
/// sync was switched on or off.
pub struct PersistentContainer {
    path: PathBuf,
    author: String,
    remote_sync_enabled: RwLock<bool>,
    view: RwLock<Arc<SqliteStorage>>,
    observers: ObserverRegistry<dyn ContextObserver>,
}

impl PersistentContainer {
    pub fn open(path: impl Into<PathBuf>, author: impl Into<String>, remote_sync_enabled: bool) -> Result<Self> {
        let path = path.into();
        let author = author.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let view = Arc::new(SqliteStorage::open(&path, author.clone())?);
        info!(path = %path.display(), remote_sync_enabled, "opened persistent container");
        Ok(Self {
            path,
            author,
            remote_sync_enabled: RwLock::new(remote_sync_enabled),
            view: RwLock::new(view),
            observers: ObserverRegistry::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn is_remote_sync_enabled(&self) -> bool {
        *self.remote_sync_enabled.read()
    }

    pub fn view_context(&self) -> Arc<SqliteStorage> {
        self.view.read().clone()
    }

    /// A new connection for writes that must not share the view context's scope.
    pub fn new_background_context(&self) -> Result<SqliteStorage> {
        SqliteStorage::open(&self.path, self.author.clone())
    }

    pub fn register_observer(&self, observer: &Arc<dyn ContextObserver>) -> ObserverId {
        self.observers.register(observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) {
        self.observers.unregister(id);
    }

    /// Reopens the database and installs the new view context, then notifies
    /// every live observer.
    pub fn reload(&self, remote_sync_enabled: bool) -> Result<Arc<SqliteStorage>> {
        let context = Arc::new(SqliteStorage::open(&self.path, self.author.clone())?);
        *self.view.write() = context.clone();
        *self.remote_sync_enabled.write() = remote_sync_enabled;
        info!(remote_sync_enabled, "reloaded persistent container");
        self.observers.for_each(|o| o.context_did_change(self));
        Ok(context)
    }
}
