#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use clipbox::errors::Result;
use clipbox::storage::images::{FsImageStorage, ImageStorage};
use clipbox::storage::models::{Clip, ClipId, ClipItemRecipe, ClipRecipe, ImageData, Tag, TagRecipe};
use clipbox::storage::object_store::ObjectStore;
use clipbox::storage::sqlite::SqliteStorage;
use clipbox::storage::ClipStorage;
use tempfile::TempDir;

#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Sqlite,
    Object,
}

enum Concrete {
    Sqlite(Arc<SqliteStorage>),
    Object(Arc<ObjectStore>),
}

/// A store of either backend plus the directory backing it.
pub struct Fixture {
    pub store: Arc<dyn ClipStorage>,
    pub dir: TempDir,
    concrete: Concrete,
}

impl Fixture {
    pub fn new(backend: Backend) -> Self {
        let dir = TempDir::new().unwrap();
        let (store, concrete): (Arc<dyn ClipStorage>, Concrete) = match backend {
            Backend::Sqlite => {
                let sqlite = Arc::new(SqliteStorage::open(&dir.path().join("clips.sqlite"), "test").unwrap());
                (sqlite.clone(), Concrete::Sqlite(sqlite))
            }
            Backend::Object => {
                let object = Arc::new(ObjectStore::open(dir.path().join("clips.json")).unwrap());
                (object.clone(), Concrete::Object(object))
            }
        };
        Self { store, dir, concrete }
    }

    /// Lands tags without the name check, the way a sync peer's records arrive.
    pub fn import_tags(&self, tags: &[Tag]) {
        match &self.concrete {
            Concrete::Sqlite(sqlite) => sqlite.import_remote_tags("remote", tags).unwrap(),
            Concrete::Object(object) => self.write(|_| object.import_tags(tags)).unwrap(),
        }
    }

    /// Runs `f` in its own transaction, committing on success and cancelling on error.
    pub fn write<T>(&self, f: impl FnOnce(&dyn ClipStorage) -> Result<T>) -> Result<T> {
        self.store.begin_transaction()?;
        match f(&*self.store) {
            Ok(value) => {
                self.store.commit_transaction()?;
                Ok(value)
            }
            Err(e) => {
                self.store.cancel_transaction_if_needed()?;
                Err(e)
            }
        }
    }

    pub fn clip(&self, names: &[&str]) -> Clip {
        self.write(|s| s.create_clip(&clip_recipe(names), false)).unwrap().clip
    }

    pub fn tag(&self, name: &str) -> Tag {
        self.write(|s| s.create_tag(&TagRecipe::named(name))).unwrap()
    }

    pub fn reload(&self, id: ClipId) -> Clip {
        self.store.read_clip(id).unwrap().unwrap()
    }
}

pub fn clip_recipe(names: &[&str]) -> ClipRecipe {
    let items = names
        .iter()
        .enumerate()
        .map(|(i, name)| ClipItemRecipe::new(*name, i as i64 + 1, 10 * (i as i64 + 1)))
        .collect();
    ClipRecipe::new(items)
}

pub fn image_data(names: &[&str]) -> Vec<ImageData> {
    names
        .iter()
        .map(|name| ImageData::new(*name, name.as_bytes().to_vec()))
        .collect()
}

/// Long enough for a touched `updated_at` to differ.
pub fn tick() {
    thread::sleep(Duration::from_millis(10));
}

/// Filesystem image store that counts the writes it receives.
pub struct RecordingImages {
    inner: FsImageStorage,
    saves: AtomicUsize,
    failure: SaveFailure,
}

enum SaveFailure {
    Never,
    Always,
    /// Only the save with this zero-based attempt number fails.
    At(usize),
}

impl RecordingImages {
    pub fn new(dir: &TempDir) -> Self {
        Self {
            inner: FsImageStorage::new(dir.path().join("images")),
            saves: AtomicUsize::new(0),
            failure: SaveFailure::Never,
        }
    }

    pub fn failing(dir: &TempDir) -> Self {
        Self {
            failure: SaveFailure::Always,
            ..Self::new(dir)
        }
    }

    pub fn failing_at(dir: &TempDir, attempt: usize) -> Self {
        Self {
            failure: SaveFailure::At(attempt),
            ..Self::new(dir)
        }
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl ImageStorage for RecordingImages {
    fn save(&self, data: &[u8], file_name: &str, clip_id: ClipId) -> Result<()> {
        let attempt = self.saves.fetch_add(1, Ordering::SeqCst);
        let fails = match self.failure {
            SaveFailure::Never => false,
            SaveFailure::Always => true,
            SaveFailure::At(n) => attempt == n,
        };
        if fails {
            return Err(clipbox::errors::StorageError::Internal("disk full".into()));
        }
        self.inner.save(data, file_name, clip_id)
    }

    fn delete(&self, file_name: &str, clip_id: ClipId) -> Result<()> {
        self.inner.delete(file_name, clip_id)
    }

    fn delete_all(&self, clip_id: ClipId) -> Result<()> {
        self.inner.delete_all(clip_id)
    }

    fn read(&self, file_name: &str, clip_id: ClipId) -> Result<Vec<u8>> {
        self.inner.read(file_name, clip_id)
    }

    fn exists(&self, file_name: &str, clip_id: ClipId) -> bool {
        self.inner.exists(file_name, clip_id)
    }

    fn clip_ids(&self) -> Result<Vec<ClipId>> {
        self.inner.clip_ids()
    }
}
