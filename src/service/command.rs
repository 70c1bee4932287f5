use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::errors::{Result, StorageError};
use crate::observers::{ObserverId, ObserverRegistry};
use crate::storage::container::{ContextObserver, PersistentContainer};
use crate::storage::images::ImageStorage;
use crate::storage::models::{
    Album, AlbumId, AlbumRecipe, Clip, ClipId, ClipItem, ClipItemId, ClipMerge, ClipPurge,
    ClipRecipe, ImageData, Tag, TagId, TagRecipe,
};
use crate::storage::sqlite::SqliteStorage;
use crate::storage::ClipStorage;
use super::ChangeObserver;
use super::coordinator::TransactionCoordinator;

/// Transactional façade over one clip store and the image blob store.
///
/// Every command runs under the coordinator lock in a single storage
/// transaction. Blobs have no rollback, so they are written only after the
/// record side succeeded and removed again if the transaction is abandoned.
pub struct ClipCommandService<S: ClipStorage + ?Sized, I: ImageStorage> {
    storage: RwLock<Arc<S>>,
    images: I,
    coordinator: Arc<TransactionCoordinator>,
    observers: ObserverRegistry<dyn ChangeObserver>,
}

fn validate_image_data(recipe: &ClipRecipe, data: &[ImageData]) -> Result<()> {
    let mut data_names = HashSet::new();
    for entry in data {
        if !data_names.insert(entry.file_name.as_str()) {
            return Err(StorageError::InvalidParameter(format!(
                "image data {:?} supplied twice",
                entry.file_name
            )));
        }
    }
    let mut item_names = HashSet::new();
    for item in &recipe.items {
        if !item_names.insert(item.image_file_name.as_str()) {
            return Err(StorageError::InvalidParameter(format!(
                "image file name {:?} used by more than one item",
                item.image_file_name
            )));
        }
        if !data_names.contains(item.image_file_name.as_str()) {
            return Err(StorageError::InvalidParameter(format!(
                "no image data for {:?}",
                item.image_file_name
            )));
        }
    }
    Ok(())
}

/// A blob `create` wrote, with the bytes it replaced when the file already existed.
struct WrittenBlob<'a> {
    file_name: &'a str,
    previous: Option<Vec<u8>>,
}

fn blob_failure(e: StorageError) -> StorageError {
    match e {
        StorageError::Internal(_) => e,
        other => StorageError::Internal(format!("image store: {}", other)),
    }
}

impl<S: ClipStorage + ?Sized, I: ImageStorage> ClipCommandService<S, I> {
    pub fn new(storage: Arc<S>, images: I, coordinator: Arc<TransactionCoordinator>) -> Self {
        Self {
            storage: RwLock::new(storage),
            images,
            coordinator,
            observers: ObserverRegistry::new(),
        }
    }

    pub fn storage(&self) -> Arc<S> {
        self.storage.read().clone()
    }

    pub fn images(&self) -> &I {
        &self.images
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    /// Swaps the store commands write to. Waits for a running command to finish.
    pub fn replace_storage(&self, storage: Arc<S>) {
        self.coordinator.perform(|| *self.storage.write() = storage);
    }

    pub fn register_observer(&self, observer: &Arc<dyn ChangeObserver>) -> ObserverId {
        self.observers.register(observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) {
        self.observers.unregister(id);
    }

    fn notify(&self) {
        self.observers.for_each(|o| o.records_did_change());
    }

    fn run<T>(&self, f: impl FnOnce(&S) -> Result<T>) -> Result<T> {
        let storage = self.storage();
        let value = self.coordinator.transaction(&*storage, f)?;
        self.notify();
        Ok(value)
    }

    fn discard_blobs(&self, clip_id: ClipId) {
        match self.images.delete_all(clip_id) {
            Ok(()) => {}
            Err(StorageError::NotFound(_)) => {}
            Err(e) => warn!(clip = %clip_id, error = %e, "failed to remove partial image directory"),
        }
    }

    fn remove_clip_blobs(&self, clip_id: ClipId) {
        match self.images.delete_all(clip_id) {
            Ok(()) => {}
            Err(StorageError::NotFound(_)) => {
                warn!(clip = %clip_id, "image directory already missing")
            }
            Err(e) => error!(clip = %clip_id, error = %e, "failed to remove image directory"),
        }
    }

    fn copy_blobs(&self, from: ClipId, items: &[ClipItem], to: ClipId) -> Result<()> {
        for item in items {
            let bytes = match self.images.read(&item.image_file_name, from) {
                Ok(bytes) => bytes,
                Err(StorageError::NotFound(_)) => {
                    warn!(clip = %from, file = %item.image_file_name, "image missing, not copied");
                    continue;
                }
                Err(e) => return Err(blob_failure(e)),
            };
            self.images
                .save(&bytes, &item.image_file_name, to)
                .map_err(blob_failure)?;
        }
        Ok(())
    }

    // --- Creation ---

    /// Stores a clip and its image data.
    ///
    /// Every entry in `data` is written, including entries no item refers to.
    /// With `forced`, an existing clip with the same id is overwritten: its id,
    /// creation date and tag links are kept, its items and blobs replaced. The
    /// replaced clip's files are only touched once the new records are committed.
    pub fn create(&self, recipe: &ClipRecipe, data: &[ImageData], forced: bool) -> Result<Clip> {
        validate_image_data(recipe, data)?;
        let storage = self.storage();
        let clip = self.coordinator.perform(|| -> Result<Clip> {
            storage.begin_transaction()?;
            let creation = match storage.create_clip(recipe, forced) {
                Ok(creation) => creation,
                Err(e) => {
                    self.cancel(&*storage);
                    return Err(e);
                }
            };
            let overwriting = creation.replaced.is_some();
            if let Some(replaced) = &creation.replaced {
                info!(clip = %replaced.id, "overwriting clip");
            }

            let mut written: Vec<WrittenBlob<'_>> = Vec::with_capacity(data.len());
            for entry in data {
                let previous = if overwriting {
                    match self.images.read(&entry.file_name, recipe.id) {
                        Ok(bytes) => Some(bytes),
                        Err(StorageError::NotFound(_)) => None,
                        Err(e) => {
                            self.abandon_create(&*storage, recipe.id, &written, overwriting);
                            return Err(blob_failure(e));
                        }
                    }
                } else {
                    None
                };
                if let Err(e) = self.images.save(&entry.bytes, &entry.file_name, recipe.id) {
                    self.abandon_create(&*storage, recipe.id, &written, overwriting);
                    return Err(blob_failure(e));
                }
                written.push(WrittenBlob {
                    file_name: &entry.file_name,
                    previous,
                });
            }
            if let Err(e) = storage.commit_transaction() {
                error!(clip = %recipe.id, error = %e, "commit failed after writing images");
                self.abandon_create(&*storage, recipe.id, &written, overwriting);
                return Err(e);
            }

            if let Some(replaced) = &creation.replaced {
                let kept: HashSet<&str> = data.iter().map(|entry| entry.file_name.as_str()).collect();
                for item in &replaced.items {
                    if kept.contains(item.image_file_name.as_str()) {
                        continue;
                    }
                    match self.images.delete(&item.image_file_name, replaced.id) {
                        Ok(()) | Err(StorageError::NotFound(_)) => {}
                        Err(e) => {
                            warn!(clip = %replaced.id, file = %item.image_file_name, error = %e, "failed to remove replaced image")
                        }
                    }
                }
            }
            Ok(creation.clip)
        })?;
        self.notify();
        Ok(clip)
    }

    /// Cancels the record side and puts the blob store back how `create` found it.
    fn abandon_create(&self, storage: &S, clip_id: ClipId, written: &[WrittenBlob<'_>], overwriting: bool) {
        self.cancel(storage);
        if !overwriting {
            self.discard_blobs(clip_id);
            return;
        }
        for blob in written.iter().rev() {
            let restored = match &blob.previous {
                Some(bytes) => self.images.save(bytes, blob.file_name, clip_id),
                None => match self.images.delete(blob.file_name, clip_id) {
                    Err(StorageError::NotFound(_)) => Ok(()),
                    other => other,
                },
            };
            if let Err(e) = restored {
                error!(clip = %clip_id, file = blob.file_name, error = %e, "failed to restore image after abandoned overwrite");
            }
        }
    }

    fn cancel(&self, storage: &S) {
        if let Err(e) = storage.cancel_transaction_if_needed() {
            warn!(error = %e, "failed to cancel transaction");
        }
    }

    pub fn create_tag(&self, name: &str) -> Result<Tag> {
        self.create_tag_from(&TagRecipe::named(name))
    }

    pub fn create_tag_from(&self, recipe: &TagRecipe) -> Result<Tag> {
        self.run(|s| s.create_tag(recipe))
    }

    pub fn create_album(&self, title: &str) -> Result<Album> {
        self.run(|s| s.create_album(&AlbumRecipe::titled(title)))
    }

    // --- Clip updates ---

    pub fn update_clips_hiding(&self, ids: &[ClipId], is_hidden: bool) -> Result<Vec<Clip>> {
        self.run(|s| s.update_clips_hiding(ids, is_hidden))
    }

    pub fn update_clips_adding_tags(&self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<Vec<Clip>> {
        self.run(|s| s.update_clips_adding_tags(ids, tag_ids))
    }

    pub fn update_clips_deleting_tags(&self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<Vec<Clip>> {
        self.run(|s| s.update_clips_deleting_tags(ids, tag_ids))
    }

    pub fn update_clips_replacing_tags(&self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<Vec<Clip>> {
        self.run(|s| s.update_clips_replacing_tags(ids, tag_ids))
    }

    pub fn update_clip_reordering_items(&self, id: ClipId, item_ids: &[ClipItemId]) -> Result<Clip> {
        self.run(|s| s.update_clip_reordering_items(id, item_ids))
    }

    pub fn update_clip_items_site_url(&self, item_ids: &[ClipItemId], site_url: Option<&str>) -> Result<Vec<ClipItem>> {
        self.run(|s| s.update_clip_items_site_url(item_ids, site_url))
    }

    // --- Albums ---

    pub fn update_album_adding_clips(&self, id: AlbumId, clip_ids: &[ClipId]) -> Result<Album> {
        self.run(|s| s.update_album_adding_clips(id, clip_ids))
    }

    pub fn update_album_deleting_clips(&self, id: AlbumId, clip_ids: &[ClipId]) -> Result<Album> {
        self.run(|s| s.update_album_deleting_clips(id, clip_ids))
    }

    pub fn update_album_reordering_clips(&self, id: AlbumId, clip_ids: &[ClipId]) -> Result<Album> {
        self.run(|s| s.update_album_reordering_clips(id, clip_ids))
    }

    pub fn update_album_title(&self, id: AlbumId, title: &str) -> Result<Album> {
        self.run(|s| s.update_album_title(id, title))
    }

    pub fn update_album_hiding(&self, id: AlbumId, is_hidden: bool) -> Result<Album> {
        self.run(|s| s.update_album_hiding(id, is_hidden))
    }

    pub fn update_albums_reordering(&self, ids: &[AlbumId]) -> Result<Vec<Album>> {
        self.run(|s| s.update_albums_reordering(ids))
    }

    // --- Tags ---

    pub fn update_tag_name(&self, id: TagId, name: &str) -> Result<Tag> {
        self.run(|s| s.update_tag_name(id, name))
    }

    pub fn update_tag_hiding(&self, id: TagId, is_hidden: bool) -> Result<Tag> {
        self.run(|s| s.update_tag_hiding(id, is_hidden))
    }

    pub fn deduplicate_tag(&self, id: TagId) -> Result<Vec<TagId>> {
        self.run(|s| s.deduplicate_tag(id))
    }

    // --- Deletion ---

    /// Deletes the records, then the clips' image directories.
    pub fn delete_clips(&self, ids: &[ClipId]) -> Result<Vec<Clip>> {
        let clips = self.run(|s| s.delete_clips(ids))?;
        for clip in &clips {
            self.remove_clip_blobs(clip.id);
        }
        Ok(clips)
    }

    pub fn delete_clip_item(&self, id: ClipItemId) -> Result<ClipItem> {
        let item = self.run(|s| s.delete_clip_item(id))?;
        match self.images.delete(&item.image_file_name, item.clip_id) {
            Ok(()) => {}
            Err(StorageError::NotFound(_)) => {
                warn!(clip = %item.clip_id, file = %item.image_file_name, "image already missing")
            }
            Err(e) => error!(clip = %item.clip_id, error = %e, "failed to remove image"),
        }
        Ok(item)
    }

    pub fn delete_album(&self, id: AlbumId) -> Result<Album> {
        self.run(|s| s.delete_album(id))
    }

    pub fn delete_tags(&self, ids: &[TagId]) -> Result<Vec<Tag>> {
        self.run(|s| s.delete_tags(ids))
    }

    // --- Purge / merge ---

    /// Splits a clip into one clip per item. Blobs are copied into the new
    /// clips' directories before commit; the original directory is removed after.
    pub fn purge_clip_items(&self, id: ClipId) -> Result<ClipPurge> {
        let mut written: Vec<ClipId> = Vec::new();
        let result = self.run(|s| {
            let purge = s.purge_clip_items(id)?;
            for created in &purge.created {
                written.push(created.id);
                self.copy_blobs(purge.original.id, &created.items, created.id)?;
            }
            Ok(purge)
        });
        match result {
            Ok(purge) => {
                self.remove_clip_blobs(purge.original.id);
                Ok(purge)
            }
            Err(e) => {
                for clip_id in written {
                    self.discard_blobs(clip_id);
                }
                Err(e)
            }
        }
    }

    /// Merges clips into a new one holding `item_ids` in that order and exactly `tag_ids`.
    pub fn merge_clip_items(&self, item_ids: &[ClipItemId], tag_ids: &[TagId], clip_ids: &[ClipId]) -> Result<ClipMerge> {
        let mut written: Option<ClipId> = None;
        let result = self.run(|s| {
            let merge = s.merge_clip_items(item_ids, tag_ids, clip_ids)?;
            let owners: HashMap<ClipItemId, ClipId> = merge
                .removed
                .iter()
                .flat_map(|c| c.items.iter().map(|i| (i.id, c.id)))
                .collect();
            written = Some(merge.merged.id);
            for item in &merge.merged.items {
                let Some(source) = owners.get(&item.id) else {
                    continue;
                };
                self.copy_blobs(*source, std::slice::from_ref(item), merge.merged.id)?;
            }
            Ok(merge)
        });
        match result {
            Ok(merge) => {
                for removed in &merge.removed {
                    self.remove_clip_blobs(removed.id);
                }
                Ok(merge)
            }
            Err(e) => {
                if let Some(clip_id) = written {
                    self.discard_blobs(clip_id);
                }
                Err(e)
            }
        }
    }
}

impl<I: ImageStorage> ContextObserver for ClipCommandService<SqliteStorage, I> {
    fn context_did_change(&self, container: &PersistentContainer) {
        match container.new_background_context() {
            Ok(context) => self.replace_storage(Arc::new(context)),
            Err(e) => error!(error = %e, "failed to open background context, commands keep the previous one"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::images::FsImageStorage;
    use crate::storage::models::ClipItemRecipe;
    use crate::storage::object_store::ObjectStore;
    use crate::storage::ClipReader;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> ClipCommandService<ObjectStore, FsImageStorage> {
        ClipCommandService::new(
            Arc::new(ObjectStore::in_memory()),
            FsImageStorage::new(dir.path().join("images")),
            Arc::new(TransactionCoordinator::new()),
        )
    }

    fn recipe(names: &[&str]) -> ClipRecipe {
        ClipRecipe::new(
            names
                .iter()
                .enumerate()
                .map(|(i, n)| ClipItemRecipe::new(*n, i as i64 + 1, 3))
                .collect(),
        )
    }

    fn data(names: &[&str]) -> Vec<ImageData> {
        names.iter().map(|n| ImageData::new(*n, n.as_bytes().to_vec())).collect()
    }

    #[test]
    fn test_validation_rejects_missing_data() {
        let r = recipe(&["a", "b"]);
        let result = validate_image_data(&r, &data(&["a"]));
        assert!(matches!(result, Err(StorageError::InvalidParameter(_))));
    }

    #[test]
    fn test_validation_rejects_repeated_data_names() {
        let r = recipe(&["a"]);
        let result = validate_image_data(&r, &data(&["a", "a"]));
        assert!(matches!(result, Err(StorageError::InvalidParameter(_))));
    }

    #[test]
    fn test_purge_moves_blobs() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let clip = service.create(&recipe(&["a", "b"]), &data(&["a", "b"]), false).unwrap();
        let purge = service.purge_clip_items(clip.id).unwrap();
        assert!(!service.images().exists("a", clip.id));
        for created in &purge.created {
            let name = &created.items[0].image_file_name;
            assert!(service.images().exists(name, created.id));
        }
    }

    #[test]
    fn test_merge_moves_blobs() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let first = service.create(&recipe(&["a"]), &data(&["a"]), false).unwrap();
        let second = service.create(&recipe(&["b"]), &data(&["b"]), false).unwrap();
        let items = vec![second.items[0].id, first.items[0].id];
        let merge = service.merge_clip_items(&items, &[], &[first.id, second.id]).unwrap();
        assert_eq!(merge.merged.item_ids(), items);
        assert!(service.images().exists("a", merge.merged.id));
        assert!(service.images().exists("b", merge.merged.id));
        assert!(service.images().clip_ids().unwrap() == vec![merge.merged.id]);
        assert!(service.storage().read_clip(first.id).unwrap().is_none());
    }
}
