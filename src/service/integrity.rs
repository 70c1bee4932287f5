use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::{Result, StorageError};
use crate::storage::history::{HistoryBatch, RemoteChangeMonitor};
use crate::storage::images::ImageStorage;
use crate::storage::models::{ClipId, TagId};
use crate::storage::object_store::ObjectStore;
use crate::storage::sqlite::SqliteStorage;
use crate::storage::{ClipReader, ClipStorage};
use super::coordinator::TransactionCoordinator;

/// What one repair pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub removed_tags: Vec<TagId>,
    pub removed_image_dirs: Vec<ClipId>,
    pub skipped: usize,
}

/// Repairs what multi-device sync can break: duplicated tag names and image
/// directories left behind by clips deleted elsewhere. Best effort: a failing
/// step is logged and skipped.
pub struct IntegrityValidationService<S: ClipStorage + ?Sized, I: ImageStorage> {
    storage: Arc<S>,
    images: I,
    coordinator: Arc<TransactionCoordinator>,
}

impl<S: ClipStorage + ?Sized, I: ImageStorage> IntegrityValidationService<S, I> {
    pub fn new(storage: Arc<S>, images: I, coordinator: Arc<TransactionCoordinator>) -> Self {
        Self {
            storage,
            images,
            coordinator,
        }
    }

    fn deduplicate(&self, winner: TagId) -> Result<Vec<TagId>> {
        self.coordinator.transaction(&*self.storage, |s| {
            if s.read_tag(winner)?.is_none() {
                debug!(tag = %winner, "changed tag no longer exists");
                return Ok(Vec::new());
            }
            s.deduplicate_tag(winner)
        })
    }

    pub fn handle_remote_changes(&self, batch: &HistoryBatch) -> RepairReport {
        let mut report = RepairReport::default();
        for tag_id in batch.inserted_or_updated_tag_ids() {
            match self.deduplicate(tag_id) {
                Ok(removed) => report.removed_tags.extend(removed),
                Err(e) => {
                    warn!(tag = %tag_id, error = %e, "skipping tag deduplication");
                    report.skipped += 1;
                }
            }
        }
        for clip_id in batch.deleted_clip_ids() {
            match self.images.delete_all(clip_id) {
                Ok(()) => report.removed_image_dirs.push(clip_id),
                Err(StorageError::NotFound(_)) => {}
                Err(e) => {
                    warn!(clip = %clip_id, error = %e, "skipping image cleanup");
                    report.skipped += 1;
                }
            }
        }
        if !report.removed_tags.is_empty() || !report.removed_image_dirs.is_empty() {
            info!(
                tags = report.removed_tags.len(),
                image_dirs = report.removed_image_dirs.len(),
                "repaired remote changes"
            );
        }
        report
    }

    /// Collapses every duplicated tag name onto its lowest id.
    pub fn deduplicate_all_tags(&self) -> Result<Vec<TagId>> {
        let mut by_name: BTreeMap<String, Vec<TagId>> = BTreeMap::new();
        for tag in self.storage.read_all_tags()? {
            by_name.entry(tag.name).or_default().push(tag.id);
        }
        let mut removed = Vec::new();
        for (name, mut ids) in by_name {
            if ids.len() < 2 {
                continue;
            }
            ids.sort();
            match self.deduplicate(ids[0]) {
                Ok(losers) => removed.extend(losers),
                Err(e) => warn!(name = %name, error = %e, "skipping tag deduplication"),
            }
        }
        Ok(removed)
    }

    /// Deletes image directories whose clip no longer exists.
    pub fn sweep_orphaned_images(&self) -> Result<Vec<ClipId>> {
        let mut removed = Vec::new();
        for clip_id in self.images.clip_ids()? {
            if self.storage.read_clip(clip_id)?.is_some() {
                continue;
            }
            match self.images.delete_all(clip_id) {
                Ok(()) => removed.push(clip_id),
                Err(e) => warn!(clip = %clip_id, error = %e, "failed to remove orphaned images"),
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "removed orphaned image directories");
        }
        Ok(removed)
    }

    /// Mirrors the tag table into the lightweight reference store.
    pub fn synchronize_references(&self, reference: &ObjectStore) -> Result<usize> {
        let tags = self.storage.read_all_tags()?;
        let stale: Vec<TagId> = reference
            .read_all_tags()?
            .into_iter()
            .filter(|r| !tags.iter().any(|t| t.id == r.id))
            .map(|r| r.id)
            .collect();
        self.coordinator.transaction(reference, |r| {
            if !stale.is_empty() {
                r.delete_tags(&stale)?;
            }
            r.import_tags(&tags)
        })?;
        debug!(tags = tags.len(), stale = stale.len(), "synchronized reference tags");
        Ok(tags.len())
    }
}

impl<I: ImageStorage> IntegrityValidationService<SqliteStorage, I> {
    /// Reads the remote changes since the last poll and repairs them.
    pub fn poll_and_repair(&self, monitor: &RemoteChangeMonitor) -> Result<RepairReport> {
        let batch = monitor.poll(&self.storage)?;
        if batch.is_empty() {
            return Ok(RepairReport::default());
        }
        Ok(self.handle_remote_changes(&batch))
    }
}
