use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::errors::{Result, StorageError};
use crate::storage::images::ImageStorage;
use crate::storage::models::{Clip, ClipId, ClipRecipe, ImageData, TagId, TagRecipe};
use crate::storage::ClipStorage;
use super::command::ClipCommandService;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistReport {
    pub persisted: Vec<ClipId>,
    /// Already present in the persistent store; removed from the temporaries.
    pub dropped: Vec<ClipId>,
    /// Left in the temporaries for the next run.
    pub failed: Vec<ClipId>,
}

/// Moves clips staged in the temporary store into the persistent store.
pub struct TemporariesPersistService<S: ClipStorage + ?Sized, I: ImageStorage> {
    temporaries: Arc<dyn ClipStorage>,
    temporary_images: Arc<dyn ImageStorage>,
    commands: Arc<ClipCommandService<S, I>>,
}

impl<S: ClipStorage + ?Sized, I: ImageStorage> TemporariesPersistService<S, I> {
    pub fn new(
        temporaries: Arc<dyn ClipStorage>,
        temporary_images: Arc<dyn ImageStorage>,
        commands: Arc<ClipCommandService<S, I>>,
    ) -> Self {
        Self {
            temporaries,
            temporary_images,
            commands,
        }
    }

    /// Maps every temporary tag id to a persistent one, creating tags that
    /// are missing. A name that already exists maps to the existing tag.
    fn persist_tags(&self) -> Result<HashMap<TagId, TagId>> {
        let persistent = self.commands.storage().read_all_tags()?;
        let mut mapping = HashMap::new();
        for tag in self.temporaries.read_all_tags()? {
            if persistent.iter().any(|p| p.id == tag.id) {
                mapping.insert(tag.id, tag.id);
                continue;
            }
            if let Some(existing) = persistent.iter().find(|p| p.name == tag.name) {
                mapping.insert(tag.id, existing.id);
                continue;
            }
            match self.commands.create_tag_from(&TagRecipe::from(&tag)) {
                Ok(created) => {
                    mapping.insert(tag.id, created.id);
                }
                Err(e) => warn!(tag = %tag.id, error = %e, "failed to persist temporary tag"),
            }
        }
        Ok(mapping)
    }

    fn image_data(&self, clip: &Clip) -> Result<Vec<ImageData>> {
        clip.items
            .iter()
            .map(|item| {
                let bytes = self.temporary_images.read(&item.image_file_name, clip.id)?;
                Ok(ImageData::new(item.image_file_name.clone(), bytes))
            })
            .collect()
    }

    fn persist_clip(&self, clip: &Clip, tags: &HashMap<TagId, TagId>) -> Result<()> {
        let mut recipe = ClipRecipe::from_clip(clip);
        recipe.tag_ids = clip
            .tag_ids()
            .iter()
            .filter_map(|id| tags.get(id).copied())
            .collect();
        let data = self.image_data(clip)?;
        self.commands.create(&recipe, &data, false)?;
        Ok(())
    }

    fn remove_from_temporaries(&self, ids: &[ClipId]) -> Result<()> {
        self.commands
            .coordinator()
            .transaction(&*self.temporaries, |t| t.delete_clips(ids))?;
        for clip_id in ids {
            match self.temporary_images.delete_all(*clip_id) {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(e) => warn!(clip = %clip_id, error = %e, "failed to remove temporary images"),
            }
        }
        Ok(())
    }

    /// Runs one pass under the coordinator lock.
    pub fn persist_all(&self) -> Result<PersistReport> {
        let coordinator = self.commands.coordinator().clone();
        coordinator.perform(|| {
            let clips = self.temporaries.read_all_clips()?;
            let mut report = PersistReport::default();
            if clips.is_empty() {
                return Ok(report);
            }
            let tags = self.persist_tags()?;
            for clip in &clips {
                match self.persist_clip(clip, &tags) {
                    Ok(()) => report.persisted.push(clip.id),
                    Err(StorageError::Duplicated(_)) => {
                        warn!(clip = %clip.id, "clip already persisted, dropping temporary copy");
                        report.dropped.push(clip.id);
                    }
                    Err(e) => {
                        warn!(clip = %clip.id, error = %e, "failed to persist temporary clip");
                        report.failed.push(clip.id);
                    }
                }
            }
            let done: Vec<ClipId> = report
                .persisted
                .iter()
                .chain(report.dropped.iter())
                .copied()
                .collect();
            if !done.is_empty() {
                self.remove_from_temporaries(&done)?;
            }
            info!(
                persisted = report.persisted.len(),
                dropped = report.dropped.len(),
                failed = report.failed.len(),
                "persisted temporaries"
            );
            Ok(report)
        })
    }
}
