use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::errors::{Result, StorageError};
use super::models::ClipId;

/// Blob store for the image files behind clip items, keyed by clip and file name.
pub trait ImageStorage: Send + Sync {
    fn save(&self, data: &[u8], file_name: &str, clip_id: ClipId) -> Result<()>;
    fn delete(&self, file_name: &str, clip_id: ClipId) -> Result<()>;
    /// Removes every file of a clip. Fails with `NotFound` when the clip has none.
    fn delete_all(&self, clip_id: ClipId) -> Result<()>;
    fn read(&self, file_name: &str, clip_id: ClipId) -> Result<Vec<u8>>;
    fn exists(&self, file_name: &str, clip_id: ClipId) -> bool;
    /// Clips that currently own a directory.
    fn clip_ids(&self) -> Result<Vec<ClipId>>;
}

impl<T: ImageStorage + ?Sized> ImageStorage for Arc<T> {
    fn save(&self, data: &[u8], file_name: &str, clip_id: ClipId) -> Result<()> {
        (**self).save(data, file_name, clip_id)
    }

    fn delete(&self, file_name: &str, clip_id: ClipId) -> Result<()> {
        (**self).delete(file_name, clip_id)
    }

    fn delete_all(&self, clip_id: ClipId) -> Result<()> {
        (**self).delete_all(clip_id)
    }

    fn read(&self, file_name: &str, clip_id: ClipId) -> Result<Vec<u8>> {
        (**self).read(file_name, clip_id)
    }

    fn exists(&self, file_name: &str, clip_id: ClipId) -> bool {
        (**self).exists(file_name, clip_id)
    }

    fn clip_ids(&self) -> Result<Vec<ClipId>> {
        (**self).clip_ids()
    }
}

/// One directory per clip under `root`.
pub struct FsImageStorage {
    root: PathBuf,
}

impl FsImageStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn clip_dir(&self, clip_id: ClipId) -> PathBuf {
        self.root.join(clip_id.to_string())
    }

    fn file_path(&self, file_name: &str, clip_id: ClipId) -> Result<PathBuf> {
        validate_file_name(file_name)?;
        Ok(self.clip_dir(clip_id).join(file_name))
    }
}

fn validate_file_name(file_name: &str) -> Result<()> {
    if file_name.is_empty()
        || file_name == "."
        || file_name == ".."
        || file_name.contains(['/', '\\', '\0'])
    {
        return Err(StorageError::InvalidParameter(format!(
            "invalid image file name {:?}",
            file_name
        )));
    }
    Ok(())
}

fn not_found(e: std::io::Error, what: String) -> StorageError {
    if e.kind() == ErrorKind::NotFound {
        StorageError::NotFound(what)
    } else {
        e.into()
    }
}

impl ImageStorage for FsImageStorage {
    fn save(&self, data: &[u8], file_name: &str, clip_id: ClipId) -> Result<()> {
        let path = self.file_path(file_name, clip_id)?;
        fs::create_dir_all(self.clip_dir(clip_id))?;
        let tmp = path.with_file_name(format!(".{}.tmp", file_name));
        fs::write(&tmp, data)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(clip = %clip_id, file = file_name, bytes = data.len(), "saved image");
        Ok(())
    }

    fn delete(&self, file_name: &str, clip_id: ClipId) -> Result<()> {
        let path = self.file_path(file_name, clip_id)?;
        fs::remove_file(&path).map_err(|e| not_found(e, format!("image {}/{}", clip_id, file_name)))
    }

    fn delete_all(&self, clip_id: ClipId) -> Result<()> {
        fs::remove_dir_all(self.clip_dir(clip_id))
            .map_err(|e| not_found(e, format!("images of clip {}", clip_id)))
    }

    fn read(&self, file_name: &str, clip_id: ClipId) -> Result<Vec<u8>> {
        let path = self.file_path(file_name, clip_id)?;
        fs::read(&path).map_err(|e| not_found(e, format!("image {}/{}", clip_id, file_name)))
    }

    fn exists(&self, file_name: &str, clip_id: ClipId) -> bool {
        self.file_path(file_name, clip_id)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    fn clip_ids(&self) -> Result<Vec<ClipId>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage() -> (TempDir, FsImageStorage) {
        let dir = TempDir::new().unwrap();
        let storage = FsImageStorage::new(dir.path().join("images"));
        (dir, storage)
    }

    #[test]
    fn test_save_and_read() {
        let (_dir, images) = storage();
        let clip = ClipId::new();
        images.save(b"png", "a.png", clip).unwrap();
        assert!(images.exists("a.png", clip));
        assert_eq!(images.read("a.png", clip).unwrap(), b"png");
    }

    #[test]
    fn test_save_overwrites() {
        let (_dir, images) = storage();
        let clip = ClipId::new();
        images.save(b"one", "a.png", clip).unwrap();
        images.save(b"two", "a.png", clip).unwrap();
        assert_eq!(images.read("a.png", clip).unwrap(), b"two");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let (_dir, images) = storage();
        let clip = ClipId::new();
        assert!(images.read("nope.png", clip).unwrap_err().is_not_found());
        assert!(images.delete("nope.png", clip).unwrap_err().is_not_found());
        assert!(images.delete_all(clip).unwrap_err().is_not_found());
    }

    #[test]
    fn test_rejects_path_separators() {
        let (_dir, images) = storage();
        let result = images.save(b"x", "../escape.png", ClipId::new());
        assert!(matches!(result, Err(StorageError::InvalidParameter(_))));
    }

    #[test]
    fn test_delete_all_and_clip_ids() {
        let (_dir, images) = storage();
        let (a, b) = (ClipId::new(), ClipId::new());
        images.save(b"x", "1.png", a).unwrap();
        images.save(b"y", "1.png", b).unwrap();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(images.clip_ids().unwrap(), expected);
        images.delete_all(a).unwrap();
        assert_eq!(images.clip_ids().unwrap(), vec![b]);
    }

    #[test]
    fn test_clip_ids_without_root() {
        let (_dir, images) = storage();
        assert!(images.clip_ids().unwrap().is_empty());
    }
}
