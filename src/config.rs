use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StorageError};
use crate::storage::history;

pub struct AppPaths {
    pub base_dir: PathBuf,
    pub db_path: PathBuf,
    pub images_dir: PathBuf,
    pub temporaries_path: PathBuf,
    pub temporary_images_dir: PathBuf,
    pub reference_path: PathBuf,
    pub history_token_path: PathBuf,
    pub settings_path: PathBuf,
    pub log_file: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self> {
        let base = dirs::data_dir()
            .ok_or_else(|| StorageError::Config("could not determine the data directory".into()))?
            .join("clipbox");
        Ok(Self::from_base(base))
    }

    pub fn from_base(base: PathBuf) -> Self {
        Self {
            db_path: base.join("clips.sqlite"),
            images_dir: base.join("images"),
            temporaries_path: base.join("temporaries").join("clips.json"),
            temporary_images_dir: base.join("temporaries").join("images"),
            reference_path: base.join("reference.json"),
            history_token_path: base.join("history-token.json"),
            settings_path: base.join("settings.toml"),
            log_file: base.join("clipbox.log"),
            base_dir: base,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub show_hidden_items: bool,
    pub remote_sync_enabled: bool,
    /// Recorded with every write so this install can skip its own history rows.
    /// Empty until `load_or_init` assigns one.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub author: String,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            show_hidden_items: false,
            remote_sync_enabled: false,
            author: String::new(),
            log_filter: "warn".into(),
        }
    }
}

impl Settings {
    /// Reads the settings file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(StorageError::Config(format!("{}: {}", path.display(), e))),
        };
        toml::from_str(&text).map_err(|e| StorageError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Like `load`, but assigns a per-install author on first run and saves it.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        let mut settings = Self::load(path)?;
        if settings.author.is_empty() {
            settings.author = history::new_author();
            settings.save(path)?;
        }
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| StorageError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_base() {
        let paths = AppPaths::from_base(PathBuf::from("/tmp/test-clipbox"));
        assert_eq!(paths.base_dir, PathBuf::from("/tmp/test-clipbox"));
        assert_eq!(paths.db_path, PathBuf::from("/tmp/test-clipbox/clips.sqlite"));
        assert_eq!(paths.images_dir, PathBuf::from("/tmp/test-clipbox/images"));
        assert_eq!(
            paths.temporaries_path,
            PathBuf::from("/tmp/test-clipbox/temporaries/clips.json")
        );
        assert_eq!(paths.settings_path, PathBuf::from("/tmp/test-clipbox/settings.toml"));
    }

    #[test]
    fn test_missing_settings_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(&dir.path().join("settings.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_partial_settings_fill_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "show_hidden_items = true\n").unwrap();
        let settings = Settings::load(&path).unwrap();
        assert!(settings.show_hidden_items);
        assert!(settings.author.is_empty());
    }

    #[test]
    fn test_load_or_init_assigns_author_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "show_hidden_items = true\n").unwrap();

        let first = Settings::load_or_init(&path).unwrap();
        assert!(!first.author.is_empty());
        assert!(first.show_hidden_items);
        assert_eq!(Settings::load_or_init(&path).unwrap().author, first.author);

        let other = TempDir::new().unwrap();
        let elsewhere = Settings::load_or_init(&other.path().join("settings.toml")).unwrap();
        assert_ne!(elsewhere.author, first.author);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/settings.toml");
        let settings = Settings {
            remote_sync_enabled: true,
            author: "laptop".into(),
            ..Settings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_malformed_settings_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "show_hidden_items = [").unwrap();
        assert!(matches!(Settings::load(&path), Err(StorageError::Config(_))));
    }
}
