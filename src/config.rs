use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub library: LibraryConfig,

    #[serde(default)]
    pub work: WorkConfig,

    #[serde(default)]
    pub exif: ExifConfig,

    #[serde(default)]
    pub thumbnails: ThumbnailConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Root of the photo tree.
    #[serde(default = "default_library_root")]
    pub root: PathBuf,

    /// When false no indexing jobs are produced and no folders are watched.
    #[serde(default = "default_true")]
    pub enable_indexing: bool,

    /// Folders with this name are never indexed.
    #[serde(default = "default_trash_folder_name")]
    pub trash_folder_name: String,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    #[serde(default = "default_sidecar_extensions")]
    pub sidecar_extensions: Vec<String>,
}

fn default_library_root() -> PathBuf {
    dirs::picture_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_true() -> bool {
    true
}

fn default_trash_folder_name() -> String {
    ".pholio_trash".to_string()
}

fn default_image_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "gif".to_string(),
        "webp".to_string(),
        "tif".to_string(),
        "tiff".to_string(),
        "heic".to_string(),
        "cr2".to_string(),
        "nef".to_string(),
        "arw".to_string(),
    ]
}

fn default_sidecar_extensions() -> Vec<String> {
    vec!["xmp".to_string()]
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            root: default_library_root(),
            enable_indexing: default_true(),
            trash_folder_name: default_trash_folder_name(),
            image_extensions: default_image_extensions(),
            sidecar_extensions: default_sidecar_extensions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkConfig {
    /// Percentage of wall time the scheduler may spend running jobs (0 disables).
    #[serde(default = "default_cpu_level")]
    pub cpu_level: u8,

    /// Alternate percentage used between `alt_hours_start` and `alt_hours_end`.
    #[serde(default)]
    pub alt_cpu_level: Option<u8>,

    /// Start hour of the alternate window (0-23).
    #[serde(default)]
    pub alt_hours_start: Option<u8>,

    /// End hour of the alternate window (0-23). May be smaller than the start
    /// for overnight windows.
    #[serde(default)]
    pub alt_hours_end: Option<u8>,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_cpu_level() -> u8 {
    50
}

fn default_max_queue_size() -> usize {
    500
}

fn default_poll_interval_secs() -> u64 {
    if cfg!(debug_assertions) {
        10
    } else {
        30
    }
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            cpu_level: default_cpu_level(),
            alt_cpu_level: None,
            alt_hours_start: None,
            alt_hours_end: None,
            max_queue_size: default_max_queue_size(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExifConfig {
    #[serde(default = "default_exiftool_path")]
    pub exiftool_path: PathBuf,

    /// Operations younger than this are left alone so rapid edits can be conflated.
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,

    /// Written operations older than this are deleted by the cleanup job.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u64,
}

fn default_exiftool_path() -> PathBuf {
    PathBuf::from("exiftool")
}

fn default_debounce_secs() -> u64 {
    30
}

fn default_retention_days() -> u32 {
    180
}

fn default_cleanup_interval_hours() -> u64 {
    24
}

impl Default for ExifConfig {
    fn default() -> Self {
        Self {
            exiftool_path: default_exiftool_path(),
            debounce_secs: default_debounce_secs(),
            retention_days: default_retention_days(),
            cleanup_interval_hours: default_cleanup_interval_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    #[serde(default = "default_thumb_cache_path")]
    pub path: PathBuf,

    #[serde(default = "default_thumb_cache_size")]
    pub size: u32,
}

fn default_thumb_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("pholio/thumbnails")
}

fn default_thumb_cache_size() -> u32 {
    256
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            path: default_thumb_cache_path(),
            size: default_thumb_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Quiet period before a burst of folder changes is reported once.
    #[serde(default = "default_folder_change_window_secs")]
    pub folder_change_window_secs: u64,
}

fn default_folder_change_window_secs() -> u64 {
    10
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            folder_change_window_secs: default_folder_change_window_secs(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pholio")
        .join("pholio.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            library: LibraryConfig::default(),
            work: WorkConfig::default(),
            exif: ExifConfig::default(),
            thumbnails: ThumbnailConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl Config {
    /// Load from the default location, writing a default file if none exists.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("PHOLIO_CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pholio")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [library]
            root = "/photos"

            [work]
            cpu_level = 25
            alt_cpu_level = 100
            alt_hours_start = 22
            alt_hours_end = 6
            "#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.library.root, PathBuf::from("/photos"));
        assert!(config.library.enable_indexing);
        assert_eq!(config.work.cpu_level, 25);
        assert_eq!(config.work.alt_cpu_level, Some(100));
        assert_eq!(config.work.max_queue_size, 500);
        assert_eq!(config.exif.debounce_secs, 30);
        assert_eq!(config.notifications.folder_change_window_secs, 10);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.exif.retention_days = 7;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.exif.retention_days, 7);
        assert_eq!(loaded.library.image_extensions, config.library.image_extensions);
    }
}
