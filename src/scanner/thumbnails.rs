use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::ThumbnailConfig;

/// Writes thumbnails into the cache directory, one JPEG per image id.
pub struct ThumbnailGenerator {
    cache_dir: PathBuf,
    size: u32,
}

impl ThumbnailGenerator {
    pub fn new(config: &ThumbnailConfig) -> Self {
        Self {
            cache_dir: config.path.clone(),
            size: config.size,
        }
    }

    pub fn cache_path(&self, image_id: i64) -> PathBuf {
        self.cache_dir.join(format!("{}.jpg", image_id))
    }

    /// Generate the thumbnail, replacing any stale one.
    pub fn generate(&self, image_id: i64, original: &Path) -> Result<PathBuf> {
        fs::create_dir_all(&self.cache_dir)?;

        let cache_path = self.cache_path(image_id);
        let img = image::open(original)?;
        let thumbnail = img.thumbnail(self.size, self.size);

        // JPEG has no alpha channel
        thumbnail.to_rgb8().save(&cache_path)?;

        Ok(cache_path)
    }
}
