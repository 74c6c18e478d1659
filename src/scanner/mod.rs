//! Metadata extraction and thumbnail generation for indexed images.

pub mod hashing;
pub mod metadata;
pub mod thumbnails;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::ImageCache;
use crate::db::{images, Database};
use crate::work::{Job, JobPriority, JobSource};

pub use hashing::{calculate_hashes, HashResult};
pub use metadata::extract_metadata;
pub use thumbnails::ThumbnailGenerator;

/// Produces a job for every image whose metadata is out of date.
pub struct MetadataService {
    db: Database,
    cache: Arc<ImageCache>,
}

impl MetadataService {
    pub fn new(db: Database, cache: Arc<ImageCache>) -> Self {
        Self { db, cache }
    }
}

#[async_trait]
impl JobSource for MetadataService {
    fn name(&self) -> &'static str {
        "metadata"
    }

    fn priority(&self) -> JobPriority {
        JobPriority::Metadata
    }

    async fn pending_jobs(&self, max_count: usize) -> Result<Vec<Box<dyn Job>>> {
        let pending = images::needing_metadata(&self.db.session(), max_count)?;
        Ok(pending
            .into_iter()
            .map(|(image_id, path)| {
                Box::new(MetadataJob {
                    image_id,
                    path,
                    db: self.db.clone(),
                    cache: Arc::clone(&self.cache),
                }) as Box<dyn Job>
            })
            .collect())
    }
}

#[derive(Clone)]
struct MetadataJob {
    image_id: i64,
    path: PathBuf,
    db: Database,
    cache: Arc<ImageCache>,
}

impl MetadataJob {
    fn run(&self) -> Result<()> {
        let now = Utc::now();
        let hashes = match calculate_hashes(&self.path) {
            Ok(hashes) => hashes,
            Err(e) => {
                // Stamp anyway so the image is not retried on every poll; the
                // indexer removes it if it is gone
                warn!(path = %self.path.display(), error = %e, "Unable to read image for metadata");
                images::mark_metadata_attempted(&self.db.session(), self.image_id, &now)?;
                return Ok(());
            }
        };

        let metadata = extract_metadata(&self.path);
        images::save_metadata(
            &self.db.session(),
            self.image_id,
            &metadata,
            Some(&hashes.sha256),
            hashes.perceptual.as_deref(),
            &now,
        )?;
        self.cache.evict(self.image_id);

        debug!(path = %self.path.display(), "Metadata updated");
        Ok(())
    }
}

#[async_trait]
impl Job for MetadataJob {
    fn name(&self) -> &str {
        "Metadata Scan"
    }

    fn description(&self) -> String {
        format!("Metadata {}", self.path.display())
    }

    fn priority(&self) -> JobPriority {
        JobPriority::Metadata
    }

    async fn process(&self) -> Result<()> {
        let job = self.clone();
        tokio::task::spawn_blocking(move || job.run()).await?
    }
}

/// Produces a job for every image with metadata but no current thumbnail.
pub struct ThumbnailService {
    db: Database,
    generator: Arc<ThumbnailGenerator>,
}

impl ThumbnailService {
    pub fn new(db: Database, generator: ThumbnailGenerator) -> Self {
        Self {
            db,
            generator: Arc::new(generator),
        }
    }
}

#[async_trait]
impl JobSource for ThumbnailService {
    fn name(&self) -> &'static str {
        "thumbnails"
    }

    fn priority(&self) -> JobPriority {
        JobPriority::Thumbnails
    }

    async fn pending_jobs(&self, max_count: usize) -> Result<Vec<Box<dyn Job>>> {
        let pending = images::needing_thumbnail(&self.db.session(), max_count)?;
        Ok(pending
            .into_iter()
            .map(|(image_id, path)| {
                Box::new(ThumbnailJob {
                    image_id,
                    path,
                    db: self.db.clone(),
                    generator: Arc::clone(&self.generator),
                }) as Box<dyn Job>
            })
            .collect())
    }
}

#[derive(Clone)]
struct ThumbnailJob {
    image_id: i64,
    path: PathBuf,
    db: Database,
    generator: Arc<ThumbnailGenerator>,
}

impl ThumbnailJob {
    fn run(&self) -> Result<()> {
        match self.generator.generate(self.image_id, &self.path) {
            Ok(thumb) => {
                debug!(path = %self.path.display(), thumb = %thumb.display(), "Thumbnail generated")
            }
            Err(e) => warn!(path = %self.path.display(), error = %e, "Thumbnail generation failed"),
        }
        images::mark_thumbnail(&self.db.session(), self.image_id, &Utc::now())
    }
}

#[async_trait]
impl Job for ThumbnailJob {
    fn name(&self) -> &str {
        "Thumbnails"
    }

    fn description(&self) -> String {
        format!("Thumbnail {}", self.path.display())
    }

    fn priority(&self) -> JobPriority {
        JobPriority::Thumbnails
    }

    async fn process(&self) -> Result<()> {
        let job = self.clone();
        tokio::task::spawn_blocking(move || job.run()).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThumbnailConfig;
    use crate::db::folders;
    use crate::db::images::FileFacts;
    use crate::events::LogNotifier;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_metadata_then_thumbnail() {
        let dir = tempdir().unwrap();
        image::RgbImage::new(40, 20)
            .save(dir.path().join("pic.png"))
            .unwrap();
        std::fs::write(dir.path().join("broken.png"), b"nope").unwrap();

        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let (pic, broken) = {
            let conn = db.session();
            let folder = folders::insert(&conn, dir.path(), None).unwrap();
            let now = Utc::now();
            let facts = |name: &str| FileFacts {
                filename: name.to_string(),
                file_size: 0,
                created: now,
                modified: now,
            };
            (
                images::insert(&conn, folder.id, &facts("pic.png"), &now).unwrap(),
                images::insert(&conn, folder.id, &facts("broken.png"), &now).unwrap(),
            )
        };

        let cache = Arc::new(ImageCache::new(db.clone(), Arc::new(LogNotifier)));
        let metadata = MetadataService::new(db.clone(), cache);
        let thumbnails = ThumbnailService::new(
            db.clone(),
            ThumbnailGenerator::new(&ThumbnailConfig {
                path: dir.path().join("thumbs"),
                size: 16,
            }),
        );

        assert!(thumbnails.pending_jobs(10).await.unwrap().is_empty());
        let jobs = metadata.pending_jobs(10).await.unwrap();
        assert_eq!(jobs.len(), 2);
        for job in jobs {
            job.process().await.unwrap();
        }
        assert!(metadata.pending_jobs(10).await.unwrap().is_empty());

        let stored = images::get_metadata(&db.session(), pic).unwrap().unwrap();
        assert_eq!((stored.width, stored.height), (Some(40), Some(20)));
        assert!(images::get(&db.session(), pic).unwrap().unwrap().sha256_hash.is_some());

        let jobs = thumbnails.pending_jobs(10).await.unwrap();
        assert_eq!(jobs.len(), 2);
        for job in jobs {
            job.process().await.unwrap();
        }
        assert!(dir.path().join(format!("thumbs/{}.jpg", pic)).exists());
        assert!(!dir.path().join(format!("thumbs/{}.jpg", broken)).exists());
        assert!(thumbnails.pending_jobs(10).await.unwrap().is_empty());
    }
}
