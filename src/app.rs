//! Wiring of the background services around one library database.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::ImageCache;
use crate::config::Config;
use crate::db::Database;
use crate::events::{ConflatingNotifier, Notifier};
use crate::exif::{ExifService, ExifTool, TagWriter};
use crate::indexing::{FolderWatcher, IndexingService, Reconciler, RescanProvider};
use crate::scanner::{MetadataService, ThumbnailGenerator, ThumbnailService};
use crate::work::{JobSignal, WorkService};

/// A photo library with its scheduler and job sources.
pub struct Library {
    config: Config,
    db: Database,
    notifier: Arc<dyn Notifier>,
    cache: Arc<ImageCache>,
    indexing: Arc<IndexingService>,
    exif: Arc<ExifService>,
    work: Arc<WorkService>,
}

impl Library {
    /// Open the configured database and build the services around it.
    ///
    /// Must be called inside a tokio runtime.
    pub fn open(
        config: Config,
        notifier: Arc<dyn Notifier>,
        watcher: Arc<dyn FolderWatcher>,
    ) -> Result<Self> {
        let db = Database::open(&config.db_path)?;
        db.initialize()?;
        let writer: Arc<dyn TagWriter> = Arc::new(ExifTool::new(config.exif.exiftool_path.clone()));
        Ok(Self::build(config, db, notifier, watcher, writer))
    }

    pub fn build(
        config: Config,
        db: Database,
        notifier: Arc<dyn Notifier>,
        watcher: Arc<dyn FolderWatcher>,
        writer: Arc<dyn TagWriter>,
    ) -> Self {
        let window = Duration::from_secs(config.notifications.folder_change_window_secs);
        let notifier: Arc<dyn Notifier> = Arc::new(ConflatingNotifier::new(notifier, window));

        let signal = JobSignal::new();
        let cache = Arc::new(ImageCache::new(db.clone(), Arc::clone(&notifier)));

        let reconciler = Arc::new(Reconciler::new(
            db.clone(),
            config.library.clone(),
            Arc::clone(&cache),
            watcher,
            Arc::clone(&notifier),
        ));
        let indexing = Arc::new(IndexingService::new(
            db.clone(),
            reconciler,
            config.library.root.clone(),
            signal.clone(),
            Arc::clone(&notifier),
        ));

        let rescan: Arc<dyn RescanProvider> = indexing.clone();
        let exif = Arc::new(ExifService::new(
            db.clone(),
            &config.exif,
            writer,
            rescan,
            Arc::clone(&cache),
            signal.clone(),
            Arc::clone(&notifier),
        ));

        let work = Arc::new(WorkService::new(&config.work, signal, Arc::clone(&notifier)));
        if config.library.enable_indexing {
            work.add_job_source(indexing.clone());
        } else {
            info!("Indexing disabled");
        }
        work.add_job_source(exif.clone());
        work.add_job_source(Arc::new(MetadataService::new(db.clone(), Arc::clone(&cache))));
        work.add_job_source(Arc::new(ThumbnailService::new(
            db.clone(),
            ThumbnailGenerator::new(&config.thumbnails),
        )));

        Self {
            config,
            db,
            notifier,
            cache,
            indexing,
            exif,
            work,
        }
    }

    /// Queue a rescan for every folder the watcher reports as changed.
    pub fn forward_watch_events(&self, mut changes: UnboundedReceiver<PathBuf>) -> JoinHandle<()> {
        let indexing = Arc::clone(&self.indexing);
        tokio::spawn(async move {
            while let Some(dir) = changes.recv().await {
                match indexing.mark_path_for_scan(&dir) {
                    Ok(Some(folder_id)) => {
                        debug!(folder_id, path = %dir.display(), "Folder changed")
                    }
                    Ok(None) => debug!(path = %dir.display(), "Change outside indexed folders"),
                    Err(e) => {
                        warn!(path = %dir.display(), error = %e, "Failed to flag folder for rescan")
                    }
                }
            }
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        Arc::clone(&self.notifier)
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    pub fn indexing(&self) -> &Arc<IndexingService> {
        &self.indexing
    }

    pub fn exif(&self) -> &Arc<ExifService> {
        &self.exif
    }

    pub fn work(&self) -> &Arc<WorkService> {
        &self.work
    }
}
