//! Disk indexing: keeps the folder and image tables in step with the library tree.

pub mod change_detection;
pub mod discovery;
pub mod reconcile;
pub mod watcher;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::{folders, Database};
use crate::events::{Notification, Notifier};
use crate::work::{Job, JobPriority, JobSignal, JobSource};

pub use reconcile::{FolderChanges, Reconciler};
pub use watcher::{FolderWatcher, NotifyFolderWatcher, NullFolderWatcher};

/// Something that can queue folders for re-indexing.
pub trait RescanProvider: Send + Sync {
    /// Queue the folders containing these images.
    fn mark_images_for_scan(&self, image_ids: &[i64]) -> Result<usize>;
}

pub struct IndexingService {
    db: Database,
    reconciler: Arc<Reconciler>,
    root: PathBuf,
    full_index_pending: AtomicBool,
    signal: JobSignal,
    notifier: Arc<dyn Notifier>,
}

impl IndexingService {
    pub fn new(
        db: Database,
        reconciler: Arc<Reconciler>,
        root: PathBuf,
        signal: JobSignal,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            db,
            reconciler,
            root,
            full_index_pending: AtomicBool::new(true),
            signal,
            notifier,
        }
    }

    fn flag(&self, message: String) {
        self.notifier.notify(Notification::Status(message));
        self.signal.flag("indexing");
    }

    pub fn mark_folders_for_scan(&self, folder_ids: &[i64]) -> Result<usize> {
        let count = folders::clear_scan_dates(&self.db.session(), folder_ids)?;
        self.flag(format!("{} folders flagged for re-indexing.", count));
        Ok(count)
    }

    pub fn mark_all_for_scan(&self) -> Result<usize> {
        let count = folders::clear_all_scan_dates(&self.db.session())?;
        self.flag("All folders flagged for re-indexing.".to_string());
        Ok(count)
    }

    /// Queue the nearest indexed folder at or above `path`.
    pub fn mark_path_for_scan(&self, path: &Path) -> Result<Option<i64>> {
        let folder = {
            let conn = self.db.session();
            let mut found = None;
            for candidate in path.ancestors() {
                if let Some(folder) = folders::get_by_path(&conn, candidate)? {
                    found = Some(folder);
                    break;
                }
                if candidate == self.root {
                    break;
                }
            }
            found
        };

        let Some(folder) = folder else {
            return Ok(None);
        };
        folders::clear_scan_dates(&self.db.session(), &[folder.id])?;
        self.flag(format!("Folder {} flagged for re-indexing.", folder.path.display()));
        Ok(Some(folder.id))
    }
}

impl RescanProvider for IndexingService {
    fn mark_images_for_scan(&self, image_ids: &[i64]) -> Result<usize> {
        let count = folders::clear_scan_dates_for_images(&self.db.session(), image_ids)?;
        self.flag(format!("{} images flagged for re-indexing.", image_ids.len()));
        Ok(count)
    }
}

#[async_trait]
impl JobSource for IndexingService {
    fn name(&self) -> &'static str {
        "indexing"
    }

    fn priority(&self) -> JobPriority {
        JobPriority::Indexing
    }

    async fn pending_jobs(&self, max_count: usize) -> Result<Vec<Box<dyn Job>>> {
        if self.full_index_pending.swap(false, Ordering::SeqCst) {
            let job = IndexJob {
                kind: IndexKind::Full,
                path: self.root.clone(),
                db: self.db.clone(),
                reconciler: Arc::clone(&self.reconciler),
                notifier: Arc::clone(&self.notifier),
            };
            return Ok(vec![Box::new(job)]);
        }

        let pending = folders::needing_scan(&self.db.session(), max_count)?;
        Ok(pending
            .into_iter()
            .map(|folder| {
                Box::new(IndexJob {
                    kind: IndexKind::Folder,
                    path: folder.path,
                    db: self.db.clone(),
                    reconciler: Arc::clone(&self.reconciler),
                    notifier: Arc::clone(&self.notifier),
                }) as Box<dyn Job>
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexKind {
    Full,
    Folder,
}

#[derive(Clone)]
struct IndexJob {
    kind: IndexKind,
    path: PathBuf,
    db: Database,
    reconciler: Arc<Reconciler>,
    notifier: Arc<dyn Notifier>,
}

impl IndexJob {
    fn run(&self) -> Result<()> {
        match self.kind {
            IndexKind::Full => {
                info!(root = %self.path.display(), "Full index started");
                let changes = self.reconciler.index_folder(&self.path, None);
                info!(
                    folders_added = changes.folders_added,
                    folders_removed = changes.folders_removed,
                    folders_failed = changes.folders_failed,
                    images_added = changes.images_added,
                    images_updated = changes.images_updated,
                    images_removed = changes.images_removed,
                    "Full index complete"
                );
                if changes.structure_changed() {
                    self.notifier.notify(Notification::FoldersChanged);
                }
            }
            IndexKind::Folder => {
                let (folder, parent) = {
                    let conn = self.db.session();
                    let Some(folder) = folders::get_by_path(&conn, &self.path)? else {
                        return Ok(());
                    };
                    let parent = match folder.parent_id {
                        Some(id) => folders::get(&conn, id)?,
                        None => None,
                    };
                    (folder, parent)
                };

                if !self.reconciler.is_monitored(&folder.path) {
                    self.reconciler.remove_folder_tree(&folder)?;
                    self.notifier.notify(Notification::FoldersChanged);
                    return Ok(());
                }

                let changes = self.reconciler.index_folder(&folder.path, parent.as_ref());
                if changes.folders_failed > 0 {
                    // Stamp it so a folder that keeps failing is not picked up on every poll
                    warn!(path = %folder.path.display(), "Folder indexed with errors");
                    folders::set_scan_date(&self.db.session(), folder.id, &Utc::now())?;
                }
                if changes.structure_changed() {
                    self.notifier.notify(Notification::FoldersChanged);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Job for IndexJob {
    fn name(&self) -> &str {
        match self.kind {
            IndexKind::Full => "Full Index",
            IndexKind::Folder => "Indexing",
        }
    }

    fn description(&self) -> String {
        format!("{} {}", self.name(), self.path.display())
    }

    fn priority(&self) -> JobPriority {
        match self.kind {
            IndexKind::Full => JobPriority::FullIndexing,
            IndexKind::Folder => JobPriority::Indexing,
        }
    }

    async fn process(&self) -> Result<()> {
        let job = self.clone();
        tokio::task::spawn_blocking(move || job.run()).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ImageCache;
    use crate::config::LibraryConfig;
    use crate::db::images;
    use crate::events::LogNotifier;
    use std::fs::{self, File};
    use tempfile::tempdir;

    fn service(root: &Path) -> (IndexingService, Database, JobSignal) {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        let library = LibraryConfig {
            root: root.to_path_buf(),
            ..LibraryConfig::default()
        };
        let cache = Arc::new(ImageCache::new(db.clone(), Arc::clone(&notifier)));
        let reconciler = Arc::new(Reconciler::new(
            db.clone(),
            library,
            cache,
            Arc::new(NullFolderWatcher),
            Arc::clone(&notifier),
        ));
        let signal = JobSignal::new();
        let service = IndexingService::new(
            db.clone(),
            reconciler,
            root.to_path_buf(),
            signal.clone(),
            notifier,
        );
        (service, db, signal)
    }

    async fn run_all(jobs: Vec<Box<dyn Job>>) {
        for job in jobs {
            job.process().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_full_index_then_marked_folders() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        File::create(dir.path().join("a/b/one.jpg")).unwrap();
        let (service, db, signal) = service(dir.path());

        let jobs = service.pending_jobs(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].priority(), JobPriority::FullIndexing);
        assert_eq!(jobs[0].description(), format!("Full Index {}", dir.path().display()));
        run_all(jobs).await;

        assert_eq!(images::count(&db.session()).unwrap(), 1);
        assert!(service.pending_jobs(10).await.unwrap().is_empty());

        let deep = dir.path().join("a/b/new-file.jpg");
        let marked = service.mark_path_for_scan(&deep).unwrap();
        assert!(marked.is_some());
        assert!(signal.take());

        let jobs = service.pending_jobs(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].description(), format!("Indexing {}", dir.path().join("a/b").display()));

        File::create(&deep).unwrap();
        run_all(jobs).await;
        assert_eq!(images::count(&db.session()).unwrap(), 2);
        assert!(service.pending_jobs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_all_and_images() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("x")).unwrap();
        File::create(dir.path().join("x/p.jpg")).unwrap();
        let (service, db, signal) = service(dir.path());
        run_all(service.pending_jobs(10).await.unwrap()).await;

        assert_eq!(service.mark_all_for_scan().unwrap(), 2);
        assert_eq!(service.pending_jobs(1).await.unwrap().len(), 1);
        assert_eq!(service.pending_jobs(10).await.unwrap().len(), 2);
        run_all(service.pending_jobs(10).await.unwrap()).await;
        signal.take();

        let image_id = images::needing_metadata(&db.session(), 10).unwrap()[0].0;
        assert_eq!(service.mark_images_for_scan(&[image_id]).unwrap(), 1);
        assert!(signal.take());
        let jobs = service.pending_jobs(10).await.unwrap();
        assert_eq!(jobs[0].description(), format!("Indexing {}", dir.path().join("x").display()));
    }

    #[tokio::test]
    async fn test_vanished_folder_job_removes_record() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("gone")).unwrap();
        File::create(dir.path().join("gone/p.jpg")).unwrap();
        let (service, db, _signal) = service(dir.path());
        run_all(service.pending_jobs(10).await.unwrap()).await;

        let gone = folders::get_by_path(&db.session(), &dir.path().join("gone")).unwrap().unwrap();
        service.mark_folders_for_scan(&[gone.id]).unwrap();
        fs::remove_dir_all(dir.path().join("gone")).unwrap();

        run_all(service.pending_jobs(10).await.unwrap()).await;
        assert!(folders::get(&db.session(), gone.id).unwrap().is_none());
        assert_eq!(images::count(&db.session()).unwrap(), 0);
    }
}
