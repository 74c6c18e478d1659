//! Mirrors a directory tree into the folder and image tables.

use anyhow::Result;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::ops::AddAssign;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::change_detection::{file_facts, is_modified_since};
use super::discovery::{find_sidecar, is_monitored_folder, list_image_names, list_subdirectories};
use super::watcher::FolderWatcher;
use crate::cache::ImageCache;
use crate::config::LibraryConfig;
use crate::db::images::FileFacts;
use crate::db::{folders, images, Database, Folder};
use crate::events::{Notification, Notifier};

/// What one reconciliation pass changed. Summed up the recursion by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderChanges {
    pub folders_added: usize,
    pub folders_removed: usize,
    pub folders_failed: usize,
    pub images_added: usize,
    pub images_updated: usize,
    pub images_removed: usize,
}

impl FolderChanges {
    pub fn structure_changed(&self) -> bool {
        self.folders_added > 0 || self.folders_removed > 0
    }

    pub fn images_changed(&self) -> bool {
        self.images_added > 0 || self.images_removed > 0
    }
}

impl AddAssign for FolderChanges {
    fn add_assign(&mut self, other: Self) {
        self.folders_added += other.folders_added;
        self.folders_removed += other.folders_removed;
        self.folders_failed += other.folders_failed;
        self.images_added += other.images_added;
        self.images_updated += other.images_updated;
        self.images_removed += other.images_removed;
    }
}

/// Planned mutations for one folder, computed before taking the database lock.
#[derive(Default)]
struct ImagePlan {
    inserts: Vec<FileFacts>,
    updates: Vec<(i64, FileFacts)>,
    removals: Vec<i64>,
}

pub struct Reconciler {
    db: Database,
    library: LibraryConfig,
    cache: Arc<ImageCache>,
    watcher: Arc<dyn FolderWatcher>,
    notifier: Arc<dyn Notifier>,
}

impl Reconciler {
    pub fn new(
        db: Database,
        library: LibraryConfig,
        cache: Arc<ImageCache>,
        watcher: Arc<dyn FolderWatcher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            db,
            library,
            cache,
            watcher,
            notifier,
        }
    }

    /// The library root only has to exist; its own name is never filtered.
    pub fn is_monitored(&self, path: &Path) -> bool {
        if path == self.library.root {
            return path.is_dir();
        }
        is_monitored_folder(path, &self.library.trash_folder_name)
    }

    /// Reconcile `dir` and everything below it.
    ///
    /// A failure in one folder is logged and counted; the rest of the tree is still visited.
    pub fn index_folder(&self, dir: &Path, parent: Option<&Folder>) -> FolderChanges {
        let (folder, subdirs, mut changes) = match self.prepare_folder(dir, parent) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(path = %dir.display(), error = %e, "Failed to index folder");
                return FolderChanges {
                    folders_failed: 1,
                    ..Default::default()
                };
            }
        };

        match self.remove_missing_child_dirs(&folder) {
            Ok(removed) => changes += removed,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Failed to remove missing child folders");
                changes.folders_failed += 1;
            }
        }

        self.watcher.watch(dir);

        match self.scan_folder_images(&folder) {
            Ok(scanned) => changes += scanned,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Failed to scan folder images");
                changes.folders_failed += 1;
            }
        }

        for subdir in subdirs {
            changes += self.index_folder(&subdir, Some(&folder));
        }

        changes
    }

    /// Steps that must succeed before anything below this folder can be visited:
    /// list the monitored subdirectories and find or create the folder record.
    fn prepare_folder(
        &self,
        dir: &Path,
        parent: Option<&Folder>,
    ) -> Result<(Folder, Vec<std::path::PathBuf>, FolderChanges)> {
        let subdirs: Vec<_> = list_subdirectories(dir)?
            .into_iter()
            .filter(|sub| self.is_monitored(sub))
            .collect();

        let mut changes = FolderChanges::default();
        let conn = self.db.session();
        let folder = match folders::get_by_path(&conn, dir)? {
            Some(existing) => existing,
            None => {
                let created = folders::insert(&conn, dir, parent.map(|p| p.id))?;
                debug!(path = %dir.display(), id = created.id, "Added folder");
                changes.folders_added += 1;
                created
            }
        };

        Ok((folder, subdirs, changes))
    }

    /// Drop records of child folders that vanished from disk or stopped being monitored.
    pub fn remove_missing_child_dirs(&self, folder: &Folder) -> Result<FolderChanges> {
        let children = folders::children(&self.db.session(), folder.id)?;

        let mut changes = FolderChanges::default();
        for child in children {
            if !self.is_monitored(&child.path) {
                changes += self.remove_folder_tree(&child)?;
            }
        }
        Ok(changes)
    }

    /// Remove a folder record and everything beneath it, deepest first.
    pub fn remove_folder_tree(&self, folder: &Folder) -> Result<FolderChanges> {
        let mut changes = FolderChanges::default();

        let children = folders::children(&self.db.session(), folder.id)?;
        for child in children {
            changes += self.remove_folder_tree(&child)?;
        }

        let image_ids: Vec<i64> = images::in_folder(&self.db.session(), folder.id)?
            .into_iter()
            .map(|image| image.id)
            .collect();

        self.watcher.unwatch(&folder.path);
        folders::delete(&self.db.session(), folder.id)?;

        for id in &image_ids {
            self.cache.evict(*id);
        }

        info!(path = %folder.path.display(), images = image_ids.len(), "Removed folder");
        changes.folders_removed += 1;
        changes.images_removed += image_ids.len();
        Ok(changes)
    }

    /// Bring the folder's image rows in line with the files on disk.
    pub fn scan_folder_images(&self, folder: &Folder) -> Result<FolderChanges> {
        let extensions = &self.library.image_extensions;
        // An unreadable directory aborts here, before any row is touched
        let disk_names = list_image_names(&folder.path, extensions)?;
        let disk_names = unique_names(&folder.path, disk_names);
        let db_images = images::in_folder(&self.db.session(), folder.id)?;

        if folder.scan_date.is_some() && same_names(&db_images, &disk_names) {
            debug!(path = %folder.path.display(), "Folder unchanged, skipping");
            return Ok(FolderChanges::default());
        }

        let started = Instant::now();
        let by_name: HashMap<String, &images::Image> = db_images
            .iter()
            .map(|image| (image.filename.to_lowercase(), image))
            .collect();

        let mut plan = ImagePlan::default();
        for name in &disk_names {
            let path = folder.path.join(name);
            match by_name.get(&name.to_lowercase()) {
                None => match file_facts(&path) {
                    Ok(facts) => plan.inserts.push(facts),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable image")
                    }
                },
                Some(existing) => {
                    let sidecar = find_sidecar(&path, &self.library.sidecar_extensions);
                    let changed =
                        is_modified_since(&path, sidecar.as_deref(), &existing.last_indexed)
                            .and_then(|changed| {
                                if changed {
                                    file_facts(&path).map(Some)
                                } else {
                                    Ok(None)
                                }
                            });
                    match changed {
                        Ok(Some(facts)) => plan.updates.push((existing.id, facts)),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Skipping unreadable image")
                        }
                    }
                }
            }
        }

        let on_disk: HashSet<String> = disk_names.iter().map(|n| n.to_lowercase()).collect();
        plan.removals = db_images
            .iter()
            .filter(|image| !on_disk.contains(&image.filename.to_lowercase()))
            .map(|image| image.id)
            .collect();

        let now = Utc::now();
        self.db.unit_of_work(|tx| {
            for facts in &plan.inserts {
                images::insert(tx, folder.id, facts, &now)?;
            }
            for (id, facts) in &plan.updates {
                images::update_file_facts(tx, *id, facts, &now)?;
            }
            for id in &plan.removals {
                images::delete(tx, *id)?;
            }
            folders::set_scan_date(tx, folder.id, &now)?;
            Ok(())
        })?;

        for id in plan.updates.iter().map(|(id, _)| id).chain(plan.removals.iter()) {
            self.cache.evict(*id);
        }

        let changes = FolderChanges {
            images_added: plan.inserts.len(),
            images_updated: plan.updates.len(),
            images_removed: plan.removals.len(),
            ..Default::default()
        };

        let folder_name = folder
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| folder.path.display().to_string());
        self.notifier.notify(Notification::Status(format!(
            "Indexed folder {}: processed {} images ({} new, {} updated, {} removed) in {:.2?}.",
            folder_name,
            disk_names.len(),
            changes.images_added,
            changes.images_updated,
            changes.images_removed,
            started.elapsed()
        )));

        if changes.images_changed() {
            self.notifier.notify(Notification::FoldersChanged);
        }

        Ok(changes)
    }
}

/// Drop names that differ from an earlier one only by case. The
/// filename column is case-insensitive, so only one of them can be indexed.
fn unique_names(dir: &Path, names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .filter(|name| {
            let first = seen.insert(name.to_lowercase());
            if !first {
                warn!(
                    dir = %dir.display(),
                    name = %name,
                    "Skipping image whose name differs from another only by case"
                );
            }
            first
        })
        .collect()
}

/// Whether the two name sets are equal ignoring order and case.
fn same_names(db_images: &[images::Image], disk_names: &[String]) -> bool {
    if db_images.len() != disk_names.len() {
        return false;
    }
    let mut db: Vec<String> = db_images.iter().map(|i| i.filename.to_lowercase()).collect();
    let mut disk: Vec<String> = disk_names.iter().map(|n| n.to_lowercase()).collect();
    db.sort();
    disk.sort();
    db == disk
}
