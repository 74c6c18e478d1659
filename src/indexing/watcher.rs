//! Filesystem watching for indexed folders.

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// Registers and unregisters directory watches as folders come and go.
pub trait FolderWatcher: Send + Sync {
    fn watch(&self, path: &Path);

    fn unwatch(&self, path: &Path);
}

/// Watcher for one-shot runs and tests.
#[derive(Debug, Default)]
pub struct NullFolderWatcher;

impl FolderWatcher for NullFolderWatcher {
    fn watch(&self, _path: &Path) {}

    fn unwatch(&self, _path: &Path) {}
}

struct Watched {
    debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    paths: HashSet<PathBuf>,
}

/// Watches each indexed directory non-recursively and reports the
/// directories whose contents changed.
pub struct NotifyFolderWatcher {
    inner: Mutex<Watched>,
}

impl NotifyFolderWatcher {
    /// Returns the watcher and the stream of changed directories.
    pub fn new(debounce: Duration) -> Result<(Self, UnboundedReceiver<PathBuf>)> {
        let (tx, rx) = unbounded_channel();
        let debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let dirs: HashSet<PathBuf> = events
                        .iter()
                        .flat_map(|event| event.paths.iter())
                        .filter_map(|path| changed_directory(path))
                        .collect();
                    send_all(&tx, dirs);
                }
                Err(errors) => {
                    for error in errors {
                        warn!(error = %error, "Folder watch error");
                    }
                }
            }
        })
        .context("Failed to create folder watcher")?;

        let watcher = Self {
            inner: Mutex::new(Watched {
                debouncer,
                paths: HashSet::new(),
            }),
        };
        Ok((watcher, rx))
    }

    pub fn watched_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).paths.len()
    }
}

fn send_all(tx: &UnboundedSender<PathBuf>, dirs: HashSet<PathBuf>) {
    for dir in dirs {
        debug!(dir = %dir.display(), "Folder changed on disk");
        let _ = tx.send(dir);
    }
}

/// The directory whose listing a change to `path` affects.
fn changed_directory(path: &Path) -> Option<PathBuf> {
    if path.is_dir() {
        Some(path.to_path_buf())
    } else {
        path.parent().map(Path::to_path_buf)
    }
}

impl FolderWatcher for NotifyFolderWatcher {
    fn watch(&self, path: &Path) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.paths.contains(path) {
            return;
        }
        match inner.debouncer.watch(path, RecursiveMode::NonRecursive) {
            Ok(()) => {
                inner.paths.insert(path.to_path_buf());
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to watch folder"),
        }
    }

    fn unwatch(&self, path: &Path) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.paths.remove(path) {
            // The directory is usually gone already, which makes unwatch fail harmlessly
            if let Err(e) = inner.debouncer.unwatch(path) {
                debug!(path = %path.display(), error = %e, "Unwatch failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_changed_directory() {
        let dir = tempdir().unwrap();
        assert_eq!(changed_directory(dir.path()), Some(dir.path().to_path_buf()));
        assert_eq!(
            changed_directory(&dir.path().join("deleted.jpg")),
            Some(dir.path().to_path_buf())
        );
    }

    #[tokio::test]
    async fn test_watch_bookkeeping() {
        let dir = tempdir().unwrap();
        let (watcher, _rx) = NotifyFolderWatcher::new(Duration::from_millis(50)).unwrap();

        watcher.watch(dir.path());
        watcher.watch(dir.path());
        assert_eq!(watcher.watched_count(), 1);

        watcher.unwatch(dir.path());
        watcher.unwatch(dir.path());
        assert_eq!(watcher.watched_count(), 0);
    }
}
