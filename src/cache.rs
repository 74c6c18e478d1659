//! In-memory cache of image records keyed by id.

use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use crate::db::{images, Database, Image};
use crate::events::{Notification, Notifier};

#[derive(Debug, Clone, PartialEq)]
pub struct CachedImage {
    pub image: Image,
    pub path: PathBuf,
}

/// Entries kept before the oldest loaded one is dropped.
pub const DEFAULT_CAPACITY: usize = 1024;

struct Entries {
    /// Value is the load sequence number and the image.
    map: HashMap<i64, (u64, Arc<CachedImage>)>,
    next_seq: u64,
}

/// Bounded cache; when full, the entry loaded longest ago makes room.
pub struct ImageCache {
    db: Database,
    entries: RwLock<Entries>,
    capacity: usize,
    notifier: Arc<dyn Notifier>,
}

impl ImageCache {
    pub fn new(db: Database, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_capacity(db, notifier, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(db: Database, notifier: Arc<dyn Notifier>, capacity: usize) -> Self {
        Self {
            db,
            entries: RwLock::new(Entries {
                map: HashMap::new(),
                next_seq: 0,
            }),
            capacity: capacity.max(1),
            notifier,
        }
    }

    /// Cached image, loading it from the database on a miss.
    pub fn get(&self, id: i64) -> Result<Option<Arc<CachedImage>>> {
        if let Some(entry) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .map
            .get(&id)
        {
            return Ok(Some(Arc::clone(&entry.1)));
        }

        let loaded = images::get_with_path(&self.db.session(), id)?;
        Ok(loaded.map(|(image, path)| {
            let entry = Arc::new(CachedImage { image, path });
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            if entries.map.len() >= self.capacity && !entries.map.contains_key(&id) {
                let oldest = entries
                    .map
                    .iter()
                    .min_by_key(|(_, (seq, _))| *seq)
                    .map(|(key, _)| *key);
                if let Some(oldest) = oldest {
                    entries.map.remove(&oldest);
                }
            }
            let seq = entries.next_seq;
            entries.next_seq += 1;
            entries.map.insert(id, (seq, Arc::clone(&entry)));
            entry
        }))
    }

    /// Drop the entry for `id`. Safe to call for ids that were never cached.
    pub fn evict(&self, id: i64) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .map
            .remove(&id);
        self.notifier.notify(Notification::CacheEvicted(id));
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .map
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
