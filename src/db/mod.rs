//! SQLite persistence for folders, images and the EXIF operation log.
//!
//! All access goes through short-lived [`Session`]s or [`Database::unit_of_work`].
//! A session holds the connection lock and is not `Send`, so it cannot be
//! kept alive across an `.await`.

mod schema;
pub mod exif_ops;
pub mod folders;
pub mod images;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, Transaction};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use exif_ops::{ExifOperation, ExifType, FaceRegion, OperationType, WriteState};
pub use folders::Folder;
pub use images::{Image, ImageMetadata};
pub use schema::SCHEMA;

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Format a timestamp for storage. The format sorts lexicographically.
pub fn to_db_time(time: &DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

pub fn from_db_time(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Cloneable handle to the library database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Exclusive access to the connection for the lifetime of the guard.
pub struct Session<'a> {
    guard: MutexGuard<'a, Connection>,
}

impl Deref for Session<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.guard
    }
}

impl DerefMut for Session<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.guard
    }
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn initialize(&self) -> Result<()> {
        let session = self.session();
        session.execute_batch("PRAGMA foreign_keys = ON;")?;
        session.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Borrow the connection. A job that panicked while holding the lock
    /// does not poison the database for everyone else.
    pub fn session(&self) -> Session<'_> {
        Session {
            guard: self.conn.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Run `work` inside a transaction, committing only if it returns `Ok`.
    pub fn unit_of_work<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut session = self.session();
        let tx = session.transaction()?;
        let value = work(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}
