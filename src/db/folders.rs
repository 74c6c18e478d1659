//! Folder records.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};

use super::{from_db_time, to_db_time};

#[derive(Debug, Clone, PartialEq)]
pub struct Folder {
    pub id: i64,
    pub path: PathBuf,
    pub parent_id: Option<i64>,
    /// `None` means the folder has never been scanned or was marked for rescan.
    pub scan_date: Option<DateTime<Utc>>,
}

const COLUMNS: &str = "id, path, parent_id, scan_date";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Folder> {
    let path: String = row.get(1)?;
    let scan_date: Option<String> = row.get(3)?;
    Ok(Folder {
        id: row.get(0)?,
        path: PathBuf::from(path),
        parent_id: row.get(2)?,
        scan_date: scan_date.as_deref().and_then(from_db_time),
    })
}

pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<Folder>> {
    let folder = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM folders WHERE id = ?"),
            [id],
            from_row,
        )
        .optional()?;
    Ok(folder)
}

pub fn get_by_path(conn: &Connection, path: &Path) -> Result<Option<Folder>> {
    let folder = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM folders WHERE path = ?"),
            [path.to_string_lossy()],
            from_row,
        )
        .optional()?;
    Ok(folder)
}

pub fn insert(conn: &Connection, path: &Path, parent_id: Option<i64>) -> Result<Folder> {
    conn.execute(
        "INSERT INTO folders (path, parent_id) VALUES (?, ?)",
        params![path.to_string_lossy(), parent_id],
    )?;
    Ok(Folder {
        id: conn.last_insert_rowid(),
        path: path.to_path_buf(),
        parent_id,
        scan_date: None,
    })
}

pub fn children(conn: &Connection, parent_id: i64) -> Result<Vec<Folder>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM folders WHERE parent_id = ? ORDER BY path"
    ))?;
    let folders = stmt
        .query_map([parent_id], from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(folders)
}

pub fn all(conn: &Connection) -> Result<Vec<Folder>> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM folders ORDER BY path"))?;
    let folders = stmt.query_map([], from_row)?.filter_map(|r| r.ok()).collect();
    Ok(folders)
}

/// Removes the folder. Child folders, images and their operations cascade.
pub fn delete(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM folders WHERE id = ?", [id])?;
    Ok(())
}

/// Folders awaiting a scan, ordered by path.
pub fn needing_scan(conn: &Connection, limit: usize) -> Result<Vec<Folder>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM folders WHERE scan_date IS NULL ORDER BY path LIMIT ?"
    ))?;
    let folders = stmt
        .query_map([limit as i64], from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(folders)
}

pub fn set_scan_date(conn: &Connection, id: i64, scan_date: &DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE folders SET scan_date = ? WHERE id = ?",
        params![to_db_time(scan_date), id],
    )?;
    Ok(())
}

/// Clear the scan date of the given folders. Returns the number of rows touched.
pub fn clear_scan_dates(conn: &Connection, ids: &[i64]) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "UPDATE folders SET scan_date = NULL WHERE id IN ({})",
        placeholders(ids.len())
    );
    Ok(conn.execute(&sql, params_from_iter(ids.iter()))?)
}

pub fn clear_all_scan_dates(conn: &Connection) -> Result<usize> {
    Ok(conn.execute("UPDATE folders SET scan_date = NULL", [])?)
}

/// Clear the scan date of every folder containing one of the given images.
pub fn clear_scan_dates_for_images(conn: &Connection, image_ids: &[i64]) -> Result<usize> {
    if image_ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "UPDATE folders SET scan_date = NULL
         WHERE id IN (SELECT folder_id FROM images WHERE id IN ({}))",
        placeholders(image_ids.len())
    );
    Ok(conn.execute(&sql, params_from_iter(image_ids.iter()))?)
}
