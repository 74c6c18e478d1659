//! The EXIF operation log: requested metadata writes and their outcome.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::folders::placeholders;
use super::{from_db_time, to_db_time};

/// Which piece of metadata an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExifType {
    Keyword,
    Caption,
    Description,
    Copyright,
    Rating,
    Rotate,
    Face,
}

impl ExifType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExifType::Keyword => "Keyword",
            ExifType::Caption => "Caption",
            ExifType::Description => "Description",
            ExifType::Copyright => "Copyright",
            ExifType::Rating => "Rating",
            ExifType::Rotate => "Rotate",
            ExifType::Face => "Face",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Keyword" => Some(ExifType::Keyword),
            "Caption" => Some(ExifType::Caption),
            "Description" => Some(ExifType::Description),
            "Copyright" => Some(ExifType::Copyright),
            "Rating" => Some(ExifType::Rating),
            "Rotate" => Some(ExifType::Rotate),
            "Face" => Some(ExifType::Face),
            _ => None,
        }
    }

    /// Types where only the newest value per image matters.
    pub fn is_single_value(&self) -> bool {
        matches!(
            self,
            ExifType::Caption | ExifType::Description | ExifType::Copyright | ExifType::Rating
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Add,
    Remove,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Add => "Add",
            OperationType::Remove => "Remove",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Add" => Some(OperationType::Add),
            "Remove" => Some(OperationType::Remove),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WriteState {
    Pending,
    Written,
    Failed,
    Discarded,
}

impl WriteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteState::Pending => "Pending",
            WriteState::Written => "Written",
            WriteState::Failed => "Failed",
            WriteState::Discarded => "Discarded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(WriteState::Pending),
            "Written" => Some(WriteState::Written),
            "Failed" => Some(WriteState::Failed),
            "Discarded" => Some(WriteState::Discarded),
            _ => None,
        }
    }
}

/// A single requested metadata write.
///
/// `id` is `None` for operations that only exist in memory, such as the
/// net rotation produced by conflation. Saving one inserts it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExifOperation {
    pub id: Option<i64>,
    pub image_id: i64,
    pub exif_type: ExifType,
    pub operation: OperationType,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub state: WriteState,
    pub user_id: Option<i64>,
}

impl ExifOperation {
    pub fn new(
        image_id: i64,
        exif_type: ExifType,
        operation: OperationType,
        text: impl Into<String>,
        user_id: Option<i64>,
    ) -> Self {
        Self {
            id: None,
            image_id,
            exif_type,
            operation,
            text: text.into(),
            timestamp: Utc::now(),
            state: WriteState::Pending,
            user_id,
        }
    }
}

/// A face region as stored in the operation text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub name: String,
    /// Centre and size of the region, relative to the image (0.0 - 1.0).
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

const COLUMNS: &str = "id, image_id, exif_type, operation, text, timestamp, state, user_id";

/// `None` for a row whose type, operation, state or timestamp text does not parse.
fn from_row(row: &Row<'_>) -> rusqlite::Result<Option<ExifOperation>> {
    let id: i64 = row.get(0)?;
    let exif_type: String = row.get(2)?;
    let operation: String = row.get(3)?;
    let timestamp: String = row.get(5)?;
    let state: String = row.get(6)?;

    let (Some(exif_type), Some(operation), Some(timestamp), Some(state)) = (
        ExifType::from_str(&exif_type),
        OperationType::from_str(&operation),
        from_db_time(&timestamp),
        WriteState::from_str(&state),
    ) else {
        warn!(
            id,
            exif_type = %exif_type,
            operation = %operation,
            state = %state,
            timestamp = %timestamp,
            "Unreadable metadata operation"
        );
        return Ok(None);
    };

    Ok(Some(ExifOperation {
        id: Some(id),
        image_id: row.get(1)?,
        exif_type,
        operation,
        text: row.get(4)?,
        timestamp,
        state,
        user_id: row.get(7)?,
    }))
}

fn insert_one(conn: &Connection, op: &ExifOperation) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO exif_operations
            (image_id, exif_type, operation, text, timestamp, state, user_id)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            op.image_id,
            op.exif_type.as_str(),
            op.operation.as_str(),
            op.text,
            to_db_time(&op.timestamp),
            op.state.as_str(),
            op.user_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Append operations to the log. Call inside a unit of work for a single commit.
pub fn insert_many(conn: &Connection, ops: &[ExifOperation]) -> Result<Vec<i64>> {
    ops.iter().map(|op| insert_one(conn, op)).collect()
}

/// Pending operations stamped before `threshold`, oldest first.
///
/// Anything cut off by `limit` is newer than every operation returned, so a
/// later batch never writes an older value over a newer one. Pending rows
/// that cannot be read are marked failed.
pub fn pending_before(
    conn: &Connection,
    threshold: &DateTime<Utc>,
    limit: usize,
) -> Result<Vec<ExifOperation>> {
    let mut stmt = conn.prepare(&format!(
        r#"
        SELECT {COLUMNS} FROM exif_operations
        WHERE state = 'Pending' AND timestamp < ?
        ORDER BY timestamp ASC, id ASC
        LIMIT ?
        "#
    ))?;
    let rows: Vec<(i64, Option<ExifOperation>)> = stmt
        .query_map(params![to_db_time(threshold), limit as i64], |row| {
            Ok((row.get(0)?, from_row(row)?))
        })?
        .filter_map(|r| r.ok())
        .collect();

    let mut ops = Vec::with_capacity(rows.len());
    let mut unreadable = Vec::new();
    for (id, op) in rows {
        match op {
            Some(op) => ops.push(op),
            None => unreadable.push(id),
        }
    }

    if !unreadable.is_empty() {
        conn.execute(
            &format!(
                "UPDATE exif_operations SET state = 'Failed' WHERE id IN ({})",
                placeholders(unreadable.len())
            ),
            params_from_iter(unreadable.iter()),
        )?;
    }
    Ok(ops)
}

pub fn for_image(conn: &Connection, image_id: i64) -> Result<Vec<ExifOperation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM exif_operations WHERE image_id = ? ORDER BY timestamp, id"
    ))?;
    let ops = stmt
        .query_map([image_id], from_row)?
        .filter_map(|r| r.ok().flatten())
        .collect();
    Ok(ops)
}

/// Persist the state of each operation. Logged rows are updated in place,
/// in-memory ones are inserted with their current state.
pub fn save_states(conn: &Connection, ops: &[ExifOperation]) -> Result<()> {
    for op in ops {
        match op.id {
            Some(id) => {
                conn.execute(
                    "UPDATE exif_operations SET state = ? WHERE id = ?",
                    params![op.state.as_str(), id],
                )?;
            }
            None => {
                insert_one(conn, op)?;
            }
        }
    }
    Ok(())
}

/// Delete written operations older than `cutoff`. Returns the number removed.
pub fn delete_written_before(conn: &Connection, cutoff: &DateTime<Utc>) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM exif_operations WHERE state = 'Written' AND timestamp < ?",
        [to_db_time(cutoff)],
    )?)
}
