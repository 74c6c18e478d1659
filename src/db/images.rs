//! Image records and their extracted metadata.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::PathBuf;

use super::folders::placeholders;
use super::{from_db_time, to_db_time};

#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub id: i64,
    pub folder_id: i64,
    pub filename: String,
    pub file_size: u64,
    pub file_created: DateTime<Utc>,
    pub file_modified: DateTime<Utc>,
    pub sort_date: DateTime<Utc>,
    pub last_indexed: DateTime<Utc>,
    pub metadata_updated: Option<DateTime<Utc>>,
    pub thumb_generated: Option<DateTime<Utc>>,
    pub sha256_hash: Option<String>,
    pub perceptual_hash: Option<String>,
}

/// Filesystem facts captured for an image during indexing.
#[derive(Debug, Clone)]
pub struct FileFacts {
    pub filename: String,
    pub file_size: u64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// Metadata extracted from the image file itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub lens: Option<String>,
    pub taken_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub copyright: Option<String>,
}

const COLUMNS: &str = "id, folder_id, filename, file_size, file_created, file_modified, \
     sort_date, last_indexed, metadata_updated, thumb_generated, sha256_hash, perceptual_hash";

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    Ok(from_db_time(&text).unwrap_or_default())
}

fn optional_time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    Ok(text.as_deref().and_then(from_db_time))
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<Image> {
    Ok(Image {
        id: row.get(0)?,
        folder_id: row.get(1)?,
        filename: row.get(2)?,
        file_size: row.get::<_, i64>(3)?.max(0) as u64,
        file_created: time_column(row, 4)?,
        file_modified: time_column(row, 5)?,
        sort_date: time_column(row, 6)?,
        last_indexed: time_column(row, 7)?,
        metadata_updated: optional_time_column(row, 8)?,
        thumb_generated: optional_time_column(row, 9)?,
        sha256_hash: row.get(10)?,
        perceptual_hash: row.get(11)?,
    })
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<Image>> {
    let image = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM images WHERE id = ?"),
            [id],
            from_row,
        )
        .optional()?;
    Ok(image)
}

/// Image together with the absolute path of its file.
pub fn get_with_path(conn: &Connection, id: i64) -> Result<Option<(Image, PathBuf)>> {
    let Some(image) = get(conn, id)? else {
        return Ok(None);
    };
    let folder_path: Option<String> = conn
        .query_row(
            "SELECT path FROM folders WHERE id = ?",
            [image.folder_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(folder_path.map(|folder| {
        let path = PathBuf::from(folder).join(&image.filename);
        (image, path)
    }))
}

pub fn in_folder(conn: &Connection, folder_id: i64) -> Result<Vec<Image>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM images WHERE folder_id = ? ORDER BY filename"
    ))?;
    let images = stmt
        .query_map([folder_id], from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(images)
}

/// Insert a newly discovered image. The sort date starts as the file creation time.
pub fn insert(
    conn: &Connection,
    folder_id: i64,
    facts: &FileFacts,
    now: &DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO images
            (folder_id, filename, file_size, file_created, file_modified, sort_date, last_indexed)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            folder_id,
            facts.filename,
            facts.file_size as i64,
            to_db_time(&facts.created),
            to_db_time(&facts.modified),
            to_db_time(&facts.created),
            to_db_time(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Refresh file facts of a changed image and queue it for metadata and thumbnail work.
pub fn update_file_facts(
    conn: &Connection,
    id: i64,
    facts: &FileFacts,
    now: &DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        r#"
        UPDATE images
        SET file_size = ?, file_created = ?, file_modified = ?, last_indexed = ?,
            metadata_updated = NULL, thumb_generated = NULL
        WHERE id = ?
        "#,
        params![
            facts.file_size as i64,
            to_db_time(&facts.created),
            to_db_time(&facts.modified),
            to_db_time(now),
            id,
        ],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM images WHERE id = ?", [id])?;
    Ok(())
}

pub fn count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?)
}

fn ids_with_paths(conn: &Connection, filter: &str, limit: usize) -> Result<Vec<(i64, PathBuf)>> {
    let sql = format!(
        r#"
        SELECT i.id, f.path, i.filename
        FROM images i JOIN folders f ON f.id = i.folder_id
        WHERE {filter}
        ORDER BY i.id
        LIMIT ?
        "#
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([limit as i64], |row| {
            let folder: String = row.get(1)?;
            let filename: String = row.get(2)?;
            Ok((row.get(0)?, PathBuf::from(folder).join(filename)))
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Images whose metadata has not been extracted since they last changed.
pub fn needing_metadata(conn: &Connection, limit: usize) -> Result<Vec<(i64, PathBuf)>> {
    ids_with_paths(conn, "i.metadata_updated IS NULL", limit)
}

/// Images with metadata but no current thumbnail.
pub fn needing_thumbnail(conn: &Connection, limit: usize) -> Result<Vec<(i64, PathBuf)>> {
    ids_with_paths(
        conn,
        "i.metadata_updated IS NOT NULL AND i.thumb_generated IS NULL",
        limit,
    )
}

/// Store extracted metadata and hashes, stamping `metadata_updated`.
pub fn save_metadata(
    conn: &Connection,
    id: i64,
    metadata: &ImageMetadata,
    sha256_hash: Option<&str>,
    perceptual_hash: Option<&str>,
    now: &DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO image_metadata
            (image_id, width, height, camera_make, camera_model, lens, taken_at,
             description, copyright)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(image_id) DO UPDATE SET
            width = excluded.width,
            height = excluded.height,
            camera_make = excluded.camera_make,
            camera_model = excluded.camera_model,
            lens = excluded.lens,
            taken_at = excluded.taken_at,
            description = excluded.description,
            copyright = excluded.copyright
        "#,
        params![
            id,
            metadata.width,
            metadata.height,
            metadata.camera_make,
            metadata.camera_model,
            metadata.lens,
            metadata.taken_at.as_ref().map(to_db_time),
            metadata.description,
            metadata.copyright,
        ],
    )?;

    conn.execute(
        r#"
        UPDATE images
        SET metadata_updated = ?,
            sha256_hash = COALESCE(?, sha256_hash),
            perceptual_hash = COALESCE(?, perceptual_hash),
            sort_date = COALESCE(?, sort_date)
        WHERE id = ?
        "#,
        params![
            to_db_time(now),
            sha256_hash,
            perceptual_hash,
            metadata.taken_at.as_ref().map(to_db_time),
            id,
        ],
    )?;
    Ok(())
}

/// Stamp `metadata_updated` without storing anything, for unreadable files.
pub fn mark_metadata_attempted(conn: &Connection, id: i64, now: &DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE images SET metadata_updated = ? WHERE id = ?",
        params![to_db_time(now), id],
    )?;
    Ok(())
}

pub fn get_metadata(conn: &Connection, id: i64) -> Result<Option<ImageMetadata>> {
    let metadata = conn
        .query_row(
            r#"
            SELECT width, height, camera_make, camera_model, lens, taken_at, description, copyright
            FROM image_metadata WHERE image_id = ?
            "#,
            [id],
            |row| {
                let taken_at: Option<String> = row.get(5)?;
                Ok(ImageMetadata {
                    width: row.get(0)?,
                    height: row.get(1)?,
                    camera_make: row.get(2)?,
                    camera_model: row.get(3)?,
                    lens: row.get(4)?,
                    taken_at: taken_at.as_deref().and_then(from_db_time),
                    description: row.get(6)?,
                    copyright: row.get(7)?,
                })
            },
        )
        .optional()?;
    Ok(metadata)
}

pub fn mark_thumbnail(conn: &Connection, id: i64, now: &DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE images SET thumb_generated = ? WHERE id = ?",
        params![to_db_time(now), id],
    )?;
    Ok(())
}

/// Keep only the ids that refer to existing images.
pub fn existing_ids(conn: &Connection, ids: &[i64]) -> Result<Vec<i64>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT id FROM images WHERE id IN ({}) ORDER BY id",
        placeholders(ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let found = stmt
        .query_map(params_from_iter(ids.iter()), |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(found)
}
