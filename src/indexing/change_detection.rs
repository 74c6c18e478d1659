//! Change detection for image files.
//!
//! Timestamps are compared at millisecond precision, the precision the
//! database stores them with.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::SystemTime;

use crate::db::images::FileFacts;

fn to_millis(time: SystemTime) -> DateTime<Utc> {
    let time: DateTime<Utc> = time.into();
    DateTime::from_timestamp_millis(time.timestamp_millis()).unwrap_or(time)
}

pub fn modified_time(path: &Path) -> Result<DateTime<Utc>> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    Ok(to_millis(metadata.modified()?))
}

/// Size and timestamps of a file. Filesystems without a creation time report the mtime.
pub fn file_facts(path: &Path) -> Result<FileFacts> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let modified = to_millis(metadata.modified()?);
    let created = metadata.created().map(to_millis).unwrap_or(modified);

    Ok(FileFacts {
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        file_size: metadata.len(),
        created,
        modified,
    })
}

/// Whether the image, or its sidecar, was written after `last_indexed`.
pub fn is_modified_since(
    image: &Path,
    sidecar: Option<&Path>,
    last_indexed: &DateTime<Utc>,
) -> Result<bool> {
    if modified_time(image)? > *last_indexed {
        return Ok(true);
    }

    if let Some(sidecar) = sidecar {
        // A sidecar that vanished between listing and stat is not a change
        if let Ok(sidecar_modified) = modified_time(sidecar) {
            return Ok(sidecar_modified > *last_indexed);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn test_is_modified_since() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("a.jpg");
        let sidecar = dir.path().join("a.xmp");
        let hour_ago = SystemTime::now() - std::time::Duration::from_secs(3600);

        File::create(&image).unwrap().set_modified(hour_ago).unwrap();
        File::create(&sidecar).unwrap().set_modified(hour_ago).unwrap();

        let indexed = Utc::now() - Duration::minutes(30);
        assert!(!is_modified_since(&image, Some(&sidecar), &indexed).unwrap());

        File::options()
            .write(true)
            .open(&sidecar)
            .unwrap()
            .set_modified(SystemTime::now())
            .unwrap();
        assert!(is_modified_since(&image, Some(&sidecar), &indexed).unwrap());
        assert!(!is_modified_since(&image, None, &indexed).unwrap());
    }

    #[test]
    fn test_file_facts() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("b.png");
        std::fs::write(&image, b"12345").unwrap();

        let facts = file_facts(&image).unwrap();
        assert_eq!(facts.filename, "b.png");
        assert_eq!(facts.file_size, 5);
        assert!(file_facts(&dir.path().join("missing.png")).is_err());
    }
}
