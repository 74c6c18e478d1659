//! Directory listing helpers for the indexer.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// NAS and OS metadata directories that never hold library images.
const IGNORED_DIRS: &[&str] = &["@eaDir", "#recycle", "$RECYCLE.BIN", "lost+found"];

/// Whether a directory belongs in the library.
pub fn is_monitored_folder(path: &Path, trash_folder_name: &str) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        // Filesystem root
        return path.is_dir();
    };

    if name.starts_with('.') || name == trash_folder_name || IGNORED_DIRS.contains(&name.as_ref()) {
        return false;
    }

    path.is_dir()
}

fn ensure_directory(directory: &Path) -> Result<()> {
    if !directory.is_dir() {
        bail!("Not a directory: {}", directory.display());
    }
    Ok(())
}

/// Immediate subdirectories of `directory`, sorted by name.
pub fn list_subdirectories(directory: &Path) -> Result<Vec<PathBuf>> {
    ensure_directory(directory)?;
    let mut dirs = Vec::new();

    for entry in WalkDir::new(directory)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("Failed to list {}", directory.display()))?;
        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        }
    }

    Ok(dirs)
}

pub fn has_image_extension(name: &str, extensions: &[String]) -> bool {
    Path::new(name)
        .extension()
        .map(|ext| {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            extensions.iter().any(|e| e.to_lowercase() == ext_lower)
        })
        .unwrap_or(false)
}

/// Names of the image files directly inside `directory`.
///
/// Uses the directory entries only, without stat calls on the files.
pub fn list_image_names(directory: &Path, extensions: &[String]) -> Result<Vec<String>> {
    ensure_directory(directory)?;
    let mut names = Vec::new();

    for entry in WalkDir::new(directory)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
    {
        let entry = entry.with_context(|| format!("Failed to list {}", directory.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if has_image_extension(&name, extensions) {
            names.push(name);
        }
    }

    names.sort();
    Ok(names)
}

/// Sidecar metadata file for an image, if one exists.
///
/// Both `IMG_1.xmp` and `IMG_1.jpg.xmp` naming styles are recognised.
pub fn find_sidecar(image: &Path, sidecar_extensions: &[String]) -> Option<PathBuf> {
    let stem = image.file_stem()?.to_string_lossy().to_string();
    let name = image.file_name()?.to_string_lossy().to_string();
    let dir = image.parent()?;

    for ext in sidecar_extensions {
        for base in [&stem, &name] {
            for candidate in [ext.to_lowercase(), ext.to_uppercase()] {
                let path = dir.join(format!("{}.{}", base, candidate));
                if path.is_file() {
                    return Some(path);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    fn extensions() -> Vec<String> {
        vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
    }

    #[test]
    fn test_list_image_names() {
        let dir = tempdir().unwrap();

        File::create(dir.path().join("photo1.jpg")).unwrap();
        File::create(dir.path().join("photo2.PNG")).unwrap();
        File::create(dir.path().join("document.txt")).unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        File::create(dir.path().join("subdir/photo3.jpeg")).unwrap();

        let names = list_image_names(dir.path(), &extensions()).unwrap();
        assert_eq!(names, vec!["photo1.jpg", "photo2.PNG"]);

        let subdirs = list_subdirectories(dir.path()).unwrap();
        assert_eq!(subdirs, vec![dir.path().join("subdir")]);
    }

    #[test]
    fn test_unreadable_directory_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(list_image_names(&dir.path().join("missing"), &extensions()).is_err());
    }

    #[test]
    fn test_monitored_folder_filter() {
        let dir = tempdir().unwrap();
        for name in ["2024", ".hidden", "@eaDir", ".pholio_trash", "trash"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }

        assert!(is_monitored_folder(&dir.path().join("2024"), "trash"));
        assert!(!is_monitored_folder(&dir.path().join(".hidden"), "trash"));
        assert!(!is_monitored_folder(&dir.path().join("@eaDir"), "trash"));
        assert!(!is_monitored_folder(&dir.path().join("trash"), "trash"));
        assert!(!is_monitored_folder(&dir.path().join("gone"), "trash"));
    }

    #[test]
    fn test_find_sidecar() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("IMG_1.jpg");
        File::create(&image).unwrap();
        let xmp = vec!["xmp".to_string()];

        assert_eq!(find_sidecar(&image, &xmp), None);

        File::create(dir.path().join("IMG_1.XMP")).unwrap();
        assert_eq!(find_sidecar(&image, &xmp), Some(dir.path().join("IMG_1.XMP")));
    }
}
