//! Turning operations into exiftool arguments, and running exiftool.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::db::{ExifOperation, ExifType, FaceRegion, OperationType};

#[derive(Debug, Error)]
pub enum ExifToolError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("exiftool exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
}

/// Writes tag arguments into an image file.
#[async_trait]
pub trait TagWriter: Send + Sync {
    async fn write_tags(&self, path: &Path, args: &[String]) -> Result<(), ExifToolError>;
}

/// `exiftool` run as a subprocess.
pub struct ExifTool {
    program: PathBuf,
}

impl ExifTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .env("LANGUAGE", "en_US.UTF-8")
            .env("LANG", "en_US.UTF-8")
            .env("LC_ALL", "en_US.UTF-8")
            .kill_on_drop(true);
        command
    }

    /// The installed version, or `None` if exiftool cannot be run.
    pub async fn version(&self) -> Option<String> {
        let output = self.command().arg("-ver").output().await.ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Log the exiftool version found at startup.
    pub async fn check(&self) -> bool {
        match self.version().await {
            Some(version) => {
                info!(version = %version, "ExifTool found");
                true
            }
            None => {
                warn!(
                    program = %self.program.display(),
                    "ExifTool version: Unavailable - ExifTool not found"
                );
                false
            }
        }
    }
}

#[async_trait]
impl TagWriter for ExifTool {
    async fn write_tags(&self, path: &Path, args: &[String]) -> Result<(), ExifToolError> {
        debug!(path = %path.display(), args = ?args, "Running exiftool");
        let output = self
            .command()
            .args(args)
            .arg("-overwrite_original")
            .arg("-m")
            .arg(path)
            .output()
            .await
            .map_err(|source| ExifToolError::Launch {
                program: self.program.display().to_string(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ExifToolError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Arguments for one exiftool run, and which operations they cover.
#[derive(Debug, Default, PartialEq)]
pub struct WritePlan {
    pub args: Vec<String>,
    /// Indices into the operation slice the plan was built from.
    pub processed: Vec<usize>,
}

/// Straighten smart quotes and trim.
pub fn sanitize_text(text: &str) -> String {
    text.replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .trim()
        .to_string()
}

/// Exif orientation name for a clockwise rotation, if it is a quarter turn.
pub fn orientation_for(degrees: i64) -> Option<&'static str> {
    match degrees.rem_euclid(360) {
        0 => Some("Horizontal (normal)"),
        90 => Some("Rotate 90 CW"),
        180 => Some("Rotate 180"),
        270 => Some("Rotate 270 CW"),
        _ => None,
    }
}

fn face_args(face: &FaceRegion) -> Vec<String> {
    vec![
        "-xmp-mwg-rs:RegionType+=Face".to_string(),
        "-xmp-mwg-rs:RegionAreaUnit+=normalized".to_string(),
        format!("-xmp-mwg-rs:RegionAreaX+={}", face.x),
        format!("-xmp-mwg-rs:RegionAreaY+={}", face.y),
        format!("-xmp-mwg-rs:RegionAreaW+={}", face.width),
        format!("-xmp-mwg-rs:RegionAreaH+={}", face.height),
        format!("-xmp-mwg-rs:RegionName+={}", face.name),
    ]
}

/// Build the exiftool arguments for an image's operations.
///
/// Operations with nothing to write after sanitising are left out of `processed`.
pub fn build_write_plan(ops: &[ExifOperation]) -> WritePlan {
    let mut plan = WritePlan::default();

    for (index, op) in ops.iter().enumerate() {
        let text = sanitize_text(&op.text);
        if text.is_empty() {
            warn!(
                image_id = op.image_id,
                exif_type = op.exif_type.as_str(),
                "Skipping empty operation"
            );
            continue;
        }

        let args = match op.exif_type {
            ExifType::Keyword => {
                // Strip first so adding an existing keyword never duplicates it
                let mut args = vec![format!("-keywords-={}", text)];
                if op.operation == OperationType::Add {
                    args.push(format!("-keywords+={}", text));
                }
                args
            }
            ExifType::Caption => vec![format!("-iptc:Caption-Abstract={}", text)],
            ExifType::Description => vec![format!("-Exif:ImageDescription={}", text)],
            ExifType::Copyright => vec![
                format!("-Copyright={}", text),
                format!("-iptc:CopyrightNotice={}", text),
            ],
            ExifType::Rating => match text.parse::<u8>() {
                Ok(rating) if rating <= 5 => vec![format!("-exif:Rating={}", rating)],
                _ => {
                    warn!(image_id = op.image_id, rating = %text, "Skipping invalid rating");
                    continue;
                }
            },
            ExifType::Rotate => match text.parse::<i64>().ok().and_then(orientation_for) {
                Some(orientation) => vec![format!("-orientation={}", orientation)],
                None => {
                    warn!(
                        image_id = op.image_id,
                        rotation = %text,
                        "Skipping unsupported rotation"
                    );
                    continue;
                }
            },
            ExifType::Face => match serde_json::from_str::<FaceRegion>(&op.text) {
                Ok(face) => face_args(&face),
                Err(e) => {
                    warn!(image_id = op.image_id, error = %e, "Skipping unreadable face region");
                    continue;
                }
            },
        };

        plan.args.extend(args);
        plan.processed.push(index);
    }

    plan
}

/// Path exiftool uses for its temporary copy while rewriting `path`.
pub fn temp_file_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push("_exiftool_tmp");
    PathBuf::from(name)
}

/// A crashed exiftool run can leave the image only in its temp file. Move it back.
pub fn restore_temp_file(path: &Path) -> bool {
    let temp = temp_file_path(path);
    if path.exists() || !temp.exists() {
        return false;
    }

    info!(from = %temp.display(), to = %path.display(), "Restoring image from exiftool temp file");
    match std::fs::rename(&temp, path) {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unable to restore exiftool temp file");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn op(exif_type: ExifType, operation: OperationType, text: &str) -> ExifOperation {
        ExifOperation::new(1, exif_type, operation, text, None)
    }

    #[test]
    fn test_keyword_args() {
        let ops = vec![
            op(ExifType::Keyword, OperationType::Add, "Banana"),
            op(ExifType::Keyword, OperationType::Remove, "Apple"),
        ];
        let plan = build_write_plan(&ops);
        assert_eq!(
            plan.args,
            vec!["-keywords-=Banana", "-keywords+=Banana", "-keywords-=Apple"]
        );
        assert_eq!(plan.processed, vec![0, 1]);
    }

    #[test]
    fn test_field_args_and_skips() {
        let ops = vec![
            op(ExifType::Caption, OperationType::Add, "  \u{201C}Sunset\u{201D} "),
            op(ExifType::Copyright, OperationType::Add, "Me"),
            op(ExifType::Keyword, OperationType::Add, "   "),
            op(ExifType::Rating, OperationType::Add, "9"),
            op(ExifType::Rotate, OperationType::Add, "180"),
            op(ExifType::Rotate, OperationType::Add, "45"),
        ];
        let plan = build_write_plan(&ops);
        assert_eq!(
            plan.args,
            vec![
                "-iptc:Caption-Abstract=\"Sunset\"",
                "-Copyright=Me",
                "-iptc:CopyrightNotice=Me",
                "-orientation=Rotate 180",
            ]
        );
        assert_eq!(plan.processed, vec![0, 1, 4]);
    }

    #[test]
    fn test_face_args() {
        let face = FaceRegion {
            name: "Ada".to_string(),
            x: 0.5,
            y: 0.25,
            width: 0.1,
            height: 0.2,
        };
        let text = serde_json::to_string(&face).unwrap();
        let ops = vec![op(ExifType::Face, OperationType::Add, &text)];
        let plan = build_write_plan(&ops);
        assert!(plan.args.contains(&"-xmp-mwg-rs:RegionName+=Ada".to_string()));
        assert!(plan.args.contains(&"-xmp-mwg-rs:RegionAreaX+=0.5".to_string()));
    }

    #[test]
    fn test_orientation_for() {
        assert_eq!(orientation_for(0), Some("Horizontal (normal)"));
        assert_eq!(orientation_for(-90), Some("Rotate 270 CW"));
        assert_eq!(orientation_for(450), Some("Rotate 90 CW"));
        assert_eq!(orientation_for(30), None);
    }

    #[test]
    fn test_restore_temp_file() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("photo.jpg");
        let temp = temp_file_path(&image);
        assert_eq!(temp, dir.path().join("photo.jpg_exiftool_tmp"));

        std::fs::write(&temp, b"original").unwrap();
        assert!(restore_temp_file(&image));
        assert_eq!(std::fs::read(&image).unwrap(), b"original");
        assert!(!temp.exists());

        // Nothing to do when the image is still there
        std::fs::write(&temp, b"partial").unwrap();
        assert!(!restore_temp_file(&image));
        assert_eq!(std::fs::read(&image).unwrap(), b"original");
    }
}
