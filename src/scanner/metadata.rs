use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::db::ImageMetadata;

fn ascii_field(exif: &exif::Exif, tag: exif::Tag) -> Option<String> {
    let field = exif.get_field(tag, exif::In::PRIMARY)?;
    let value = field.display_value().to_string().trim_matches('"').trim().to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Parse an EXIF date such as `2019-06-01 12:00:00`. Camera clocks carry no
/// zone, so treat it as UTC.
fn parse_exif_date(text: &str) -> Option<DateTime<Utc>> {
    ["%Y-%m-%d %H:%M:%S", "%Y:%m:%d %H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
}

/// Read what we can from the file. Missing or unreadable EXIF just leaves fields empty.
pub fn extract_metadata(path: &Path) -> ImageMetadata {
    let mut metadata = ImageMetadata::default();

    if let Ok(reader) = image::ImageReader::open(path) {
        if let Ok(reader) = reader.with_guessed_format() {
            if let Ok((width, height)) = reader.into_dimensions() {
                metadata.width = Some(width);
                metadata.height = Some(height);
            }
        }
    }

    if let Ok(file) = File::open(path) {
        let mut bufreader = BufReader::new(file);
        if let Ok(exif) = exif::Reader::new().read_from_container(&mut bufreader) {
            metadata.camera_make = ascii_field(&exif, exif::Tag::Make);
            metadata.camera_model = ascii_field(&exif, exif::Tag::Model);
            metadata.lens = ascii_field(&exif, exif::Tag::LensModel);
            metadata.description = ascii_field(&exif, exif::Tag::ImageDescription);
            metadata.copyright = ascii_field(&exif, exif::Tag::Copyright);
            metadata.taken_at = ascii_field(&exif, exif::Tag::DateTimeOriginal)
                .as_deref()
                .and_then(parse_exif_date);
        }
    }

    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_parse_exif_date() {
        let expected = Utc.with_ymd_and_hms(2019, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_exif_date("2019-06-01 12:00:00"), Some(expected));
        assert_eq!(parse_exif_date("2019:06:01 12:00:00"), Some(expected));
        assert_eq!(parse_exif_date("0000:00:00 00:00:00"), None);
    }

    #[test]
    fn test_dimensions_without_exif() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.png");
        image::RgbImage::new(12, 7).save(&path).unwrap();

        let metadata = extract_metadata(&path);
        assert_eq!(metadata.width, Some(12));
        assert_eq!(metadata.height, Some(7));
        assert_eq!(metadata.taken_at, None);
    }
}
