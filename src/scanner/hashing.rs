use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct HashResult {
    pub sha256: String,
    pub perceptual: Option<String>,
}

pub fn calculate_hashes(path: &Path) -> Result<HashResult> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut sha256_hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        sha256_hasher.update(&buffer[..bytes_read]);
    }

    let sha256 = format!("{:x}", sha256_hasher.finalize());

    // Not every supported format decodes (raw files for one)
    let perceptual = calculate_perceptual_hash(path).ok();

    Ok(HashResult { sha256, perceptual })
}

fn calculate_perceptual_hash(path: &Path) -> Result<String> {
    use img_hash::HasherConfig;

    let img = image::open(path)?;
    let thumbnail = img.thumbnail(64, 64);

    let hasher = HasherConfig::new().hash_size(16, 16).to_hasher();

    // img_hash pins an older image crate, so hand the pixels over raw
    let rgba = thumbnail.to_rgba8();
    let (width, height) = rgba.dimensions();

    let img_hash_image = img_hash::image::RgbaImage::from_raw(width, height, rgba.into_raw())
        .ok_or_else(|| anyhow!("Failed to create image for hashing"))?;

    let hash = hasher.hash_image(&img_hash::image::DynamicImage::ImageRgba8(img_hash_image));

    Ok(hash.to_base64())
}
