use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("image decode/encode failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("crop of {percent}% leaves no rows")]
    Empty { percent: u8 },
    #[error("normalizer task failed: {0}")]
    Join(String),
}

/// Rows kept after removing the bottom `percent` of an image `height` rows tall.
pub fn cropped_height(height: u32, percent: u8) -> u32 {
    let percent = u64::from(percent.min(100));
    (u64::from(height) * (100 - percent) / 100) as u32
}

/// Removes the bottom watermark band, keeping rows `[0, new_height)`.
pub async fn crop(input: &Path, output: &Path, percent: u8) -> Result<PathBuf, NormalizeError> {
    let input = input.to_path_buf();
    let output = output.to_path_buf();
    tokio::task::spawn_blocking(move || crop_blocking(&input, &output, percent))
        .await
        .map_err(|err| NormalizeError::Join(err.to_string()))?
}

fn crop_blocking(input: &Path, output: &Path, percent: u8) -> Result<PathBuf, NormalizeError> {
    let img = image::open(input)?;
    let new_height = cropped_height(img.height(), percent);
    if new_height == 0 {
        return Err(NormalizeError::Empty { percent });
    }
    img.crop_imm(0, 0, img.width(), new_height).save(output)?;
    Ok(output.to_path_buf())
}

/// Decodes downloaded bytes and stores them as PNG so every raw asset has a
/// known format before cropping.
pub async fn store_raw(bytes: Vec<u8>, path: &Path) -> Result<PathBuf, NormalizeError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let img = image::load_from_memory(&bytes)?;
        img.save(&path)?;
        Ok(path)
    })
    .await
    .map_err(|err| NormalizeError::Join(err.to_string()))?
}
