//! File and grid export for generated samples.
use std::fs;
use std::path::{Path, PathBuf};

use image::{GenericImage, RgbImage};

use crate::error::{Error, Result};

/// Write each image as `ddpm_sample_{idx:02}.png` under `output_dir`,
/// creating the directory if needed. Returns the written paths.
pub fn save_individual(images: &[RgbImage], output_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(output_dir)?;
    let mut paths = Vec::with_capacity(images.len());
    for (idx, image) in images.iter().enumerate() {
        let path = output_dir.join(format!("ddpm_sample_{idx:02}.png"));
        image.save(&path)?;
        paths.push(path);
    }
    Ok(paths)
}

/// Assemble images into a `rows x cols` grid: image `i` lands at row
/// `i / cols`, column `i % cols`. Images beyond the grid capacity are
/// dropped; the drop is reported through a warning.
pub fn assemble_grid(images: &[RgbImage], rows: usize, cols: usize) -> Result<RgbImage> {
    if images.is_empty() {
        return Err(Error::Validation(
            "no images provided for grid export".to_string(),
        ));
    }
    if rows == 0 || cols == 0 {
        return Err(Error::Validation(format!(
            "grid must have at least one row and one column, got {rows}x{cols}"
        )));
    }
    let (width, height) = images[0].dimensions();
    if images.iter().any(|i| i.dimensions() != (width, height)) {
        return Err(Error::Validation(
            "grid images must all share the same dimensions".to_string(),
        ));
    }

    let capacity = rows * cols;
    if images.len() > capacity {
        tracing::warn!(
            total = images.len(),
            capacity,
            "grid capacity exceeded, dropping trailing images"
        );
    }
    let mut grid = RgbImage::new(cols as u32 * width, rows as u32 * height);
    for (idx, image) in images.iter().take(capacity).enumerate() {
        let row = (idx / cols) as u32;
        let col = (idx % cols) as u32;
        grid.copy_from(image, col * width, row * height)?;
    }
    Ok(grid)
}

/// Assemble and write the grid image, creating parent directories.
pub fn save_grid(images: &[RgbImage], rows: usize, cols: usize, path: &Path) -> Result<()> {
    let grid = assemble_grid(images, rows, cols)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    grid.save(path)?;
    Ok(())
}
