//! Dataset readers used by the `orbslam` binary.

pub mod euroc;
pub mod tum;

use std::path::Path;

use anyhow::{Context, Result};
use image::GrayImage;

use crate::tracking::frame::DepthImage;

pub use euroc::EurocDataset;
pub use tum::TumDataset;

pub(crate) fn load_gray(path: &Path) -> Result<GrayImage> {
    let img = image::open(path).with_context(|| format!("Failed to read image {}", path.display()))?;
    Ok(img.into_luma8())
}

/// 16-bit depth image, raw values as stored.
pub(crate) fn load_depth(path: &Path) -> Result<DepthImage> {
    let img = image::open(path).with_context(|| format!("Failed to read depth image {}", path.display()))?;
    Ok(img.into_luma16())
}
