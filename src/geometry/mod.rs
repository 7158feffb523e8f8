//! Rigid-body geometry.

pub mod alignment;
pub mod se3;

pub use alignment::{align_points_ransac, horn, Alignment, AlignmentConfig};
pub use se3::SE3;
