//! Atlas module - the shared map, its place-recognition index, and their
//! persistence.
//!
//! - [`map`] - KeyFrames, MapPoints and the graphs over them
//! - [`keyframe_db`] - inverted BoW index for loop detection and relocalization
//! - [`atlas`] - the container pairing the two
//! - [`persistence`] - map file reading and writing

pub mod map;
pub mod atlas;
pub mod keyframe_db;
pub mod persistence;

// Re-export commonly used types
pub use atlas::Atlas;
pub use map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};
