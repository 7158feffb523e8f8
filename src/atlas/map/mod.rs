//! Keyframes, map points and the map that owns them.
//!
//! Keyframes and map points reference each other by id only: a keyframe lists
//! the points it observes, a point lists the keyframes observing it. On top of
//! that the map keeps a covisibility graph (weighted by shared points) and a
//! spanning tree whose parent links let trajectory export place keyframes that
//! were culled after the fact.
//!
//! All of it derives `serde` and is written to the map file unchanged.

pub mod keyframe;
pub mod map;
pub mod map_point;
pub mod types;

pub use keyframe::KeyFrame;
pub use map::Map;
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapPointId};
