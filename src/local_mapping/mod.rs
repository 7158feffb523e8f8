//! Local Mapping thread.
//!
//! The Local Mapping thread is responsible for:
//! - Inserting new keyframes into the map
//! - Creating new map points from features with depth
//! - Maintaining the covisibility graph and spanning tree
//! - Culling redundant keyframes and map points
//! - Handing keyframes on to Loop Closing

mod local_mapper;

pub use local_mapper::LocalMapper;
