//! Orchestration core of an ORB-SLAM style visual SLAM system.
//!
//! [`System`] owns the pipeline: Tracking runs on the caller's thread, Local
//! Mapping, Loop Closing and the optional Viewer each run on their own thread
//! and share the [`atlas::Atlas`] through [`system::SharedState`].

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod atlas;
pub mod error;
pub mod geometry;
pub mod io;
pub mod local_mapping;
pub mod loop_closing;
pub mod settings;
pub mod system;
pub mod tracking;
pub mod viewer;
pub mod vocabulary;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Result, SlamError};
pub use settings::Settings;
pub use system::{SaveOutcome, System, SystemBuilder, TrackingSnapshot};
pub use tracking::TrackingState;

/// Input sensor, fixed when the system is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum Sensor {
    Monocular,
    Stereo,
    Rgbd,
}

impl Sensor {
    /// Whether frames carry metric depth for their keypoints.
    pub fn has_depth(self) -> bool {
        !matches!(self, Sensor::Monocular)
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sensor::Monocular => write!(f, "monocular"),
            Sensor::Stereo => write!(f, "stereo"),
            Sensor::Rgbd => write!(f, "rgbd"),
        }
    }
}
