//! Tracking stage: runs on the caller's thread and turns frames into poses.
//!
//! - Frame processing (FAST + BRIEF extraction, stereo / RGB-D depth)
//! - Map initialization (from depth, or from two monocular frames)
//! - Tracking against the reference keyframe, relocalization when lost
//! - New KeyFrame decision, handing keyframes to Local Mapping

pub mod frame;
pub mod history;
pub mod keyframe_decision;
pub mod matching;
pub mod motion_model;
pub mod state;
pub mod tracker;

use crate::atlas::map::MapPointId;
use crate::error::Result;
use crate::geometry::SE3;

pub use frame::{KeyPoint, SensorInput};
pub use history::{FrameRecord, TrajectoryHistory};
pub use state::TrackingState;
pub use tracker::{StageLinks, Tracker};

/// What the orchestrator needs from a tracking stage.
///
/// Implemented by [`Tracker`]; other implementations can be injected through
/// the system builder.
pub trait TrackingStage: Send {
    /// Process one frame. Returns the camera pose (T_wc), or None when
    /// tracking failed for this frame.
    fn track(&mut self, input: SensorInput<'_>, timestamp: f64) -> Result<Option<SE3>>;

    /// Enter or leave localization-only behavior (no keyframes, no map edits).
    fn set_localization_only(&mut self, enabled: bool);

    /// Drop the map and every per-frame history and start from scratch.
    fn reset(&mut self);

    /// Keep the (freshly loaded) map but forget everything tied to the
    /// previous one, and relocalize against it.
    fn reset_after_load(&mut self);

    fn state(&self) -> TrackingState;

    /// Map point matched to each feature of the last frame.
    fn current_map_points(&self) -> Vec<Option<MapPointId>>;

    /// Keypoints of the last frame.
    fn current_keypoints(&self) -> Vec<KeyPoint>;

    /// Per-frame pose history since the last reset.
    fn history(&self) -> &TrajectoryHistory;
}
