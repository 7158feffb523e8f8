//! SLAM system orchestration and thread management.
//!
//! This module contains the top-level [`System`] that owns and coordinates
//! the pipeline stages, along with the stage lifecycle controls, shared state,
//! inter-thread messaging types and trajectory export.

pub mod lifecycle;
pub mod messages;
pub mod shared_state;
mod slam_system;
pub mod trajectory;

pub use lifecycle::StageControl;
pub use messages::{LoopQueryMsg, NewKeyFrameMsg};
pub use shared_state::SharedState;
pub use slam_system::{SaveOutcome, System, SystemBuilder, TrackingContext, TrackingFactory, TrackingSnapshot};
