//! Visualization: display adapters and the viewer stage.
//!
//! - [`FrameDrawer`] - last tracked frame, written by Tracking
//! - [`MapDrawer`] - map snapshot plus current camera pose
//! - [`Viewer`] - background loop drawing both into a [`ViewerSink`]

pub mod frame_drawer;
pub mod map_drawer;
pub mod rerun_sink;
pub mod sink;
#[allow(clippy::module_inception)]
pub mod viewer;

pub use frame_drawer::{FrameDrawer, FrameSnapshot};
pub use map_drawer::{MapDrawer, MapSnapshot};
pub use rerun_sink::RerunSink;
pub use sink::{NullSink, ViewerSink};
pub use viewer::Viewer;
