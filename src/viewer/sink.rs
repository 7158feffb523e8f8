//! Output side of the viewer.

use crate::error::Result;

use super::frame_drawer::FrameSnapshot;
use super::map_drawer::MapSnapshot;

/// Receives one rendered view per viewer tick.
pub trait ViewerSink: Send {
    fn draw(&mut self, frame: &FrameSnapshot, map: &MapSnapshot, status: &str) -> Result<()>;
}

/// Sink that discards everything, for headless runs.
#[derive(Debug, Default)]
pub struct NullSink;

impl ViewerSink for NullSink {
    fn draw(&mut self, _frame: &FrameSnapshot, _map: &MapSnapshot, _status: &str) -> Result<()> {
        Ok(())
    }
}
