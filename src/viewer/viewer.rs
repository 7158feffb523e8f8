//! Viewer stage: periodically draws the frame and map snapshots.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::system::lifecycle::StageControl;

use super::frame_drawer::FrameDrawer;
use super::map_drawer::MapDrawer;
use super::sink::ViewerSink;

pub struct Viewer {
    control: Arc<StageControl>,
    frame_drawer: Arc<FrameDrawer>,
    map_drawer: Arc<MapDrawer>,
    sink: Box<dyn ViewerSink>,
    period: Duration,
}

impl Viewer {
    pub fn new(
        control: Arc<StageControl>,
        frame_drawer: Arc<FrameDrawer>,
        map_drawer: Arc<MapDrawer>,
        sink: Box<dyn ViewerSink>,
        fps: f64,
    ) -> Self {
        let fps = if fps > 0.0 { fps } else { 30.0 };
        Self {
            control,
            frame_drawer,
            map_drawer,
            sink,
            period: Duration::from_secs_f64(1.0 / fps),
        }
    }

    /// Draw one view.
    pub fn draw_once(&mut self) {
        let frame = self.frame_drawer.snapshot();
        let map = self.map_drawer.snapshot();
        let status = frame.status_text(map.num_keyframes(), map.num_map_points());
        if let Err(e) = self.sink.draw(&frame, &map, &status) {
            warn!("Viewer: draw failed: {}", e);
        }
    }

    /// Main loop. Returns after a finish request.
    pub fn run(mut self) {
        info!("Viewer: started");
        loop {
            if self.control.stop_if_requested() {
                self.control.wait_while_stopped();
                if self.control.is_finish_requested() {
                    break;
                }
                continue;
            }
            if self.control.is_finish_requested() {
                break;
            }

            self.draw_once();
            thread::sleep(self.period);
        }
        self.control.set_finished();
        info!("Viewer: finished");
    }
}
