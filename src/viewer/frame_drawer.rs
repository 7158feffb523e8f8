//! Snapshot of the last tracked frame for display.

use parking_lot::Mutex;

use crate::tracking::frame::KeyPoint;
use crate::tracking::TrackingState;

/// What the viewer shows about the current frame.
#[derive(Debug, Clone, Default)]
pub struct FrameSnapshot {
    pub state: TrackingState,
    /// Timestamp in seconds.
    pub timestamp: f64,
    pub keypoints: Vec<KeyPoint>,
    /// Per keypoint: matched to the map in this frame.
    pub tracked: Vec<bool>,
    pub localization_only: bool,
}

impl FrameSnapshot {
    pub fn num_tracked(&self) -> usize {
        self.tracked.iter().filter(|t| **t).count()
    }

    /// One-line status in the style of the classic viewer banner.
    pub fn status_text(&self, num_keyframes: usize, num_map_points: usize) -> String {
        match self.state {
            TrackingState::SystemNotReady => "SYSTEM NOT READY".to_string(),
            TrackingState::NoImagesYet => "WAITING FOR IMAGES".to_string(),
            TrackingState::NotInitialized => "TRYING TO INITIALIZE".to_string(),
            TrackingState::Lost => "TRACK LOST. TRYING TO RELOCALIZE".to_string(),
            TrackingState::Ok | TrackingState::RecentlyLost => {
                let mode = if self.localization_only { "LOCALIZATION" } else { "SLAM MODE" };
                let mut text = format!(
                    "{} | KFs: {}, MPs: {}, Matches: {}",
                    mode,
                    num_keyframes,
                    num_map_points,
                    self.num_tracked()
                );
                if self.state == TrackingState::RecentlyLost {
                    text.push_str(" | RECENTLY LOST");
                }
                text
            }
        }
    }
}

/// Written by Tracking after every frame, read by the viewer.
#[derive(Debug, Default)]
pub struct FrameDrawer {
    snapshot: Mutex<FrameSnapshot>,
}

impl FrameDrawer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, snapshot: FrameSnapshot) {
        *self.snapshot.lock() = snapshot;
    }

    pub fn snapshot(&self) -> FrameSnapshot {
        self.snapshot.lock().clone()
    }
}
