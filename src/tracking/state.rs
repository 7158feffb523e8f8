//! Tracking state machine.

use std::fmt;

/// State of the tracking stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// The pipeline is still being constructed.
    SystemNotReady,
    /// No frame has been submitted since start or the last reset.
    #[default]
    NoImagesYet,
    /// Frames arrive but no map has been initialized from them yet.
    NotInitialized,
    /// Tracking successfully.
    Ok,
    /// Lost tracking recently, the motion model still predicts the pose.
    RecentlyLost,
    /// Completely lost, need relocalization.
    Lost,
}

impl TrackingState {
    /// Whether a map exists that tracking was initialized against.
    pub fn is_initialized(self) -> bool {
        matches!(self, Self::Ok | Self::RecentlyLost | Self::Lost)
    }
}

impl fmt::Display for TrackingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SystemNotReady => "SYSTEM NOT READY",
            Self::NoImagesYet => "NO IMAGES YET",
            Self::NotInitialized => "NOT INITIALIZED",
            Self::Ok => "OK",
            Self::RecentlyLost => "RECENTLY LOST",
            Self::Lost => "LOST",
        };
        f.write_str(name)
    }
}
