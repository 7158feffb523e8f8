//! Per-frame pose history used for trajectory export.
//!
//! Frames are stored relative to their reference keyframe rather than as
//! absolute poses, so that later map corrections (loop closure, keyframe
//! culling) are reflected when the trajectory is rebuilt.

use crate::atlas::map::KeyFrameId;
use crate::geometry::SE3;

/// One submitted frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    /// T_ref_cam: camera pose in the reference keyframe's frame.
    pub relative_pose: SE3,
    pub reference: Option<KeyFrameId>,
    /// Timestamp in seconds.
    pub timestamp: f64,
    /// Tracking failed for this frame.
    pub lost: bool,
}

/// Ordered list of [`FrameRecord`]s since the last reset.
#[derive(Debug, Clone, Default)]
pub struct TrajectoryHistory {
    records: Vec<FrameRecord>,
}

impl TrajectoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_tracked(&mut self, relative_pose: SE3, reference: KeyFrameId, timestamp: f64) {
        self.records.push(FrameRecord {
            relative_pose,
            reference: Some(reference),
            timestamp,
            lost: false,
        });
    }

    /// Record a lost frame. It repeats the previous record's relative pose
    /// and reference so the history stays aligned with submitted frames.
    pub fn push_lost(&mut self, timestamp: f64) {
        let (relative_pose, reference) = self
            .records
            .last()
            .map(|r| (r.relative_pose.clone(), r.reference))
            .unwrap_or_default();
        self.records.push(FrameRecord {
            relative_pose,
            reference,
            timestamp,
            lost: true,
        });
    }

    pub fn records(&self) -> &[FrameRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
