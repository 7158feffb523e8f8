//! Inter-thread message types.
//!
//! These types are sent between threads via channels to coordinate
//! SLAM processing.

use nalgebra::Vector3;

use crate::atlas::map::{KeyFrameId, MapPointId};
use crate::geometry::SE3;
use crate::tracking::frame::KeyPoint;
use crate::vocabulary::Descriptor;

/// Message sent from Tracking to Local Mapping when a new keyframe is created.
///
/// Contains all the data needed for Local Mapping to:
/// 1. Insert the keyframe into the map
/// 2. Associate existing map point matches
/// 3. Create new map points from features with known depth
#[derive(Debug, Clone)]
pub struct NewKeyFrameMsg {
    /// The ID reserved for this keyframe by Tracking.
    pub keyframe_id: KeyFrameId,

    /// Id of the frame the keyframe is created from.
    pub frame_id: u64,

    /// Timestamp in seconds.
    pub timestamp: f64,

    /// Pose estimate from Tracking (T_wc: camera to world).
    pub pose: SE3,

    pub keypoints: Vec<KeyPoint>,

    /// ORB descriptors for each keypoint.
    pub descriptors: Vec<Descriptor>,

    /// 3D points in camera frame from stereo or depth.
    /// `points_cam[i]` corresponds to `keypoints[i]`.
    pub points_cam: Vec<Option<Vector3<f64>>>,

    /// Map point associations from tracking.
    /// `matched_map_points[i] = Some(mp_id)` if feature i was matched
    /// to an existing map point during tracking.
    pub matched_map_points: Vec<Option<MapPointId>>,
}

/// Message sent from Local Mapping to Loop Closing once a keyframe is in
/// the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopQueryMsg {
    pub keyframe_id: KeyFrameId,
}
