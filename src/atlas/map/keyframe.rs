//! KeyFrame - A selected frame with map structure relationships.
//!
//! KeyFrames are the core nodes of the SLAM graph. They contain:
//! - Sensor data (features, 3D points in the camera frame)
//! - Pose estimate (SE3 transform)
//! - Graph relationships (covisibility, spanning tree, loop edges)
//!
//! A culled KeyFrame is never removed from the map: it is flagged bad and
//! remembers its pose relative to its spanning-tree parent, so frames that
//! were tracked against it can still be placed in the trajectory.

use std::collections::{BTreeSet, HashMap};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;
use crate::tracking::frame::KeyPoint;
use crate::vocabulary::{BowVector, Descriptor};

use super::types::{KeyFrameId, MapPointId};

/// A KeyFrame in the SLAM map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    /// Id of the frame this keyframe was created from.
    pub frame_id: u64,

    /// Timestamp in seconds.
    pub timestamp: f64,

    /// Pose: transform from camera to world (T_wc).
    /// To transform a point from camera to world: p_world = pose.transform_point(p_cam)
    pub pose: SE3,

    // ─────────────────────────────────────────────────────────────────────────
    // Visual Features
    // ─────────────────────────────────────────────────────────────────────────
    pub keypoints: Vec<KeyPoint>,

    /// ORB descriptors, one per keypoint.
    pub descriptors: Vec<Descriptor>,

    /// 3D points in camera frame (from stereo or depth).
    /// None if the feature has no valid depth.
    pub points_cam: Vec<Option<Vector3<f64>>>,

    /// Bag-of-Words representation used for place recognition.
    ///
    /// Not persisted: it is recomputed from the descriptors when a map is
    /// loaded, since the vocabulary itself is not part of the map file.
    #[serde(skip)]
    pub bow_vector: Option<BowVector>,

    // ─────────────────────────────────────────────────────────────────────────
    // Map Associations
    // ─────────────────────────────────────────────────────────────────────────
    /// Feature index → MapPoint association.
    pub map_point_ids: Vec<Option<MapPointId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────
    /// Connected KeyFrame → number of shared MapPoints.
    covisibility_weights: HashMap<KeyFrameId, usize>,

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────
    /// Parent KeyFrame in the spanning tree (None for the root).
    pub parent_id: Option<KeyFrameId>,

    pub children_ids: BTreeSet<KeyFrameId>,

    /// KeyFrames connected to this one by a closed loop.
    pub loop_edges: BTreeSet<KeyFrameId>,

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────
    pub is_bad: bool,

    /// T_parent_this, recorded when the keyframe is culled.
    pub pose_in_parent: Option<SE3>,
}

impl KeyFrame {
    pub fn new(
        id: KeyFrameId,
        frame_id: u64,
        timestamp: f64,
        pose: SE3,
        keypoints: Vec<KeyPoint>,
        descriptors: Vec<Descriptor>,
        points_cam: Vec<Option<Vector3<f64>>>,
    ) -> Self {
        let n = keypoints.len();
        Self {
            id,
            frame_id,
            timestamp,
            pose,
            keypoints,
            descriptors,
            points_cam,
            bow_vector: None,
            map_point_ids: vec![None; n],
            covisibility_weights: HashMap::new(),
            parent_id: None,
            children_ids: BTreeSet::new(),
            loop_edges: BTreeSet::new(),
            is_bad: false,
            pose_in_parent: None,
        }
    }

    pub fn bow_vector(&self) -> Option<&BowVector> {
        self.bow_vector.as_ref()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Associate a feature with a MapPoint, returning the previous association.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        self.map_point_ids
            .get_mut(feature_idx)
            .and_then(|slot| slot.replace(mp_id))
    }

    pub fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(feature_idx).and_then(|slot| slot.take())
    }

    /// Iterate over (feature index, MapPoint) pairs.
    pub fn get_map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(i, mp)| mp.map(|id| (i, id)))
    }

    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|m| m.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    /// Add or update a covisibility connection.
    pub fn add_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        self.covisibility_weights.insert(kf_id, weight);
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        self.covisibility_weights.remove(&kf_id);
    }

    pub fn clear_covisibility(&mut self) {
        self.covisibility_weights.clear();
    }

    pub fn get_covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn get_covisibles(&self) -> impl Iterator<Item = &KeyFrameId> {
        self.covisibility_weights.keys()
    }

    /// The N best covisible KeyFrames (most shared points first, ties by id).
    pub fn get_best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        let mut ordered: Vec<(KeyFrameId, usize)> =
            self.covisibility_weights.iter().map(|(id, w)| (*id, *w)).collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ordered.into_iter().take(n).map(|(id, _)| id).collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent_id: KeyFrameId) {
        self.parent_id = Some(parent_id);
    }

    pub fn add_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.insert(child_id);
    }

    pub fn erase_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.remove(&child_id);
    }

    pub fn add_loop_edge(&mut self, kf_id: KeyFrameId) {
        if kf_id != self.id {
            self.loop_edges.insert(kf_id);
        }
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }
}
