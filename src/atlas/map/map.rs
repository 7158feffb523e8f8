//! Map - Container for KeyFrames and MapPoints.
//!
//! The Map is the central data structure that holds the SLAM graph:
//! - KeyFrames with their poses and features
//! - MapPoints (3D landmarks) with their observations
//! - Covisibility relationships and the spanning tree over KeyFrames
//!
//! It provides methods for:
//! - Adding KeyFrames and MapPoints
//! - Creating bidirectional associations (KF↔MP)
//! - Culling KeyFrames while keeping them resolvable through the spanning tree
//! - Culling bad MapPoints

use std::collections::HashMap;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;
use crate::vocabulary::Descriptor;

use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// The SLAM map containing KeyFrames and MapPoints.
#[derive(Default, Serialize, Deserialize)]
pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,

    map_points: HashMap<MapPointId, MapPoint>,

    /// Counter for generating unique KeyFrame IDs.
    next_kf_id: u64,

    /// Counter for generating unique MapPoint IDs.
    next_mp_id: u64,

    /// First KeyFrame inserted; the trajectory origin and spanning-tree root.
    origin_kf: Option<KeyFrameId>,

    /// Most recent KeyFrame inserted.
    last_kf: Option<KeyFrameId>,

    /// Bumped on every structural change (loop closure, reset, load).
    big_change_index: u64,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // ID Generation
    // ─────────────────────────────────────────────────────────────────────────

    /// Reserve a new unique KeyFrame ID.
    ///
    /// Tracking reserves the id when it decides on a keyframe so it can use
    /// the keyframe as reference before Local Mapping inserts it.
    pub fn next_keyframe_id(&mut self) -> KeyFrameId {
        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;
        id
    }

    pub fn next_map_point_id(&mut self) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        id
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a KeyFrame whose id was reserved with [`Map::next_keyframe_id`].
    pub fn add_keyframe(&mut self, kf: KeyFrame) {
        let id = kf.id;
        if id.0 >= self.next_kf_id {
            self.next_kf_id = id.0 + 1;
        }
        if self.origin_kf.is_none() {
            self.origin_kf = Some(id);
        }
        self.last_kf = Some(id);
        self.keyframes.insert(id, kf);
    }

    /// Create and add a new KeyFrame to the map, returning its ID.
    pub fn create_keyframe(
        &mut self,
        frame_id: u64,
        timestamp: f64,
        pose: SE3,
        keypoints: Vec<crate::tracking::frame::KeyPoint>,
        descriptors: Vec<Descriptor>,
        points_cam: Vec<Option<Vector3<f64>>>,
    ) -> KeyFrameId {
        let id = self.next_keyframe_id();
        self.add_keyframe(KeyFrame::new(
            id,
            frame_id,
            timestamp,
            pose,
            keypoints,
            descriptors,
            points_cam,
        ));
        id
    }

    pub fn origin_keyframe_id(&self) -> Option<KeyFrameId> {
        self.origin_kf
    }

    pub fn last_keyframe_id(&self) -> Option<KeyFrameId> {
        self.last_kf
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    /// All KeyFrame ids in creation order, bad ones included.
    pub fn keyframe_ids(&self) -> Vec<KeyFrameId> {
        let mut ids: Vec<KeyFrameId> = self.keyframes.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn keyframes_mut(&mut self) -> impl Iterator<Item = &mut KeyFrame> {
        self.keyframes.values_mut()
    }

    /// Number of KeyFrames, bad ones included.
    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    /// Largest frame id any KeyFrame was created from.
    pub fn max_frame_id(&self) -> Option<u64> {
        self.keyframes.values().map(|kf| kf.frame_id).max()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a MapPoint observed by `kf_id` at `feature_idx`.
    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        kf_id: KeyFrameId,
        feature_idx: usize,
    ) -> MapPointId {
        let id = self.next_map_point_id();
        self.map_points
            .insert(id, MapPoint::new(id, position, descriptor, kf_id));
        self.associate(kf_id, feature_idx, id);
        id
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a bidirectional association between a KeyFrame feature and a MapPoint.
    ///
    /// This:
    /// 1. Links the KeyFrame's feature to the MapPoint
    /// 2. Adds an observation in the MapPoint
    /// 3. Updates covisibility with other KeyFrames observing this MapPoint
    ///
    /// Returns true if the association was created.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let existing_observers: Vec<KeyFrameId> = match self.map_points.get(&mp_id) {
            Some(mp) if !mp.is_bad && !mp.observations.contains_key(&kf_id) => {
                mp.observations.keys().copied().collect()
            }
            _ => return false,
        };

        match self.keyframes.get_mut(&kf_id) {
            Some(kf) if !kf.is_bad && feature_idx < kf.map_point_ids.len() => {
                if kf.get_map_point(feature_idx).is_some() {
                    return false;
                }
                kf.set_map_point(feature_idx, mp_id);
            }
            _ => return false,
        }

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.add_observation(kf_id, feature_idx);
        }

        // Increment covisibility weight with all other observers
        for other_kf_id in existing_observers {
            let new_weight = self
                .keyframes
                .get(&other_kf_id)
                .map(|kf| kf.get_covisibility_weight(kf_id))
                .unwrap_or(0)
                + 1;

            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.add_covisibility(other_kf_id, new_weight);
            }
            if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                other_kf.add_covisibility(kf_id, new_weight);
            }
        }

        true
    }

    /// Remove the association between a KeyFrame feature and its MapPoint.
    ///
    /// Returns the MapPoint ID that was disassociated, if any.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get_mut(&kf_id)?.erase_map_point(feature_idx)?;

        let other_observers: Vec<KeyFrameId> = match self.map_points.get_mut(&mp_id) {
            Some(mp) => {
                mp.erase_observation(kf_id);
                mp.observations.keys().copied().collect()
            }
            None => Vec::new(),
        };

        // Decrement covisibility weight with other observers
        for other_kf_id in other_observers {
            let current = self
                .keyframes
                .get(&other_kf_id)
                .map(|kf| kf.get_covisibility_weight(kf_id))
                .unwrap_or(0);

            if current <= 1 {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.erase_covisibility(other_kf_id);
                }
                if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                    other_kf.erase_covisibility(kf_id);
                }
            } else {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.add_covisibility(other_kf_id, current - 1);
                }
                if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                    other_kf.add_covisibility(kf_id, current - 1);
                }
            }
        }

        Some(mp_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────

    /// Attach a KeyFrame to the spanning tree under its best covisible
    /// KeyFrame, falling back to `fallback` when it shares no points.
    ///
    /// The origin KeyFrame stays the root.
    pub fn link_to_spanning_tree(&mut self, kf_id: KeyFrameId, fallback: Option<KeyFrameId>) {
        if Some(kf_id) == self.origin_kf {
            return;
        }
        let parent = match self.keyframes.get(&kf_id) {
            Some(kf) if kf.parent_id.is_none() => kf
                .get_best_covisibles(1)
                .first()
                .copied()
                .or(fallback)
                .or(self.origin_kf),
            _ => return,
        };
        let Some(parent) = parent.filter(|p| *p != kf_id && self.keyframes.contains_key(p)) else {
            return;
        };

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_parent(parent);
        }
        if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
            parent_kf.add_child(kf_id);
        }
    }

    /// World pose (T_wc) of a KeyFrame.
    ///
    /// For a culled KeyFrame the pose is rebuilt by walking up the spanning
    /// tree to the nearest valid ancestor and composing the relative poses
    /// recorded on the way.
    pub fn resolve_pose(&self, kf_id: KeyFrameId) -> Option<SE3> {
        let mut accumulated = SE3::identity();
        let mut current = kf_id;

        for _ in 0..=self.keyframes.len() {
            let kf = self.keyframes.get(&current)?;
            if !kf.is_bad {
                return Some(kf.pose.compose(&accumulated));
            }
            accumulated = kf.pose_in_parent.as_ref()?.compose(&accumulated);
            current = kf.parent_id?;
        }

        None
    }

    /// Cull a KeyFrame.
    ///
    /// The KeyFrame stays in the map flagged bad. Its observations and
    /// covisibility edges are removed, its children move to its parent, and
    /// its pose relative to the parent is recorded. The origin cannot be
    /// culled. Returns false if nothing was done.
    pub fn set_keyframe_bad(&mut self, kf_id: KeyFrameId) -> bool {
        if Some(kf_id) == self.origin_kf {
            return false;
        }
        let (parent_id, children, associations) = match self.keyframes.get(&kf_id) {
            Some(kf) if !kf.is_bad => match kf.parent_id {
                Some(parent) => (
                    parent,
                    kf.children_ids.iter().copied().collect::<Vec<_>>(),
                    kf.get_map_point_indices().map(|(i, _)| i).collect::<Vec<_>>(),
                ),
                None => return false,
            },
            _ => return false,
        };

        for feature_idx in associations {
            self.disassociate(kf_id, feature_idx);
        }

        let covisibles: Vec<KeyFrameId> = self
            .keyframes
            .get(&kf_id)
            .map(|kf| kf.get_covisibles().copied().collect())
            .unwrap_or_default();
        for other in covisibles {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.erase_covisibility(kf_id);
            }
        }

        for child in &children {
            if let Some(child_kf) = self.keyframes.get_mut(child) {
                child_kf.set_parent(parent_id);
            }
        }

        let parent_pose = self.resolve_pose(parent_id);
        if let Some(parent_kf) = self.keyframes.get_mut(&parent_id) {
            parent_kf.erase_child(kf_id);
            for child in &children {
                parent_kf.add_child(*child);
            }
        }

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.pose_in_parent = parent_pose.map(|tp| tp.between(&kf.pose));
            kf.clear_covisibility();
            kf.children_ids.clear();
            kf.is_bad = true;
        }

        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Fully remove a MapPoint, cleaning up all associations.
    pub fn remove_map_point_full(&mut self, mp_id: MapPointId) {
        let observations: Vec<(KeyFrameId, usize)> = self
            .map_points
            .get(&mp_id)
            .map(|mp| mp.observations.iter().map(|(&k, &i)| (k, i)).collect())
            .unwrap_or_default();

        for (kf_id, feature_idx) in observations {
            self.disassociate(kf_id, feature_idx);
        }
        self.map_points.remove(&mp_id);
    }

    pub fn big_change_index(&self) -> u64 {
        self.big_change_index
    }

    /// Record a structural change (loop closure, load, reset).
    pub fn inform_big_change(&mut self) {
        self.big_change_index += 1;
    }

    /// Clear the entire map. The big-change index keeps counting.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.next_kf_id = 0;
        self.next_mp_id = 0;
        self.origin_kf = None;
        self.last_kf = None;
        self.inform_big_change();
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .field("big_change_index", &self.big_change_index)
            .finish()
    }
}
