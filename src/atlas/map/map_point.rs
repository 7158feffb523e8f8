//! MapPoint - A 3D landmark observed by KeyFrames.
//!
//! Each MapPoint tracks which KeyFrames observe it and keeps the
//! visible/found counters used for culling decisions.

use std::collections::HashMap;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::vocabulary::Descriptor;

use super::types::{KeyFrameId, MapPointId};

/// A 3D map point (landmark) observed by one or more KeyFrames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapPoint {
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// Representative ORB descriptor (from the creating observation).
    pub descriptor: Descriptor,

    /// observation[kf_id] = feature_idx means keyframe kf_id sees this point at feature_idx.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Number of times this point was expected in a frame.
    pub visible_count: u32,

    /// Number of times this point was successfully matched.
    pub found_count: u32,

    /// KeyFrame that first created this MapPoint.
    pub first_kf_id: KeyFrameId,

    pub is_bad: bool,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            visible_count: 1,
            found_count: 1,
            first_kf_id,
            is_bad: false,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    /// Returns true if the observation existed and was removed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    /// found_count / visible_count (1.0 when never visible).
    pub fn found_ratio(&self) -> f64 {
        if self.visible_count == 0 {
            1.0
        } else {
            self.found_count as f64 / self.visible_count as f64
        }
    }

    pub fn increase_visible(&mut self) {
        self.visible_count += 1;
    }

    pub fn increase_found(&mut self) {
        self.found_count += 1;
    }

    /// A point is bad if it has too few observations or its found ratio is too low.
    pub fn should_cull(&self, min_found_ratio: f64, min_observations: usize) -> bool {
        self.is_bad
            || self.num_observations() < min_observations
            || self.found_ratio() < min_found_ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_found_ratio_and_culling() {
        let mut mp = MapPoint::new(
            MapPointId::new(0),
            Vector3::new(0.0, 0.0, 1.0),
            [0u8; 32],
            KeyFrameId::new(0),
        );
        mp.add_observation(KeyFrameId::new(0), 3);
        mp.add_observation(KeyFrameId::new(1), 5);
        assert!(!mp.should_cull(0.25, 2));

        for _ in 0..9 {
            mp.increase_visible();
        }
        assert!((mp.found_ratio() - 0.1).abs() < 1e-12);
        assert!(mp.should_cull(0.25, 2));

        assert!(mp.erase_observation(KeyFrameId::new(1)));
        assert!(!mp.erase_observation(KeyFrameId::new(1)));
        assert_eq!(mp.num_observations(), 1);
    }
}
