//! Snapshot of the map for display.

use std::sync::Arc;

use nalgebra::Vector3;
use parking_lot::Mutex;

use crate::geometry::SE3;
use crate::system::shared_state::SharedState;

/// What the viewer shows about the map.
#[derive(Debug, Clone, Default)]
pub struct MapSnapshot {
    /// Pose (T_wc) of the current camera, if tracking.
    pub camera_pose: Option<SE3>,
    /// Poses of good keyframes in creation order.
    pub keyframe_poses: Vec<SE3>,
    pub map_points: Vec<Vector3<f64>>,
}

impl MapSnapshot {
    pub fn num_keyframes(&self) -> usize {
        self.keyframe_poses.len()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }
}

/// Reads the shared map and holds the current camera pose.
#[derive(Debug)]
pub struct MapDrawer {
    shared: Arc<SharedState>,
    camera_pose: Mutex<Option<SE3>>,
}

impl MapDrawer {
    pub fn new(shared: Arc<SharedState>) -> Self {
        Self {
            shared,
            camera_pose: Mutex::new(None),
        }
    }

    pub fn set_current_camera_pose(&self, pose: SE3) {
        *self.camera_pose.lock() = Some(pose);
    }

    pub fn clear_camera_pose(&self) {
        *self.camera_pose.lock() = None;
    }

    /// Copy what the viewer needs out of the map under a read lock.
    pub fn snapshot(&self) -> MapSnapshot {
        let camera_pose = self.camera_pose.lock().clone();
        let atlas = self.shared.atlas.read();
        let map = &atlas.map;

        let keyframe_poses = map
            .keyframe_ids()
            .into_iter()
            .filter_map(|id| map.get_keyframe(id))
            .filter(|kf| !kf.is_bad)
            .map(|kf| kf.pose.clone())
            .collect();
        let map_points = map
            .map_points()
            .filter(|mp| !mp.is_bad)
            .map(|mp| mp.position)
            .collect();

        MapSnapshot {
            camera_pose,
            keyframe_poses,
            map_points,
        }
    }
}
