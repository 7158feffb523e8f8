//! Local Mapper - Main Local Mapping thread implementation.
//!
//! Processes keyframes received from Tracking:
//! 1. Inserts keyframe into the map
//! 2. Associates matched map points
//! 3. Creates new map points from unmatched features with depth
//! 4. Attaches the keyframe to the spanning tree
//! 5. Computes its BoW vector and adds it to the keyframe database
//! 6. Map point culling (removes low-quality recent points)
//! 7. Keyframe culling (removes redundant keyframes)
//! 8. Forwards the keyframe to Loop Closing

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info};

use crate::atlas::atlas::Atlas;
use crate::atlas::map::{KeyFrame, KeyFrameId, MapPointId};
use crate::settings::LocalMappingSettings;
use crate::system::lifecycle::StageControl;
use crate::system::messages::{LoopQueryMsg, NewKeyFrameMsg};
use crate::system::shared_state::SharedState;

/// Timeout for receiving keyframes. Allows periodic lifecycle checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Points created within this many keyframes are still checked by culling.
const RECENT_KEYFRAMES: u64 = 3;

/// Found/visible ratio below which a recent point is culled.
const MIN_FOUND_RATIO: f64 = 0.25;

/// Observations a recent point needs once it is two keyframes old.
const MIN_OBSERVATIONS: usize = 2;

/// Other observers a point needs to count as redundant for keyframe culling.
const MIN_OBSERVERS_FOR_REDUNDANCY: usize = 3;

/// Local Mapping thread state.
pub struct LocalMapper {
    config: LocalMappingSettings,
    shared: Arc<SharedState>,
    control: Arc<StageControl>,
    keyframes: Receiver<NewKeyFrameMsg>,
    loop_queries: Sender<LoopQueryMsg>,
}

impl LocalMapper {
    pub fn new(
        config: LocalMappingSettings,
        shared: Arc<SharedState>,
        control: Arc<StageControl>,
        keyframes: Receiver<NewKeyFrameMsg>,
        loop_queries: Sender<LoopQueryMsg>,
    ) -> Self {
        Self {
            config,
            shared,
            control,
            keyframes,
            loop_queries,
        }
    }

    /// Main thread loop: receive keyframes and process them.
    ///
    /// Between keyframes the loop serves reset, stop and finish requests.
    /// Queued keyframes are kept while stopped and dropped on reset.
    pub fn run(self) {
        info!("Local Mapping: started");
        loop {
            if self.control.is_reset_requested() {
                self.reset();
            }

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

            // Update flow control based on queue size
            self.shared
                .set_stop_keyframe_creation(self.keyframes.len() > self.config.max_queue);

            match self.keyframes.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => self.process_keyframe(msg),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.shared.set_stop_keyframe_creation(false);
        self.control.set_finished();
        info!("Local Mapping: finished");
    }

    /// Drop every queued keyframe.
    fn reset(&self) {
        let dropped = self.keyframes.try_iter().count();
        self.shared.set_stop_keyframe_creation(false);
        self.control.reset_done();
        info!("Local Mapping: reset, {} queued keyframes dropped", dropped);
    }

    /// Process a single keyframe message.
    fn process_keyframe(&self, msg: NewKeyFrameMsg) {
        let kf_id = msg.keyframe_id;
        {
            let mut atlas = self.shared.atlas.write();

            // Step 1: Insert keyframe into the map
            let previous = atlas.map.last_keyframe_id();
            let parent_hint = self.insert_keyframe(&mut atlas, &msg, previous);

            // Step 2: Associate existing map point matches
            let associated = self.associate_matched_points(&mut atlas, &msg);

            // Step 3: New map points from unmatched features with depth
            let created = self.create_new_points(&mut atlas, &msg);

            // Step 4: Spanning tree, then visibility of the parent's points
            atlas.map.link_to_spanning_tree(kf_id, parent_hint);
            self.mark_unmatched_parent_points(&mut atlas, kf_id);

            // Step 5: BoW + keyframe database
            atlas.index_keyframe(kf_id);

            // Step 6 / 7: culling
            let culled_points = self.cull_map_points(&mut atlas, kf_id);
            let culled_kfs = self.cull_keyframes(&mut atlas, kf_id);

            debug!(
                "Local Mapping: {} inserted ({} associated, {} created, {} points and {} keyframes culled)",
                kf_id, associated, created, culled_points, culled_kfs
            );
        }

        // Step 8: Send keyframe to Loop Closing (non-blocking)
        match self.loop_queries.try_send(LoopQueryMsg { keyframe_id: kf_id }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Local Mapping: Loop Closing busy, {} not queried", kf_id),
            Err(TrySendError::Disconnected(_)) => debug!("Local Mapping: Loop Closing is gone"),
        }
    }

    /// Insert the keyframe into the map. Returns the keyframe to attach to
    /// when it shares no points with the map.
    fn insert_keyframe(
        &self,
        atlas: &mut Atlas,
        msg: &NewKeyFrameMsg,
        previous: Option<KeyFrameId>,
    ) -> Option<KeyFrameId> {
        atlas.map.add_keyframe(KeyFrame::new(
            msg.keyframe_id,
            msg.frame_id,
            msg.timestamp,
            msg.pose.clone(),
            msg.keypoints.clone(),
            msg.descriptors.clone(),
            msg.points_cam.clone(),
        ));
        previous.filter(|id| *id != msg.keyframe_id)
    }

    /// Associate map points that were matched during tracking and count
    /// them as found.
    fn associate_matched_points(&self, atlas: &mut Atlas, msg: &NewKeyFrameMsg) -> usize {
        let mut associated = 0;
        for (feat_idx, mp_id) in msg.matched_map_points.iter().enumerate() {
            let Some(mp_id) = *mp_id else {
                continue;
            };
            // Create bidirectional association (also updates covisibility)
            if !atlas.map.associate(msg.keyframe_id, feat_idx, mp_id) {
                continue;
            }
            if let Some(mp) = atlas.map.get_map_point_mut(mp_id) {
                mp.increase_visible();
                mp.increase_found();
            }
            associated += 1;
        }
        associated
    }

    /// For each feature that has a depth but no map point, create a new
    /// MapPoint at its world position.
    fn create_new_points(&self, atlas: &mut Atlas, msg: &NewKeyFrameMsg) -> usize {
        let kf_id = msg.keyframe_id;
        let free: Vec<usize> = match atlas.map.get_keyframe(kf_id) {
            Some(kf) => (0..kf.num_features())
                .filter(|&i| kf.get_map_point(i).is_none())
                .collect(),
            None => return 0,
        };

        let mut created = 0;
        for feat_idx in free {
            let Some(p_cam) = msg.points_cam.get(feat_idx).copied().flatten() else {
                continue;
            };
            let Some(descriptor) = msg.descriptors.get(feat_idx) else {
                continue;
            };
            atlas
                .map
                .create_map_point(msg.pose.transform_point(&p_cam), *descriptor, kf_id, feat_idx);
            created += 1;
        }
        created
    }

    /// Points of the parent that this keyframe did not match were in view
    /// but not found.
    fn mark_unmatched_parent_points(&self, atlas: &mut Atlas, kf_id: KeyFrameId) {
        let Some(kf) = atlas.map.get_keyframe(kf_id) else {
            return;
        };
        let Some(parent) = kf.parent_id.and_then(|p| atlas.map.get_keyframe(p)) else {
            return;
        };
        let unmatched: Vec<MapPointId> = parent
            .get_map_point_indices()
            .map(|(_, mp_id)| mp_id)
            .filter(|mp_id| {
                atlas
                    .map
                    .get_map_point(*mp_id)
                    .is_some_and(|mp| !mp.observations.contains_key(&kf_id))
            })
            .collect();

        for mp_id in unmatched {
            if let Some(mp) = atlas.map.get_map_point_mut(mp_id) {
                mp.increase_visible();
            }
        }
    }

    /// Cull recently created map points.
    ///
    /// A point is checked while it is at most [`RECENT_KEYFRAMES`] keyframes
    /// old. It is removed when its found ratio is below 0.25, or when it is
    /// two keyframes old and still has fewer than two observers.
    fn cull_map_points(&self, atlas: &mut Atlas, current_kf_id: KeyFrameId) -> usize {
        let to_cull: Vec<MapPointId> = atlas
            .map
            .map_points()
            .filter(|mp| {
                let age = current_kf_id.0.saturating_sub(mp.first_kf_id.0);
                if age > RECENT_KEYFRAMES {
                    return false;
                }
                let min_observations = if age >= 2 { MIN_OBSERVATIONS } else { 0 };
                mp.should_cull(MIN_FOUND_RATIO, min_observations)
            })
            .map(|mp| mp.id)
            .collect();

        let num_culled = to_cull.len();
        for mp_id in to_cull {
            atlas.map.remove_map_point_full(mp_id);
        }
        num_culled
    }

    /// Cull redundant keyframes.
    ///
    /// A covisible keyframe is redundant when more than `redundancy_ratio`
    /// of its map points are observed by at least three other keyframes.
    /// The origin and the current keyframe are never culled.
    fn cull_keyframes(&self, atlas: &mut Atlas, current_kf_id: KeyFrameId) -> usize {
        let origin = atlas.map.origin_keyframe_id();
        let local_kf_ids: Vec<KeyFrameId> = match atlas.map.get_keyframe(current_kf_id) {
            Some(kf) => kf.get_covisibles().copied().collect(),
            None => return 0,
        };

        let mut to_cull = Vec::new();
        for kf_id in local_kf_ids {
            if kf_id == current_kf_id || Some(kf_id) == origin {
                continue;
            }
            let Some(kf) = atlas.map.get_keyframe(kf_id).filter(|kf| !kf.is_bad) else {
                continue;
            };

            let mut total_points = 0usize;
            let mut redundant = 0usize;
            for (_, mp_id) in kf.get_map_point_indices() {
                let Some(mp) = atlas.map.get_map_point(mp_id).filter(|mp| !mp.is_bad) else {
                    continue;
                };
                total_points += 1;
                let others = mp.observations.keys().filter(|&&obs| obs != kf_id).count();
                if others >= MIN_OBSERVERS_FOR_REDUNDANCY {
                    redundant += 1;
                }
            }

            if total_points > 0 && redundant as f64 > self.config.redundancy_ratio * total_points as f64 {
                to_cull.push(kf_id);
            }
        }

        let mut num_culled = 0;
        for kf_id in to_cull {
            if atlas.cull_keyframe(kf_id) {
                num_culled += 1;
            }
        }
        if num_culled > 0 {
            info!(
                "Local Mapping: culled {} redundant keyframes ({} remaining)",
                num_culled,
                atlas.map.num_keyframes()
            );
        }
        num_culled
    }
}
