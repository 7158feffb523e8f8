//! Main tracker: turns frames into poses and decides on keyframes.
//!
//! - Uses shared `Atlas` via RwLock for thread-safe access
//! - Tracks each frame against a reference keyframe by descriptor matching
//! - Places stereo / RGB-D frames by rigid 3D alignment, monocular frames by
//!   the constant-velocity motion model
//! - Relocalizes through the keyframe database when lost
//! - Sends new keyframes to Local Mapping via channel

use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use nalgebra::Vector3;
use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrame, KeyFrameId, Map, MapPointId};
use crate::error::Result;
use crate::geometry::{align_points_ransac, AlignmentConfig, SE3};
use crate::settings::{Settings, TrackingSettings};
use crate::system::lifecycle::StageControl;
use crate::system::messages::NewKeyFrameMsg;
use crate::system::shared_state::SharedState;
use crate::viewer::{FrameDrawer, FrameSnapshot, MapDrawer};
use crate::vocabulary::Descriptor;
use crate::Sensor;

use super::frame::{CameraModel, DepthParams, FeatureExtractor, Frame, KeyPoint, SensorInput};
use super::history::TrajectoryHistory;
use super::keyframe_decision::{KeyFrameCandidate, KeyFrameDecision};
use super::matching::{match_descriptors, Match, TH_HIGH, TH_LOW};
use super::motion_model::MotionModel;
use super::state::TrackingState;
use super::TrackingStage;

/// Relocalization candidates examined per frame.
const MAX_RELOCALIZATION_CANDIDATES: usize = 5;

/// Handles to the other stages, created by the orchestrator before the
/// stages themselves.
#[derive(Debug, Clone)]
pub struct StageLinks {
    /// Keyframes for Local Mapping.
    pub keyframes: Sender<NewKeyFrameMsg>,
    pub local_mapping: Arc<StageControl>,
    pub loop_closing: Arc<StageControl>,
    pub viewer: Option<Arc<StageControl>>,
}

/// The keyframe the current frame is tracked against.
#[derive(Debug, Clone)]
struct Reference {
    id: KeyFrameId,
    pose: SE3,
    descriptors: Vec<Descriptor>,
    points_cam: Vec<Option<Vector3<f64>>>,
    map_points: Vec<Option<MapPointId>>,
    /// Local Mapping has inserted the keyframe into the map.
    in_map: bool,
}

impl Reference {
    fn from_keyframe(kf: &KeyFrame) -> Self {
        Self {
            id: kf.id,
            pose: kf.pose.clone(),
            descriptors: kf.descriptors.clone(),
            points_cam: kf.points_cam.clone(),
            map_points: kf.map_point_ids.clone(),
            in_map: true,
        }
    }

    /// A feature can be tracked if it has a map point or a depth.
    fn is_trackable(&self, idx: usize) -> bool {
        self.map_points.get(idx).is_some_and(Option::is_some)
            || self.points_cam.get(idx).is_some_and(Option::is_some)
    }

    fn num_trackable(&self) -> usize {
        (0..self.descriptors.len()).filter(|&i| self.is_trackable(i)).count()
    }

    /// World position of a feature: its map point, else its back-projected depth.
    fn world_point(&self, idx: usize, map: &Map) -> Option<Vector3<f64>> {
        self.map_points
            .get(idx)
            .copied()
            .flatten()
            .and_then(|id| map.get_map_point(id))
            .filter(|mp| !mp.is_bad)
            .map(|mp| mp.position)
            .or_else(|| {
                self.points_cam
                    .get(idx)
                    .copied()
                    .flatten()
                    .map(|p| self.pose.transform_point(&p))
            })
    }
}

/// Outcome of tracking one frame.
struct Tracked {
    pose: SE3,
    map_points: Vec<Option<MapPointId>>,
    num_matches: usize,
    /// Set when the pose came from relocalization against a new reference.
    relocalized_against: Option<Reference>,
}

/// Main tracking structure.
pub struct Tracker {
    sensor: Sensor,
    camera: CameraModel,
    extractor: FeatureExtractor,
    depth: DepthParams,
    config: TrackingSettings,

    /// Shared state (Atlas, frame ids, flags) - thread-safe access.
    shared: Arc<SharedState>,
    links: StageLinks,
    frame_drawer: Arc<FrameDrawer>,
    map_drawer: Arc<MapDrawer>,

    pub state: TrackingState,
    localization_only: bool,

    /// Number of consecutive frames with failed tracking.
    lost_frames: usize,
    motion: MotionModel,
    kf_decision: KeyFrameDecision,
    reference: Option<Reference>,

    /// First frame of a pending monocular initialization.
    mono_init: Option<Frame>,

    /// Atlas generation the tracker's state refers to.
    generation: u64,

    history: TrajectoryHistory,
    current_keypoints: Vec<KeyPoint>,
    current_map_points: Vec<Option<MapPointId>>,
}

impl Tracker {
    /// Create the tracker. With `reuse_map` the shared atlas holds a loaded
    /// map and tracking starts by relocalizing against it.
    pub fn new(
        settings: &Settings,
        sensor: Sensor,
        shared: Arc<SharedState>,
        links: StageLinks,
        frame_drawer: Arc<FrameDrawer>,
        map_drawer: Arc<MapDrawer>,
        reuse_map: bool,
    ) -> Self {
        let generation = shared.generation();
        Self {
            sensor,
            camera: CameraModel::from_settings(settings),
            extractor: FeatureExtractor::from_settings(settings),
            depth: DepthParams::from_settings(settings),
            config: settings.tracking,
            shared,
            links,
            frame_drawer,
            map_drawer,
            state: if reuse_map {
                TrackingState::Lost
            } else {
                TrackingState::NoImagesYet
            },
            localization_only: false,
            lost_frames: 0,
            motion: MotionModel::new(),
            kf_decision: KeyFrameDecision::new(0, settings.max_frames_between_keyframes()),
            reference: None,
            mono_init: None,
            generation,
            history: TrajectoryHistory::new(),
            current_keypoints: Vec::new(),
            current_map_points: Vec::new(),
        }
    }

    pub fn is_localization_only(&self) -> bool {
        self.localization_only
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────────────

    fn initialize(&mut self, frame: &Frame) -> Option<SE3> {
        match self.sensor {
            Sensor::Monocular => self.initialize_monocular(frame),
            Sensor::Stereo | Sensor::Rgbd => self.initialize_from_depth(frame),
        }
    }

    /// Create the first keyframe and one map point per feature with depth.
    ///
    /// The first keyframe is put in the map directly (not via Local
    /// Mapping) because the next frame needs it as reference.
    fn initialize_from_depth(&mut self, frame: &Frame) -> Option<SE3> {
        let n_points = frame.num_points();
        if n_points < self.config.min_init_points {
            debug!(
                "Tracking: {} points with depth, {} needed to initialize",
                n_points, self.config.min_init_points
            );
            self.mark_lost(frame);
            return None;
        }

        let pose = SE3::identity();
        let reference = {
            let mut atlas = self.shared.atlas.write();
            let kf_id = atlas.map.create_keyframe(
                frame.id,
                frame.timestamp,
                pose.clone(),
                frame.keypoints.clone(),
                frame.descriptors.clone(),
                frame.points_cam.clone(),
            );
            for (idx, p_cam) in frame.points_cam.iter().enumerate() {
                if let Some(p_cam) = p_cam {
                    atlas
                        .map
                        .create_map_point(pose.transform_point(p_cam), frame.descriptors[idx], kf_id, idx);
                }
            }
            atlas.index_keyframe(kf_id);
            atlas.map.get_keyframe(kf_id).map(Reference::from_keyframe)
        };

        let Some(reference) = reference else {
            self.mark_lost(frame);
            return None;
        };
        info!("New map created with {} points", n_points);
        Some(self.start_tracking(frame, pose, reference))
    }

    /// Initialize from the first frame and a later frame matching it well.
    ///
    /// Without a pose estimate both keyframes sit at the origin and the
    /// shared points are placed at unit depth along the first frame's rays.
    fn initialize_monocular(&mut self, frame: &Frame) -> Option<SE3> {
        let min_matches = self.config.min_init_matches;
        let Some(first) = self.mono_init.take() else {
            if frame.num_features() >= min_matches {
                self.mono_init = Some(frame.clone());
            }
            self.mark_lost(frame);
            return None;
        };

        let matches = match_descriptors(&first.descriptors, &frame.descriptors, TH_LOW);
        if matches.len() < min_matches {
            debug!(
                "Tracking: {} initialization matches, {} needed",
                matches.len(),
                min_matches
            );
            if frame.num_features() >= min_matches {
                self.mono_init = Some(frame.clone());
            }
            self.mark_lost(frame);
            return None;
        }

        let pose = SE3::identity();
        let reference = {
            let mut atlas = self.shared.atlas.write();
            let kf0 = atlas.map.create_keyframe(
                first.id,
                first.timestamp,
                pose.clone(),
                first.keypoints.clone(),
                first.descriptors.clone(),
                first.points_cam.clone(),
            );
            let kf1 = atlas.map.create_keyframe(
                frame.id,
                frame.timestamp,
                pose.clone(),
                frame.keypoints.clone(),
                frame.descriptors.clone(),
                frame.points_cam.clone(),
            );
            for m in &matches {
                let kp = first.keypoints[m.query_idx];
                let position = self.camera.unproject(kp.x as f64, kp.y as f64, 1.0);
                let mp_id = atlas
                    .map
                    .create_map_point(position, first.descriptors[m.query_idx], kf0, m.query_idx);
                atlas.map.associate(kf1, m.train_idx, mp_id);
            }
            atlas.map.link_to_spanning_tree(kf1, Some(kf0));
            atlas.index_keyframe(kf0);
            atlas.index_keyframe(kf1);
            atlas.map.get_keyframe(kf1).map(Reference::from_keyframe)
        };

        let Some(reference) = reference else {
            self.mark_lost(frame);
            return None;
        };
        info!("New monocular map created with {} points", matches.len());
        Some(self.start_tracking(frame, pose, reference))
    }

    /// Enter `Ok` with `reference` being the keyframe made from `frame`.
    fn start_tracking(&mut self, frame: &Frame, pose: SE3, reference: Reference) -> SE3 {
        self.state = TrackingState::Ok;
        self.lost_frames = 0;
        self.motion.reset();
        self.motion.update(&pose);
        self.kf_decision.reset();
        self.current_map_points = reference.map_points.clone();
        self.history
            .push_tracked(SE3::identity(), reference.id, frame.timestamp);
        self.reference = Some(reference);
        pose
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tracking
    // ─────────────────────────────────────────────────────────────────────────

    fn track_frame(&mut self, frame: &Frame) -> Option<SE3> {
        self.refresh_reference();

        let tracked = match self.state {
            TrackingState::Lost => self.relocalize(frame),
            TrackingState::RecentlyLost => self
                .track_reference(frame)
                .or_else(|| self.relocalize(frame)),
            _ => self.track_reference(frame),
        };

        match tracked {
            Some(tracked) => Some(self.accept(frame, tracked)),
            None => self.handle_failure(frame),
        }
    }

    /// Pick up the map points Local Mapping created for a reference
    /// keyframe that was still queued when it became the reference.
    fn refresh_reference(&mut self) {
        let Some(reference) = self.reference.as_mut() else {
            return;
        };
        if reference.in_map {
            return;
        }
        let atlas = self.shared.atlas.read();
        if let Some(kf) = atlas.map.get_keyframe(reference.id) {
            *reference = Reference::from_keyframe(kf);
        }
    }

    fn track_reference(&self, frame: &Frame) -> Option<Tracked> {
        let reference = self.reference.as_ref()?;
        let matches: Vec<Match> = match_descriptors(&frame.descriptors, &reference.descriptors, TH_HIGH)
            .into_iter()
            .filter(|m| reference.is_trackable(m.train_idx))
            .collect();
        if matches.len() < self.config.min_matches {
            debug!(
                "Tracking: {} matches with {}, {} needed",
                matches.len(),
                reference.id,
                self.config.min_matches
            );
            return None;
        }

        let atlas = self.shared.atlas.read();
        let fallback = self.motion.predict().unwrap_or_else(|| reference.pose.clone());
        let (pose, inliers) = self.estimate_pose(
            frame,
            &matches,
            |idx| reference.world_point(idx, &atlas.map),
            fallback,
        )?;

        let mut map_points = vec![None; frame.num_features()];
        for m in &inliers {
            map_points[m.query_idx] = reference.map_points.get(m.train_idx).copied().flatten();
        }
        Some(Tracked {
            pose,
            map_points,
            num_matches: inliers.len(),
            relocalized_against: None,
        })
    }

    /// Query the keyframe database and try the best candidates.
    fn relocalize(&self, frame: &Frame) -> Option<Tracked> {
        if frame.descriptors.is_empty() {
            return None;
        }
        let bow = self.shared.vocabulary.transform(&frame.descriptors);
        let atlas = self.shared.atlas.read();
        let candidates = atlas
            .keyframe_db
            .detect_relocalization_candidates(&atlas.map, &bow);

        for candidate in candidates.iter().take(MAX_RELOCALIZATION_CANDIDATES) {
            let Some(kf) = atlas.map.get_keyframe(candidate.keyframe_id).filter(|kf| !kf.is_bad) else {
                continue;
            };
            let reference = Reference::from_keyframe(kf);
            let matches: Vec<Match> = match_descriptors(&frame.descriptors, &kf.descriptors, TH_LOW)
                .into_iter()
                .filter(|m| reference.is_trackable(m.train_idx))
                .collect();
            if matches.len() < self.config.min_relocalization_matches {
                continue;
            }

            let Some((pose, inliers)) = self.estimate_pose(
                frame,
                &matches,
                |idx| reference.world_point(idx, &atlas.map),
                kf.pose.clone(),
            ) else {
                continue;
            };

            let mut map_points = vec![None; frame.num_features()];
            for m in &inliers {
                map_points[m.query_idx] = reference.map_points.get(m.train_idx).copied().flatten();
            }
            info!(
                "Tracking: relocalized against {} ({} matches)",
                kf.id,
                inliers.len()
            );
            return Some(Tracked {
                pose,
                map_points,
                num_matches: inliers.len(),
                relocalized_against: Some(reference),
            });
        }
        None
    }

    /// Pose from the matched features.
    ///
    /// Frames with depth are aligned rigidly onto the world points of their
    /// matches; the returned matches are the alignment inliers. Monocular
    /// frames take `fallback` and keep every match.
    fn estimate_pose(
        &self,
        frame: &Frame,
        matches: &[Match],
        world_point: impl Fn(usize) -> Option<Vector3<f64>>,
        fallback: SE3,
    ) -> Option<(SE3, Vec<Match>)> {
        if self.sensor == Sensor::Monocular {
            return Some((fallback, matches.to_vec()));
        }

        let mut used = Vec::with_capacity(matches.len());
        let mut source = Vec::with_capacity(matches.len());
        let mut target = Vec::with_capacity(matches.len());
        for m in matches {
            let p_cam = frame.points_cam.get(m.query_idx).copied().flatten();
            if let (Some(p_cam), Some(p_world)) = (p_cam, world_point(m.train_idx)) {
                source.push(p_cam);
                target.push(p_world);
                used.push(*m);
            }
        }

        let config = AlignmentConfig {
            min_inliers: (self.config.min_matches / 2).max(3),
            ..Default::default()
        };
        let alignment = align_points_ransac(&source, &target, &config)?;
        let inliers = alignment.inliers.iter().map(|&i| used[i]).collect();
        Some((alignment.transform, inliers))
    }

    fn accept(&mut self, frame: &Frame, tracked: Tracked) -> SE3 {
        if self.state != TrackingState::Ok {
            info!("Tracking: recovered ({} matches)", tracked.num_matches);
        }
        self.state = TrackingState::Ok;
        self.lost_frames = 0;

        if let Some(reference) = tracked.relocalized_against {
            self.motion.anchor(&tracked.pose);
            self.kf_decision.reset();
            self.reference = Some(reference);
        } else {
            self.motion.update(&tracked.pose);
        }
        self.current_map_points = tracked.map_points;

        if let Some(reference) = &self.reference {
            self.history.push_tracked(
                reference.pose.between(&tracked.pose),
                reference.id,
                frame.timestamp,
            );
        }

        self.maybe_create_keyframe(frame, &tracked.pose, tracked.num_matches);
        tracked.pose
    }

    /// `Ok` degrades to `RecentlyLost`, which keeps predicting the pose for
    /// a few frames before giving up and becoming `Lost`.
    fn handle_failure(&mut self, frame: &Frame) -> Option<SE3> {
        self.current_map_points = vec![None; frame.num_features()];

        if !matches!(self.state, TrackingState::Ok | TrackingState::RecentlyLost) {
            self.mark_lost(frame);
            return None;
        }

        self.lost_frames += 1;
        if self.lost_frames > self.config.max_lost_frames {
            warn!("Tracking: lost after {} failed frames", self.lost_frames);
            self.state = TrackingState::Lost;
            self.motion.reset();
            self.mark_lost(frame);
            return None;
        }

        self.state = TrackingState::RecentlyLost;
        let (Some(pose), Some(reference)) = (self.motion.predict(), self.reference.as_ref()) else {
            self.mark_lost(frame);
            return None;
        };
        self.history
            .push_tracked(reference.pose.between(&pose), reference.id, frame.timestamp);
        self.motion.update(&pose);
        Some(pose)
    }

    fn mark_lost(&mut self, frame: &Frame) {
        self.current_map_points = vec![None; frame.num_features()];
        self.history.push_lost(frame.timestamp);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame creation
    // ─────────────────────────────────────────────────────────────────────────

    /// Decide whether to create a new keyframe, and if so, send it to Local Mapping.
    fn maybe_create_keyframe(&mut self, frame: &Frame, pose: &SE3, num_matches: usize) {
        if self.localization_only {
            return;
        }

        // Don't create keyframes while Local Mapping is paused or overloaded
        let local_mapping = &self.links.local_mapping;
        if local_mapping.is_stopped()
            || local_mapping.is_stop_requested()
            || self.shared.should_stop_keyframe_creation()
        {
            return;
        }

        let Some(reference) = &self.reference else {
            return;
        };
        let candidate = KeyFrameCandidate {
            tracked_points: num_matches,
            reference_points: reference.num_trackable(),
            mapping_idle: self.links.keyframes.is_empty(),
        };
        if !self.kf_decision.should_create_keyframe(candidate) {
            return;
        }

        let keyframe_id = self.shared.atlas.write().map.next_keyframe_id();
        let msg = NewKeyFrameMsg {
            keyframe_id,
            frame_id: frame.id,
            timestamp: frame.timestamp,
            pose: pose.clone(),
            keypoints: frame.keypoints.clone(),
            descriptors: frame.descriptors.clone(),
            points_cam: frame.points_cam.clone(),
            matched_map_points: self.current_map_points.clone(),
        };

        match self.links.keyframes.try_send(msg) {
            Ok(()) => {
                debug!("Tracking: new keyframe {} from frame {}", keyframe_id, frame.id);
                self.reference = Some(Reference {
                    id: keyframe_id,
                    pose: pose.clone(),
                    descriptors: frame.descriptors.clone(),
                    points_cam: frame.points_cam.clone(),
                    map_points: self.current_map_points.clone(),
                    in_map: false,
                });
            }
            Err(TrySendError::Full(_)) => {
                warn!("Tracking: Local Mapping queue full, keyframe dropped")
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("Tracking: Local Mapping is gone, keyframe dropped")
            }
        }
    }

    /// Hand the frame to the display adapters.
    fn publish(&self, frame: &Frame, pose: Option<&SE3>) {
        self.frame_drawer.update(FrameSnapshot {
            state: self.state,
            timestamp: frame.timestamp,
            keypoints: frame.keypoints.clone(),
            tracked: self.current_map_points.iter().map(Option::is_some).collect(),
            localization_only: self.localization_only,
        });
        match pose {
            Some(pose) => self.map_drawer.set_current_camera_pose(pose.clone()),
            None => self.map_drawer.clear_camera_pose(),
        }
    }

    /// Forget everything tied to the current frame sequence.
    fn clear_frame_state(&mut self) {
        self.reference = None;
        self.mono_init = None;
        self.motion.reset();
        self.kf_decision.reset();
        self.lost_frames = 0;
        self.current_keypoints.clear();
        self.current_map_points.clear();
        self.map_drawer.clear_camera_pose();
    }
}

impl TrackingStage for Tracker {
    fn track(&mut self, input: SensorInput<'_>, timestamp: f64) -> Result<Option<SE3>> {
        if self.shared.generation() != self.generation {
            info!("Tracking: the map was replaced, relocalizing");
            self.reset_after_load();
        }

        let frame = Frame::new(
            self.shared.frame_ids.next_id(),
            timestamp,
            input,
            &self.extractor,
            &self.camera,
            &self.depth,
        );

        if self.state == TrackingState::NoImagesYet {
            self.state = TrackingState::NotInitialized;
        }

        let pose = if self.state == TrackingState::NotInitialized {
            self.initialize(&frame)
        } else {
            self.track_frame(&frame)
        };

        self.current_keypoints = frame.keypoints.clone();
        self.publish(&frame, pose.as_ref());
        Ok(pose)
    }

    fn set_localization_only(&mut self, enabled: bool) {
        self.localization_only = enabled;
    }

    fn reset(&mut self) {
        info!("System reseting");
        if let Some(viewer) = &self.links.viewer {
            viewer.request_stop();
            viewer.wait_until_stopped();
        }

        // Neither stage may be waited on while holding the atlas lock
        info!("Reseting Local Mapper...");
        self.links.local_mapping.request_reset();
        info!("Reseting Loop Closing...");
        self.links.loop_closing.request_reset();

        info!("Reseting Database and Map...");
        self.shared.atlas.write().clear();
        self.shared.frame_ids.reset_to(0);
        self.shared.set_stop_keyframe_creation(false);

        self.state = TrackingState::NoImagesYet;
        self.clear_frame_state();
        self.history.clear();

        // Drops only our hold; a load in flight may still hold the viewer
        if let Some(viewer) = &self.links.viewer {
            viewer.release();
        }
        info!("Tracking: reset done");
    }

    fn reset_after_load(&mut self) {
        self.clear_frame_state();
        self.history.clear();
        self.generation = self.shared.generation();
        self.state = TrackingState::Lost;
        info!("Tracking: continuing on the loaded map, relocalization required");
    }

    fn state(&self) -> TrackingState {
        self.state
    }

    fn current_map_points(&self) -> Vec<Option<MapPointId>> {
        self.current_map_points.clone()
    }

    fn current_keypoints(&self) -> Vec<KeyPoint> {
        self.current_keypoints.clone()
    }

    fn history(&self) -> &TrajectoryHistory {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, Fixture};
    use crossbeam_channel::{bounded, Receiver};
    use image::GrayImage;

    struct Harness {
        fixture: Fixture,
        tracker: Tracker,
        keyframes: Receiver<NewKeyFrameMsg>,
        local_mapping: Arc<StageControl>,
    }

    fn harness(sensor: Sensor) -> Harness {
        let fixture = Fixture::new();
        let (tx, rx) = bounded(16);
        let local_mapping = Arc::new(StageControl::new("Local Mapping"));
        let loop_closing = Arc::new(StageControl::new("Loop Closing"));
        // No workers run in these tests: finished stages answer resets at once
        local_mapping.set_finished();
        loop_closing.set_finished();
        local_mapping.release();

        let links = StageLinks {
            keyframes: tx,
            local_mapping: Arc::clone(&local_mapping),
            loop_closing,
            viewer: None,
        };
        let tracker = Tracker::new(
            &fixture.settings,
            sensor,
            Arc::clone(&fixture.shared),
            links,
            Arc::new(FrameDrawer::new()),
            Arc::new(MapDrawer::new(Arc::clone(&fixture.shared))),
            false,
        );
        Harness {
            fixture,
            tracker,
            keyframes: rx,
            local_mapping,
        }
    }

    fn rgbd(tracker: &mut Tracker, image: &GrayImage, t: f64) -> Option<SE3> {
        let depth = test_support::depth_image(image.width(), image.height(), 10_000);
        tracker
            .track(SensorInput::Rgbd { image, depth: &depth }, t)
            .unwrap()
    }

    #[test]
    fn test_rgbd_initializes_on_first_frame() {
        let mut h = harness(Sensor::Rgbd);
        assert_eq!(h.tracker.state(), TrackingState::NoImagesYet);

        let image = test_support::textured_image(160, 120, 7);
        let pose = rgbd(&mut h.tracker, &image, 0.0).unwrap();
        assert_eq!(pose, SE3::identity());
        assert_eq!(h.tracker.state(), TrackingState::Ok);

        let atlas = h.fixture.shared.atlas.read();
        assert_eq!(atlas.map.num_keyframes(), 1);
        assert!(atlas.map.num_map_points() >= h.fixture.settings.tracking.min_init_points);
        assert!(h.tracker.current_map_points().iter().any(Option::is_some));
    }

    #[test]
    fn test_identical_frame_tracks_at_same_pose() {
        let mut h = harness(Sensor::Rgbd);
        let image = test_support::textured_image(160, 120, 7);
        rgbd(&mut h.tracker, &image, 0.0).unwrap();

        let pose = rgbd(&mut h.tracker, &image, 0.5).unwrap();
        let (dt, dr) = pose.distance(&SE3::identity());
        assert!(dt < 1e-6 && dr < 1e-6);
        assert_eq!(h.tracker.state(), TrackingState::Ok);
        assert_eq!(h.tracker.history().len(), 2);
        assert!(h.tracker.history().records().iter().all(|r| !r.lost));
    }

    #[test]
    fn test_failures_degrade_to_lost_then_relocalize() {
        let mut h = harness(Sensor::Rgbd);
        let image = test_support::textured_image(160, 120, 7);
        let blank = GrayImage::new(160, 120);
        rgbd(&mut h.tracker, &image, 0.0).unwrap();

        let max_lost = h.fixture.settings.tracking.max_lost_frames;
        for i in 0..max_lost {
            assert!(rgbd(&mut h.tracker, &blank, 1.0 + i as f64).is_some());
            assert_eq!(h.tracker.state(), TrackingState::RecentlyLost);
        }
        assert!(rgbd(&mut h.tracker, &blank, 10.0).is_none());
        assert_eq!(h.tracker.state(), TrackingState::Lost);
        assert!(h.tracker.history().records().last().unwrap().lost);

        assert!(rgbd(&mut h.tracker, &image, 11.0).is_some());
        assert_eq!(h.tracker.state(), TrackingState::Ok);
    }

    #[test]
    fn test_keyframes_only_outside_localization_mode() {
        let mut h = harness(Sensor::Rgbd);
        let image = test_support::textured_image(160, 120, 7);
        rgbd(&mut h.tracker, &image, 0.0).unwrap();

        h.tracker.set_localization_only(true);
        assert!(h.tracker.is_localization_only());
        for i in 1..6 {
            rgbd(&mut h.tracker, &image, i as f64 * 0.5).unwrap();
        }
        assert!(h.keyframes.try_recv().is_err());

        h.tracker.set_localization_only(false);
        for i in 6..10 {
            rgbd(&mut h.tracker, &image, i as f64 * 0.5).unwrap();
        }
        let msg = h.keyframes.try_recv().unwrap();
        assert!(msg.matched_map_points.iter().any(Option::is_some));
        assert!(msg.frame_id > 0);
    }

    #[test]
    fn test_no_keyframes_while_local_mapping_stopped() {
        let mut h = harness(Sensor::Rgbd);
        let image = test_support::textured_image(160, 120, 7);
        rgbd(&mut h.tracker, &image, 0.0).unwrap();

        h.local_mapping.request_stop();
        for i in 1..6 {
            rgbd(&mut h.tracker, &image, i as f64 * 0.5).unwrap();
        }
        assert!(h.keyframes.try_recv().is_err());
    }

    #[test]
    fn test_reset_clears_map_and_history() {
        let mut h = harness(Sensor::Rgbd);
        let image = test_support::textured_image(160, 120, 7);
        rgbd(&mut h.tracker, &image, 0.0).unwrap();
        rgbd(&mut h.tracker, &image, 0.5).unwrap();

        h.tracker.reset();
        assert_eq!(h.tracker.state(), TrackingState::NoImagesYet);
        assert!(h.tracker.history().is_empty());
        assert_eq!(h.fixture.shared.atlas.read().map.num_keyframes(), 0);
        assert_eq!(h.fixture.shared.frame_ids.peek(), 0);

        rgbd(&mut h.tracker, &image, 1.0).unwrap();
        assert_eq!(h.tracker.state(), TrackingState::Ok);
    }

    #[test]
    fn test_reset_keeps_other_viewer_pauses() {
        let mut h = harness(Sensor::Rgbd);
        let viewer = Arc::new(StageControl::new("Viewer"));
        viewer.set_finished();
        h.tracker.links.viewer = Some(Arc::clone(&viewer));

        // A map load is holding the viewer while the reset runs
        viewer.request_stop();
        h.tracker.reset();
        assert!(viewer.is_stop_requested());

        viewer.release();
        assert!(!viewer.is_stop_requested());
    }

    #[test]
    fn test_monocular_needs_two_frames() {
        let mut h = harness(Sensor::Monocular);
        let image = test_support::textured_image(160, 120, 7);

        let first = h.tracker.track(SensorInput::Monocular { image: &image }, 0.0).unwrap();
        assert!(first.is_none());
        assert_eq!(h.tracker.state(), TrackingState::NotInitialized);

        let second = h.tracker.track(SensorInput::Monocular { image: &image }, 0.1).unwrap();
        assert!(second.is_some());
        assert_eq!(h.tracker.state(), TrackingState::Ok);
        assert_eq!(h.fixture.shared.atlas.read().map.num_keyframes(), 2);
    }

    #[test]
    fn test_replaced_map_forces_relocalization() {
        let mut h = harness(Sensor::Rgbd);
        let image = test_support::textured_image(160, 120, 7);
        rgbd(&mut h.tracker, &image, 0.0).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.bin");
        {
            let atlas = h.fixture.shared.atlas.read();
            crate::atlas::persistence::write_atlas(&path, &atlas).unwrap();
        }
        let loaded = crate::atlas::persistence::read_atlas(&path, &h.fixture.vocabulary).unwrap();
        h.fixture.shared.replace_atlas(loaded);

        assert!(rgbd(&mut h.tracker, &image, 1.0).is_some());
        assert_eq!(h.tracker.state(), TrackingState::Ok);
        assert_eq!(h.tracker.history().len(), 1);
    }
}
