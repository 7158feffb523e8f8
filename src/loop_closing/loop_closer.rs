//! LoopCloser - Main loop closing thread.
//!
//! This module implements the main loop closing thread that:
//! 1. Receives keyframes from LocalMapping
//! 2. Detects loop candidates using BoW
//! 3. Verifies candidates by descriptor matching (plus rigid alignment with depth)
//! 4. Registers the loop while Local Mapping is stopped
//! 5. Launches the global pass in the background

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use nalgebra::Vector3;
use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::settings::LoopClosingSettings;
use crate::system::lifecycle::StageControl;
use crate::system::messages::LoopQueryMsg;
use crate::system::shared_state::SharedState;

use super::detector::{detect_loop_candidates, verify_loop_candidate, ConsistencyChecker, LoopDetectorConfig, VerifiedLoop};

/// Timeout for receiving keyframes from the channel.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Configuration for the LoopCloser.
#[derive(Debug, Clone)]
pub struct LoopCloserConfig {
    /// Loop detection configuration.
    pub detector: LoopDetectorConfig,

    /// Whether to run the global pass after a loop is registered.
    pub run_global_ba: bool,

    /// Whether keyframes carry depth (stereo / RGB-D).
    pub has_depth: bool,
}

impl LoopCloserConfig {
    pub fn from_settings(settings: &LoopClosingSettings, has_depth: bool) -> Self {
        Self {
            detector: LoopDetectorConfig::from_settings(settings),
            run_global_ba: settings.run_global_ba,
            has_depth,
        }
    }
}

/// Statistics for the loop closer.
#[derive(Debug, Default, Clone)]
pub struct LoopCloserStats {
    /// Number of keyframes processed.
    pub keyframes_processed: usize,

    /// Number of loop candidates detected.
    pub candidates_detected: usize,

    /// Number of loops verified.
    pub loops_verified: usize,

    /// Number of loops registered in the map.
    pub loops_closed: usize,
}

/// The LoopCloser thread handler.
pub struct LoopCloser {
    shared: Arc<SharedState>,
    config: LoopCloserConfig,

    /// Own lifecycle. `busy` is set while the global pass runs.
    control: Arc<StageControl>,

    /// Local Mapping is stopped while a loop is registered.
    local_mapping: Arc<StageControl>,

    queries: Receiver<LoopQueryMsg>,
    consistency_checker: ConsistencyChecker,
    stats: LoopCloserStats,
    global_pass: Option<thread::JoinHandle<()>>,
}

impl LoopCloser {
    pub fn new(
        shared: Arc<SharedState>,
        config: LoopCloserConfig,
        control: Arc<StageControl>,
        local_mapping: Arc<StageControl>,
        queries: Receiver<LoopQueryMsg>,
    ) -> Self {
        let consistency_checker = ConsistencyChecker::new(config.detector.consistency_threshold);
        Self {
            shared,
            config,
            control,
            local_mapping,
            queries,
            consistency_checker,
            stats: LoopCloserStats::default(),
            global_pass: None,
        }
    }

    /// Run the main loop closing thread until finish is requested or the
    /// channel is closed.
    pub fn run(mut self) {
        info!("Loop Closing: started");

        loop {
            if self.control.is_reset_requested() {
                self.reset();
            }

            if self.control.is_finish_requested() {
                break;
            }

            match self.queries.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => self.process_keyframe(msg.keyframe_id),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!(
            "Loop Closing: finished (processed={}, detected={}, verified={}, closed={})",
            self.stats.keyframes_processed,
            self.stats.candidates_detected,
            self.stats.loops_verified,
            self.stats.loops_closed
        );
        self.control.set_finished();

        // The orchestrator joins this thread, so it also waits for the pass
        self.join_global_pass();
    }

    fn reset(&mut self) {
        let dropped = self.queries.try_iter().count();
        self.consistency_checker.clear();
        self.control.reset_done();
        info!("Loop Closing: reset, {} queued keyframes dropped", dropped);
    }

    /// Process a single keyframe for loop detection.
    fn process_keyframe(&mut self, kf_id: KeyFrameId) {
        self.stats.keyframes_processed += 1;

        // Skip while the global pass is running
        if self.control.is_busy() {
            debug!("Loop Closing: global pass running, {} skipped", kf_id);
            return;
        }

        // Step 1: Detect loop candidates
        let candidates = {
            let atlas = self.shared.atlas.read();
            detect_loop_candidates(&atlas.map, &atlas.keyframe_db, kf_id, &self.config.detector)
        };
        self.stats.candidates_detected += candidates.len();

        // Step 2: Check temporal consistency
        let Some(candidate) = self.consistency_checker.add_and_check(kf_id, &candidates) else {
            return;
        };
        info!(
            "Loop candidate detected: {} -> {} (score: {:.3})",
            candidate.current_kf_id, candidate.loop_kf_id, candidate.bow_score
        );

        // Step 3: Verify
        let verified = {
            let atlas = self.shared.atlas.read();
            verify_loop_candidate(&atlas.map, &candidate, self.config.has_depth, &self.config.detector)
        };
        let Some(verified) = verified else {
            debug!("Loop candidate failed verification");
            return;
        };
        self.stats.loops_verified += 1;

        // Step 4: Stop Local Mapping
        self.local_mapping.request_stop();
        self.local_mapping.wait_until_stopped();

        // Step 5: Register the loop
        let fused = {
            let mut atlas = self.shared.atlas.write();
            register_loop(&mut atlas.map, &verified)
        };
        self.stats.loops_closed += 1;
        info!(
            "Loop closed: {} -> {} ({} matched points, {} fused)",
            verified.current_kf_id,
            verified.loop_kf_id,
            verified.matched_map_points.len(),
            fused
        );

        // Step 6: Drop our hold on Local Mapping
        self.local_mapping.release();

        // Step 7: Launch the global pass
        if self.config.run_global_ba {
            self.launch_global_pass();
        }
    }

    /// Run [`run_global_pass`] on its own thread with the busy flag set.
    fn launch_global_pass(&mut self) {
        self.join_global_pass();

        self.control.set_busy(true);
        let shared = Arc::clone(&self.shared);
        let control = Arc::clone(&self.control);
        let spawned = thread::Builder::new()
            .name("global-pass".into())
            .spawn(move || {
                info!("Running global pass");
                let updated = run_global_pass(&shared);
                info!("Global pass finished, {} map points updated", updated);
                control.set_busy(false);
            });

        match spawned {
            Ok(handle) => self.global_pass = Some(handle),
            Err(e) => {
                warn!("Loop Closing: could not start the global pass: {}", e);
                self.control.set_busy(false);
            }
        }
    }

    /// Wait for the previous global pass. Returns false if it panicked.
    fn join_global_pass(&mut self) -> bool {
        let Some(handle) = self.global_pass.take() else {
            return true;
        };
        if handle.join().is_err() {
            warn!("Loop Closing: global pass panicked");
            return false;
        }
        true
    }

    /// Get current statistics.
    pub fn stats(&self) -> &LoopCloserStats {
        &self.stats
    }
}

/// Add the loop edges, fuse the current keyframe's matched features into
/// the loop's map points and record a big change. Returns the number of
/// features moved to a loop map point.
pub fn register_loop(map: &mut Map, verified: &VerifiedLoop) -> usize {
    let current = verified.current_kf_id;
    let loop_kf = verified.loop_kf_id;

    if let Some(kf) = map.get_keyframe_mut(current) {
        kf.add_loop_edge(loop_kf);
    }
    if let Some(kf) = map.get_keyframe_mut(loop_kf) {
        kf.add_loop_edge(current);
    }

    let mut fused = 0;
    for &(feat_idx, loop_mp) in &verified.matched_map_points {
        let existing: Option<MapPointId> = map.get_keyframe(current).and_then(|kf| kf.get_map_point(feat_idx));
        if existing == Some(loop_mp) {
            continue;
        }
        if existing.is_some() {
            map.disassociate(current, feat_idx);
        }
        if map.associate(current, feat_idx, loop_mp) {
            fused += 1;
        }
    }

    if let Some(pose) = &verified.corrected_pose {
        if let Some(kf) = map.get_keyframe(current) {
            let (dt, dr) = kf.pose.distance(pose);
            debug!("Loop drift at {}: {:.3} m, {:.3} rad", current, dt, dr);
        }
    }

    map.inform_big_change();
    fused
}

/// Global pass over the whole map.
///
/// Every map point observed with depth is moved to the mean of the world
/// positions its observers measured. Runs under the atlas write lock and
/// records a big change. Returns the number of points moved.
pub fn run_global_pass(shared: &SharedState) -> usize {
    let mut atlas = shared.atlas.write();
    let map = &mut atlas.map;

    let updates: Vec<(MapPointId, Vector3<f64>)> = map
        .map_points()
        .filter(|mp| !mp.is_bad)
        .filter_map(|mp| {
            let measured: Vec<Vector3<f64>> = mp
                .observations
                .iter()
                .filter_map(|(kf_id, &feat_idx)| {
                    let kf = map.get_keyframe(*kf_id).filter(|kf| !kf.is_bad)?;
                    let p_cam = kf.points_cam.get(feat_idx).copied().flatten()?;
                    Some(kf.pose.transform_point(&p_cam))
                })
                .collect();
            if measured.is_empty() {
                return None;
            }
            let mean = measured.iter().sum::<Vector3<f64>>() / measured.len() as f64;
            Some((mp.id, mean))
        })
        .collect();

    let updated = updates.len();
    for (mp_id, position) in updates {
        if let Some(mp) = map.get_map_point_mut(mp_id) {
            mp.position = position;
        }
    }
    map.inform_big_change();
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::test_support::{self, Fixture};
    use crossbeam_channel::bounded;
    use std::time::Instant;

    const N: usize = 40;

    /// KF0 sees a set of features, KF1..=KF3 see something else, KF4
    /// sees KF0's features again from a drifted pose and shares one point
    /// with KF3.
    fn build_revisit(fixture: &Fixture) -> (KeyFrameId, KeyFrameId) {
        let seen = test_support::random_descriptors(N, 11);
        let points: Vec<Option<Vector3<f64>>> = (0..N)
            .map(|i| Some(Vector3::new((i % 8) as f64 * 0.2, (i / 8) as f64 * 0.2, 2.0 + (i % 3) as f64 * 0.3)))
            .collect();
        let keypoints = vec![crate::tracking::KeyPoint { x: 10.0, y: 10.0, response: 1.0 }; N];

        let mut atlas = fixture.shared.atlas.write();
        let kf0 = atlas.map.create_keyframe(0, 0.0, SE3::identity(), keypoints.clone(), seen.clone(), points.clone());
        for (i, p) in points.iter().enumerate() {
            atlas.map.create_map_point(p.unwrap(), seen[i], kf0, i);
        }

        let mut previous = kf0;
        for k in 1..=3u64 {
            let other: Vec<_> = (0..N).map(|i| [0xFF ^ (i as u8 & 0x07); 32]).collect();
            let kf = atlas.map.create_keyframe(
                k,
                k as f64,
                SE3::from_translation(Vector3::new(k as f64, 0.0, 0.0)),
                keypoints.clone(),
                other.clone(),
                points.clone(),
            );
            atlas.map.create_map_point(Vector3::new(k as f64, 0.0, 2.0), other[0], kf, 0);
            atlas.map.link_to_spanning_tree(kf, Some(previous));
            previous = kf;
        }

        let kf4 = atlas.map.create_keyframe(
            4,
            4.0,
            SE3::from_translation(Vector3::new(0.3, 0.0, 0.0)),
            keypoints,
            seen,
            points,
        );
        let shared_mp = atlas.map.get_keyframe(previous).unwrap().get_map_point(0).unwrap();
        atlas.map.associate(kf4, N - 1, shared_mp);
        atlas.map.link_to_spanning_tree(kf4, Some(previous));

        for id in atlas.map.keyframe_ids() {
            atlas.index_keyframe(id);
        }
        (kf0, kf4)
    }

    fn config() -> LoopCloserConfig {
        LoopCloserConfig {
            detector: LoopDetectorConfig {
                consistency_threshold: 1,
                min_temporal_gap: 2,
                min_matches: 20,
                ..Default::default()
            },
            run_global_ba: false,
            has_depth: true,
        }
    }

    fn closer(fixture: &Fixture, config: LoopCloserConfig) -> (LoopCloser, Arc<StageControl>, Arc<StageControl>) {
        let control = Arc::new(StageControl::new("Loop Closing"));
        let local_mapping = Arc::new(StageControl::new("Local Mapping"));
        // No Local Mapping thread here: a finished stage counts as stopped
        local_mapping.set_finished();
        let (_tx, rx) = bounded(4);
        let closer = LoopCloser::new(
            Arc::clone(&fixture.shared),
            config,
            Arc::clone(&control),
            Arc::clone(&local_mapping),
            rx,
        );
        (closer, control, local_mapping)
    }

    #[test]
    fn test_revisit_registers_loop() {
        let fixture = Fixture::new();
        let (kf0, kf4) = build_revisit(&fixture);
        let before = fixture.shared.atlas.read().map.big_change_index();

        let (mut closer, _, local_mapping) = closer(&fixture, config());
        closer.process_keyframe(kf4);
        assert_eq!(closer.stats().loops_closed, 1);

        let atlas = fixture.shared.atlas.read();
        assert!(atlas.map.big_change_index() > before);
        assert!(atlas.map.get_keyframe(kf4).unwrap().loop_edges.contains(&kf0));
        assert!(atlas.map.get_keyframe(kf0).unwrap().loop_edges.contains(&kf4));
        let loop_mp = atlas.map.get_keyframe(kf0).unwrap().get_map_point(0);
        assert_eq!(atlas.map.get_keyframe(kf4).unwrap().get_map_point(0), loop_mp);
        assert!(!local_mapping.is_stop_requested());
    }

    #[test]
    fn test_loop_registration_keeps_other_stop_requests() {
        let fixture = Fixture::new();
        let (_, kf4) = build_revisit(&fixture);
        let (mut closer, _, local_mapping) = closer(&fixture, config());

        // Localization mode already holds Local Mapping
        local_mapping.request_stop();
        closer.process_keyframe(kf4);
        assert_eq!(closer.stats().loops_closed, 1);
        assert!(local_mapping.is_stop_requested());

        local_mapping.release();
        assert!(!local_mapping.is_stop_requested());
    }

    #[test]
    fn test_panicked_global_pass_is_reported() {
        let fixture = Fixture::new();
        let (mut closer, _, _) = closer(&fixture, config());
        assert!(closer.join_global_pass());

        closer.global_pass = Some(thread::spawn(|| panic!("global pass failed")));
        assert!(!closer.join_global_pass());
        assert!(closer.global_pass.is_none());
    }

    #[test]
    fn test_verification_recovers_drifted_pose() {
        let fixture = Fixture::new();
        let (kf0, kf4) = build_revisit(&fixture);
        let atlas = fixture.shared.atlas.read();
        let candidates = detect_loop_candidates(&atlas.map, &atlas.keyframe_db, kf4, &config().detector);
        assert_eq!(candidates[0].loop_kf_id, kf0);

        let verified = verify_loop_candidate(&atlas.map, &candidates[0], true, &config().detector).unwrap();
        let (dt, dr) = verified.corrected_pose.unwrap().distance(&SE3::identity());
        assert!(dt < 1e-6 && dr < 1e-6);
    }

    #[test]
    fn test_global_pass_sets_busy_until_done() {
        let fixture = Fixture::new();
        let (_, kf4) = build_revisit(&fixture);
        let config = LoopCloserConfig {
            run_global_ba: true,
            ..config()
        };
        let (mut closer, control, _) = closer(&fixture, config);
        closer.process_keyframe(kf4);

        let start = Instant::now();
        while control.is_busy() {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(2));
        }
        control.set_finished();
        control.wait_until_idle();
    }

    #[test]
    fn test_global_pass_averages_observations() {
        let fixture = Fixture::new();
        {
            let mut atlas = fixture.shared.atlas.write();
            let kp = vec![crate::tracking::KeyPoint { x: 0.0, y: 0.0, response: 1.0 }];
            let a = atlas
                .map
                .create_keyframe(0, 0.0, SE3::identity(), kp.clone(), vec![[0; 32]], vec![Some(Vector3::new(0.0, 0.0, 2.0))]);
            let b = atlas
                .map
                .create_keyframe(1, 1.0, SE3::identity(), kp, vec![[0; 32]], vec![Some(Vector3::new(0.0, 0.0, 4.0))]);
            let mp = atlas.map.create_map_point(Vector3::new(0.0, 0.0, 10.0), [0; 32], a, 0);
            atlas.map.associate(b, 0, mp);
        }

        assert_eq!(run_global_pass(&fixture.shared), 1);
        let atlas = fixture.shared.atlas.read();
        let mp = atlas.map.map_points().next().unwrap();
        assert!((mp.position - Vector3::new(0.0, 0.0, 3.0)).norm() < 1e-12);
    }

    #[test]
    fn test_thread_serves_reset_and_finish() {
        let fixture = Fixture::new();
        let control = Arc::new(StageControl::new("Loop Closing"));
        let (tx, rx) = bounded(4);
        let closer = LoopCloser::new(
            Arc::clone(&fixture.shared),
            config(),
            Arc::clone(&control),
            Arc::new(StageControl::new("Local Mapping")),
            rx,
        );
        let handle = thread::spawn(move || closer.run());

        tx.send(LoopQueryMsg { keyframe_id: KeyFrameId::new(99) }).unwrap();
        control.request_reset();
        assert!(!control.is_reset_requested());

        control.request_finish();
        control.wait_until_idle();
        handle.join().unwrap();
    }
}
