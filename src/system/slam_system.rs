//! The orchestrator: owns every stage and thread of the pipeline.
//!
//! Tracking runs on the caller's thread, behind a mutex so concurrent
//! submissions cannot interleave. Local Mapping, Loop Closing and the
//! optional Viewer run on named background threads and are driven through
//! their [`StageControl`] blocks.
//!
//! Three independent locks guard the cross-thread requests:
//!     mode    - pending localization-mode transitions
//!     reset   - pending reset / reset-and-load
//!     status  - snapshot of the last tracked frame

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::bounded;
use image::GrayImage;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::atlas::map::{KeyFrameId, MapPointId};
use crate::atlas::persistence::{has_map_suffix, read_atlas, write_atlas};
use crate::error::{Result, SlamError};
use crate::geometry::SE3;
use crate::local_mapping::LocalMapper;
use crate::loop_closing::{LoopCloser, LoopCloserConfig};
use crate::settings::Settings;
use crate::tracking::frame::DepthImage;
use crate::tracking::{KeyPoint, SensorInput, StageLinks, Tracker, TrackingStage, TrackingState};
use crate::viewer::{FrameDrawer, MapDrawer, RerunSink, Viewer, ViewerSink};
use crate::vocabulary::OrbVocabulary;
use crate::Sensor;

use super::lifecycle::StageControl;
use super::messages::{LoopQueryMsg, NewKeyFrameMsg};
use super::shared_state::SharedState;
use super::trajectory;

/// Capacity of the keyframe channel between Tracking and Local Mapping.
/// Tracking never blocks on it; a full channel drops the keyframe.
const KEYFRAME_CHANNEL_CAPACITY: usize = 16;

/// Capacity of the query channel between Local Mapping and Loop Closing.
const LOOP_QUERY_CHANNEL_CAPACITY: usize = 64;

/// Everything a tracking stage is built from.
pub struct TrackingContext {
    pub settings: Settings,
    pub sensor: Sensor,
    pub shared: Arc<SharedState>,
    pub links: StageLinks,
    pub frame_drawer: Arc<FrameDrawer>,
    pub map_drawer: Arc<MapDrawer>,
    /// A persisted map was loaded at construction.
    pub reuse_map: bool,
}

/// Builds the tracking stage once the rest of the pipeline is wired.
pub type TrackingFactory = Box<dyn FnOnce(TrackingContext) -> Box<dyn TrackingStage> + Send>;

/// Result of a map save request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The map was written to this path.
    Saved(PathBuf),
    /// Tracking has not initialized yet; nothing was written.
    NotInitialized,
    /// No map file path was configured; nothing was written.
    NoMapFile,
}

#[derive(Debug, Default)]
struct ModeFlags {
    activate_localization: bool,
    deactivate_localization: bool,
    /// Localization mode holds a stop request on Local Mapping.
    holds_local_mapping: bool,
}

#[derive(Debug, Default)]
struct ResetFlags {
    reset: bool,
    reset_and_load: bool,
}

/// Tracking status after the last frame. All fields come from the same frame.
#[derive(Debug, Clone, Default)]
pub struct TrackingSnapshot {
    pub state: TrackingState,
    pub map_points: Vec<Option<MapPointId>>,
    pub keypoints: Vec<KeyPoint>,
}

type StageBody = Box<dyn FnOnce() + Send>;

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Construction inputs of a [`System`].
pub struct SystemBuilder {
    vocabulary_path: PathBuf,
    settings_path: PathBuf,
    sensor: Sensor,
    use_viewer: bool,
    map_file: Option<PathBuf>,
    tracking_factory: Option<TrackingFactory>,
    viewer_sink: Option<Box<dyn ViewerSink>>,
}

impl SystemBuilder {
    pub fn new(vocabulary_path: impl Into<PathBuf>, settings_path: impl Into<PathBuf>, sensor: Sensor) -> Self {
        Self {
            vocabulary_path: vocabulary_path.into(),
            settings_path: settings_path.into(),
            sensor,
            use_viewer: false,
            map_file: None,
            tracking_factory: None,
            viewer_sink: None,
        }
    }

    pub fn use_viewer(mut self, enabled: bool) -> Self {
        self.use_viewer = enabled;
        self
    }

    /// Map file loaded at construction (when it ends in `.bin`) and used
    /// by [`System::save_map`].
    pub fn map_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.map_file = Some(path.into());
        self
    }

    /// Replace the default [`Tracker`].
    pub fn tracking_factory(mut self, factory: TrackingFactory) -> Self {
        self.tracking_factory = Some(factory);
        self
    }

    /// Replace the default rerun sink of the viewer.
    pub fn viewer_sink(mut self, sink: Box<dyn ViewerSink>) -> Self {
        self.viewer_sink = Some(sink);
        self
    }

    /// Load settings, vocabulary and map, then start the background stages.
    pub fn build(self) -> Result<System> {
        let sensor = self.sensor;
        info!("Input sensor was set to: {}", sensor);

        let settings = Settings::load(&self.settings_path).map_err(|source| SlamError::Settings {
            path: self.settings_path.clone(),
            source,
        })?;

        info!("Loading ORB Vocabulary. This could take a while...");
        let vocabulary = OrbVocabulary::load(&self.vocabulary_path).map_err(|source| SlamError::Vocabulary {
            path: self.vocabulary_path.clone(),
            source,
        })?;
        let vocabulary = Arc::new(vocabulary);
        info!("Vocabulary loaded!");

        // Map and index, reused when a persisted map can be read
        let loaded = match &self.map_file {
            Some(path) if has_map_suffix(path) => match read_atlas(path, &vocabulary) {
                Ok(loaded) => Some(loaded),
                Err(e) => {
                    warn!("Cannot open map file {}: {}. Starting with an empty map", path.display(), e);
                    None
                }
            },
            _ => None,
        };
        let reuse_map = loaded.is_some();
        let shared = match loaded {
            Some(loaded) => SharedState::with_atlas(loaded.atlas, Arc::clone(&vocabulary), loaded.next_frame_id),
            None => SharedState::new(Arc::clone(&vocabulary)),
        };

        let frame_drawer = Arc::new(FrameDrawer::new());
        let map_drawer = Arc::new(MapDrawer::new(Arc::clone(&shared)));

        // Controls and channels exist before the stages, so every stage is
        // constructed already wired.
        let local_mapping = Arc::new(StageControl::new("Local Mapping"));
        let loop_closing = Arc::new(StageControl::new("Loop Closing"));
        let viewer = self.use_viewer.then(|| Arc::new(StageControl::new("Viewer")));
        let (kf_sender, kf_receiver) = bounded::<NewKeyFrameMsg>(KEYFRAME_CHANNEL_CAPACITY);
        let (query_sender, query_receiver) = bounded::<LoopQueryMsg>(LOOP_QUERY_CHANNEL_CAPACITY);

        let ctx = TrackingContext {
            settings: settings.clone(),
            sensor,
            shared: Arc::clone(&shared),
            links: StageLinks {
                keyframes: kf_sender,
                local_mapping: Arc::clone(&local_mapping),
                loop_closing: Arc::clone(&loop_closing),
                viewer: viewer.clone(),
            },
            frame_drawer: Arc::clone(&frame_drawer),
            map_drawer: Arc::clone(&map_drawer),
            reuse_map,
        };
        let tracker = match self.tracking_factory {
            Some(factory) => factory(ctx),
            None => default_tracker(ctx),
        };

        let local_mapper = LocalMapper::new(
            settings.local_mapping,
            Arc::clone(&shared),
            Arc::clone(&local_mapping),
            kf_receiver,
            query_sender,
        );
        let loop_closer = LoopCloser::new(
            Arc::clone(&shared),
            LoopCloserConfig::from_settings(&settings.loop_closing, sensor.has_depth()),
            Arc::clone(&loop_closing),
            Arc::clone(&local_mapping),
            query_receiver,
        );

        let mut stages: Vec<(&'static str, Arc<StageControl>, StageBody)> = vec![
            ("local-mapping", Arc::clone(&local_mapping), Box::new(move || local_mapper.run()) as StageBody),
            ("loop-closing", Arc::clone(&loop_closing), Box::new(move || loop_closer.run()) as StageBody),
        ];
        if let Some(control) = &viewer {
            // The viewer always starts in full SLAM mode, whatever the map.
            let sink: Box<dyn ViewerSink> = match self.viewer_sink {
                Some(sink) => sink,
                None => Box::new(RerunSink::spawn(&settings.viewer.app_name)?),
            };
            let stage = Viewer::new(
                Arc::clone(control),
                Arc::clone(&frame_drawer),
                Arc::clone(&map_drawer),
                sink,
                settings.viewer.fps,
            );
            stages.push(("viewer", Arc::clone(control), Box::new(move || stage.run()) as StageBody));
        }

        let initial_state = tracker.state();
        let last_change = (shared.generation(), shared.atlas.read().map.big_change_index());
        let system = System {
            sensor,
            shared,
            tracker: Mutex::new(tracker),
            local_mapping,
            loop_closing,
            viewer,
            mode: Mutex::new(ModeFlags::default()),
            resets: Mutex::new(ResetFlags::default()),
            status: Mutex::new(TrackingSnapshot {
                state: initial_state,
                ..TrackingSnapshot::default()
            }),
            map_file: Mutex::new(self.map_file),
            frames_tracked: AtomicU64::new(0),
            last_change: Mutex::new(last_change),
            shut_down: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        };
        // On failure the system is dropped here, which shuts down what
        // did start.
        system.launch(stages)?;
        Ok(system)
    }
}

fn default_tracker(ctx: TrackingContext) -> Box<dyn TrackingStage> {
    Box::new(Tracker::new(
        &ctx.settings,
        ctx.sensor,
        ctx.shared,
        ctx.links,
        ctx.frame_drawer,
        ctx.map_drawer,
        ctx.reuse_map,
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// System
// ─────────────────────────────────────────────────────────────────────────────

/// A running SLAM pipeline.
///
/// All methods take `&self`; the system can be shared between the thread
/// feeding frames and threads issuing mode, reset or save requests.
pub struct System {
    sensor: Sensor,
    shared: Arc<SharedState>,
    tracker: Mutex<Box<dyn TrackingStage>>,

    local_mapping: Arc<StageControl>,
    loop_closing: Arc<StageControl>,
    viewer: Option<Arc<StageControl>>,

    mode: Mutex<ModeFlags>,
    resets: Mutex<ResetFlags>,
    status: Mutex<TrackingSnapshot>,

    map_file: Mutex<Option<PathBuf>>,
    frames_tracked: AtomicU64,
    /// (atlas generation, big-change index) last reported by `map_changed`.
    last_change: Mutex<(u64, u64)>,
    shut_down: AtomicBool,
    threads: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl System {
    /// Build a system with the default tracker and sink.
    pub fn new(
        vocabulary_path: &Path,
        settings_path: &Path,
        sensor: Sensor,
        use_viewer: bool,
        map_file: Option<&Path>,
    ) -> Result<Self> {
        let mut builder = SystemBuilder::new(vocabulary_path, settings_path, sensor).use_viewer(use_viewer);
        if let Some(path) = map_file {
            builder = builder.map_file(path);
        }
        builder.build()
    }

    /// Spawn one named thread per stage. If a spawn fails, that stage and
    /// every later one are marked finished so shutdown does not wait on them.
    fn launch(&self, stages: Vec<(&'static str, Arc<StageControl>, StageBody)>) -> Result<()> {
        let mut threads = self.threads.lock();
        let mut pending = stages.into_iter();
        while let Some((name, control, body)) = pending.next() {
            match thread::Builder::new().name(name.to_string()).spawn(body) {
                Ok(handle) => threads.push((name, handle)),
                Err(source) => {
                    control.set_finished();
                    for (_, control, _) in pending {
                        control.set_finished();
                    }
                    return Err(SlamError::Spawn { stage: name, source });
                }
            }
        }
        Ok(())
    }

    pub fn sensor(&self) -> Sensor {
        self.sensor
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Frame submission
    // ─────────────────────────────────────────────────────────────────────────

    /// Track a rectified stereo pair. Returns the camera pose (T_wc), or None
    /// when tracking failed.
    pub fn track_stereo(&self, left: &GrayImage, right: &GrayImage, timestamp: f64) -> Result<Option<SE3>> {
        self.track(SensorInput::Stereo { left, right }, timestamp)
    }

    /// Track a grayscale image with its registered depth map.
    pub fn track_rgbd(&self, image: &GrayImage, depth: &DepthImage, timestamp: f64) -> Result<Option<SE3>> {
        self.track(SensorInput::Rgbd { image, depth }, timestamp)
    }

    pub fn track_monocular(&self, image: &GrayImage, timestamp: f64) -> Result<Option<SE3>> {
        self.track(SensorInput::Monocular { image }, timestamp)
    }

    fn track(&self, input: SensorInput<'_>, timestamp: f64) -> Result<Option<SE3>> {
        let called = input.sensor();
        if called != self.sensor {
            error!("Called {} tracking but input sensor was set to {}", called, self.sensor);
            return Err(SlamError::SensorMismatch {
                called,
                configured: self.sensor,
            });
        }

        let mut tracker = self.tracker.lock();
        self.apply_mode_changes(&mut **tracker);
        self.apply_resets(&mut **tracker);

        let pose = tracker.track(input, timestamp)?;
        self.frames_tracked.fetch_add(1, Ordering::SeqCst);

        let mut status = self.status.lock();
        *status = TrackingSnapshot {
            state: tracker.state(),
            map_points: tracker.current_map_points(),
            keypoints: tracker.current_keypoints(),
        };
        Ok(pose)
    }

    /// Activation first, so activate-then-deactivate nets to deactivated.
    fn apply_mode_changes(&self, tracker: &mut dyn TrackingStage) {
        let mut mode = self.mode.lock();
        if mode.activate_localization {
            if !mode.holds_local_mapping {
                self.local_mapping.request_stop();
                mode.holds_local_mapping = true;
            }
            self.local_mapping.wait_until_stopped();
            tracker.set_localization_only(true);
            mode.activate_localization = false;
            info!("Localization mode activated");
        }
        if mode.deactivate_localization {
            tracker.set_localization_only(false);
            if mode.holds_local_mapping {
                self.local_mapping.release();
                mode.holds_local_mapping = false;
            }
            mode.deactivate_localization = false;
            info!("Localization mode deactivated");
        }
    }

    fn apply_resets(&self, tracker: &mut dyn TrackingStage) {
        let mut resets = self.resets.lock();
        if resets.reset {
            tracker.reset();
            resets.reset = false;
        }
        if resets.reset_and_load {
            // Stereo and RGB-D trackers pick up the new map on their own
            if self.sensor == Sensor::Monocular {
                tracker.reset_after_load();
            }
            resets.reset_and_load = false;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mode and reset requests
    // ─────────────────────────────────────────────────────────────────────────

    /// Stop mapping before the next frame; only the camera is tracked.
    pub fn activate_localization_mode(&self) {
        self.mode.lock().activate_localization = true;
    }

    pub fn deactivate_localization_mode(&self) {
        self.mode.lock().deactivate_localization = true;
    }

    /// Clear the map before the next frame.
    pub fn reset(&self) {
        self.resets.lock().reset = true;
        self.frames_tracked.store(0, Ordering::SeqCst);
    }

    /// Replace the current map with the one stored at `path`.
    ///
    /// The map is swapped immediately while Local Mapping and the Viewer are
    /// paused; tracking relocalizes against it from the next frame. When the
    /// file cannot be read the current map is left untouched and the error
    /// is returned.
    pub fn reset_and_load(&self, path: &Path) -> Result<()> {
        if !has_map_suffix(path) {
            return Err(SlamError::InvalidMapPath(path.to_path_buf()));
        }
        self.load_in_flight(path)?;
        *self.map_file.lock() = Some(path.to_path_buf());
        self.resets.lock().reset_and_load = true;
        Ok(())
    }

    fn load_in_flight(&self, path: &Path) -> Result<()> {
        pause(&self.local_mapping);
        if let Some(viewer) = &self.viewer {
            pause(viewer);
        }

        let result = read_atlas(path, &self.shared.vocabulary);
        let outcome = match result {
            Ok(loaded) => {
                self.shared.replace_atlas(loaded);
                // Queued keyframes and loop queries refer to the old map
                self.local_mapping.request_reset();
                self.loop_closing.request_reset();
                Ok(())
            }
            Err(e) => {
                error!("Cannot open map file {}: {}", path.display(), e);
                Err(e)
            }
        };

        if let Some(viewer) = &self.viewer {
            viewer.release();
        }
        self.local_mapping.release();
        outcome
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map save
    // ─────────────────────────────────────────────────────────────────────────

    /// Save the map to the configured map file.
    pub fn save_map(&self) -> Result<SaveOutcome> {
        if !self.is_initialized() {
            return Ok(SaveOutcome::NotInitialized);
        }
        let Some(path) = self.map_file() else {
            warn!("No map file set. Map not saved.");
            return Ok(SaveOutcome::NoMapFile);
        };
        self.save_to(&path)
    }

    /// Save the map to `path`, which becomes the configured map file.
    pub fn save_manual(&self, path: &Path) -> Result<SaveOutcome> {
        if !has_map_suffix(path) {
            return Err(SlamError::InvalidMapPath(path.to_path_buf()));
        }
        if !self.is_initialized() {
            return Ok(SaveOutcome::NotInitialized);
        }
        *self.map_file.lock() = Some(path.to_path_buf());
        self.save_to(path)
    }

    fn is_initialized(&self) -> bool {
        let state = self.tracking_state();
        if !state.is_initialized() {
            warn!("Tracking state is {:?}, not initialised. Map not saved.", state);
            return false;
        }
        true
    }

    fn save_to(&self, path: &Path) -> Result<SaveOutcome> {
        info!("Pause the local mapper to save a map");
        pause(&self.local_mapping);
        let result = write_atlas(path, &self.shared.atlas.read());
        self.local_mapping.release();
        result?;
        Ok(SaveOutcome::Saved(path.to_path_buf()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Trajectory export
    // ─────────────────────────────────────────────────────────────────────────

    /// Save every tracked frame pose in TUM format.
    pub fn save_trajectory_tum(&self, path: &Path) -> Result<()> {
        self.require_depth("save_trajectory_tum")?;
        info!("Saving camera trajectory to {} ...", path.display());
        let poses = self.frame_poses()?;
        trajectory::write_tum(path, &poses, 9)?;
        info!("trajectory saved!");
        Ok(())
    }

    /// Save every tracked frame pose in KITTI format.
    pub fn save_trajectory_kitti(&self, path: &Path) -> Result<()> {
        self.require_depth("save_trajectory_kitti")?;
        info!("Saving camera trajectory to {} ...", path.display());
        let poses = self.frame_poses()?;
        trajectory::write_kitti(path, &poses)?;
        info!("trajectory saved!");
        Ok(())
    }

    /// Save the pose of every good keyframe in TUM format. Works for every
    /// sensor.
    pub fn save_keyframe_trajectory_tum(&self, path: &Path) -> Result<()> {
        info!("Saving keyframe trajectory to {} ...", path.display());
        let poses = trajectory::keyframe_poses(&self.shared.atlas.read().map)?;
        trajectory::write_tum(path, &poses, 7)?;
        info!("trajectory saved!");
        Ok(())
    }

    fn require_depth(&self, operation: &'static str) -> Result<()> {
        if self.sensor.has_depth() {
            Ok(())
        } else {
            error!("{} cannot be used for monocular.", operation);
            Err(SlamError::UnsupportedForSensor { operation })
        }
    }

    fn frame_poses(&self) -> Result<Vec<trajectory::StampedPose>> {
        let tracker = self.tracker.lock();
        let atlas = self.shared.atlas.read();
        trajectory::frame_poses(tracker.history(), &atlas.map)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn tracking_state(&self) -> TrackingState {
        self.status.lock().state
    }

    /// State, map points and keypoints of the last frame, read together.
    pub fn tracking_snapshot(&self) -> TrackingSnapshot {
        self.status.lock().clone()
    }

    pub fn tracked_map_points(&self) -> Vec<Option<MapPointId>> {
        self.status.lock().map_points.clone()
    }

    pub fn tracked_keypoints_un(&self) -> Vec<KeyPoint> {
        self.status.lock().keypoints.clone()
    }

    /// True once after each structural change of the map (loop closure,
    /// load, reset).
    pub fn map_changed(&self) -> bool {
        let current = (self.shared.generation(), self.shared.atlas.read().map.big_change_index());
        let mut last = self.last_change.lock();
        if *last != current {
            *last = current;
            true
        } else {
            false
        }
    }

    /// Ids of every keyframe in the map, culled ones included.
    pub fn keyframes(&self) -> Vec<KeyFrameId> {
        self.shared.atlas.read().map.keyframe_ids()
    }

    pub fn map_file(&self) -> Option<PathBuf> {
        self.map_file.lock().clone()
    }

    /// Frames submitted since construction or the last reset request.
    pub fn frames_tracked(&self) -> u64 {
        self.frames_tracked.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────────

    /// Finish every stage and join its thread. Safe to call more than once.
    ///
    /// Returns once Local Mapping and Loop Closing have finished and no
    /// global optimization pass is in flight.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down");

        self.local_mapping.request_finish();
        self.loop_closing.request_finish();
        if let Some(viewer) = &self.viewer {
            viewer.request_finish();
            viewer.wait_until_finished();
        }

        self.local_mapping.wait_until_finished();
        self.loop_closing.wait_until_idle();

        for (name, handle) in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                warn!("{} thread panicked", name);
            } else {
                debug!("{} thread joined", name);
            }
        }
        info!("Shutdown complete");
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("sensor", &self.sensor)
            .field("state", &self.tracking_state())
            .field("frames_tracked", &self.frames_tracked())
            .finish_non_exhaustive()
    }
}

/// Take a stop hold on a stage and wait until it is stopped. The caller
/// releases its hold when done.
fn pause(control: &StageControl) {
    control.request_stop();
    control.wait_until_stopped();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, Fixture, RecordingSink, ScriptedTracker};
    use std::time::{Duration, Instant};

    type Events = Arc<Mutex<Vec<String>>>;

    fn scripted(events: &Events, lost: &[u64]) -> TrackingFactory {
        let events = Arc::clone(events);
        let lost = lost.to_vec();
        Box::new(move |ctx| Box::new(ScriptedTracker::new(ctx, events, &lost)))
    }

    fn build(fixture: &Fixture, sensor: Sensor, events: &Events, lost: &[u64]) -> System {
        SystemBuilder::new(fixture.vocabulary_path(), fixture.settings_path(), sensor)
            .tracking_factory(scripted(events, lost))
            .build()
            .unwrap()
    }

    fn rgbd_frame() -> (GrayImage, DepthImage) {
        (test_support::textured_image(160, 120, 1), test_support::depth_image(160, 120, 5000))
    }

    #[test]
    fn test_localization_activation_pauses_local_mapping() {
        let fixture = Fixture::new();
        let events = Events::default();
        let system = build(&fixture, Sensor::Rgbd, &events, &[]);
        let (image, depth) = rgbd_frame();

        system.activate_localization_mode();
        system.track_rgbd(&image, &depth, 0.0).unwrap();
        assert!(system.local_mapping.is_stopped());
        assert_eq!(events.lock()[0], "localization true (local mapping stopped: true)");

        system.deactivate_localization_mode();
        system.track_rgbd(&image, &depth, 1.0).unwrap();
        assert!(!system.local_mapping.is_stop_requested());
        assert!(events.lock().contains(&"localization false (local mapping stopped: true)".to_string()));
    }

    #[test]
    fn test_activate_then_deactivate_nets_to_deactivated() {
        let fixture = Fixture::new();
        let events = Events::default();
        let system = build(&fixture, Sensor::Stereo, &events, &[]);
        let image = test_support::textured_image(160, 120, 2);

        system.activate_localization_mode();
        system.deactivate_localization_mode();
        system.track_stereo(&image, &image, 0.0).unwrap();

        let events = events.lock();
        assert_eq!(events[0], "localization true (local mapping stopped: true)");
        assert!(events[1].starts_with("localization false"));
        assert_eq!(events[2], "track stereo");
        assert!(!system.local_mapping.is_stopped());
    }

    #[test]
    fn test_localization_keeps_mapping_stopped_after_a_save_releases() {
        let fixture = Fixture::new();
        let events = Events::default();
        let system = build(&fixture, Sensor::Rgbd, &events, &[]);
        let (image, depth) = rgbd_frame();

        // A save is holding Local Mapping when localization mode is applied
        pause(&system.local_mapping);
        system.activate_localization_mode();
        system.track_rgbd(&image, &depth, 0.0).unwrap();
        system.local_mapping.release();
        system.track_rgbd(&image, &depth, 1.0).unwrap();

        assert!(system.local_mapping.is_stop_requested());
        assert!(system.local_mapping.is_stopped());

        // Activating twice still takes a single hold
        system.activate_localization_mode();
        system.track_rgbd(&image, &depth, 2.0).unwrap();
        system.deactivate_localization_mode();
        system.track_rgbd(&image, &depth, 3.0).unwrap();
        assert!(!system.local_mapping.is_stop_requested());

        // Deactivating without an active mode leaves other holds alone
        pause(&system.local_mapping);
        system.deactivate_localization_mode();
        system.track_rgbd(&image, &depth, 4.0).unwrap();
        assert!(system.local_mapping.is_stop_requested());
        system.local_mapping.release();
    }

    #[test]
    fn test_reset_is_consumed_once() {
        let fixture = Fixture::new();
        let events = Events::default();
        let system = build(&fixture, Sensor::Rgbd, &events, &[]);
        let (image, depth) = rgbd_frame();

        system.track_rgbd(&image, &depth, 0.0).unwrap();
        system.reset();
        assert_eq!(system.frames_tracked(), 0);

        system.track_rgbd(&image, &depth, 1.0).unwrap();
        system.track_rgbd(&image, &depth, 2.0).unwrap();
        let resets = events.lock().iter().filter(|e| *e == "reset").count();
        assert_eq!(resets, 1);
        assert_eq!(system.frames_tracked(), 2);
        assert!(system.map_changed());
        assert!(!system.map_changed());
    }

    #[test]
    fn test_snapshot_follows_tracking() {
        let fixture = Fixture::new();
        let events = Events::default();
        let system = build(&fixture, Sensor::Rgbd, &events, &[1]);
        let (image, depth) = rgbd_frame();
        assert_eq!(system.tracking_state(), TrackingState::NoImagesYet);

        system.track_rgbd(&image, &depth, 0.0).unwrap();
        assert_eq!(system.tracking_state(), TrackingState::Ok);
        assert!(system.track_rgbd(&image, &depth, 1.0).unwrap().is_none());
        assert_eq!(system.tracking_state(), TrackingState::Lost);
        assert_eq!(system.tracked_map_points().len(), system.tracked_keypoints_un().len());
    }

    #[test]
    fn test_snapshot_is_consistent_across_threads() {
        let fixture = Fixture::new();
        let events = Events::default();
        let lost: Vec<u64> = (0..200).filter(|i| i % 3 == 2).collect();
        let system = build(&fixture, Sensor::Rgbd, &events, &lost);
        let (image, depth) = rgbd_frame();
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            let reader = s.spawn(|| {
                let mut reads = 0;
                loop {
                    let finished = done.load(Ordering::SeqCst);
                    let snapshot = system.tracking_snapshot();
                    assert_eq!(snapshot.map_points.len(), snapshot.keypoints.len());
                    match snapshot.state {
                        TrackingState::Ok => assert!(!snapshot.keypoints.is_empty()),
                        _ => assert!(snapshot.keypoints.is_empty()),
                    }
                    reads += 1;
                    if finished {
                        return reads;
                    }
                }
            });

            for i in 0..200 {
                system.track_rgbd(&image, &depth, i as f64 * 0.01).unwrap();
            }
            done.store(true, Ordering::SeqCst);
            assert!(reader.join().unwrap() > 0);
        });

        let last = system.tracking_snapshot();
        assert_eq!(last.state, TrackingState::Ok);
        assert_eq!(last.keypoints.len(), 200);
    }

    #[test]
    fn test_monocular_save_before_initialization_writes_nothing() {
        let fixture = Fixture::new();
        let system = SystemBuilder::new(fixture.vocabulary_path(), fixture.settings_path(), Sensor::Monocular)
            .build()
            .unwrap();
        let image = test_support::textured_image(160, 120, 7);

        system.track_monocular(&image, 0.0).unwrap();
        assert_eq!(system.tracking_state(), TrackingState::NotInitialized);

        let map_path = fixture.dir.path().join("map.bin");
        assert_eq!(system.save_manual(&map_path).unwrap(), SaveOutcome::NotInitialized);
        assert!(!map_path.exists());
        assert_eq!(system.map_file(), None);
        assert!(!system.local_mapping.is_stop_requested());

        // The suffix is checked before the tracking state
        let bad = fixture.dir.path().join("map.txt");
        assert!(matches!(system.save_manual(&bad), Err(SlamError::InvalidMapPath(_))));
        assert_eq!(system.map_file(), None);
    }

    #[test]
    fn test_save_before_initialization_is_noop() {
        let fixture = Fixture::new();
        let events = Events::default();
        let map_path = fixture.dir.path().join("map.bin");
        let system = SystemBuilder::new(fixture.vocabulary_path(), fixture.settings_path(), Sensor::Rgbd)
            .map_file(&map_path)
            .tracking_factory(scripted(&events, &[]))
            .build()
            .unwrap();

        assert_eq!(system.save_map().unwrap(), SaveOutcome::NotInitialized);
        assert!(!map_path.exists());
        assert!(!system.local_mapping.is_stop_requested());
    }

    #[test]
    fn test_save_requires_map_file_and_suffix() {
        let fixture = Fixture::new();
        let events = Events::default();
        let system = build(&fixture, Sensor::Rgbd, &events, &[]);
        let (image, depth) = rgbd_frame();
        system.track_rgbd(&image, &depth, 0.0).unwrap();

        assert_eq!(system.save_map().unwrap(), SaveOutcome::NoMapFile);
        let bad = fixture.dir.path().join("map.txt");
        assert!(matches!(system.save_manual(&bad), Err(SlamError::InvalidMapPath(_))));
        assert!(matches!(system.reset_and_load(&bad), Err(SlamError::InvalidMapPath(_))));
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let fixture = Fixture::new();
        let events = Events::default();
        let map_path = fixture.dir.path().join("map.bin");
        let system = build(&fixture, Sensor::Monocular, &events, &[]);
        let image = test_support::textured_image(160, 120, 3);

        system.track_monocular(&image, 0.0).unwrap();
        {
            let mut atlas = system.shared.atlas.write();
            let id = atlas.map.create_keyframe(7, 0.7, SE3::identity(), Vec::new(), Vec::new(), Vec::new());
            atlas.index_keyframe(id);
        }
        let saved_ids = system.keyframes();
        assert_eq!(system.save_manual(&map_path).unwrap(), SaveOutcome::Saved(map_path.clone()));
        assert_eq!(system.map_file(), Some(map_path.clone()));
        assert!(!system.local_mapping.is_stop_requested());

        // A fresh system picks the map up at construction
        let reloaded = SystemBuilder::new(fixture.vocabulary_path(), fixture.settings_path(), Sensor::Monocular)
            .map_file(&map_path)
            .tracking_factory(scripted(&Events::default(), &[]))
            .build()
            .unwrap();
        assert_eq!(reloaded.keyframes(), saved_ids);
        assert_eq!(reloaded.shared.frame_ids.peek(), 8);
        assert_eq!(reloaded.tracking_state(), TrackingState::Lost);

        // And the running one can go back to it
        system.shared.atlas.write().clear();
        assert!(system.keyframes().is_empty());
        system.reset_and_load(&map_path).unwrap();
        assert_eq!(system.keyframes(), saved_ids);
        assert!(system.map_changed());
        assert!(!system.local_mapping.is_stop_requested());

        system.track_monocular(&image, 1.0).unwrap();
        let events = events.lock();
        assert_eq!(events.iter().filter(|e| *e == "reset_after_load").count(), 1);
    }

    #[test]
    fn test_failed_load_keeps_current_map() {
        let fixture = Fixture::new();
        let events = Events::default();
        let system = build(&fixture, Sensor::Rgbd, &events, &[]);
        let (image, depth) = rgbd_frame();
        system.track_rgbd(&image, &depth, 0.0).unwrap();
        let before = system.keyframes();

        let missing = fixture.dir.path().join("missing.bin");
        assert!(matches!(system.reset_and_load(&missing), Err(SlamError::MapRead { .. })));
        assert_eq!(system.keyframes(), before);
        assert_eq!(system.map_file(), None);
        assert!(!system.local_mapping.is_stop_requested());
    }

    #[test]
    fn test_trajectory_export_skips_lost_frames() {
        let fixture = Fixture::new();
        let events = Events::default();
        let system = build(&fixture, Sensor::Stereo, &events, &[1]);
        let image = test_support::textured_image(160, 120, 4);
        for t in 0..3 {
            system.track_stereo(&image, &image, t as f64).unwrap();
        }

        let path = fixture.dir.path().join("CameraTrajectory.txt");
        system.save_trajectory_tum(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0.000000 0.000000000"));
        assert!(lines[1].starts_with("2.000000 2.000000000"));

        let kitti = fixture.dir.path().join("kitti.txt");
        system.save_trajectory_kitti(&kitti).unwrap();
        assert_eq!(std::fs::read_to_string(&kitti).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_monocular_frame_trajectory_unsupported() {
        let fixture = Fixture::new();
        let events = Events::default();
        let system = build(&fixture, Sensor::Monocular, &events, &[]);
        let image = test_support::textured_image(160, 120, 5);
        system.track_monocular(&image, 0.5).unwrap();

        let path = fixture.dir.path().join("traj.txt");
        let err = system.save_trajectory_tum(&path).unwrap_err();
        assert!(matches!(err, SlamError::UnsupportedForSensor { .. }));
        assert!(!err.is_fatal());
        assert!(matches!(
            system.save_trajectory_kitti(&path),
            Err(SlamError::UnsupportedForSensor { .. })
        ));

        let kf_path = fixture.dir.path().join("KeyFrameTrajectory.txt");
        system.save_keyframe_trajectory_tum(&kf_path).unwrap();
        let text = std::fs::read_to_string(&kf_path).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("0.500000 0.0000000"));
    }

    #[test]
    fn test_sensor_mismatch_is_fatal() {
        let fixture = Fixture::new();
        let events = Events::default();
        let system = build(&fixture, Sensor::Monocular, &events, &[]);
        let image = test_support::textured_image(160, 120, 6);

        let err = system.track_stereo(&image, &image, 0.0).unwrap_err();
        assert!(matches!(
            err,
            SlamError::SensorMismatch {
                called: Sensor::Stereo,
                configured: Sensor::Monocular
            }
        ));
        assert!(err.is_fatal());
        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_bad_construction_inputs() {
        let fixture = Fixture::new();
        let missing = fixture.dir.path().join("missing.yaml");
        let err = SystemBuilder::new(fixture.vocabulary_path(), &missing, Sensor::Rgbd)
            .build()
            .unwrap_err();
        assert!(matches!(err, SlamError::Settings { .. }));

        let err = SystemBuilder::new(fixture.dir.path().join("voc.dat"), fixture.settings_path(), Sensor::Rgbd)
            .build()
            .unwrap_err();
        assert!(matches!(err, SlamError::Vocabulary { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_shutdown_waits_for_global_pass() {
        let fixture = Fixture::new();
        let events = Events::default();
        let system = build(&fixture, Sensor::Rgbd, &events, &[]);

        system.loop_closing.set_busy(true);
        let loop_closing = Arc::clone(&system.loop_closing);
        let pass = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            loop_closing.set_busy(false);
        });

        let start = Instant::now();
        system.shutdown();
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert!(system.local_mapping.is_finished());
        assert!(system.loop_closing.is_finished());
        assert!(system.threads.lock().is_empty());
        pass.join().unwrap();

        // Idempotent, and Drop runs it once more
        system.shutdown();
    }

    #[test]
    fn test_viewer_runs_until_shutdown() {
        let fixture = Fixture::new();
        let events = Events::default();
        let sink = RecordingSink::default();
        let frames = sink.frames();
        let system = SystemBuilder::new(fixture.vocabulary_path(), fixture.settings_path(), Sensor::Rgbd)
            .use_viewer(true)
            .viewer_sink(Box::new(sink))
            .tracking_factory(scripted(&events, &[]))
            .build()
            .unwrap();
        let (image, depth) = rgbd_frame();
        system.track_rgbd(&image, &depth, 0.0).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while frames.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        system.shutdown();
        assert!(system.viewer.as_ref().is_some_and(|v| v.is_finished()));
        assert!(!frames.lock().is_empty());
    }
}
