//! Fixtures shared by the unit tests: a tiny vocabulary, settings, synthetic
//! images and a scripted tracking stage.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{GrayImage, Luma};
use nalgebra::Vector3;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use crate::atlas::map::MapPointId;
use crate::error::Result;
use crate::geometry::SE3;
use crate::settings::Settings;
use crate::system::shared_state::SharedState;
use crate::system::TrackingContext;
use crate::tracking::frame::DepthImage;
use crate::tracking::{KeyPoint, SensorInput, StageLinks, TrackingStage, TrackingState, TrajectoryHistory};
use crate::viewer::{FrameSnapshot, MapSnapshot, ViewerSink};
use crate::vocabulary::{Descriptor, OrbVocabulary};

/// Level-1 node bytes of the test vocabulary.
const GROUPS: [u8; 4] = [0x00, 0x0F, 0xF0, 0xFF];

/// Write a two-level, 16-word vocabulary in the text encoding.
pub fn write_vocabulary(dir: &Path) -> PathBuf {
    let mut text = String::from("4 2 0 0\n");
    for group in GROUPS {
        let _ = writeln!(text, "0 0 {} 0", vec![group.to_string(); 32].join(" "));
    }
    for (node, group) in GROUPS.iter().enumerate() {
        for flip in [0x00u8, 0x01, 0x02, 0x04] {
            let byte = group ^ flip;
            let _ = writeln!(text, "{} 1 {} 1.0", node + 1, vec![byte.to_string(); 32].join(" "));
        }
    }
    let path = dir.join("voc.txt");
    fs::write(&path, text).unwrap();
    path
}

/// Settings scaled to the 160x120 synthetic images.
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.camera.fx = 200.0;
    settings.camera.fy = 200.0;
    settings.camera.cx = 80.0;
    settings.camera.cy = 60.0;
    settings.camera.bf = 40.0;
    settings.camera.fps = 2.0;
    settings.depth_threshold = 40.0;
    settings.depth_map_factor = 5000.0;
    settings.orb_extractor.n_features = 300;
    settings.tracking.min_init_points = 20;
    settings.tracking.min_init_matches = 20;
    settings.tracking.min_matches = 10;
    settings.tracking.max_lost_frames = 2;
    settings.tracking.min_relocalization_matches = 10;
    settings
}

pub fn write_settings(dir: &Path) -> PathBuf {
    let path = dir.join("settings.yaml");
    fs::write(&path, serde_yaml::to_string(&test_settings()).unwrap()).unwrap();
    path
}

/// Random 8x8 blocks: plenty of FAST corners, distinct BRIEF descriptors.
pub fn textured_image(width: u32, height: u32, seed: u64) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let blocks_x = width.div_ceil(8);
    let blocks_y = height.div_ceil(8);
    let levels: Vec<u8> = (0..blocks_x * blocks_y).map(|_| rng.gen()).collect();
    GrayImage::from_fn(width, height, |x, y| {
        Luma([levels[((y / 8) * blocks_x + x / 8) as usize]])
    })
}

pub fn depth_image(width: u32, height: u32, raw: u16) -> DepthImage {
    DepthImage::from_pixel(width, height, Luma([raw]))
}

pub fn random_descriptors(n: usize, seed: u64) -> Vec<Descriptor> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen()).collect()
}

/// Temporary directory holding a vocabulary and settings, plus shared state
/// over an empty atlas.
pub struct Fixture {
    pub dir: TempDir,
    pub settings: Settings,
    pub vocabulary: Arc<OrbVocabulary>,
    pub shared: Arc<SharedState>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let vocabulary = Arc::new(OrbVocabulary::load(write_vocabulary(dir.path())).unwrap());
        let shared = SharedState::new(Arc::clone(&vocabulary));
        Self {
            dir,
            settings: test_settings(),
            vocabulary,
            shared,
        }
    }

    pub fn vocabulary_path(&self) -> PathBuf {
        self.dir.path().join("voc.txt")
    }

    pub fn settings_path(&self) -> PathBuf {
        write_settings(self.dir.path())
    }
}

/// Sink remembering the status line of every drawn view.
#[derive(Default)]
pub struct RecordingSink {
    frames: Arc<Mutex<Vec<String>>>,
}

impl RecordingSink {
    pub fn frames(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.frames)
    }
}

impl ViewerSink for RecordingSink {
    fn draw(&mut self, _frame: &FrameSnapshot, _map: &MapSnapshot, status: &str) -> Result<()> {
        self.frames.lock().push(status.to_string());
        Ok(())
    }
}

/// Tracking stage with scripted outcomes.
///
/// Every submission succeeds at pose `x = timestamp`, except the
/// submissions listed as lost. The first successful one creates a keyframe
/// at the origin. Submission `n` reports `n + 1` tracked points, a lost one
/// reports none. Calls are logged to `events`.
pub struct ScriptedTracker {
    shared: Arc<SharedState>,
    links: StageLinks,
    events: Arc<Mutex<Vec<String>>>,
    lost: HashSet<u64>,
    submitted: u64,
    tracked: usize,
    state: TrackingState,
    history: TrajectoryHistory,
}

impl ScriptedTracker {
    pub fn new(ctx: TrackingContext, events: Arc<Mutex<Vec<String>>>, lost: &[u64]) -> Self {
        Self {
            shared: ctx.shared,
            links: ctx.links,
            events,
            lost: lost.iter().copied().collect(),
            submitted: 0,
            tracked: 0,
            state: if ctx.reuse_map {
                TrackingState::Lost
            } else {
                TrackingState::NoImagesYet
            },
            history: TrajectoryHistory::new(),
        }
    }

    fn log(&self, event: String) {
        self.events.lock().push(event);
    }
}

impl TrackingStage for ScriptedTracker {
    fn track(&mut self, input: SensorInput<'_>, timestamp: f64) -> Result<Option<SE3>> {
        let frame_id = self.shared.frame_ids.next_id();
        let index = self.submitted;
        self.submitted += 1;
        self.log(format!("track {}", input.sensor()));

        if self.lost.contains(&index) {
            if self.state.is_initialized() {
                self.state = TrackingState::Lost;
            } else {
                self.state = TrackingState::NotInitialized;
            }
            self.history.push_lost(timestamp);
            self.tracked = 0;
            return Ok(None);
        }

        let mut atlas = self.shared.atlas.write();
        let reference = match atlas.map.last_keyframe_id() {
            Some(id) => id,
            None => {
                let id = atlas.map.create_keyframe(frame_id, timestamp, SE3::identity(), Vec::new(), Vec::new(), Vec::new());
                atlas.index_keyframe(id);
                id
            }
        };
        let reference_pose = atlas.map.resolve_pose(reference).unwrap_or_else(SE3::identity);
        drop(atlas);

        let pose = SE3::from_translation(Vector3::new(timestamp, 0.0, 0.0));
        self.history
            .push_tracked(reference_pose.between(&pose), reference, timestamp);
        self.state = TrackingState::Ok;
        self.tracked = index as usize + 1;
        Ok(Some(pose))
    }

    fn set_localization_only(&mut self, enabled: bool) {
        let stopped = self.links.local_mapping.is_stopped();
        self.log(format!("localization {} (local mapping stopped: {})", enabled, stopped));
    }

    fn reset(&mut self) {
        self.log("reset".to_string());
        self.links.local_mapping.request_reset();
        self.links.loop_closing.request_reset();
        self.shared.atlas.write().clear();
        self.shared.frame_ids.reset_to(0);
        self.state = TrackingState::NoImagesYet;
        self.tracked = 0;
        self.history.clear();
    }

    fn reset_after_load(&mut self) {
        self.log("reset_after_load".to_string());
        self.history.clear();
        self.tracked = 0;
        self.state = TrackingState::Lost;
    }

    fn state(&self) -> TrackingState {
        self.state
    }

    fn current_map_points(&self) -> Vec<Option<MapPointId>> {
        (0..self.tracked).map(|i| Some(MapPointId::new(i as u64))).collect()
    }

    fn current_keypoints(&self) -> Vec<KeyPoint> {
        (0..self.tracked)
            .map(|i| KeyPoint {
                x: i as f32,
                y: 0.0,
                response: 1.0,
            })
            .collect()
    }

    fn history(&self) -> &TrajectoryHistory {
        &self.history
    }
}
