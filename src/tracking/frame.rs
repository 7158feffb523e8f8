//! Frame-level processing: camera model, feature extraction, depth per
//! keypoint, and frame id allocation.
//!
//! Features are FAST-9 corners on a blurred image described with a fixed
//! 256-bit BRIEF test pattern. Stereo depth comes from row-wise descriptor
//! matching between the rectified images, RGB-D depth from the registered
//! depth image.

use std::sync::atomic::{AtomicU64, Ordering};

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::corners::corners_fast9;
use imageproc::filter::gaussian_blur_f32;
use nalgebra::Vector3;
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::settings::Settings;
use crate::tracking::matching::TH_HIGH;
use crate::vocabulary::{hamming_distance, Descriptor};
use crate::Sensor;

/// 16-bit depth image as produced by RGB-D sensors.
pub type DepthImage = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Side of the square patch the BRIEF tests are sampled in.
const PATCH_SIZE: i32 = 31;
const HALF_PATCH: i32 = PATCH_SIZE / 2;

/// Border excluded from detection so every test stays inside the image.
const EDGE_THRESHOLD: u32 = (HALF_PATCH + 1) as u32;

/// Pixel tolerance on the row of a stereo match.
const STEREO_ROW_MARGIN: f32 = 2.0;

/// Random BRIEF test pairs, drawn once from an isotropic Gaussian.
static BRIEF_PATTERN: Lazy<Vec<[(i32, i32); 2]>> = Lazy::new(|| {
    let mut rng = StdRng::seed_from_u64(0x0b5e_55ed);
    let normal = Normal::new(0.0_f64, PATCH_SIZE as f64 / 5.0).unwrap_or_else(|_| unreachable!());
    let mut sample = || {
        let v = normal.sample(&mut rng).round() as i32;
        v.clamp(-HALF_PATCH, HALF_PATCH)
    };
    (0..256)
        .map(|_| [(sample(), sample()), (sample(), sample())])
        .collect()
});

/// A detected feature in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    /// Detector response; higher is stronger.
    pub response: f32,
}

/// Pinhole camera with stereo baseline.
#[derive(Debug, Clone, Copy)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Baseline times fx.
    pub bf: f64,
}

impl CameraModel {
    pub fn from_settings(settings: &Settings) -> Self {
        let cam = &settings.camera;
        Self {
            fx: cam.fx,
            fy: cam.fy,
            cx: cam.cx,
            cy: cam.cy,
            bf: cam.bf,
        }
    }

    /// Back-project a pixel at depth `z` into the camera frame.
    pub fn unproject(&self, u: f64, v: f64, z: f64) -> Vector3<f64> {
        Vector3::new((u - self.cx) * z / self.fx, (v - self.cy) * z / self.fy, z)
    }

    /// Project a camera-frame point to pixels. None behind the camera.
    pub fn project(&self, p: &Vector3<f64>) -> Option<(f64, f64)> {
        if p.z <= 0.0 {
            return None;
        }
        Some((self.fx * p.x / p.z + self.cx, self.fy * p.y / p.z + self.cy))
    }
}

/// One frame's sensor data, as handed to the tracking stage.
#[derive(Debug, Clone, Copy)]
pub enum SensorInput<'a> {
    Stereo { left: &'a GrayImage, right: &'a GrayImage },
    Rgbd { image: &'a GrayImage, depth: &'a DepthImage },
    Monocular { image: &'a GrayImage },
}

impl SensorInput<'_> {
    pub fn sensor(&self) -> Sensor {
        match self {
            SensorInput::Stereo { .. } => Sensor::Stereo,
            SensorInput::Rgbd { .. } => Sensor::Rgbd,
            SensorInput::Monocular { .. } => Sensor::Monocular,
        }
    }
}

/// FAST + BRIEF feature extractor.
#[derive(Debug, Clone, Copy)]
pub struct FeatureExtractor {
    n_features: usize,
    fast_threshold: u8,
}

impl FeatureExtractor {
    pub fn new(n_features: usize, fast_threshold: u8) -> Self {
        Self {
            n_features,
            fast_threshold,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.orb_extractor.n_features,
            settings.orb_extractor.fast_threshold,
        )
    }

    /// Detect the strongest corners and describe them.
    pub fn extract(&self, image: &GrayImage) -> (Vec<KeyPoint>, Vec<Descriptor>) {
        let (w, h) = image.dimensions();
        if w <= 2 * EDGE_THRESHOLD || h <= 2 * EDGE_THRESHOLD {
            return (Vec::new(), Vec::new());
        }

        let smoothed = gaussian_blur_f32(image, 2.0);
        let mut corners: Vec<_> = corners_fast9(image, self.fast_threshold)
            .into_iter()
            .filter(|c| {
                c.x >= EDGE_THRESHOLD
                    && c.y >= EDGE_THRESHOLD
                    && c.x < w - EDGE_THRESHOLD
                    && c.y < h - EDGE_THRESHOLD
            })
            .collect();
        corners.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then((a.y, a.x).cmp(&(b.y, b.x)))
        });
        corners.truncate(self.n_features);

        corners
            .iter()
            .map(|c| {
                let kp = KeyPoint {
                    x: c.x as f32,
                    y: c.y as f32,
                    response: c.score,
                };
                (kp, describe(&smoothed, c.x as i32, c.y as i32))
            })
            .unzip()
    }
}

/// BRIEF-256 descriptor of the patch centred at (x, y).
fn describe(image: &GrayImage, x: i32, y: i32) -> Descriptor {
    let mut desc = [0u8; 32];
    let pixel = |dx: i32, dy: i32| image.get_pixel((x + dx) as u32, (y + dy) as u32)[0];
    for (i, [(ax, ay), (bx, by)]) in BRIEF_PATTERN.iter().enumerate() {
        if pixel(*ax, *ay) < pixel(*bx, *by) {
            desc[i / 8] |= 1 << (i % 8);
        }
    }
    desc
}

/// Hands out frame ids. Shared by the tracker and the orchestrator, which
/// rewinds it on reset and moves it past loaded keyframes.
#[derive(Debug, Default)]
pub struct FrameIdAllocator {
    next: AtomicU64,
}

impl FrameIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The id the next frame will receive.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    pub fn reset_to(&self, next: u64) {
        self.next.store(next, Ordering::SeqCst);
    }
}

/// Depth conversion parameters taken from the settings.
#[derive(Debug, Clone, Copy)]
pub struct DepthParams {
    /// Maximum depth (meters) for a point to be used.
    pub max_depth: f64,
    /// Raw RGB-D value to meters.
    pub depth_scale: f64,
}

impl DepthParams {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_depth: settings.close_depth_threshold(),
            depth_scale: settings.depth_scale(),
        }
    }
}

/// A processed input frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u64,
    /// Timestamp in seconds.
    pub timestamp: f64,
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    /// Camera-frame point per keypoint, where depth is known.
    pub points_cam: Vec<Option<Vector3<f64>>>,
}

impl Frame {
    pub fn new(
        id: u64,
        timestamp: f64,
        input: SensorInput<'_>,
        extractor: &FeatureExtractor,
        camera: &CameraModel,
        depth: &DepthParams,
    ) -> Self {
        let (keypoints, descriptors, points_cam) = match input {
            SensorInput::Monocular { image } => {
                let (kps, descs) = extractor.extract(image);
                let n = kps.len();
                (kps, descs, vec![None; n])
            }
            SensorInput::Rgbd { image, depth: depth_image } => {
                let (kps, descs) = extractor.extract(image);
                let points = kps
                    .iter()
                    .map(|kp| {
                        let raw = depth_image
                            .get_pixel_checked(kp.x as u32, kp.y as u32)
                            .map_or(0, |p| p[0]);
                        let z = raw as f64 * depth.depth_scale;
                        (z > 0.0 && z <= depth.max_depth)
                            .then(|| camera.unproject(kp.x as f64, kp.y as f64, z))
                    })
                    .collect();
                (kps, descs, points)
            }
            SensorInput::Stereo { left, right } => {
                let (kps, descs) = extractor.extract(left);
                let (right_kps, right_descs) = extractor.extract(right);
                let points = stereo_points(&kps, &descs, &right_kps, &right_descs, camera, depth);
                (kps, descs, points)
            }
        };

        Self {
            id,
            timestamp,
            keypoints,
            descriptors,
            points_cam,
        }
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    /// Number of keypoints with a known 3D point.
    pub fn num_points(&self) -> usize {
        self.points_cam.iter().filter(|p| p.is_some()).count()
    }
}

/// Depth for each left keypoint from its best match on the same row of the
/// right image.
fn stereo_points(
    left: &[KeyPoint],
    left_descs: &[Descriptor],
    right: &[KeyPoint],
    right_descs: &[Descriptor],
    camera: &CameraModel,
    depth: &DepthParams,
) -> Vec<Option<Vector3<f64>>> {
    let min_disparity = if depth.max_depth > 0.0 {
        (camera.bf / depth.max_depth) as f32
    } else {
        0.0
    };

    left.iter()
        .zip(left_descs)
        .map(|(kp, desc)| {
            let mut best: Option<(u32, f32)> = None;
            let mut second_best = TH_HIGH;
            for (rkp, rdesc) in right.iter().zip(right_descs) {
                if (kp.y - rkp.y).abs() > STEREO_ROW_MARGIN {
                    continue;
                }
                let disparity = kp.x - rkp.x;
                if disparity <= min_disparity.max(0.0) {
                    continue;
                }
                let dist = hamming_distance(desc, rdesc);
                match best {
                    Some((d, _)) if dist >= d => second_best = second_best.min(dist),
                    _ => {
                        if let Some((d, _)) = best {
                            second_best = second_best.min(d);
                        }
                        best = Some((dist, disparity));
                    }
                }
            }

            let (dist, disparity) = best?;
            if dist >= TH_HIGH || (dist as f32) >= 0.9 * second_best as f32 {
                return None;
            }
            let z = camera.bf / disparity as f64;
            Some(camera.unproject(kp.x as f64, kp.y as f64, z))
        })
        .collect()
}
