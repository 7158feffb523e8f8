//! Rerun-based viewer sink.
//!
//! Entity hierarchy:
//!     status               - Tracking state and map statistics
//!     camera/
//!         keypoints/tracked    - Features matched to the map (green dots)
//!         keypoints/untracked  - Remaining features (gray dots)
//!     world/
//!         camera           - Current camera transform
//!         trajectory       - Keyframe trajectory line (gray, thin)
//!         map_points       - Map points (white dots)

use nalgebra::Vector3;
use rerun::{external::glam, RecordingStream};

use crate::error::{Result, SlamError};
use crate::geometry::SE3;

use super::frame_drawer::FrameSnapshot;
use super::map_drawer::MapSnapshot;
use super::sink::ViewerSink;

pub struct RerunSink {
    rec: RecordingStream,
    start_timestamp: Option<f64>,
}

impl RerunSink {
    /// Spawn a rerun viewer process and connect to it.
    pub fn spawn(app_name: &str) -> Result<Self> {
        let rec = rerun::RecordingStreamBuilder::new(app_name)
            .spawn()
            .map_err(|e| SlamError::Viewer(e.to_string()))?;
        rec.log_static("world", &rerun::ViewCoordinates::RDF())
            .map_err(|e| SlamError::Viewer(e.to_string()))?;
        Ok(Self {
            rec,
            start_timestamp: None,
        })
    }

    /// Set the current timestamp for all subsequent logs (relative to the first frame).
    fn set_time(&mut self, timestamp: f64) {
        let start = *self.start_timestamp.get_or_insert(timestamp);
        self.rec.set_duration_secs("time", (timestamp - start).max(0.0));
    }

    fn log_status(&self, status: &str) {
        self.rec
            .log(
                "status",
                &rerun::TextDocument::new(status).with_media_type(rerun::MediaType::markdown()),
            )
            .ok();
    }

    fn log_keypoints(&self, frame: &FrameSnapshot) {
        let mut tracked: Vec<[f32; 2]> = Vec::new();
        let mut untracked: Vec<[f32; 2]> = Vec::new();
        for (i, kp) in frame.keypoints.iter().enumerate() {
            if frame.tracked.get(i).copied().unwrap_or(false) {
                tracked.push([kp.x, kp.y]);
            } else {
                untracked.push([kp.x, kp.y]);
            }
        }

        self.rec
            .log(
                "camera/keypoints/tracked",
                &rerun::Points2D::new(tracked)
                    .with_colors([[0u8, 255, 0]]) // Green
                    .with_radii([3.0f32]),
            )
            .ok();
        self.rec
            .log(
                "camera/keypoints/untracked",
                &rerun::Points2D::new(untracked)
                    .with_colors([[128u8, 128, 128]]) // Gray
                    .with_radii([2.0f32]),
            )
            .ok();
    }

    fn log_camera_pose(&self, pose: &SE3) {
        let t = &pose.translation;
        let q = &pose.rotation;
        let translation = glam::Vec3::new(t.x as f32, t.y as f32, t.z as f32);
        let rotation = glam::Quat::from_xyzw(
            q.coords.x as f32,
            q.coords.y as f32,
            q.coords.z as f32,
            q.w as f32,
        );
        self.rec
            .log(
                "world/camera",
                &rerun::Transform3D::from_translation_rotation(translation, rotation),
            )
            .ok();
    }

    fn log_trajectory(&self, poses: &[SE3]) {
        if poses.len() < 2 {
            return;
        }
        let pts: Vec<[f32; 3]> = poses.iter().map(|p| to_f32(&p.translation)).collect();
        self.rec
            .log(
                "world/trajectory",
                &rerun::LineStrips3D::new([pts])
                    .with_colors([[128u8, 128, 128]]) // Gray
                    .with_radii([0.005f32]), // Thin
            )
            .ok();
    }

    fn log_map_points(&self, points: &[Vector3<f64>]) {
        let pts: Vec<[f32; 3]> = points.iter().map(to_f32).collect();
        self.rec
            .log(
                "world/map_points",
                &rerun::Points3D::new(pts)
                    .with_colors([[255u8, 255, 255]])
                    .with_radii([0.01f32]),
            )
            .ok();
    }
}

impl ViewerSink for RerunSink {
    fn draw(&mut self, frame: &FrameSnapshot, map: &MapSnapshot, status: &str) -> Result<()> {
        self.set_time(frame.timestamp);
        self.log_status(status);
        self.log_keypoints(frame);
        if let Some(pose) = &map.camera_pose {
            self.log_camera_pose(pose);
        }
        self.log_trajectory(&map.keyframe_poses);
        self.log_map_points(&map.map_points);
        Ok(())
    }
}

fn to_f32(p: &Vector3<f64>) -> [f32; 3] {
    [p.x as f32, p.y as f32, p.z as f32]
}
