//! Settings file loading.
//!
//! The settings source is a YAML document read once at construction. Every
//! section has defaults, so a file only needs the values that differ:
//!
//! ```yaml
//! camera:
//!   fx: 517.3
//!   fy: 516.5
//!   cx: 318.6
//!   cy: 255.3
//!   bf: 40.0
//!   fps: 30.0
//! depth_map_factor: 5000.0
//! orb_extractor:
//!   n_features: 1000
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors while reading the settings source.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value: {0}")]
    Invalid(String),
}

/// All tunables of the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub camera: CameraSettings,

    /// Close/far threshold, in units of the stereo baseline.
    pub depth_threshold: f64,

    /// Raw depth value per meter for RGB-D input (5000 for TUM datasets).
    pub depth_map_factor: f64,

    pub orb_extractor: ExtractorSettings,
    pub tracking: TrackingSettings,
    pub local_mapping: LocalMappingSettings,
    pub loop_closing: LoopClosingSettings,
    pub viewer: ViewerSettings,
}

/// Pinhole intrinsics plus stereo baseline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Stereo baseline times fx.
    pub bf: f64,
    pub fps: f64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            fx: 458.654,
            fy: 457.296,
            cx: 367.215,
            cy: 248.375,
            bf: 47.90639384423901,
            fps: 20.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorSettings {
    /// Maximum number of features kept per image.
    pub n_features: usize,
    /// FAST intensity threshold.
    pub fast_threshold: u8,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            n_features: 1000,
            fast_threshold: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    /// Points with valid depth needed to initialize stereo / RGB-D maps.
    pub min_init_points: usize,
    /// Matches between two frames needed to initialize a monocular map.
    pub min_init_matches: usize,
    /// Matches against the reference keyframe for the frame to count as tracked.
    pub min_matches: usize,
    /// Consecutive failed frames before a recently-lost track becomes lost.
    pub max_lost_frames: usize,
    /// Matches against a relocalization candidate needed to recover.
    pub min_relocalization_matches: usize,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            min_init_points: 500,
            min_init_matches: 100,
            min_matches: 30,
            max_lost_frames: 5,
            min_relocalization_matches: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalMappingSettings {
    /// Queue length above which Tracking stops creating keyframes.
    pub max_queue: usize,
    /// Fraction of redundant points that marks a keyframe for culling.
    pub redundancy_ratio: f64,
}

impl Default for LocalMappingSettings {
    fn default() -> Self {
        Self {
            max_queue: 3,
            redundancy_ratio: 0.9,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopClosingSettings {
    pub min_score_ratio: f64,
    pub consistency_threshold: usize,
    pub min_temporal_gap: usize,
    /// Run the global optimization pass after a loop is registered.
    pub run_global_ba: bool,
}

impl Default for LoopClosingSettings {
    fn default() -> Self {
        Self {
            min_score_ratio: 0.75,
            consistency_threshold: 3,
            min_temporal_gap: 10,
            run_global_ba: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerSettings {
    /// Refresh rate of the viewer loop.
    pub fps: f64,
    /// Application id used by the rerun sink.
    pub app_name: String,
}

impl Default for ViewerSettings {
    fn default() -> Self {
        Self {
            fps: 30.0,
            app_name: "orbslam-system".to_string(),
        }
    }
}

impl Settings {
    /// Read and validate the settings file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path.as_ref())?;
        let settings: Settings = serde_yaml::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        let cam = &self.camera;
        if cam.fx <= 0.0 || cam.fy <= 0.0 {
            return Err(SettingsError::Invalid(format!(
                "focal lengths must be positive (fx={}, fy={})",
                cam.fx, cam.fy
            )));
        }
        if cam.fps <= 0.0 {
            return Err(SettingsError::Invalid(format!("camera fps must be positive, got {}", cam.fps)));
        }
        if self.depth_map_factor < 0.0 {
            return Err(SettingsError::Invalid("depth_map_factor must not be negative".into()));
        }
        Ok(())
    }

    /// Depth in meters beyond which a stereo/RGB-D point is considered far.
    pub fn close_depth_threshold(&self) -> f64 {
        let th = if self.depth_threshold > 0.0 { self.depth_threshold } else { 35.0 };
        self.camera.bf * th / self.camera.fx
    }

    /// Scale converting raw RGB-D depth to meters.
    pub fn depth_scale(&self) -> f64 {
        if self.depth_map_factor.abs() < 1e-5 {
            1.0
        } else {
            1.0 / self.depth_map_factor
        }
    }

    /// Maximum number of frames between keyframes (one second of input).
    pub fn max_frames_between_keyframes(&self) -> usize {
        self.camera.fps.round().max(1.0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "camera:\n  fx: 500.0\n  fy: 500.0\ndepth_map_factor: 5000.0").unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.camera.fx, 500.0);
        assert_eq!(settings.orb_extractor.n_features, 1000);
        assert!((settings.depth_scale() - 1.0 / 5000.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = Settings::load("/nonexistent/settings.yaml").unwrap_err();
        assert!(matches!(err, SettingsError::Io(_)));
    }

    #[test]
    fn test_rejects_bad_intrinsics() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "camera:\n  fx: 0.0").unwrap();
        assert!(matches!(
            Settings::load(file.path()),
            Err(SettingsError::Invalid(_))
        ));
    }
}
