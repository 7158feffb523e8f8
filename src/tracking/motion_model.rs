//! Constant-velocity motion model for pose prediction.

use crate::geometry::SE3;

/// Predicts the next camera pose by repeating the last inter-frame motion.
///
/// The velocity is kept as the relative transform `T_prev_curr` between the
/// two most recent poses, so it is applied in the camera frame and does not
/// depend on where the map origin is.
#[derive(Debug, Clone, Default)]
pub struct MotionModel {
    last_pose: Option<SE3>,
    velocity: Option<SE3>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the pose (T_wc) of the frame just tracked.
    pub fn update(&mut self, pose: &SE3) {
        self.velocity = self.last_pose.as_ref().map(|prev| prev.between(pose));
        self.last_pose = Some(pose.clone());
    }

    /// Forget the velocity but keep the last pose, e.g. after a frame whose
    /// pose came from relocalization rather than from motion.
    pub fn anchor(&mut self, pose: &SE3) {
        self.velocity = None;
        self.last_pose = Some(pose.clone());
    }

    /// Predicted pose of the next frame. Without a velocity the last pose
    /// is returned unchanged.
    pub fn predict(&self) -> Option<SE3> {
        let last = self.last_pose.as_ref()?;
        Some(match &self.velocity {
            Some(v) => last.compose(v),
            None => last.clone(),
        })
    }

    pub fn has_velocity(&self) -> bool {
        self.velocity.is_some()
    }

    pub fn reset(&mut self) {
        self.last_pose = None;
        self.velocity = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    #[test]
    fn test_constant_velocity_prediction() {
        let mut model = MotionModel::new();
        assert!(model.predict().is_none());

        let rot = UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0);
        let p0 = SE3::identity();
        let step = SE3::new(rot, Vector3::new(0.1, 0.0, 0.0));
        let p1 = p0.compose(&step);

        model.update(&p0);
        assert!(!model.has_velocity());
        model.update(&p1);

        let predicted = model.predict().unwrap();
        let expected = p1.compose(&step);
        let (dt, dr) = predicted.distance(&expected);
        assert!(dt < 1e-9 && dr < 1e-9);
    }

    #[test]
    fn test_anchor_drops_velocity() {
        let mut model = MotionModel::new();
        model.update(&SE3::identity());
        model.update(&SE3::from_translation(Vector3::new(1.0, 0.0, 0.0)));
        let relocalized = SE3::from_translation(Vector3::new(5.0, 0.0, 0.0));
        model.anchor(&relocalized);
        assert_eq!(model.predict(), Some(relocalized));
    }
}
