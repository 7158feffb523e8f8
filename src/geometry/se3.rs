//! SE3: 6-DOF rigid-body transformation (rotation + translation).
//!
//! Poses follow the camera-to-world convention (`T_wc`) everywhere in the
//! crate: `p_world = pose.transform_point(&p_cam)`.

use nalgebra::{Matrix3, Matrix4, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Rigid-body transformation: p' = R * p + t.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self { rotation, translation }
    }

    /// Pure translation.
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// `self * other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Homogeneous 4x4 matrix.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation_matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Relative transform taking `other` into this pose's frame: `self⁻¹ * other`.
    pub fn between(&self, other: &SE3) -> Self {
        self.inverse().compose(other)
    }

    /// Translation distance and rotation angle (radians) to `other`.
    pub fn distance(&self, other: &SE3) -> (f64, f64) {
        let dt = (self.translation - other.translation).norm();
        let dr = (self.rotation.inverse() * other.rotation).angle();
        (dt, dr)
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul<&SE3> for &SE3 {
    type Output = SE3;

    fn mul(self, rhs: &SE3) -> SE3 {
        self.compose(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    fn sample_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.4, FRAC_PI_2),
            Vector3::new(1.0, -2.0, 0.5),
        )
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        let pose = sample_pose();
        let id = pose.compose(&pose.inverse());
        let (dt, dr) = id.distance(&SE3::identity());
        assert!(dt < 1e-12);
        assert!(dr < 1e-12);
    }

    #[test]
    fn test_between_recovers_relative_pose() {
        let a = sample_pose();
        let rel = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.2, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
        );
        let b = a.compose(&rel);
        let (dt, dr) = a.between(&b).distance(&rel);
        assert!(dt < 1e-12);
        assert!(dr < 1e-12);
    }

    #[test]
    fn test_matrix_matches_point_transform() {
        let pose = sample_pose();
        let p = Vector3::new(0.3, 0.2, 4.0);
        let m = pose.to_matrix();
        let ph = m * nalgebra::Vector4::new(p.x, p.y, p.z, 1.0);
        let expected = pose.transform_point(&p);
        assert!((ph.xyz() - expected).norm() < 1e-12);
    }
}
