//! Rigid-body transforms.
//!
//! `T_AB` maps coordinates expressed in frame B into frame A:
//! `p_A = T_AB * p_B = R_AB p_B + t_AB`.

use nalgebra::{Matrix3, Matrix4, Quaternion, Rotation3, UnitQuaternion, Vector3};

use super::so3;

/// Rigid transform stored as a unit quaternion and a translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self { rotation, translation }
    }

    pub fn identity() -> Self {
        Self::new(UnitQuaternion::identity(), Vector3::zeros())
    }

    /// Build from a Hamilton quaternion (w, x, y, z) and a position.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_quaternion(Quaternion::new(qw, qx, qy, qz));
        Self::new(rotation, translation)
    }

    /// Build from a 4x4 homogeneous matrix. The rotation block is
    /// re-orthonormalized, so calibration files with a few digits of
    /// precision are accepted.
    pub fn from_matrix(m: &Matrix4<f64>) -> Self {
        let r: Matrix3<f64> = m.fixed_view::<3, 3>(0, 0).into_owned();
        let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(&r));
        let translation = Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]);
        Self::new(rotation, translation)
    }

    /// Build from 16 row-major values of a homogeneous matrix.
    pub fn from_row_major(values: &[f64; 16]) -> Self {
        Self::from_matrix(&Matrix4::from_row_slice(values))
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(self.rotation.to_rotation_matrix().matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self::new(rotation, -(rotation * self.translation))
    }

    /// `self ∘ other`, i.e. `T_AC = T_AB.compose(&T_BC)`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self::new(
            self.rotation * other.rotation,
            self.rotation * other.translation + self.translation,
        )
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Perturb with `(δp, δθ)`: `t + δp`, `R Exp(δθ)`.
    pub fn boxplus(&self, dp: &Vector3<f64>, dtheta: &Vector3<f64>) -> Self {
        Self::new(so3::boxplus(&self.rotation, dtheta), self.translation + dp)
    }

    /// Inverse of [`SE3::boxplus`]: `(δp, δθ)` with `self = other ⊞ (δp, δθ)`.
    pub fn boxminus(&self, other: &SE3) -> (Vector3<f64>, Vector3<f64>) {
        (self.translation - other.translation, so3::boxminus(&self.rotation, &other.rotation))
    }

    pub fn is_finite(&self) -> bool {
        self.translation.iter().all(|v| v.is_finite())
            && self.rotation.coords.iter().all(|v| v.is_finite())
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}
