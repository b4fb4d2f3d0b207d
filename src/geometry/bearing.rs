//! Unit bearing vectors on S².
//!
//! A bearing is stored as a rotation `q` whose third column is the bearing,
//! `μ = q · e_z`. The first two columns `N = R(q) [e_x e_y]` span the tangent
//! plane and define the 2-dof error coordinates:
//!
//! ```text
//! μ ⊞ δ = Exp(N δ) μ
//! ∂(μ ⊞ δ)/∂δ |_{δ=0} = -[μ]× N
//! ```

use std::f64::consts::PI;

use nalgebra::{Matrix3x2, UnitQuaternion, Vector2, Vector3};

use super::so3::{exp, skew};

const PARALLEL_EPS: f64 = 1e-12;

const E_Z: Vector3<f64> = Vector3::new(0.0, 0.0, 1.0);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bearing {
    q: UnitQuaternion<f64>,
}

impl Bearing {
    /// Bearing along the optical axis `e_z`.
    pub fn forward() -> Self {
        Self { q: UnitQuaternion::identity() }
    }

    /// Bearing pointing along `v`. Returns `None` for zero or non-finite input.
    pub fn from_vector(v: &Vector3<f64>) -> Option<Self> {
        let norm = v.norm();
        if !norm.is_finite() || norm < PARALLEL_EPS {
            return None;
        }
        let dir = v / norm;
        let q = UnitQuaternion::rotation_between(&E_Z, &dir)
            .unwrap_or_else(|| UnitQuaternion::from_axis_angle(&Vector3::x_axis(), PI));
        Some(Self { q })
    }

    pub fn from_quaternion(q: UnitQuaternion<f64>) -> Self {
        Self { q }
    }

    pub fn quaternion(&self) -> &UnitQuaternion<f64> {
        &self.q
    }

    /// The unit bearing vector μ.
    pub fn vector(&self) -> Vector3<f64> {
        self.q * E_Z
    }

    /// Tangent basis N (3x2, orthonormal columns perpendicular to μ).
    pub fn tangent_basis(&self) -> Matrix3x2<f64> {
        let r = self.q.to_rotation_matrix();
        let m = r.matrix();
        Matrix3x2::from_columns(&[m.column(0).into_owned(), m.column(1).into_owned()])
    }

    /// ∂μ/∂δ at δ = 0.
    pub fn derivative(&self) -> Matrix3x2<f64> {
        -skew(&self.vector()) * self.tangent_basis()
    }

    pub fn boxplus(&self, delta: &Vector2<f64>) -> Self {
        let rotvec = self.tangent_basis() * delta;
        let mut q = exp(&rotvec) * self.q;
        q.renormalize();
        Self { q }
    }

    /// `δ` such that `other ⊞ δ` points along `self`.
    pub fn boxminus(&self, other: &Bearing) -> Vector2<f64> {
        let from = other.vector();
        let to = self.vector();
        let axis = from.cross(&to);
        let sin = axis.norm();
        let cos = from.dot(&to);
        if sin < PARALLEL_EPS {
            if cos > 0.0 {
                return Vector2::zeros();
            }
            return Vector2::new(PI, 0.0);
        }
        let rotvec = axis * (sin.atan2(cos) / sin);
        other.tangent_basis().transpose() * rotvec
    }

    /// Bearing rotated by `r`; the tangent basis is carried along.
    pub fn rotated(&self, r: &UnitQuaternion<f64>) -> Self {
        Self { q: r * self.q }
    }

    pub fn is_finite(&self) -> bool {
        self.q.coords.iter().all(|v| v.is_finite())
    }
}

impl Default for Bearing {
    fn default() -> Self {
        Self::forward()
    }
}
