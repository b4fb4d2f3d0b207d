//! SO(3) utilities for the error-state filter.
//!
//! Attitudes are perturbed on the right, `R = R̂ Exp(δθ)`, everywhere in the
//! crate. The right Jacobian Jr(φ) follows the same convention as Forster et
//! al. "IMU Preintegration on Manifold".

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

/// Small angle threshold for numerical stability.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-6;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
#[rustfmt::skip]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Exponential map from a rotation vector to a unit quaternion.
#[inline]
pub fn exp(phi: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*phi)
}

/// Exponential map returning a rotation matrix.
#[inline]
pub fn exp_matrix(phi: &Vector3<f64>) -> Matrix3<f64> {
    Rotation3::from_scaled_axis(*phi).into_inner()
}

/// Logarithm map, returning the rotation vector with angle in [0, π].
#[inline]
pub fn log(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    q.scaled_axis()
}

/// Right-perturbation increment: `δ` such that `a = b Exp(δ)`.
#[inline]
pub fn boxminus(a: &UnitQuaternion<f64>, b: &UnitQuaternion<f64>) -> Vector3<f64> {
    log(&(b.inverse() * a))
}

/// Right-perturbation update `q Exp(δ)`, renormalized.
#[inline]
pub fn boxplus(q: &UnitQuaternion<f64>, delta: &Vector3<f64>) -> UnitQuaternion<f64> {
    let mut out = q * exp(delta);
    out.renormalize();
    out
}

/// Computes the right Jacobian Jr(φ) of SO(3).
///
/// ```text
/// Jr(φ) = I - (1 - cos|φ|)/|φ|² [φ]× + (|φ| - sin|φ|)/|φ|³ [φ]×²
/// ```
///
/// For small angles (|φ| < ε):
/// ```text
/// Jr(φ) ≈ I - 0.5 [φ]×
/// ```
pub fn right_jacobian_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() - 0.5 * skew(phi);
    }

    let theta_sq = theta * theta;
    let theta_cu = theta_sq * theta;
    let skew_phi = skew(phi);
    let skew_phi_sq = skew_phi * skew_phi;

    Matrix3::identity() - ((1.0 - theta.cos()) / theta_sq) * skew_phi
        + ((theta - theta.sin()) / theta_cu) * skew_phi_sq
}
