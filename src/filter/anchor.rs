//! Robocentric anchor reset.
//!
//! Moves the anchor `A` to the current body pose without changing the
//! physical estimate:
//!
//! ```text
//! T_WA' = T_WA T_AB,   T_A'B = I
//! P_A'  = R_ABᵀ (P_A - p_AB)        for every valid feature
//! ```
//!
//! The whole mean and covariance are transformed in one step, `P' = J P Jᵀ`.

use nalgebra::{DMatrix, Matrix3, UnitQuaternion, Vector3};
use tracing::debug;

use super::feature::DepthParameterization;
use super::layout::*;
use super::state::{FeatureMean, FilterState, StateMean};
use crate::config::{AnchorResetConfig, NumericsConfig};
use crate::error::DivergenceReason;
use crate::geometry::{skew, Bearing};

/// True if the reset policy fires for the current state.
pub fn should_reset(
    mean: &StateMean,
    images_since_reset: usize,
    policy: &AnchorResetConfig,
) -> bool {
    let by_count = policy.interval_images > 0 && images_since_reset >= policy.interval_images;
    let by_translation =
        policy.max_translation > 0.0 && mean.position.norm() > policy.max_translation;
    let by_rotation = policy.max_rotation_deg > 0.0
        && mean.attitude.angle().to_degrees() > policy.max_rotation_deg;
    by_count || by_translation || by_rotation
}

/// Feature point re-expressed in the new anchor.
fn moved_point(mean: &StateMean, i: usize, depth: DepthParameterization) -> Vector3<f64> {
    let r_ab = mean.attitude.to_rotation_matrix();
    r_ab.transpose() * (mean.feature_point(i, depth) - mean.position)
}

/// Mean after the reset. `valid[i]` selects the feature slots to move.
pub fn reset_mean(mean: &StateMean, valid: &[bool], depth: DepthParameterization) -> StateMean {
    let mut out = mean.clone();
    out.anchor = mean.anchor.compose(&mean.robocentric_pose());
    out.position = Vector3::zeros();
    out.attitude = UnitQuaternion::identity();
    for (i, _) in valid.iter().enumerate().filter(|(_, v)| **v) {
        let p = moved_point(mean, i, depth);
        // A point at the new origin keeps its bearing; depth validity catches it.
        let bearing = Bearing::from_vector(&p).unwrap_or(mean.features[i].bearing);
        out.features[i] = FeatureMean { bearing, depth: depth.parameter(p.norm()) };
    }
    out
}

/// Error-state Jacobian of [`reset_mean`] at `mean`.
pub fn reset_jacobian(
    mean: &StateMean,
    valid: &[bool],
    depth: DepthParameterization,
) -> DMatrix<f64> {
    let layout = mean.layout();
    let n = layout.dim();
    let mut j = DMatrix::identity(n, n);

    let r_ab = mean.attitude.to_rotation_matrix().into_inner();
    let r_wa = mean.anchor.rotation_matrix();
    let p_ab = mean.position;

    // The new robocentric pose is identically zero.
    j.rows_mut(POS, 3).fill(0.0);
    j.rows_mut(ATT, 3).fill(0.0);

    // p_WA' = p_WA + R_WA p_AB
    j.fixed_view_mut::<3, 3>(ANCHOR_POS, ANCHOR_ATT).copy_from(&(-r_wa * skew(&p_ab)));
    j.fixed_view_mut::<3, 3>(ANCHOR_POS, POS).copy_from(&r_wa);
    // R_WA' = R_WA R_AB
    j.fixed_view_mut::<3, 3>(ANCHOR_ATT, ANCHOR_ATT).copy_from(&r_ab.transpose());
    j.fixed_view_mut::<3, 3>(ANCHOR_ATT, ATT).copy_from(&Matrix3::identity());

    let moved = reset_mean(mean, valid, depth);
    for (i, _) in valid.iter().enumerate().filter(|(_, v)| **v) {
        let s = layout.feature(i);
        let f = &mean.features[i];
        let d = depth.distance(f.depth);
        let p_new = moved_point(mean, i, depth);
        let dist = p_new.norm();
        let new = &moved.features[i];

        // Rows mapping dP' to (δμ', δp').
        let m = new.bearing.derivative();
        let mut a = Matrix3::zeros();
        a.fixed_view_mut::<2, 3>(0, 0).copy_from(&(m.transpose() / dist));
        let mu_new = new.bearing.vector();
        a.set_row(2, &(mu_new.transpose() / depth.derivative(new.depth)));

        let d_bearing = r_ab.transpose() * f.bearing.derivative() * d;
        let d_depth = r_ab.transpose() * f.bearing.vector() * depth.derivative(f.depth);

        let mut rows = DMatrix::zeros(FEATURE_DIM, n);
        rows.fixed_view_mut::<3, 2>(0, s).copy_from(&(a * d_bearing));
        rows.fixed_view_mut::<3, 1>(0, s + 2).copy_from(&(a * d_depth));
        rows.fixed_view_mut::<3, 3>(0, POS).copy_from(&(a * (-r_ab.transpose())));
        rows.fixed_view_mut::<3, 3>(0, ATT).copy_from(&(a * skew(&p_new)));
        j.rows_mut(s, FEATURE_DIM).copy_from(&rows);
    }
    j
}

/// Apply the reset to the whole state. On failure nothing is changed.
pub fn anchor_reset(
    state: &mut FilterState,
    numerics: &NumericsConfig,
) -> Result<(), DivergenceReason> {
    let valid: Vec<bool> = state.slots.slots().iter().map(|s| s.valid).collect();
    let j = reset_jacobian(&state.mean, &valid, state.depth);
    let mean = reset_mean(&state.mean, &valid, state.depth);
    let p = &j * state.covariance() * j.transpose();

    state.commit_covariance(p, numerics)?;
    state.mean = mean;
    state.anchor_epoch += 1;
    let epoch = state.anchor_epoch;
    for i in 0..state.slots.capacity() {
        let slot = state.slots.slot_mut(i);
        if slot.valid {
            slot.anchor_epoch = epoch;
        }
    }
    debug!("anchor reset, epoch {}", epoch);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use crate::filter::numeric::{max_abs_difference, numeric_state_jacobian};
    use crate::geometry::SE3;
    use approx::assert_relative_eq;

    fn state() -> FilterState {
        let config = FilterConfig {
            max_features: 3,
            auxiliary_pose_count: 1,
            ..FilterConfig::default()
        };
        let mut s = FilterState::new(&config, vec![SE3::identity()], (1e-4, 0.25));
        s.mean.position = Vector3::new(0.3, -0.2, 0.15);
        s.mean.attitude = UnitQuaternion::from_euler_angles(0.1, -0.05, 0.4);
        s.mean.anchor = SE3::new(
            UnitQuaternion::from_euler_angles(0.02, 0.01, -0.7),
            Vector3::new(2.0, 1.0, 0.5),
        );
        let bearings = [Vector3::new(0.2, 0.1, 1.0), Vector3::new(-0.3, 0.2, 1.0)];
        for (i, v) in bearings.iter().enumerate() {
            s.slots.claim(i, 0, 0);
            s.mean.features[i] = FeatureMean {
                bearing: Bearing::from_vector(v).unwrap(),
                depth: s.depth.parameter(2.0 + i as f64),
            };
        }
        s
    }

    #[test]
    fn test_reset_preserves_world_geometry() {
        let s = state();
        let valid = [true, true, false];
        let before_pose = s.mean.world_pose();
        let before_point = s.mean.anchor.transform_point(&s.mean.feature_point(1, s.depth));

        let moved = reset_mean(&s.mean, &valid, s.depth);
        let after_pose = moved.world_pose();
        assert_relative_eq!(after_pose.translation, before_pose.translation, epsilon = 1e-12);
        assert_relative_eq!(after_pose.rotation, before_pose.rotation, epsilon = 1e-12);
        let after_point = moved.anchor.transform_point(&moved.feature_point(1, s.depth));
        assert_relative_eq!(after_point, before_point, epsilon = 1e-12);
        assert_eq!(moved.position, Vector3::zeros());
        // Invalid slots are left alone.
        assert_eq!(moved.features[2], s.mean.features[2]);
    }

    #[test]
    fn test_reset_jacobian_matches_numeric() {
        let s = state();
        let valid = [true, true, false];
        for depth in [
            DepthParameterization::Inverse,
            DepthParameterization::Regular,
            DepthParameterization::Log,
        ] {
            let mut mean = s.mean.clone();
            for i in 0..2 {
                mean.features[i].depth = depth.parameter(2.0 + i as f64);
            }
            let analytic = reset_jacobian(&mean, &valid, depth);
            let numeric = numeric_state_jacobian(&mean, 1e-6, |m| reset_mean(m, &valid, depth));
            let err = max_abs_difference(&analytic, &numeric);
            assert!(err < 1e-6, "{:?}: max Jacobian error {:e}", depth, err);
        }
    }

    #[test]
    fn test_reset_keeps_covariance_healthy_and_bumps_epoch() {
        let mut s = state();
        let numerics = NumericsConfig::default();
        anchor_reset(&mut s, &numerics).unwrap();
        s.check_health(&numerics).unwrap();
        assert_eq!(s.anchor_epoch, 1);
        assert_eq!(s.slots.slot(0).anchor_epoch, 1);
        assert_eq!(s.slots.slot(2).anchor_epoch, 0);
        // Pose uncertainty moved into the anchor.
        assert_eq!(s.covariance()[(POS, POS)], 0.0);
    }

    #[test]
    fn test_policy() {
        let s = state();
        let policy = AnchorResetConfig {
            interval_images: 0,
            max_translation: 0.5,
            max_rotation_deg: 0.0,
        };
        assert!(!should_reset(&s.mean, 10, &policy));
        let rotation = AnchorResetConfig { max_rotation_deg: 10.0, ..policy.clone() };
        assert!(should_reset(&s.mean, 0, &rotation));
        assert!(should_reset(&s.mean, 1, &AnchorResetConfig::default()));
    }
}
