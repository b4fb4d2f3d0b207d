//! Absolute body-pose measurements from an external reference frame.
//!
//! Auxiliary pose `k` is `T_EW`, the world expressed in the external frame
//! `E` (e.g. a motion-capture system). A measurement of `T_EB` is predicted
//! as `T_EW T_WA T_AB`; the residual is
//!
//! ```text
//! r = [p_meas - p_pred; Log(R_predᵀ R_meas)]
//! ```
//!
//! The Jacobian is taken by finite differences on the manifold.

use nalgebra::{DMatrix, DVector, Matrix6, UnitQuaternion, Vector3, Vector6};
use tracing::debug;

use super::layout::*;
use super::numeric::numeric_jacobian;
use super::state::{FilterState, StateMean};
use crate::config::FilterConfig;
use crate::error::{VioError, VioResult};
use crate::geometry::{so3, SE3};

/// Measured pose of the body in external frame `aux_index`.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseMeasurement {
    pub timestamp: f64,
    pub aux_index: usize,
    /// p_EB
    pub position: Vector3<f64>,
    /// q_EB
    pub attitude: UnitQuaternion<f64>,
    /// Covariance of `(δp, δθ)`, attitude error on the right.
    pub covariance: Matrix6<f64>,
}

impl PoseMeasurement {
    pub fn is_finite(&self) -> bool {
        self.timestamp.is_finite()
            && self.position.iter().all(|v| v.is_finite())
            && self.attitude.coords.iter().all(|v| v.is_finite())
            && self.covariance.iter().all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoseUpdateReport {
    pub timestamp: f64,
    pub aux_index: usize,
    /// Squared Mahalanobis distance of the innovation; `None` if the
    /// measurement was not evaluated.
    pub mahalanobis: Option<f64>,
    pub accepted: bool,
}

/// Predicted `T_EB`.
pub fn predict_pose(mean: &StateMean, aux_index: usize) -> SE3 {
    mean.aux_poses[aux_index].compose(&mean.world_pose())
}

pub fn pose_residual(mean: &StateMean, measurement: &PoseMeasurement) -> Vector6<f64> {
    let predicted = predict_pose(mean, measurement.aux_index);
    let dp = measurement.position - predicted.translation;
    let dth = so3::boxminus(&measurement.attitude, &predicted.rotation);
    Vector6::new(dp.x, dp.y, dp.z, dth.x, dth.y, dth.z)
}

/// EKF update with one pose measurement. A gated measurement leaves the
/// state untouched and is reported with `accepted = false`.
pub fn pose_update(
    state: &mut FilterState,
    measurement: &PoseMeasurement,
    config: &FilterConfig,
) -> VioResult<PoseUpdateReport> {
    let k = measurement.aux_index;
    if k >= state.layout.aux_poses {
        return Err(VioError::InvalidMeasurement(format!(
            "auxiliary pose {} does not exist ({} configured)",
            k, state.layout.aux_poses
        )));
    }
    if !measurement.is_finite() {
        return Err(VioError::InvalidMeasurement("non-finite pose measurement".to_string()));
    }
    let r_meas = DMatrix::from_iterator(6, 6, measurement.covariance.iter().copied());
    if r_meas.clone().cholesky().is_none() {
        return Err(VioError::InvalidMeasurement(
            "pose covariance is not positive definite".to_string(),
        ));
    }

    let residual = pose_residual(&state.mean, measurement);
    let aux = state.layout.aux(k);
    let columns = [POS..ATT + 3, ANCHOR_POS..CORE_DIM, aux..aux + AUX_DIM];
    let eps = config.pose_update.finite_difference_step;
    let d_residual = numeric_jacobian(&state.mean, &columns, eps, |m| {
        DVector::from_column_slice(pose_residual(m, measurement).as_slice())
    });
    // r(x ⊞ δ) ≈ r - H δ
    let h = -d_residual;

    let p = state.covariance();
    let pht = p * h.transpose();
    let s = &h * &pht + &r_meas;
    let Some(chol) = s.cholesky() else {
        return Err(VioError::InvalidMeasurement(
            "pose innovation covariance is singular".to_string(),
        ));
    };
    let r = DVector::from_column_slice(residual.as_slice());
    let d2 = r.dot(&chol.solve(&r));

    let mut report = PoseUpdateReport {
        timestamp: measurement.timestamp,
        aux_index: k,
        mahalanobis: Some(d2),
        accepted: false,
    };
    if !(d2 <= config.pose_update.mahalanobis_gate) {
        debug!("pose measurement on aux {} gated (d² = {:.2})", k, d2);
        return Ok(report);
    }

    let gain = chol.solve(&pht.transpose()).transpose();
    let n = p.nrows();
    let ikh = DMatrix::identity(n, n) - &gain * &h;
    let p_new = &ikh * p * ikh.transpose() + &gain * &r_meas * gain.transpose();
    let delta = &gain * r;

    state.commit_covariance(p_new, &config.numerics)?;
    state.mean.boxplus_in_place(&delta);
    report.accepted = true;
    Ok(report)
}
