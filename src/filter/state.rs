//! Filter state: manifold mean, error-state covariance and feature slots.
//!
//! Frames:
//! - `W` world (z up, gravity along -z)
//! - `A` robocentric anchor, the body frame at the last anchor reset
//! - `B` body / IMU
//! - `C_i` camera i
//! - `E_k` external reference frame of auxiliary pose k

use nalgebra::{DMatrix, DVector, UnitQuaternion, Vector2, Vector3};

use super::feature::{DepthParameterization, FeatureArena};
use super::layout::*;
use crate::config::{FilterConfig, NumericsConfig};
use crate::error::DivergenceReason;
use crate::geometry::{so3, Bearing, SE3};
use crate::imu::ImuInitState;

/// Mean of one feature: bearing in `A` and depth parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureMean {
    pub bearing: Bearing,
    pub depth: f64,
}

/// Manifold-valued filter mean.
#[derive(Debug, Clone, PartialEq)]
pub struct StateMean {
    /// p_AB
    pub position: Vector3<f64>,
    /// v_B
    pub velocity: Vector3<f64>,
    /// q_AB
    pub attitude: UnitQuaternion<f64>,
    pub gyro_bias: Vector3<f64>,
    pub acc_bias: Vector3<f64>,
    /// T_WA
    pub anchor: SE3,
    /// T_BC per camera.
    pub extrinsics: Vec<SE3>,
    /// T_EW per auxiliary frame.
    pub aux_poses: Vec<SE3>,
    pub features: Vec<FeatureMean>,
}

#[inline]
fn seg3(v: &DVector<f64>, at: usize) -> Vector3<f64> {
    v.fixed_rows::<3>(at).into_owned()
}

impl StateMean {
    pub fn new(layout: &StateLayout, extrinsics: Vec<SE3>, initial_depth: f64) -> Self {
        debug_assert_eq!(extrinsics.len(), layout.cameras);
        Self {
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            attitude: UnitQuaternion::identity(),
            gyro_bias: Vector3::zeros(),
            acc_bias: Vector3::zeros(),
            anchor: SE3::identity(),
            extrinsics,
            aux_poses: vec![SE3::identity(); layout.aux_poses],
            features: vec![
                FeatureMean { bearing: Bearing::forward(), depth: initial_depth };
                layout.features
            ],
        }
    }

    pub fn layout(&self) -> StateLayout {
        StateLayout::new(self.extrinsics.len(), self.aux_poses.len(), self.features.len())
    }

    /// T_AB
    pub fn robocentric_pose(&self) -> SE3 {
        SE3::new(self.attitude, self.position)
    }

    /// T_WB
    pub fn world_pose(&self) -> SE3 {
        self.anchor.compose(&self.robocentric_pose())
    }

    /// Feature point in `A`.
    pub fn feature_point(&self, i: usize, depth: DepthParameterization) -> Vector3<f64> {
        let f = &self.features[i];
        f.bearing.vector() * depth.distance(f.depth)
    }

    /// `self ⊞ δ`.
    pub fn boxplus(&self, delta: &DVector<f64>) -> Self {
        let mut out = self.clone();
        out.boxplus_in_place(delta);
        out
    }

    pub fn boxplus_in_place(&mut self, delta: &DVector<f64>) {
        let layout = self.layout();
        debug_assert_eq!(delta.len(), layout.dim());

        self.position += seg3(delta, POS);
        self.velocity += seg3(delta, VEL);
        self.attitude = so3::boxplus(&self.attitude, &seg3(delta, ATT));
        self.gyro_bias += seg3(delta, GYRO_BIAS);
        self.acc_bias += seg3(delta, ACC_BIAS);
        self.anchor = self.anchor.boxplus(&seg3(delta, ANCHOR_POS), &seg3(delta, ANCHOR_ATT));

        for (c, ext) in self.extrinsics.iter_mut().enumerate() {
            let s = layout.extrinsic(c);
            *ext = ext.boxplus(&seg3(delta, s), &seg3(delta, s + 3));
        }
        for (k, aux) in self.aux_poses.iter_mut().enumerate() {
            let s = layout.aux(k);
            *aux = aux.boxplus(&seg3(delta, s), &seg3(delta, s + 3));
        }
        for (i, f) in self.features.iter_mut().enumerate() {
            let s = layout.feature(i);
            f.bearing = f.bearing.boxplus(&Vector2::new(delta[s], delta[s + 1]));
            f.depth += delta[s + 2];
        }
    }

    /// `self ⊟ other`: the δ with `other ⊞ δ = self`.
    pub fn boxminus(&self, other: &StateMean) -> DVector<f64> {
        let layout = self.layout();
        debug_assert_eq!(layout, other.layout());
        let mut d = DVector::zeros(layout.dim());

        d.fixed_rows_mut::<3>(POS).copy_from(&(self.position - other.position));
        d.fixed_rows_mut::<3>(VEL).copy_from(&(self.velocity - other.velocity));
        d.fixed_rows_mut::<3>(ATT).copy_from(&so3::boxminus(&self.attitude, &other.attitude));
        d.fixed_rows_mut::<3>(GYRO_BIAS).copy_from(&(self.gyro_bias - other.gyro_bias));
        d.fixed_rows_mut::<3>(ACC_BIAS).copy_from(&(self.acc_bias - other.acc_bias));
        let (dp, dth) = self.anchor.boxminus(&other.anchor);
        d.fixed_rows_mut::<3>(ANCHOR_POS).copy_from(&dp);
        d.fixed_rows_mut::<3>(ANCHOR_ATT).copy_from(&dth);

        for c in 0..layout.cameras {
            let s = layout.extrinsic(c);
            let (dp, dth) = self.extrinsics[c].boxminus(&other.extrinsics[c]);
            d.fixed_rows_mut::<3>(s).copy_from(&dp);
            d.fixed_rows_mut::<3>(s + 3).copy_from(&dth);
        }
        for k in 0..layout.aux_poses {
            let s = layout.aux(k);
            let (dp, dth) = self.aux_poses[k].boxminus(&other.aux_poses[k]);
            d.fixed_rows_mut::<3>(s).copy_from(&dp);
            d.fixed_rows_mut::<3>(s + 3).copy_from(&dth);
        }
        for i in 0..layout.features {
            let s = layout.feature(i);
            let db = self.features[i].bearing.boxminus(&other.features[i].bearing);
            d[s] = db.x;
            d[s + 1] = db.y;
            d[s + 2] = self.features[i].depth - other.features[i].depth;
        }
        d
    }

    /// Name of the first block holding a NaN or infinity.
    pub fn first_non_finite(&self) -> Option<&'static str> {
        let finite3 = |v: &Vector3<f64>| v.iter().all(|x| x.is_finite());
        let finite_q = |q: &UnitQuaternion<f64>| q.coords.iter().all(|x| x.is_finite());

        if !finite3(&self.position) {
            return Some("position");
        }
        if !finite3(&self.velocity) {
            return Some("velocity");
        }
        if !finite_q(&self.attitude) {
            return Some("attitude");
        }
        if !finite3(&self.gyro_bias) {
            return Some("gyro_bias");
        }
        if !finite3(&self.acc_bias) {
            return Some("acc_bias");
        }
        if !self.anchor.is_finite() {
            return Some("anchor");
        }
        if !self.extrinsics.iter().all(SE3::is_finite) {
            return Some("extrinsics");
        }
        if !self.aux_poses.iter().all(SE3::is_finite) {
            return Some("auxiliary_pose");
        }
        if !self.features.iter().all(|f| f.bearing.is_finite() && f.depth.is_finite()) {
            return Some("feature");
        }
        None
    }
}

/// Full filter state.
#[derive(Debug, Clone)]
pub struct FilterState {
    pub layout: StateLayout,
    /// Time (s) the mean refers to; `-inf` before the first IMU sample.
    pub timestamp: f64,
    pub init: ImuInitState,
    /// Incremented by every anchor reset.
    pub anchor_epoch: u64,
    pub depth: DepthParameterization,
    pub mean: StateMean,
    pub slots: FeatureArena,
    covariance: DMatrix<f64>,
}

impl FilterState {
    /// Prior state for `config`, with camera extrinsics from calibration.
    pub fn new(config: &FilterConfig, extrinsics: Vec<SE3>, feature_prior: (f64, f64)) -> Self {
        let layout = StateLayout::new(
            config.camera_count,
            config.auxiliary_pose_count,
            config.max_features,
        );
        let depth = config.features.depth_parameterization;
        let initial_depth = depth.parameter(config.features.initial_distance);
        Self {
            layout,
            timestamp: f64::NEG_INFINITY,
            init: ImuInitState::AwaitingImu,
            anchor_epoch: 0,
            depth,
            mean: StateMean::new(&layout, extrinsics, initial_depth),
            slots: FeatureArena::new(config.max_features, config.pyramid_levels, config.patch_size),
            covariance: prior_covariance(config, &layout, feature_prior),
        }
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    /// Raw access to the covariance. Callers must run [`FilterState::check_health`]
    /// before the state is used again.
    pub fn covariance_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.covariance
    }

    /// Replace the covariance after checking it. A matrix that passes is
    /// stored symmetrized; a failing one leaves the state untouched.
    pub fn commit_covariance(
        &mut self,
        p: DMatrix<f64>,
        numerics: &NumericsConfig,
    ) -> Result<(), DivergenceReason> {
        check_covariance(&p, numerics)?;
        self.covariance = symmetrize(p);
        Ok(())
    }

    pub fn check_health(&self, numerics: &NumericsConfig) -> Result<(), DivergenceReason> {
        if let Some(block) = self.mean.first_non_finite() {
            return Err(DivergenceReason::NonFiniteMean { block });
        }
        if !self.timestamp.is_finite() && self.init == ImuInitState::GravityAligned {
            return Err(DivergenceReason::NonFiniteMean { block: "timestamp" });
        }
        check_covariance(&self.covariance, numerics)
    }

    /// Decouple slot `i` from the rest of the state and set its prior.
    pub fn reset_feature_covariance(&mut self, i: usize, bearing_var: f64, depth_var: f64) {
        let s = self.layout.feature(i);
        let n = self.layout.dim();
        for r in s..s + FEATURE_DIM {
            for c in 0..n {
                self.covariance[(r, c)] = 0.0;
                self.covariance[(c, r)] = 0.0;
            }
        }
        self.covariance[(s, s)] = bearing_var;
        self.covariance[(s + 1, s + 1)] = bearing_var;
        self.covariance[(s + 2, s + 2)] = depth_var;
    }

    /// Standard deviation of a scalar error-state component.
    pub fn sigma(&self, index: usize) -> f64 {
        self.covariance[(index, index)].max(0.0).sqrt()
    }
}

/// Diagonal prior covariance.
pub fn prior_covariance(
    config: &FilterConfig,
    layout: &StateLayout,
    feature_prior: (f64, f64),
) -> DMatrix<f64> {
    let ic = &config.initial_covariance;
    let mut diag = DVector::zeros(layout.dim());
    let mut set = |start: usize, len: usize, value: f64| {
        diag.rows_mut(start, len).fill(value);
    };
    set(POS, 3, ic.position);
    set(VEL, 3, ic.velocity);
    set(ATT, 3, ic.attitude);
    set(GYRO_BIAS, 3, ic.gyro_bias);
    set(ACC_BIAS, 3, ic.acc_bias);
    set(ANCHOR_POS, 3, ic.anchor_position);
    set(ANCHOR_ATT, 3, ic.anchor_attitude);
    for c in 0..layout.cameras {
        let s = layout.extrinsic(c);
        let (p, a) = if config.estimate_extrinsics {
            (ic.extrinsic_position, ic.extrinsic_attitude)
        } else {
            (0.0, 0.0)
        };
        set(s, 3, p);
        set(s + 3, 3, a);
    }
    for k in 0..layout.aux_poses {
        let s = layout.aux(k);
        set(s, 3, ic.auxiliary_position);
        set(s + 3, 3, ic.auxiliary_attitude);
    }
    let (bearing_var, depth_var) = feature_prior;
    for i in 0..layout.features {
        let s = layout.feature(i);
        set(s, 2, bearing_var);
        set(s + 2, 1, depth_var);
    }
    DMatrix::from_diagonal(&diag)
}

fn symmetrize(mut p: DMatrix<f64>) -> DMatrix<f64> {
    let n = p.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let v = 0.5 * (p[(i, j)] + p[(j, i)]);
            p[(i, j)] = v;
            p[(j, i)] = v;
        }
    }
    p
}

/// Finite, symmetric within tolerance, and positive semi-definite.
pub fn check_covariance(
    p: &DMatrix<f64>,
    numerics: &NumericsConfig,
) -> Result<(), DivergenceReason> {
    let n = p.nrows();
    for c in 0..n {
        for r in 0..n {
            if !p[(r, c)].is_finite() {
                return Err(DivergenceReason::NonFiniteCovariance { row: r, col: c });
            }
        }
    }

    let max_abs = p.amax();
    let mut asymmetry = 0.0f64;
    for i in 0..n {
        for j in (i + 1)..n {
            asymmetry = asymmetry.max((p[(i, j)] - p[(j, i)]).abs());
        }
    }
    let tolerance = numerics.symmetry_tolerance * (1.0 + max_abs);
    if asymmetry > tolerance {
        return Err(DivergenceReason::Asymmetric { asymmetry, tolerance });
    }

    let max_diag = p.diagonal().amax();
    let mut loaded = symmetrize(p.clone());
    let load = numerics.psd_tolerance * (1.0 + max_diag);
    for i in 0..n {
        loaded[(i, i)] += load;
    }
    if loaded.cholesky().is_none() {
        return Err(DivergenceReason::NotPositiveSemiDefinite);
    }
    Ok(())
}
