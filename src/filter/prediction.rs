//! IMU-driven prediction of the robocentric state.
//!
//! With ω = ω_m - b_g, f = f_m - b_a and g_A = R_WAᵀ g_W, one explicit step
//! of length dt is
//!
//! ```text
//! p' = p + dt R v
//! v' = v + dt (-ω × v + f + Rᵀ g_A)
//! R' = R Exp(ω dt)
//! ```
//!
//! Biases, anchor, extrinsics and features are constant; auxiliary poses
//! and features only receive process noise. Only rows 0..15 of the
//! transition matrix differ from identity, so the covariance is propagated
//! blockwise instead of through a full `F P Fᵀ`.

use nalgebra::{DMatrix, Matrix3, Vector3};

use super::layout::*;
use super::state::{FilterState, StateMean};
use crate::config::FilterConfig;
use crate::error::DivergenceReason;
use crate::geometry::{right_jacobian_so3, skew, so3};
use crate::imu::{gravity_world, ImuInput};

/// One explicit step of the mean. Does not touch biases or other blocks.
pub fn propagate_mean(mean: &StateMean, input: &ImuInput, dt: f64, gravity: f64) -> StateMean {
    let omega = input.gyro - mean.gyro_bias;
    let f = input.accel - mean.acc_bias;
    let g_a = mean.anchor.rotation.inverse() * gravity_world(gravity);
    let r = mean.attitude.to_rotation_matrix();

    let mut next = mean.clone();
    next.position = mean.position + dt * (r * mean.velocity);
    next.velocity = mean.velocity + dt * (-omega.cross(&mean.velocity) + f + r.transpose() * g_a);
    next.attitude = so3::boxplus(&mean.attitude, &(omega * dt));
    next
}

/// Rows 0..15, columns 0..21 of the error-state transition matrix for one
/// step. All other rows are identity.
pub fn transition_block(mean: &StateMean, input: &ImuInput, dt: f64, gravity: f64) -> DMatrix<f64> {
    let omega = input.gyro - mean.gyro_bias;
    let r_wa = mean.anchor.rotation_matrix();
    let g_w = gravity_world(gravity);
    let g_a = r_wa.transpose() * g_w;
    let r = mean.attitude.to_rotation_matrix().into_inner();
    let v = mean.velocity;
    let i3 = Matrix3::identity();

    let mut phi = DMatrix::zeros(PROPAGATED_DIM, CORE_DIM);
    let mut put = |row: usize, col: usize, m: &Matrix3<f64>| {
        phi.fixed_view_mut::<3, 3>(row, col).copy_from(m);
    };

    // δp'
    put(POS, POS, &i3);
    put(POS, VEL, &(dt * r));
    put(POS, ATT, &(-dt * r * skew(&v)));

    // δv'
    put(VEL, VEL, &(i3 - dt * skew(&omega)));
    put(VEL, ATT, &(dt * skew(&(r.transpose() * g_a))));
    put(VEL, GYRO_BIAS, &(-dt * skew(&v)));
    put(VEL, ACC_BIAS, &(-dt * i3));
    put(VEL, ANCHOR_ATT, &(dt * r.transpose() * skew(&g_a)));

    // δθ'
    let phi_step: Vector3<f64> = omega * dt;
    put(ATT, ATT, &so3::exp_matrix(&phi_step).transpose());
    put(ATT, GYRO_BIAS, &(-dt * right_jacobian_so3(&phi_step)));

    put(GYRO_BIAS, GYRO_BIAS, &i3);
    put(ACC_BIAS, ACC_BIAS, &i3);
    phi
}

/// Full `dim x dim` transition matrix. Only used for checks.
pub fn transition_matrix(
    mean: &StateMean,
    input: &ImuInput,
    dt: f64,
    gravity: f64,
) -> DMatrix<f64> {
    let dim = mean.layout().dim();
    let mut f = DMatrix::identity(dim, dim);
    let phi = transition_block(mean, input, dt, gravity);
    f.view_mut((0, 0), (PROPAGATED_DIM, CORE_DIM)).copy_from(&phi);
    f
}

/// `Φ P Φᵀ` with Φ the identity outside rows 0..15.
pub fn propagate_covariance(p: &DMatrix<f64>, phi: &DMatrix<f64>) -> DMatrix<f64> {
    let mut t = p.clone();
    let top = phi * p.rows(0, CORE_DIM);
    t.rows_mut(0, PROPAGATED_DIM).copy_from(&top);
    let left = t.columns(0, CORE_DIM) * phi.transpose();
    t.columns_mut(0, PROPAGATED_DIM).copy_from(&left);
    t
}

/// Add discrete process noise `Q dt` to the diagonal.
fn add_process_noise(state: &FilterState, p: &mut DMatrix<f64>, dt: f64, config: &FilterConfig) {
    let q = &config.process_noise;
    let layout = state.layout;
    let mut add = |start: usize, len: usize, density: f64| {
        for i in start..start + len {
            p[(i, i)] += density * dt;
        }
    };
    add(POS, 3, q.position);
    add(VEL, 3, q.velocity);
    add(ATT, 3, q.attitude);
    add(GYRO_BIAS, 3, q.gyro_bias);
    add(ACC_BIAS, 3, q.acc_bias);
    if config.estimate_extrinsics {
        for c in 0..layout.cameras {
            let s = layout.extrinsic(c);
            add(s, 3, q.extrinsic_position);
            add(s + 3, 3, q.extrinsic_attitude);
        }
    }
    for k in 0..layout.aux_poses {
        let s = layout.aux(k);
        add(s, 3, q.auxiliary_position);
        add(s + 3, 3, q.auxiliary_attitude);
    }
    for i in 0..layout.features {
        if state.slots.slot(i).valid {
            let s = layout.feature(i);
            add(s, 2, q.feature_bearing);
            add(s + 2, 1, q.feature_depth);
        }
    }
}

/// Propagate mean and covariance over `dt` seconds with constant `input`,
/// sub-stepping at `imu.max_step`. The covariance is health-checked before
/// it is committed.
pub fn predict(
    state: &mut FilterState,
    input: &ImuInput,
    dt: f64,
    config: &FilterConfig,
) -> Result<(), DivergenceReason> {
    if !(dt > 0.0) {
        return Ok(());
    }
    let steps = (dt / config.imu.max_step).ceil().max(1.0) as usize;
    let h = dt / steps as f64;
    let gravity = config.imu.gravity;

    let mut p = state.covariance().clone();
    let mut mean = state.mean.clone();
    for _ in 0..steps {
        let phi = transition_block(&mean, input, h, gravity);
        mean = propagate_mean(&mean, input, h, gravity);
        p = propagate_covariance(&p, &phi);
        add_process_noise(state, &mut p, h, config);
    }

    if let Some(block) = mean.first_non_finite() {
        return Err(DivergenceReason::NonFiniteMean { block });
    }
    state.commit_covariance(p, &config.numerics)?;
    state.mean = mean;
    Ok(())
}
