//! Immutable copy of the filter state published to consumers.

use nalgebra::{DMatrix, Matrix3, UnitQuaternion, Vector2, Vector3};

use crate::filter::feature::TrackStatus;
use crate::filter::layout::*;
use crate::filter::FilterState;
use crate::geometry::{skew, SE3};
use crate::imu::ImuInitState;

/// Counters kept by the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EstimatorStats {
    pub imu_processed: u64,
    pub images_processed: u64,
    pub poses_processed: u64,
    /// Events older than the state when they reached the estimation thread.
    pub late_events_dropped: u64,
    /// Images that contributed prediction only.
    pub updates_skipped: u64,
    pub anchor_resets: u64,
}

/// One feature slot. Invalid slots are included with `valid = false`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSnapshot {
    pub slot: usize,
    pub id: u64,
    pub valid: bool,
    pub camera: usize,
    pub anchor_epoch: u64,
    /// Unit bearing in the anchor frame.
    pub bearing: Vector3<f64>,
    /// Metric distance from the anchor origin.
    pub distance: f64,
    /// First-order standard deviation of `distance`.
    pub distance_sigma: f64,
    pub position_world: Vector3<f64>,
    pub age: usize,
    pub observed: usize,
    pub status: TrackStatus,
    pub consecutive_failures: usize,
    pub last_pixel: Option<Vector2<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterSnapshot {
    pub timestamp: f64,
    /// True once the first IMU sample has aligned the filter with gravity.
    pub initialized: bool,
    /// T_WB
    pub world_pose: SE3,
    /// T_AB
    pub robocentric_pose: SE3,
    /// T_WA
    pub anchor_pose: SE3,
    pub anchor_epoch: u64,
    pub velocity_body: Vector3<f64>,
    pub velocity_world: Vector3<f64>,
    pub gyro_bias: Vector3<f64>,
    pub acc_bias: Vector3<f64>,
    /// T_BC per camera.
    pub extrinsics: Vec<SE3>,
    /// T_EW per auxiliary frame.
    pub aux_poses: Vec<SE3>,
    /// Covariance of p_WB.
    pub position_covariance_world: Matrix3<f64>,
    pub features: Vec<FeatureSnapshot>,
    pub stats: EstimatorStats,
}

impl FilterSnapshot {
    pub fn capture(state: &FilterState, stats: EstimatorStats) -> Self {
        let mean = &state.mean;
        let world_pose = mean.world_pose();
        let p = state.covariance();
        let n = state.layout.dim();

        // p_WB = p_WA + R_WA p_AB
        let r_wa = mean.anchor.rotation_matrix();
        let mut j = DMatrix::zeros(3, n);
        j.fixed_view_mut::<3, 3>(0, ANCHOR_POS).copy_from(&Matrix3::identity());
        j.fixed_view_mut::<3, 3>(0, ANCHOR_ATT).copy_from(&(-r_wa * skew(&mean.position)));
        j.fixed_view_mut::<3, 3>(0, POS).copy_from(&r_wa);
        let cov = &j * p * j.transpose();
        let position_covariance_world = Matrix3::from_fn(|r, c| cov[(r, c)]);

        let features = state
            .slots
            .slots()
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                let f = &mean.features[i];
                let s = state.layout.feature(i);
                let distance = state.depth.distance(f.depth);
                let distance_sigma = state.depth.derivative(f.depth).abs() * state.sigma(s + 2);
                FeatureSnapshot {
                    slot: i,
                    id: slot.id,
                    valid: slot.valid,
                    camera: slot.camera,
                    anchor_epoch: slot.anchor_epoch,
                    bearing: f.bearing.vector(),
                    distance,
                    distance_sigma,
                    position_world: mean
                        .anchor
                        .transform_point(&mean.feature_point(i, state.depth)),
                    age: slot.stats.age,
                    observed: slot.stats.observed,
                    status: slot.stats.status,
                    consecutive_failures: slot.stats.consecutive_failures,
                    last_pixel: slot.last_pixel,
                }
            })
            .collect();

        Self {
            timestamp: state.timestamp,
            initialized: state.init == ImuInitState::GravityAligned,
            world_pose,
            robocentric_pose: mean.robocentric_pose(),
            anchor_pose: mean.anchor,
            anchor_epoch: state.anchor_epoch,
            velocity_body: mean.velocity,
            velocity_world: world_pose.rotation * mean.velocity,
            gyro_bias: mean.gyro_bias,
            acc_bias: mean.acc_bias,
            extrinsics: mean.extrinsics.clone(),
            aux_poses: mean.aux_poses.clone(),
            position_covariance_world,
            features,
            stats,
        }
    }

    pub fn valid_features(&self) -> impl Iterator<Item = &FeatureSnapshot> {
        self.features.iter().filter(|f| f.valid)
    }

    pub fn position(&self) -> Vector3<f64> {
        self.world_pose.translation
    }

    pub fn attitude(&self) -> UnitQuaternion<f64> {
        self.world_pose.rotation
    }

    /// True if every published pose, velocity and valid feature is finite.
    pub fn is_finite(&self) -> bool {
        let finite3 = |v: &Vector3<f64>| v.iter().all(|x| x.is_finite());
        self.world_pose.is_finite()
            && self.anchor_pose.is_finite()
            && finite3(&self.velocity_body)
            && finite3(&self.gyro_bias)
            && finite3(&self.acc_bias)
            && self.position_covariance_world.iter().all(|x| x.is_finite())
            && self.valid_features().all(|f| finite3(&f.bearing) && f.distance.is_finite())
    }
}
