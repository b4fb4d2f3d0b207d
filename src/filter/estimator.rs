//! Synchronous estimator: owns the filter state and sequences prediction,
//! update, feature management and anchor resets for one timeline.
//!
//! The estimator is single-threaded; [`VioSystem`](crate::system::VioSystem)
//! wraps it in an estimation thread with an ordered event queue.

use image::GrayImage;
use tracing::{debug, error, info};

use super::anchor::{anchor_reset, reset_jacobian, reset_mean, should_reset};
use super::feature_manager::{add_features, feature_prior, prune};
use super::numeric::{max_abs_difference, numeric_state_jacobian};
use super::pose_update::{pose_update, PoseMeasurement, PoseUpdateReport};
use super::prediction::{predict, propagate_mean, transition_matrix};
use super::state::FilterState;
use super::update::{PhotometricUpdate, SkipReason, UpdateReport};
use crate::camera::Camera;
use crate::config::FilterConfig;
use crate::error::{DivergenceReason, VioError, VioResult};
use crate::imu::{gravity_aligned_attitude, ImuInitState, ImuInput, ImuSample};
use crate::system::snapshot::{EstimatorStats, FilterSnapshot};
use crate::vision::{ImagePyramid, Patch};

/// Largest absolute difference between analytic and finite-difference
/// Jacobians at the current state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JacobianCheck {
    pub prediction_max_error: f64,
    pub reset_max_error: f64,
}

impl JacobianCheck {
    pub fn max_error(&self) -> f64 {
        self.prediction_max_error.max(self.reset_max_error)
    }

    /// False if either map exceeds `tolerance` (or produced NaN).
    pub fn passes(&self, tolerance: f64) -> bool {
        self.prediction_max_error <= tolerance && self.reset_max_error <= tolerance
    }
}

pub struct Estimator {
    config: FilterConfig,
    cameras: Vec<Camera>,
    state: FilterState,
    /// One pre-allocated pyramid per camera.
    pyramids: Vec<ImagePyramid>,
    /// Per-level patch buffers reused by the update.
    scratch: Vec<Patch>,
    last_imu: Option<ImuSample>,
    images_since_reset: usize,
    diverged: Option<DivergenceReason>,
    stats: EstimatorStats,
}

impl Estimator {
    /// Validate `config` and allocate the state, pyramids and slot arena.
    pub fn new(config: FilterConfig) -> VioResult<Self> {
        config.validate()?;
        let cameras = config
            .cameras
            .iter()
            .cloned()
            .map(Camera::new)
            .collect::<VioResult<Vec<_>>>()?;
        let state = Self::initial_state(&config, &cameras);
        let pyramids = cameras
            .iter()
            .map(|c| ImagePyramid::new(c.width(), c.height(), config.pyramid_levels))
            .collect();
        let scratch = (0..config.pyramid_levels).map(|_| Patch::new(config.patch_size)).collect();

        info!(
            "estimator: {} camera(s), {} feature slots, {} aux pose(s), state dimension {}",
            cameras.len(),
            config.max_features,
            config.auxiliary_pose_count,
            state.layout.dim()
        );
        Ok(Self {
            config,
            cameras,
            state,
            pyramids,
            scratch,
            last_imu: None,
            images_since_reset: 0,
            diverged: None,
            stats: EstimatorStats::default(),
        })
    }

    fn initial_state(config: &FilterConfig, cameras: &[Camera]) -> FilterState {
        let extrinsics = cameras.iter().map(|c| *c.t_body_cam()).collect();
        FilterState::new(config, extrinsics, feature_prior(config, &cameras[0]))
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn cameras(&self) -> &[Camera] {
        &self.cameras
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }

    /// Mutable access for tests and tools. The next event re-checks the
    /// state before using it.
    pub fn state_mut(&mut self) -> &mut FilterState {
        &mut self.state
    }

    pub fn stats(&self) -> EstimatorStats {
        self.stats
    }

    pub fn record_late_event(&mut self) {
        self.stats.late_events_dropped += 1;
    }

    pub fn is_diverged(&self) -> bool {
        self.diverged.is_some()
    }

    pub fn divergence(&self) -> Option<&DivergenceReason> {
        self.diverged.as_ref()
    }

    pub fn snapshot(&self) -> FilterSnapshot {
        FilterSnapshot::capture(&self.state, self.stats)
    }

    /// Return to the configured prior. Buffers are reused.
    pub fn reset(&mut self) {
        self.state = Self::initial_state(&self.config, &self.cameras);
        self.last_imu = None;
        self.images_since_reset = 0;
        self.diverged = None;
        self.stats = EstimatorStats::default();
        info!("estimator reset");
    }

    fn diverge(&mut self, reason: DivergenceReason) -> VioError {
        error!("estimation diverged at t={:.6}: {}", self.state.timestamp, reason);
        self.diverged = Some(reason.clone());
        VioError::EstimationDivergence(reason)
    }

    /// Common entry checks: not diverged, state healthy, timestamp not stale.
    fn admit(&mut self, timestamp: f64) -> VioResult<()> {
        if let Some(reason) = &self.diverged {
            return Err(VioError::EstimationDivergence(reason.clone()));
        }
        if !timestamp.is_finite() {
            return Err(VioError::InvalidMeasurement(format!("timestamp {}", timestamp)));
        }
        if let Err(reason) = self.state.check_health(&self.config.numerics) {
            return Err(self.diverge(reason));
        }
        if timestamp < self.state.timestamp {
            return Err(VioError::StaleTimestamp { timestamp, committed: self.state.timestamp });
        }
        Ok(())
    }

    /// Predict to `timestamp` holding the newest IMU sample.
    fn predict_to(&mut self, timestamp: f64) -> VioResult<()> {
        let Some(last) = self.last_imu else {
            return Ok(());
        };
        let dt = timestamp - self.state.timestamp;
        if dt > 0.0 {
            let input = ImuInput::from_sample(&last);
            if let Err(reason) = predict(&mut self.state, &input, dt, &self.config) {
                return Err(self.diverge(reason));
            }
            self.state.timestamp = timestamp;
        }
        Ok(())
    }

    pub fn process_imu(&mut self, sample: ImuSample) -> VioResult<()> {
        if !sample.is_finite() {
            return Err(VioError::InvalidMeasurement("non-finite IMU sample".to_string()));
        }
        self.admit(sample.timestamp_s)?;

        match self.last_imu {
            None => {
                if let Some(q) = gravity_aligned_attitude(&sample.accel) {
                    self.state.mean.anchor.rotation = q;
                }
                self.state.init = ImuInitState::GravityAligned;
                self.state.timestamp = sample.timestamp_s;
                info!("gravity aligned at t={:.6}", sample.timestamp_s);
            }
            Some(prev) => {
                let dt = sample.timestamp_s - self.state.timestamp;
                if dt > 0.0 {
                    let input = self.config.imu.integrator.input(&prev, &sample);
                    if let Err(reason) = predict(&mut self.state, &input, dt, &self.config) {
                        return Err(self.diverge(reason));
                    }
                }
                self.state.timestamp = sample.timestamp_s;
            }
        }
        self.last_imu = Some(sample);
        self.stats.imu_processed += 1;
        Ok(())
    }

    /// Predict to `timestamp` and run one update with the image of `camera`.
    pub fn process_image(
        &mut self,
        timestamp: f64,
        camera: usize,
        image: &GrayImage,
    ) -> VioResult<UpdateReport> {
        if camera >= self.cameras.len() {
            return Err(VioError::InvalidMeasurement(format!(
                "camera {} does not exist ({} configured)",
                camera,
                self.cameras.len()
            )));
        }
        self.admit(timestamp)?;
        if self.last_imu.is_none() {
            let mut report = UpdateReport::new(timestamp, camera);
            report.skipped = Some(SkipReason::AwaitingImu);
            self.stats.images_processed += 1;
            self.stats.updates_skipped += 1;
            debug!("image at t={:.6} before first IMU sample", timestamp);
            return Ok(report);
        }
        self.pyramids[camera].build(image)?;
        self.predict_to(timestamp)?;

        let update = PhotometricUpdate {
            config: &self.config,
            camera_idx: camera,
            camera: &self.cameras[camera],
            pyramid: &self.pyramids[camera],
        };
        let result = update.apply(&mut self.state, timestamp, &mut self.scratch);
        let mut report = result.map_err(|reason| self.diverge(reason))?;
        self.ensure_healthy()?;

        report.removed = prune(&mut self.state, &self.cameras, &self.config);

        self.images_since_reset += 1;
        if should_reset(&self.state.mean, self.images_since_reset, &self.config.anchor_reset) {
            if let Err(reason) = anchor_reset(&mut self.state, &self.config.numerics) {
                return Err(self.diverge(reason));
            }
            self.images_since_reset = 0;
            self.stats.anchor_resets += 1;
            report.anchor_reset = true;
        }

        // Refill after an accepted update, or to bootstrap a camera with
        // no tracks left.
        let bootstrap = self.state.slots.valid_for_camera(camera).is_empty();
        if report.skipped.is_none() || bootstrap {
            report.added = add_features(
                &mut self.state,
                camera,
                &self.cameras[camera],
                &self.pyramids[camera],
                &self.config,
            );
            self.ensure_healthy()?;
        }

        self.stats.images_processed += 1;
        if report.skipped.is_some() {
            self.stats.updates_skipped += 1;
        }
        Ok(report)
    }

    /// Predict to the measurement time and apply an external pose update.
    pub fn process_pose(&mut self, measurement: &PoseMeasurement) -> VioResult<PoseUpdateReport> {
        self.admit(measurement.timestamp)?;
        if self.last_imu.is_none() {
            return Ok(PoseUpdateReport {
                timestamp: measurement.timestamp,
                aux_index: measurement.aux_index,
                mahalanobis: None,
                accepted: false,
            });
        }
        self.predict_to(measurement.timestamp)?;
        let report = match pose_update(&mut self.state, measurement, &self.config) {
            Ok(report) => report,
            Err(VioError::EstimationDivergence(reason)) => return Err(self.diverge(reason)),
            Err(e) => return Err(e),
        };
        self.stats.poses_processed += 1;
        Ok(report)
    }

    fn ensure_healthy(&mut self) -> VioResult<()> {
        match self.state.check_health(&self.config.numerics) {
            Ok(()) => Ok(()),
            Err(reason) => Err(self.diverge(reason)),
        }
    }

    /// Compare the analytic prediction and anchor-reset Jacobians with
    /// finite differences at the current state, using the newest IMU
    /// sample (or a level hover) as input.
    pub fn check_jacobians(&self) -> JacobianCheck {
        let eps = self.config.pose_update.finite_difference_step;
        let gravity = self.config.imu.gravity;
        let input = self.last_imu.map(|s| ImuInput::from_sample(&s)).unwrap_or(ImuInput {
            gyro: nalgebra::Vector3::zeros(),
            accel: nalgebra::Vector3::new(0.0, 0.0, gravity),
        });
        let dt = self.config.imu.max_step;
        let mean = &self.state.mean;

        let analytic = transition_matrix(mean, &input, dt, gravity);
        let numeric = numeric_state_jacobian(mean, eps, |m| propagate_mean(m, &input, dt, gravity));
        let prediction_max_error = max_abs_difference(&analytic, &numeric);

        let valid: Vec<bool> = self.state.slots.slots().iter().map(|s| s.valid).collect();
        let depth = self.state.depth;
        let analytic = reset_jacobian(mean, &valid, depth);
        let numeric = numeric_state_jacobian(mean, eps, |m| reset_mean(m, &valid, depth));
        let reset_max_error = max_abs_difference(&analytic, &numeric);

        debug!(
            "Jacobian check: prediction {:.2e}, reset {:.2e}",
            prediction_max_error, reset_max_error
        );
        JacobianCheck { prediction_max_error, reset_max_error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraCalibration;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn config() -> FilterConfig {
        FilterConfig {
            max_features: 4,
            cameras: vec![CameraCalibration::pinhole(160, 120, 100.0)],
            ..FilterConfig::default()
        }
    }

    fn still(t: f64) -> ImuSample {
        ImuSample::new(t, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros())
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = FilterConfig { patch_size: 5, ..config() };
        assert!(matches!(Estimator::new(config), Err(VioError::Configuration(_))));
    }

    #[test]
    fn test_first_imu_sample_aligns_gravity() {
        let mut est = Estimator::new(config()).unwrap();
        let tilted = Vector3::new(0.0, 9.81 * 0.2f64.sin(), 9.81 * 0.2f64.cos());
        est.process_imu(ImuSample::new(0.0, tilted, Vector3::zeros())).unwrap();
        let snap = est.snapshot();
        assert!(snap.initialized);
        // Measured specific force points up in the world.
        let up = snap.world_pose.rotation * tilted.normalize();
        assert_relative_eq!(up, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-9);
    }

    #[test]
    fn test_image_before_imu_is_skipped() {
        let mut est = Estimator::new(config()).unwrap();
        let report = est.process_image(0.0, 0, &GrayImage::new(160, 120)).unwrap();
        assert_eq!(report.skipped, Some(SkipReason::AwaitingImu));
        assert_eq!(est.state().slots.valid_count(), 0);
    }

    #[test]
    fn test_bad_camera_and_size_rejected() {
        let mut est = Estimator::new(config()).unwrap();
        est.process_imu(still(0.0)).unwrap();
        assert!(matches!(
            est.process_image(0.1, 3, &GrayImage::new(160, 120)),
            Err(VioError::InvalidMeasurement(_))
        ));
        assert!(matches!(
            est.process_image(0.1, 0, &GrayImage::new(100, 120)),
            Err(VioError::InvalidMeasurement(_))
        ));
        // Nothing moved.
        assert_eq!(est.state().timestamp, 0.0);
    }

    #[test]
    fn test_stale_imu_rejected() {
        let mut est = Estimator::new(config()).unwrap();
        est.process_imu(still(1.0)).unwrap();
        est.process_imu(still(1.0)).unwrap();
        assert!(matches!(est.process_imu(still(0.5)), Err(VioError::StaleTimestamp { .. })));
    }

    #[test]
    fn test_divergence_is_sticky_until_reset() {
        let mut est = Estimator::new(config()).unwrap();
        est.process_imu(still(0.0)).unwrap();
        est.state_mut().mean.velocity.x = f64::NAN;
        assert!(matches!(est.process_imu(still(0.01)), Err(VioError::EstimationDivergence(_))));
        assert!(est.is_diverged());
        assert!(matches!(est.process_imu(still(0.02)), Err(VioError::EstimationDivergence(_))));
        est.reset();
        assert!(!est.is_diverged());
        est.process_imu(still(0.03)).unwrap();
    }

    #[test]
    fn test_jacobian_self_check() {
        let mut est = Estimator::new(config()).unwrap();
        let accel = Vector3::new(0.3, 0.1, 9.7);
        let gyro = Vector3::new(0.1, -0.2, 0.3);
        est.process_imu(ImuSample::new(0.0, accel, gyro)).unwrap();
        est.process_imu(ImuSample::new(0.2, accel, gyro)).unwrap();
        let check = est.check_jacobians();
        assert!(check.prediction_max_error < 1e-6);
        assert!(check.reset_max_error < 1e-6);
        assert!(check.passes(est.config().numerics.jacobian_check_tolerance));
    }

    #[test]
    fn test_jacobian_check_before_first_sample() {
        let est = Estimator::new(config()).unwrap();
        let check = est.check_jacobians();
        assert!(check.passes(est.config().numerics.jacobian_check_tolerance));

        let broken = JacobianCheck { prediction_max_error: 1e-9, reset_max_error: f64::NAN };
        assert!(!broken.passes(1e-6));
    }
}
