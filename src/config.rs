//! Filter configuration.
//!
//! Every section is `#[serde(default)]`, so a YAML file only needs the keys
//! it changes. [`FilterConfig::validate`] is run by the estimator before it
//! allocates anything; a failing configuration never starts a session.

use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::camera::CameraCalibration;
use crate::error::{VioError, VioResult};
use crate::filter::feature::DepthParameterization;
use crate::filter::robust::RobustKernel;
use crate::imu::{ImuIntegrator, GRAVITY_MAGNITUDE};

/// Upper bound on `pyramid_levels`; level scales are `1 << level`.
pub const MAX_PYRAMID_LEVELS: usize = 16;

/// Top-level filter configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Number of feature slots (K).
    /// Default: 25
    pub max_features: usize,

    /// Number of pyramid levels including the full-resolution image,
    /// at most `MAX_PYRAMID_LEVELS`.
    /// Default: 4
    pub pyramid_levels: usize,

    /// Side of the square patch in pixels. Must be even.
    /// Default: 6
    pub patch_size: usize,

    /// Number of cameras (N). Must equal `cameras.len()`.
    /// Default: 1
    pub camera_count: usize,

    /// Number of auxiliary pose blocks (M).
    /// Default: 0
    pub auxiliary_pose_count: usize,

    /// Estimate camera extrinsics online. When false the extrinsic blocks
    /// keep zero covariance and never move.
    /// Default: true
    pub estimate_extrinsics: bool,

    pub imu: ImuConfig,
    pub process_noise: ProcessNoiseConfig,
    pub initial_covariance: InitialCovarianceConfig,
    pub update: UpdateConfig,
    pub features: FeatureConfig,
    pub anchor_reset: AnchorResetConfig,
    pub pose_update: PoseUpdateConfig,
    pub orchestrator: OrchestratorConfig,
    pub numerics: NumericsConfig,

    /// One record per camera.
    pub cameras: Vec<CameraCalibration>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_features: 25,
            pyramid_levels: 4,
            patch_size: 6,
            camera_count: 1,
            auxiliary_pose_count: 0,
            estimate_extrinsics: true,
            imu: ImuConfig::default(),
            process_noise: ProcessNoiseConfig::default(),
            initial_covariance: InitialCovarianceConfig::default(),
            update: UpdateConfig::default(),
            features: FeatureConfig::default(),
            anchor_reset: AnchorResetConfig::default(),
            pose_update: PoseUpdateConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            numerics: NumericsConfig::default(),
            cameras: vec![CameraCalibration::default()],
        }
    }
}

/// Inertial sensor parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    /// Gravity magnitude (m/s²).
    /// Default: 9.81
    pub gravity: f64,

    /// Integration scheme.
    /// Default: euler
    pub integrator: ImuIntegrator,

    /// Longest single prediction sub-step (s); longer gaps are subdivided.
    /// Default: 0.01
    pub max_step: f64,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self { gravity: GRAVITY_MAGNITUDE, integrator: ImuIntegrator::Euler, max_step: 0.01 }
    }
}

/// Continuous-time process noise, as variance per second of each block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessNoiseConfig {
    pub position: f64,
    pub velocity: f64,
    pub attitude: f64,
    pub gyro_bias: f64,
    pub acc_bias: f64,
    pub extrinsic_position: f64,
    pub extrinsic_attitude: f64,
    pub auxiliary_position: f64,
    pub auxiliary_attitude: f64,
    /// Per tangent direction (rad²/s).
    pub feature_bearing: f64,
    /// In units of the depth parameterization.
    pub feature_depth: f64,
}

impl Default for ProcessNoiseConfig {
    fn default() -> Self {
        Self {
            position: 1e-4,
            velocity: 4e-5,
            attitude: 7.6e-7,
            gyro_bias: 3.8e-7,
            acc_bias: 1e-8,
            extrinsic_position: 1e-8,
            extrinsic_attitude: 1e-8,
            auxiliary_position: 1e-8,
            auxiliary_attitude: 1e-8,
            feature_bearing: 1e-5,
            feature_depth: 1e-4,
        }
    }
}

impl ProcessNoiseConfig {
    fn values(&self) -> [(&'static str, f64); 11] {
        [
            ("position", self.position),
            ("velocity", self.velocity),
            ("attitude", self.attitude),
            ("gyro_bias", self.gyro_bias),
            ("acc_bias", self.acc_bias),
            ("extrinsic_position", self.extrinsic_position),
            ("extrinsic_attitude", self.extrinsic_attitude),
            ("auxiliary_position", self.auxiliary_position),
            ("auxiliary_attitude", self.auxiliary_attitude),
            ("feature_bearing", self.feature_bearing),
            ("feature_depth", self.feature_depth),
        ]
    }
}

/// Prior variances (diagonal) at construction and reset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialCovarianceConfig {
    /// Robocentric position; zero because the anchor starts at the body.
    pub position: f64,
    pub velocity: f64,
    /// Robocentric attitude; zero for the same reason as `position`.
    pub attitude: f64,
    pub gyro_bias: f64,
    pub acc_bias: f64,
    /// World position of the anchor; zero fixes the world origin.
    pub anchor_position: f64,
    /// World attitude of the anchor (roll/pitch from gravity, yaw free).
    pub anchor_attitude: f64,
    pub extrinsic_position: f64,
    pub extrinsic_attitude: f64,
    pub auxiliary_position: f64,
    pub auxiliary_attitude: f64,
}

impl Default for InitialCovarianceConfig {
    fn default() -> Self {
        Self {
            position: 0.0,
            velocity: 1e-2,
            attitude: 0.0,
            gyro_bias: 1e-4,
            acc_bias: 4e-4,
            anchor_position: 0.0,
            anchor_attitude: 1e-2,
            extrinsic_position: 1e-4,
            extrinsic_attitude: 1e-4,
            auxiliary_position: 1.0,
            auxiliary_attitude: 1e-1,
        }
    }
}

impl InitialCovarianceConfig {
    fn values(&self) -> [(&'static str, f64); 11] {
        [
            ("position", self.position),
            ("velocity", self.velocity),
            ("attitude", self.attitude),
            ("gyro_bias", self.gyro_bias),
            ("acc_bias", self.acc_bias),
            ("anchor_position", self.anchor_position),
            ("anchor_attitude", self.anchor_attitude),
            ("extrinsic_position", self.extrinsic_position),
            ("extrinsic_attitude", self.extrinsic_attitude),
            ("auxiliary_position", self.auxiliary_position),
            ("auxiliary_attitude", self.auxiliary_attitude),
        ]
    }
}

/// Photometric iterated update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Iteration cap of the IEKF loop.
    /// Default: 10
    pub max_iterations: usize,

    /// The loop stops once every component of the state step is below this.
    /// Default: 1e-4
    pub convergence_threshold: f64,

    /// A feature counts as converged when its predicted pixel moved less
    /// than this (pixels) in the last iteration.
    /// Default: 0.1
    pub pixel_convergence_threshold: f64,

    /// Standard deviation of image intensity noise (intensity levels).
    /// Default: 10.0
    pub intensity_sigma: f64,

    /// Robust kernel on pixel residuals.
    /// Default: huber, threshold 20
    pub robust_kernel: RobustKernel,

    /// Chi-square gate on the 2-dof innovation of each feature.
    /// Default: 13.8 (99.9 %)
    pub mahalanobis_gate: f64,

    /// A feature whose mean absolute intensity error (over all pixels of
    /// the levels it used) exceeds this is an outlier for the frame.
    /// Default: 50.0
    pub patch_rejection_threshold: f64,

    /// Fewer converged features than this skips the update.
    /// Default: 3
    pub min_converged_features: usize,

    /// Finest pyramid level used by the update.
    /// Default: 0
    pub finest_level: usize,

    /// Coarsest level used; `None` means the top of the pyramid.
    /// Default: None
    pub coarsest_level: Option<usize>,

    /// Minimum eigenvalue of a feature's summed structure tensor.
    /// Default: 10.0
    pub min_patch_information: f64,

    /// Subtract the patch means before comparing intensities.
    /// Default: false
    pub normalize_intensity: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            convergence_threshold: 1e-4,
            pixel_convergence_threshold: 0.1,
            intensity_sigma: 10.0,
            robust_kernel: RobustKernel::default(),
            mahalanobis_gate: 13.8,
            patch_rejection_threshold: 50.0,
            min_converged_features: 3,
            finest_level: 0,
            coarsest_level: None,
            min_patch_information: 10.0,
            normalize_intensity: false,
        }
    }
}

/// Feature initialization and removal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// How depth is stored in the state.
    /// Default: inverse
    pub depth_parameterization: DepthParameterization,

    /// Distance (m) assigned to a new feature.
    /// Default: 2.0
    pub initial_distance: f64,

    /// Prior standard deviation of depth, in parameterization units.
    /// Default: 0.5
    pub initial_depth_sigma: f64,

    /// Prior standard deviation of bearing, in pixels.
    /// Default: 2.0
    pub initial_bearing_sigma_px: f64,

    /// Minimum spacing (pixels) between a new feature and existing ones.
    /// Default: 20.0
    pub min_feature_distance_px: f64,

    /// Pyramid level on which corners are scored.
    /// Default: 1
    pub detection_level: usize,

    /// Minimum Shi-Tomasi score (mean min-eigenvalue, intensity²/px²).
    /// Default: 10.0
    pub min_corner_score: f64,

    /// Non-maximum-suppression bucket side at the detection level (pixels).
    /// Default: 16
    pub bucket_size_px: usize,

    /// Half-width of the corner scoring window (pixels).
    /// Default: 2
    pub corner_window_half: usize,

    /// Extra margin (level-0 pixels) kept clear of the image border on top
    /// of what patch extraction requires.
    /// Default: 4.0
    pub border_margin_px: f64,

    /// A feature failing this many consecutive frames is removed.
    /// Default: 3
    pub max_consecutive_failures: usize,

    /// Quality (observed / age) below which mature features are removed.
    /// Default: 0.5
    pub min_track_quality: f64,

    /// Age (frames) from which `min_track_quality` is enforced.
    /// Default: 10
    pub min_age_for_quality: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            depth_parameterization: DepthParameterization::Inverse,
            initial_distance: 2.0,
            initial_depth_sigma: 0.5,
            initial_bearing_sigma_px: 2.0,
            min_feature_distance_px: 20.0,
            detection_level: 1,
            min_corner_score: 10.0,
            bucket_size_px: 16,
            corner_window_half: 2,
            border_margin_px: 4.0,
            max_consecutive_failures: 3,
            min_track_quality: 0.5,
            min_age_for_quality: 10,
        }
    }
}

/// When the robocentric anchor is moved to the current body pose.
/// A criterion set to zero is disabled; at least one must be enabled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorResetConfig {
    /// Reset every n-th image.
    /// Default: 1
    pub interval_images: usize,

    /// Reset once the body is this far (m) from the anchor.
    /// Default: 0.0
    pub max_translation: f64,

    /// Reset once the body is rotated this much (deg) from the anchor.
    /// Default: 0.0
    pub max_rotation_deg: f64,
}

impl Default for AnchorResetConfig {
    fn default() -> Self {
        Self { interval_images: 1, max_translation: 0.0, max_rotation_deg: 0.0 }
    }
}

/// External absolute pose updates on the auxiliary blocks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseUpdateConfig {
    /// Chi-square gate on the 6-dof innovation.
    /// Default: 22.46 (99.9 %)
    pub mahalanobis_gate: f64,

    /// Finite-difference step of the measurement Jacobian.
    /// Default: 1e-6
    pub finite_difference_step: f64,
}

impl Default for PoseUpdateConfig {
    fn default() -> Self {
        Self { mahalanobis_gate: 22.46, finite_difference_step: 1e-6 }
    }
}

/// Threaded orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Events are held this long (s, measurement time) to absorb
    /// out-of-order arrival across sensors.
    /// Default: 0.02
    pub reorder_horizon: f64,

    /// Capacity of the ingestion channel; producers block when it is full.
    /// Default: 1024
    pub queue_capacity: usize,

    /// With no input for this long (ms) every queued event is processed.
    /// Default: 50
    pub idle_flush_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { reorder_horizon: 0.02, queue_capacity: 1024, idle_flush_ms: 50 }
    }
}

/// Covariance health check.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumericsConfig {
    /// Allowed `max|P - Pᵀ|`, relative to `1 + max|P|`.
    /// Default: 1e-9
    pub symmetry_tolerance: f64,

    /// Diagonal loading (relative to `1 + max diag`) for the PSD test.
    /// Default: 1e-9
    pub psd_tolerance: f64,

    /// Largest analytic vs. finite-difference Jacobian error accepted by
    /// the start-up self-test.
    /// Default: 1e-6
    pub jacobian_check_tolerance: f64,
}

impl Default for NumericsConfig {
    fn default() -> Self {
        Self { symmetry_tolerance: 1e-9, psd_tolerance: 1e-9, jacobian_check_tolerance: 1e-6 }
    }
}

fn config_error<T>(msg: String) -> VioResult<T> {
    Err(VioError::Configuration(msg))
}

impl FilterConfig {
    /// Load a YAML file. Missing keys take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> VioResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            VioError::Configuration(format!("failed to open {}: {}", path.display(), e))
        })?;
        let config: Self = serde_yaml::from_reader(file).map_err(|e| {
            VioError::Configuration(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> VioResult<Self> {
        let config: Self = serde_yaml::from_str(text)
            .map_err(|e| VioError::Configuration(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Coarsest pyramid level used by the update.
    pub fn coarsest_level(&self) -> usize {
        self.update
            .coarsest_level
            .unwrap_or(self.pyramid_levels.saturating_sub(1))
            .min(self.pyramid_levels.saturating_sub(1))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> VioResult<()> {
        if self.patch_size < 2 || self.patch_size % 2 != 0 {
            return config_error(format!(
                "patch_size must be even and >= 2, got {}",
                self.patch_size
            ));
        }
        if self.pyramid_levels == 0 || self.pyramid_levels > MAX_PYRAMID_LEVELS {
            return config_error(format!(
                "pyramid_levels must be in 1..={}, got {}",
                MAX_PYRAMID_LEVELS, self.pyramid_levels
            ));
        }
        if self.max_features == 0 {
            return config_error("max_features must be >= 1".to_string());
        }
        if self.camera_count == 0 {
            return config_error("camera_count must be >= 1".to_string());
        }
        if self.cameras.len() != self.camera_count {
            return config_error(format!(
                "camera_count is {} but {} camera record(s) were given",
                self.camera_count,
                self.cameras.len()
            ));
        }

        if !(self.imu.gravity > 0.0 && self.imu.gravity.is_finite()) {
            return config_error(format!("imu.gravity must be > 0, got {}", self.imu.gravity));
        }
        if !(self.imu.max_step > 0.0) {
            return config_error(format!("imu.max_step must be > 0, got {}", self.imu.max_step));
        }

        for (name, value) in self.process_noise.values() {
            if !(value >= 0.0 && value.is_finite()) {
                return config_error(format!("process_noise.{} must be >= 0, got {}", name, value));
            }
        }
        for (name, value) in self.initial_covariance.values() {
            if !(value >= 0.0 && value.is_finite()) {
                return config_error(format!(
                    "initial_covariance.{} must be >= 0, got {}",
                    name, value
                ));
            }
        }

        let u = &self.update;
        if u.max_iterations < 2 {
            return config_error(format!(
                "update.max_iterations must be >= 2, got {}",
                u.max_iterations
            ));
        }
        let positive = [
            ("update.convergence_threshold", u.convergence_threshold),
            ("update.pixel_convergence_threshold", u.pixel_convergence_threshold),
            ("update.intensity_sigma", u.intensity_sigma),
            ("update.mahalanobis_gate", u.mahalanobis_gate),
            ("update.patch_rejection_threshold", u.patch_rejection_threshold),
            ("features.initial_distance", self.features.initial_distance),
            ("features.initial_depth_sigma", self.features.initial_depth_sigma),
            ("features.initial_bearing_sigma_px", self.features.initial_bearing_sigma_px),
            ("pose_update.mahalanobis_gate", self.pose_update.mahalanobis_gate),
            ("pose_update.finite_difference_step", self.pose_update.finite_difference_step),
            ("numerics.symmetry_tolerance", self.numerics.symmetry_tolerance),
            ("numerics.psd_tolerance", self.numerics.psd_tolerance),
            ("numerics.jacobian_check_tolerance", self.numerics.jacobian_check_tolerance),
        ];
        for (name, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return config_error(format!("{} must be > 0, got {}", name, value));
            }
        }
        if let Some(scale) = u.robust_kernel.scale() {
            if !(scale > 0.0) {
                return config_error(format!("robust kernel scale must be > 0, got {}", scale));
            }
        }
        if u.finest_level >= self.pyramid_levels {
            return config_error(format!(
                "update.finest_level {} must be < pyramid_levels {}",
                u.finest_level, self.pyramid_levels
            ));
        }
        if u.finest_level > self.coarsest_level() {
            return config_error(format!(
                "update.finest_level {} is coarser than update.coarsest_level {}",
                u.finest_level,
                self.coarsest_level()
            ));
        }
        if u.min_converged_features == 0 {
            return config_error("update.min_converged_features must be >= 1".to_string());
        }

        let f = &self.features;
        if f.detection_level >= self.pyramid_levels {
            return config_error(format!(
                "features.detection_level {} must be < pyramid_levels {}",
                f.detection_level, self.pyramid_levels
            ));
        }
        if f.bucket_size_px == 0 {
            return config_error("features.bucket_size_px must be >= 1".to_string());
        }
        if f.min_feature_distance_px < 0.0 || f.border_margin_px < 0.0 {
            return config_error("feature distances and margins must be >= 0".to_string());
        }
        let initial_parameter = f.depth_parameterization.parameter(f.initial_distance);
        if !f.depth_parameterization.is_valid(initial_parameter) {
            return config_error(format!(
                "initial distance {} is not representable",
                f.initial_distance
            ));
        }

        let a = &self.anchor_reset;
        if a.interval_images == 0 && a.max_translation <= 0.0 && a.max_rotation_deg <= 0.0 {
            return config_error("anchor_reset needs at least one enabled criterion".to_string());
        }

        if !(self.orchestrator.reorder_horizon >= 0.0) {
            return config_error("orchestrator.reorder_horizon must be >= 0".to_string());
        }
        if self.orchestrator.queue_capacity == 0 {
            return config_error("orchestrator.queue_capacity must be >= 1".to_string());
        }

        // The coarsest level must still hold a patch with its gradient border.
        let scale = 1usize << self.coarsest_level();
        let min_side = (self.patch_size + 4) * scale;
        for (i, camera) in self.cameras.iter().enumerate() {
            camera.validate().map_err(|e| match e {
                VioError::Configuration(msg) => {
                    VioError::Configuration(format!("camera {}: {}", i, msg))
                }
                other => other,
            })?;
            if (camera.width as usize) < min_side || (camera.height as usize) < min_side {
                return config_error(format!(
                    "camera {} ({}x{}) is too small for {} px patches on level {}",
                    i,
                    camera.width,
                    camera.height,
                    self.patch_size,
                    self.coarsest_level()
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        FilterConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = FilterConfig::from_yaml_str(
            concat!(
                "max_features: 12\n",
                "update:\n",
                "  max_iterations: 4\n",
                "  robust_kernel: {kind: cauchy, scale: 15.0}\n",
            ),
        )
        .unwrap();
        assert_eq!(config.max_features, 12);
        assert_eq!(config.update.max_iterations, 4);
        assert_eq!(config.update.robust_kernel, RobustKernel::Cauchy { scale: 15.0 });
        assert_eq!(config.patch_size, 6);
        assert_eq!(config.features.depth_parameterization, DepthParameterization::Inverse);
    }

    #[test]
    fn test_odd_patch_size_rejected() {
        let config = FilterConfig { patch_size: 5, ..FilterConfig::default() };
        assert!(matches!(config.validate(), Err(VioError::Configuration(_))));
    }

    #[test]
    fn test_camera_count_mismatch_rejected() {
        let config = FilterConfig { camera_count: 2, ..FilterConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_noise_rejected() {
        let mut config = FilterConfig::default();
        config.process_noise.velocity = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disabled_anchor_reset_rejected() {
        let mut config = FilterConfig::default();
        config.anchor_reset.interval_images = 0;
        assert!(config.validate().is_err());
        config.anchor_reset.max_translation = 0.5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pyramid_levels_out_of_range_rejected() {
        for levels in [0, MAX_PYRAMID_LEVELS + 1, 70] {
            let config = FilterConfig { pyramid_levels: levels, ..FilterConfig::default() };
            assert!(matches!(config.validate(), Err(VioError::Configuration(_))));
        }
    }

    #[test]
    fn test_non_positive_patch_rejection_rejected() {
        let mut config = FilterConfig::default();
        config.update.patch_rejection_threshold = 0.0;
        assert!(matches!(config.validate(), Err(VioError::Configuration(_))));
        config.update.patch_rejection_threshold = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tiny_image_rejected() {
        let config = FilterConfig {
            cameras: vec![CameraCalibration::pinhole(40, 40, 30.0)],
            ..FilterConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
