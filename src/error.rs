//! Error taxonomy for the estimator.
//!
//! Only two kinds of failure need action from outside the filter:
//! - [`VioError::Configuration`]: the filter refuses to start.
//! - [`VioError::EstimationDivergence`]: the session is dead until reset.
//!
//! Everything else is either a caller mistake that is reported and dropped
//! (`StaleTimestamp`, `InvalidMeasurement`) or a per-feature / per-frame
//! condition that the update stage absorbs locally (`Projection`,
//! `OutOfBoundsPatch`, `UpdateNotConverged`).

use thiserror::Error;

/// Why a 3D point could not be projected into a camera.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ProjectionFailure {
    /// Point lies on or behind the image plane.
    #[error("point is behind the camera (z = {z:.4})")]
    BehindCamera { z: f64 },

    /// Point is in front of the camera but outside the validity cone.
    #[error("point is {angle_deg:.1} deg off the optical axis")]
    OutsideValidityCone { angle_deg: f64 },

    /// Iterative undistortion did not converge.
    #[error("pixel could not be undistorted")]
    UndistortionFailed,

    /// Input contained NaN or infinity.
    #[error("non-finite input")]
    NonFinite,
}

/// A patch request that would read outside the image.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("patch centred at ({x:.2}, {y:.2}) on level {level} leaves the {width}x{height} image")]
pub struct OutOfBoundsPatch {
    pub x: f64,
    pub y: f64,
    pub level: usize,
    pub width: usize,
    pub height: usize,
}

/// What the covariance / mean health check found.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DivergenceReason {
    #[error("non-finite value in state block `{block}`")]
    NonFiniteMean { block: &'static str },

    #[error("non-finite covariance entry at ({row}, {col})")]
    NonFiniteCovariance { row: usize, col: usize },

    #[error("covariance asymmetry {asymmetry:.3e} exceeds tolerance {tolerance:.3e}")]
    Asymmetric { asymmetry: f64, tolerance: f64 },

    #[error("covariance is not positive semi-definite")]
    NotPositiveSemiDefinite,
}

/// Top-level error type of the crate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VioError {
    /// Invalid or missing calibration / parameters. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Per-feature projection failure.
    #[error("projection failed: {0}")]
    Projection(#[from] ProjectionFailure),

    /// Per-feature patch extraction failure.
    #[error(transparent)]
    OutOfBoundsPatch(#[from] OutOfBoundsPatch),

    /// Too few features converged; the frame contributes prediction only.
    #[error("update not converged: {converged} feature(s) converged, {required} required")]
    UpdateNotConverged { converged: usize, required: usize },

    /// Covariance lost symmetry / PSD or the state became non-finite.
    #[error("estimation diverged: {0}")]
    EstimationDivergence(DivergenceReason),

    /// Measurement older than the committed filter state.
    #[error("stale timestamp {timestamp:.6} s (committed state at {committed:.6} s)")]
    StaleTimestamp { timestamp: f64, committed: f64 },

    /// Measurement that can never be processed (bad camera index, wrong size, NaN).
    #[error("invalid measurement: {0}")]
    InvalidMeasurement(String),

    /// The estimation thread has exited.
    #[error("estimation thread is no longer running")]
    Disconnected,
}

impl VioError {
    /// True for the failures that require external action (config fix or reset).
    pub fn is_fatal(&self) -> bool {
        matches!(self, VioError::Configuration(_) | VioError::EstimationDivergence(_))
    }
}

impl From<DivergenceReason> for VioError {
    fn from(reason: DivergenceReason) -> Self {
        VioError::EstimationDivergence(reason)
    }
}

pub type VioResult<T> = std::result::Result<T, VioError>;
