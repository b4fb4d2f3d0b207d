//! Selection of the inertial input used over one prediction interval.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::sample::ImuSample;

/// Integration scheme for the prediction step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImuIntegrator {
    /// Use the most recent sample over the whole interval.
    Euler,
    /// Average the samples at both ends of the interval.
    Midpoint,
}

impl Default for ImuIntegrator {
    fn default() -> Self {
        Self::Euler
    }
}

/// Raw (bias-uncorrected) rates held constant over one prediction interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuInput {
    pub gyro: Vector3<f64>,
    pub accel: Vector3<f64>,
}

impl ImuInput {
    pub fn from_sample(sample: &ImuSample) -> Self {
        Self { gyro: sample.gyro, accel: sample.accel }
    }
}

impl ImuIntegrator {
    /// Input for the interval `[prev.timestamp_s, curr.timestamp_s]`.
    pub fn input(&self, prev: &ImuSample, curr: &ImuSample) -> ImuInput {
        match self {
            // The sample at the start of the interval drives it; the new
            // sample takes over from its own timestamp onwards.
            ImuIntegrator::Euler => ImuInput::from_sample(prev),
            ImuIntegrator::Midpoint => ImuInput {
                gyro: 0.5 * (prev.gyro + curr.gyro),
                accel: 0.5 * (prev.accel + curr.accel),
            },
        }
    }
}
