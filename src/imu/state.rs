//! IMU initialization state tracking.

/// Whether the filter has seen enough inertial data to fix its attitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImuInitState {
    /// No IMU sample yet; images are skipped.
    AwaitingImu,
    /// Roll and pitch were initialized from the first accelerometer reading.
    GravityAligned,
}

impl Default for ImuInitState {
    fn default() -> Self {
        Self::AwaitingImu
    }
}
