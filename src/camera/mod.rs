//! Camera calibration and projection models.

pub mod calibration;
pub mod model;

pub use calibration::{CameraCalibration, Distortion};
pub use model::{Camera, Projection};
