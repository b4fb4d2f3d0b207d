//! Messages sent from producers to the estimation thread.

use std::sync::Arc;

use crossbeam_channel::Sender;
use image::GrayImage;

use crate::filter::{Estimator, PoseMeasurement};
use crate::imu::ImuSample;

/// A timestamped measurement.
#[derive(Debug, Clone)]
pub enum Event {
    Imu(ImuSample),
    Image { timestamp: f64, camera: usize, image: Arc<GrayImage> },
    Pose(PoseMeasurement),
}

impl Event {
    pub fn timestamp(&self) -> f64 {
        match self {
            Event::Imu(s) => s.timestamp_s,
            Event::Image { timestamp, .. } => *timestamp,
            Event::Pose(m) => m.timestamp,
        }
    }

    /// Processing order among events with equal timestamps: inertial data
    /// first so an image at the same instant sees the newest sample.
    pub fn priority(&self) -> u8 {
        match self {
            Event::Imu(_) => 0,
            Event::Pose(_) => 1,
            Event::Image { .. } => 2,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Imu(_) => "imu",
            Event::Image { .. } => "image",
            Event::Pose(_) => "pose",
        }
    }
}

/// Closure run on the estimation thread with exclusive access.
pub type EstimatorFn = Box<dyn FnOnce(&mut Estimator) + Send>;

/// Everything the estimation thread can receive.
pub enum Command {
    Event(Event),
    /// Process everything queued, then acknowledge.
    Flush(Sender<()>),
    /// Drop everything queued, reinitialize, then acknowledge.
    Reset(Sender<()>),
    /// Run a closure on the estimator between events.
    Inspect(EstimatorFn),
    Shutdown,
}
