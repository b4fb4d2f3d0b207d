pub mod camera;
pub mod config;
pub mod error;
pub mod filter;
pub mod geometry;
pub mod imu;
pub mod io;
pub mod system;
pub mod vision;

pub use config::FilterConfig;
pub use error::{DivergenceReason, VioError, VioResult};
pub use filter::Estimator;
pub use system::{FilterSnapshot, MeasurementSender, VioSystem};
