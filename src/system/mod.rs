//! Threaded orchestration: ordered ingestion, the estimation thread and
//! snapshot publication.

pub mod messages;
pub mod queue;
pub mod shared_state;
pub mod snapshot;
mod vio_system;

pub use messages::{Command, Event};
pub use queue::EventQueue;
pub use shared_state::SharedState;
pub use snapshot::{EstimatorStats, FeatureSnapshot, FilterSnapshot};
pub use vio_system::{MeasurementSender, VioSystem};
