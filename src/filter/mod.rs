//! Photometric iterated EKF.
//!
//! - [`layout`]: index map of the error state
//! - [`state`]: manifold mean, covariance and its guarded write path
//! - [`prediction`]: IMU propagation
//! - [`update`]: patch-intensity IEKF update
//! - [`feature_manager`]: slot removal and initialization
//! - [`anchor`]: robocentric anchor reset
//! - [`pose_update`]: external pose measurements
//! - [`estimator`]: synchronous sequencing of all of the above

pub mod anchor;
pub mod estimator;
pub mod feature;
pub mod feature_manager;
pub mod layout;
pub mod numeric;
pub mod pose_update;
pub mod prediction;
pub mod robust;
pub mod state;
pub mod update;

pub use estimator::{Estimator, JacobianCheck};
pub use feature::{DepthParameterization, FeatureArena, FeatureSlot, FeatureStatistics, TrackStatus};
pub use layout::StateLayout;
pub use pose_update::{PoseMeasurement, PoseUpdateReport};
pub use robust::RobustKernel;
pub use state::{FeatureMean, FilterState, StateMean};
pub use update::{SkipReason, UpdateReport};
