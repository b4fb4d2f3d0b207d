//! Dataset readers.

pub mod euroc;

pub use euroc::{EurocDataset, GroundTruthEntry, ImageEntry, ImuEntry, ReplayItem};
