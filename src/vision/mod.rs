//! Image handling: float images, pyramids, patches and corner detection.

pub mod corners;
pub mod image;
pub mod patch;
pub mod pyramid;

pub use corners::{detect_corners, CornerCandidate, CornerParams};
pub use image::ImageF32;
pub use patch::Patch;
pub use pyramid::ImagePyramid;
