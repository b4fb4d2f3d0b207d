//! Geometry utilities: SO(3) maps, rigid transforms and unit bearings.

pub mod bearing;
pub mod se3;
pub mod so3;

pub use bearing::Bearing;
pub use se3::SE3;
pub use so3::{right_jacobian_so3, skew};
