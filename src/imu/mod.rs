//! Inertial measurements and their use in prediction.

pub mod integrator;
pub mod sample;
pub mod state;

pub use integrator::{ImuInput, ImuIntegrator};
pub use sample::{gravity_aligned_attitude, gravity_world, ImuSample, GRAVITY_MAGNITUDE};
pub use state::ImuInitState;
