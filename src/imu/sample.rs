//! IMU samples and gravity alignment.

use nalgebra::{UnitQuaternion, Vector3};

/// Standard gravity magnitude (m/s^2).
pub const GRAVITY_MAGNITUDE: f64 = 9.81;

/// Specific-force norm below which a sample cannot define "up".
const MIN_ALIGNMENT_ACCEL: f64 = 1e-3;

/// Single IMU measurement, expressed in the body (IMU) frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub timestamp_s: f64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuSample {
    pub fn new(timestamp_s: f64, accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        Self { timestamp_s, accel, gyro }
    }

    pub fn is_finite(&self) -> bool {
        self.timestamp_s.is_finite()
            && self.accel.iter().all(|v| v.is_finite())
            && self.gyro.iter().all(|v| v.is_finite())
    }
}

/// Gravity vector in the world frame for a given magnitude (z up).
pub fn gravity_world(magnitude: f64) -> Vector3<f64> {
    Vector3::new(0.0, 0.0, -magnitude)
}

/// World-from-body attitude whose z axis is aligned with the measured
/// specific force, assuming the body is at rest. Yaw is left at zero.
///
/// Returns `None` if the accelerometer reading is too small to define a
/// direction.
pub fn gravity_aligned_attitude(accel: &Vector3<f64>) -> Option<UnitQuaternion<f64>> {
    let norm = accel.norm();
    if !norm.is_finite() || norm < MIN_ALIGNMENT_ACCEL {
        return None;
    }
    let up = Vector3::new(0.0, 0.0, 1.0);
    let q = UnitQuaternion::rotation_between(&(accel / norm), &up).unwrap_or_else(|| {
        UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI)
    });
    // Remove the yaw component so the heading starts at zero.
    let (roll, pitch, _) = q.euler_angles();
    Some(UnitQuaternion::from_euler_angles(roll, pitch, 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_level_sample_gives_identity() {
        let q = gravity_aligned_attitude(&Vector3::new(0.0, 0.0, GRAVITY_MAGNITUDE)).unwrap();
        assert_relative_eq!(q.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_tilted_sample_maps_specific_force_to_up() {
        let tilt = UnitQuaternion::from_euler_angles(0.2, -0.3, 0.0);
        // At rest the accelerometer reads R_WB^T (0, 0, g).
        let accel = tilt.inverse() * Vector3::new(0.0, 0.0, GRAVITY_MAGNITUDE);
        let q = gravity_aligned_attitude(&accel).unwrap();
        let f_world = q * accel;
        assert_relative_eq!(f_world, Vector3::new(0.0, 0.0, GRAVITY_MAGNITUDE), epsilon = 1e-9);
    }

    #[test]
    fn test_zero_accel_rejected() {
        assert!(gravity_aligned_attitude(&Vector3::zeros()).is_none());
    }
}
