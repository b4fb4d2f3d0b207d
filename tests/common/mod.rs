//! Synthetic scene for the end-to-end scenarios: a textured horizontal
//! plane seen by an upward-looking camera, and IMU samples generated from a
//! known trajectory with the same explicit Euler scheme the filter uses.

#![allow(dead_code)]

use image::{GrayImage, Luma};
use nalgebra::{Vector2, Vector3};

use rust_pvio::camera::{Camera, CameraCalibration};
use rust_pvio::config::FilterConfig;
use rust_pvio::geometry::SE3;
use rust_pvio::imu::{ImuSample, GRAVITY_MAGNITUDE};

pub const WIDTH: u32 = 320;
pub const HEIGHT: u32 = 240;
pub const FOCAL: f64 = 200.0;
/// Height of the textured plane above the world origin.
pub const PLANE_HEIGHT: f64 = 3.0;

pub fn calibration() -> CameraCalibration {
    CameraCalibration::pinhole(WIDTH, HEIGHT, FOCAL)
}

pub fn camera() -> Camera {
    Camera::new(calibration()).unwrap()
}

/// Smooth, non-periodic intensity pattern on the plane (world metres).
pub fn texture(x: f64, y: f64) -> f64 {
    use std::f64::consts::TAU;
    128.0
        + 45.0 * (TAU * x / 0.5).sin() * (TAU * y / 0.45).sin()
        + 25.0 * (TAU * (x + 0.3 * y) / 0.31).sin()
        + 15.0 * (TAU * (0.6 * x - y) / 0.73).cos()
}

/// Render the plane `z = PLANE_HEIGHT` seen from body pose `t_world_body`
/// (camera frame equal to the body frame).
pub fn render(camera: &Camera, t_world_body: &SE3) -> GrayImage {
    let r = t_world_body.rotation_matrix();
    let c = t_world_body.translation;
    GrayImage::from_fn(WIDTH, HEIGHT, |u, v| {
        let value = camera
            .unproject(&Vector2::new(u as f64, v as f64))
            .ok()
            .map(|ray| r * ray)
            .filter(|d| d.z > 1e-6)
            .map(|d| {
                let s = (PLANE_HEIGHT - c.z) / d.z;
                let hit = c + d * s;
                texture(hit.x, hit.y)
            })
            .unwrap_or(128.0);
        Luma([value.round().clamp(0.0, 255.0) as u8])
    })
}

/// True pose at each IMU sample of a level body translating along world x.
pub struct Motion {
    pub samples: Vec<ImuSample>,
    pub poses: Vec<SE3>,
}

impl Motion {
    /// `duration` seconds at `rate` Hz with forward acceleration
    /// `accel(t)`, starting at rest at the origin.
    pub fn lateral(duration: f64, rate: f64, accel: impl Fn(f64) -> f64) -> Self {
        let dt = 1.0 / rate;
        let n = (duration * rate).round() as usize + 1;
        let mut samples = Vec::with_capacity(n);
        let mut poses = Vec::with_capacity(n);
        let mut p = Vector3::zeros();
        let mut v = Vector3::zeros();
        for k in 0..n {
            let t = k as f64 * dt;
            let a = Vector3::new(accel(t), 0.0, 0.0);
            let specific_force = a + Vector3::new(0.0, 0.0, GRAVITY_MAGNITUDE);
            samples.push(ImuSample::new(t, specific_force, Vector3::zeros()));
            poses.push(SE3::new(nalgebra::UnitQuaternion::identity(), p));
            p += dt * v;
            v += dt * a;
        }
        Self { samples, poses }
    }

    /// Body at rest for `duration` seconds.
    pub fn still(duration: f64, rate: f64) -> Self {
        Self::lateral(duration, rate, |_| 0.0)
    }
}

/// Push forward, then brake: ends at rest `0.6 m` along x.
pub fn push_and_brake(t: f64) -> f64 {
    if t < 0.1 {
        0.0
    } else if t < 1.1 {
        0.6
    } else if t < 2.1 {
        -0.6
    } else {
        0.0
    }
}

/// Configuration for the synthetic scene: motion is known almost exactly,
/// so what remains uncertain is feature geometry.
pub fn synthetic_config() -> FilterConfig {
    let mut config = FilterConfig {
        max_features: 8,
        pyramid_levels: 3,
        patch_size: 6,
        estimate_extrinsics: false,
        cameras: vec![calibration()],
        ..FilterConfig::default()
    };
    config.imu.max_step = 0.01;

    let q = &mut config.process_noise;
    q.position = 1e-8;
    q.velocity = 1e-6;
    q.acc_bias = 1e-10;
    q.gyro_bias = 1e-10;

    let ic = &mut config.initial_covariance;
    ic.velocity = 1e-8;
    ic.gyro_bias = 1e-10;
    ic.acc_bias = 1e-10;
    ic.anchor_attitude = 1e-8;

    config.update.min_converged_features = 1;
    config.features.initial_distance = 2.0;
    config.features.min_feature_distance_px = 30.0;
    config.features.bucket_size_px = 12;
    config
}
