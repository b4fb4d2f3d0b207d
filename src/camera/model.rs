//! Camera projection with lens distortion and analytic Jacobians.

use nalgebra::{Matrix2, Matrix2x3, Vector2, Vector3};

use super::calibration::{CameraCalibration, Distortion};
use crate::error::{ProjectionFailure, VioResult};
use crate::geometry::SE3;

/// Minimum depth along the optical axis for a valid projection (m).
const MIN_DEPTH: f64 = 1e-6;

/// Iteration cap for the Gauss-Newton undistortion.
const UNDISTORT_MAX_ITERATIONS: usize = 20;

/// Residual (normalized units) at which undistortion is accepted.
const UNDISTORT_TOLERANCE: f64 = 1e-10;

/// Pixel location of a projected point and its derivative.
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    pub pixel: Vector2<f64>,
    /// ∂pixel / ∂P_C
    pub jacobian: Matrix2x3<f64>,
}

/// A calibrated camera.
#[derive(Debug, Clone)]
pub struct Camera {
    calibration: CameraCalibration,
    t_body_cam: SE3,
    cos_validity_cone: f64,
}

impl Camera {
    pub fn new(calibration: CameraCalibration) -> VioResult<Self> {
        calibration.validate()?;
        let t_body_cam = calibration.t_body_cam();
        let cos_validity_cone = calibration.validity_cone_deg.to_radians().cos();
        Ok(Self { calibration, t_body_cam, cos_validity_cone })
    }

    pub fn calibration(&self) -> &CameraCalibration {
        &self.calibration
    }

    /// Calibrated camera-to-body transform T_BC.
    pub fn t_body_cam(&self) -> &SE3 {
        &self.t_body_cam
    }

    pub fn width(&self) -> usize {
        self.calibration.width as usize
    }

    pub fn height(&self) -> usize {
        self.calibration.height as usize
    }

    /// Mean focal length in pixels.
    pub fn focal(&self) -> f64 {
        0.5 * (self.calibration.fx + self.calibration.fy)
    }

    /// True if `pixel` lies at least `margin` pixels inside the image.
    pub fn contains(&self, pixel: &Vector2<f64>, margin: f64) -> bool {
        pixel.x >= margin
            && pixel.y >= margin
            && pixel.x <= self.width() as f64 - 1.0 - margin
            && pixel.y <= self.height() as f64 - 1.0 - margin
    }

    /// Project a point in camera coordinates to pixel coordinates.
    pub fn project(&self, p_c: &Vector3<f64>) -> Result<Projection, ProjectionFailure> {
        if !p_c.iter().all(|v| v.is_finite()) {
            return Err(ProjectionFailure::NonFinite);
        }
        if p_c.z <= MIN_DEPTH {
            return Err(ProjectionFailure::BehindCamera { z: p_c.z });
        }
        let norm = p_c.norm();
        if p_c.z < self.cos_validity_cone * norm {
            return Err(ProjectionFailure::OutsideValidityCone {
                angle_deg: (p_c.z / norm).acos().to_degrees(),
            });
        }

        let inv_z = 1.0 / p_c.z;
        let normalized = Vector2::new(p_c.x * inv_z, p_c.y * inv_z);
        #[rustfmt::skip]
        let d_norm = Matrix2x3::new(
            inv_z, 0.0, -p_c.x * inv_z * inv_z,
            0.0, inv_z, -p_c.y * inv_z * inv_z,
        );

        let (distorted, d_dist) = distort(&self.calibration.distortion, &normalized);
        let c = &self.calibration;
        let pixel = Vector2::new(c.fx * distorted.x + c.cx, c.fy * distorted.y + c.cy);
        let k = Matrix2::new(c.fx, 0.0, 0.0, c.fy);

        Ok(Projection { pixel, jacobian: k * d_dist * d_norm })
    }

    /// Back-project a pixel into a unit bearing in camera coordinates.
    pub fn unproject(&self, pixel: &Vector2<f64>) -> Result<Vector3<f64>, ProjectionFailure> {
        if !pixel.iter().all(|v| v.is_finite()) {
            return Err(ProjectionFailure::NonFinite);
        }
        let c = &self.calibration;
        let distorted = Vector2::new((pixel.x - c.cx) / c.fx, (pixel.y - c.cy) / c.fy);
        let normalized = undistort(&c.distortion, &distorted)?;
        Ok(Vector3::new(normalized.x, normalized.y, 1.0).normalize())
    }
}

/// Apply distortion to normalized coordinates, returning the distorted
/// point and its 2x2 Jacobian.
pub fn distort(model: &Distortion, p: &Vector2<f64>) -> (Vector2<f64>, Matrix2<f64>) {
    let (x, y) = (p.x, p.y);
    match *model {
        Distortion::None => (*p, Matrix2::identity()),

        Distortion::Radtan { k1, k2, p1, p2 } => {
            let r2 = x * x + y * y;
            let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
            let d_radial = k1 + 2.0 * k2 * r2; // ∂radial/∂(r2)

            let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

            let dxd_dx = radial + 2.0 * x * x * d_radial + 2.0 * p1 * y + 6.0 * p2 * x;
            let dxd_dy = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
            let dyd_dx = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
            let dyd_dy = radial + 2.0 * y * y * d_radial + 6.0 * p1 * y + 2.0 * p2 * x;

            (Vector2::new(xd, yd), Matrix2::new(dxd_dx, dxd_dy, dyd_dx, dyd_dy))
        }

        Distortion::Equidistant { k1, k2, k3, k4 } => {
            let r = (x * x + y * y).sqrt();
            if r < 1e-10 {
                return (*p, Matrix2::identity());
            }
            let theta = r.atan();
            let t2 = theta * theta;
            let t4 = t2 * t2;
            let t6 = t4 * t2;
            let t8 = t4 * t4;
            let theta_d = theta * (1.0 + k1 * t2 + k2 * t4 + k3 * t6 + k4 * t8);
            let dtheta_d = 1.0 + 3.0 * k1 * t2 + 5.0 * k2 * t4 + 7.0 * k3 * t6 + 9.0 * k4 * t8;
            let dtheta_dr = 1.0 / (1.0 + r * r);

            let s = theta_d / r;
            let ds_dr = (dtheta_d * dtheta_dr * r - theta_d) / (r * r);
            let coeff = ds_dr / r;

            (
                Vector2::new(x * s, y * s),
                Matrix2::new(s + coeff * x * x, coeff * x * y, coeff * x * y, s + coeff * y * y),
            )
        }
    }
}

/// Invert [`distort`] by Gauss-Newton, starting from the distorted point.
pub fn undistort(
    model: &Distortion,
    distorted: &Vector2<f64>,
) -> Result<Vector2<f64>, ProjectionFailure> {
    if matches!(model, Distortion::None) {
        return Ok(*distorted);
    }
    let mut p = *distorted;
    for _ in 0..UNDISTORT_MAX_ITERATIONS {
        let (d, j) = distort(model, &p);
        let err = d - distorted;
        if err.norm() < UNDISTORT_TOLERANCE {
            return Ok(p);
        }
        let step = j.try_inverse().ok_or(ProjectionFailure::UndistortionFailed)? * err;
        p -= step;
        if !p.iter().all(|v| v.is_finite()) {
            return Err(ProjectionFailure::UndistortionFailed);
        }
    }
    let (d, _) = distort(model, &p);
    if (d - distorted).norm() < 1e3 * UNDISTORT_TOLERANCE {
        Ok(p)
    } else {
        Err(ProjectionFailure::UndistortionFailed)
    }
}
