//! Per-camera calibration records.
//!
//! Two on-disk formats are accepted:
//! - the native record (`CameraCalibration` serialized as YAML), used inside
//!   the filter configuration file;
//! - an EuRoC `sensor.yaml` (`intrinsics`, `resolution`, `distortion_model`,
//!   `distortion_coefficients`, `T_BS`).

use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{VioError, VioResult};
use crate::geometry::SE3;

/// Lens distortion applied to normalized image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum Distortion {
    None,
    /// Radial-tangential (plumb bob) with two radial terms.
    Radtan { k1: f64, k2: f64, p1: f64, p2: f64 },
    /// Equidistant fisheye (Kannala-Brandt, four terms).
    Equidistant { k1: f64, k2: f64, k3: f64, k4: f64 },
}

impl Default for Distortion {
    fn default() -> Self {
        Distortion::None
    }
}

/// Intrinsics, distortion and body-from-camera extrinsics of one camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraCalibration {
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub distortion: Distortion,
    /// Row-major 4x4 homogeneous transform T_BC (camera into body/IMU frame).
    pub t_body_cam: [f64; 16],
    /// Half-angle of the cone (around the optical axis) in which projection
    /// is considered valid.
    pub validity_cone_deg: f64,
}

#[rustfmt::skip]
const IDENTITY_4X4: [f64; 16] = [
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 1.0, 0.0,
    0.0, 0.0, 0.0, 1.0,
];

impl Default for CameraCalibration {
    /// EuRoC cam0 intrinsics without distortion.
    fn default() -> Self {
        Self {
            width: 752,
            height: 480,
            fx: 458.654,
            fy: 457.296,
            cx: 367.215,
            cy: 248.375,
            distortion: Distortion::None,
            t_body_cam: IDENTITY_4X4,
            validity_cone_deg: 85.0,
        }
    }
}

impl CameraCalibration {
    /// Ideal pinhole camera with the principal point at the image centre.
    pub fn pinhole(width: u32, height: u32, focal: f64) -> Self {
        Self {
            width,
            height,
            fx: focal,
            fy: focal,
            cx: (width as f64 - 1.0) / 2.0,
            cy: (height as f64 - 1.0) / 2.0,
            distortion: Distortion::None,
            t_body_cam: IDENTITY_4X4,
            validity_cone_deg: 85.0,
        }
    }

    pub fn with_extrinsics(mut self, t_body_cam: &SE3) -> Self {
        let m = t_body_cam.to_matrix();
        for r in 0..4 {
            for c in 0..4 {
                self.t_body_cam[r * 4 + c] = m[(r, c)];
            }
        }
        self
    }

    pub fn t_body_cam(&self) -> SE3 {
        SE3::from_row_major(&self.t_body_cam)
    }

    pub fn validate(&self) -> VioResult<()> {
        if self.width < 8 || self.height < 8 {
            return Err(VioError::Configuration(format!(
                "camera resolution {}x{} is too small",
                self.width, self.height
            )));
        }
        let intrinsics = [self.fx, self.fy, self.cx, self.cy];
        if intrinsics.iter().any(|v| !v.is_finite()) || self.fx <= 0.0 || self.fy <= 0.0 {
            return Err(VioError::Configuration(format!(
                "invalid intrinsics [{}, {}, {}, {}]",
                self.fx, self.fy, self.cx, self.cy
            )));
        }
        if !(self.validity_cone_deg > 0.0 && self.validity_cone_deg < 90.0) {
            return Err(VioError::Configuration(format!(
                "validity cone {} deg must lie in (0, 90)",
                self.validity_cone_deg
            )));
        }
        if self.t_body_cam.iter().any(|v| !v.is_finite()) {
            return Err(VioError::Configuration(
                "camera extrinsics contain non-finite values".into(),
            ));
        }
        let last_row = &self.t_body_cam[12..16];
        if last_row != [0.0, 0.0, 0.0, 1.0] {
            return Err(VioError::Configuration(format!(
                "camera extrinsics last row {:?} is not [0, 0, 0, 1]",
                last_row
            )));
        }
        Ok(())
    }

    /// Load an EuRoC `sensor.yaml`.
    pub fn load<P: AsRef<Path>>(path: P) -> VioResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            VioError::Configuration(format!("failed to open {}: {}", path.display(), e))
        })?;
        let raw: EurocCameraYaml = serde_yaml::from_reader(file).map_err(|e| {
            VioError::Configuration(format!("failed to parse {}: {}", path.display(), e))
        })?;
        raw.into_calibration()
    }

    /// Parse an EuRoC `sensor.yaml` document held in memory.
    pub fn from_euroc_str(text: &str) -> VioResult<Self> {
        let raw: EurocCameraYaml = serde_yaml::from_str(text)
            .map_err(|e| VioError::Configuration(format!("failed to parse camera yaml: {}", e)))?;
        raw.into_calibration()
    }
}

/// EuRoC T_BS transform format: has cols, rows, data fields
#[derive(Debug, Deserialize)]
struct TransformYaml {
    data: Vec<f64>,
}

/// EuRoC camera sensor.yaml format
#[derive(Debug, Deserialize)]
struct EurocCameraYaml {
    #[serde(rename = "T_BS")]
    t_bs: TransformYaml,
    /// [fx, fy, cx, cy]
    intrinsics: Vec<f64>,
    resolution: Vec<u32>,
    #[serde(default)]
    distortion_model: Option<String>,
    #[serde(default)]
    distortion_coefficients: Vec<f64>,
}

impl EurocCameraYaml {
    fn into_calibration(self) -> VioResult<CameraCalibration> {
        if self.intrinsics.len() != 4 {
            return Err(VioError::Configuration(format!(
                "expected 4 intrinsics [fx, fy, cx, cy], got {}",
                self.intrinsics.len()
            )));
        }
        if self.resolution.len() != 2 {
            return Err(VioError::Configuration(format!(
                "expected resolution [width, height], got {} values",
                self.resolution.len()
            )));
        }
        let t_body_cam: [f64; 16] = self.t_bs.data.as_slice().try_into().map_err(|_| {
            VioError::Configuration(format!(
                "expected 16 elements for T_BS, got {}",
                self.t_bs.data.len()
            ))
        })?;

        let d = &self.distortion_coefficients;
        let distortion = match self.distortion_model.as_deref() {
            None | Some("none") => Distortion::None,
            Some("radial-tangential") | Some("radtan") | Some("plumb_bob") => {
                if d.len() < 4 {
                    return Err(VioError::Configuration(format!(
                        "radial-tangential model needs 4 coefficients, got {}",
                        d.len()
                    )));
                }
                Distortion::Radtan { k1: d[0], k2: d[1], p1: d[2], p2: d[3] }
            }
            Some("equidistant") | Some("fisheye") => {
                if d.len() < 4 {
                    return Err(VioError::Configuration(format!(
                        "equidistant model needs 4 coefficients, got {}",
                        d.len()
                    )));
                }
                Distortion::Equidistant { k1: d[0], k2: d[1], k3: d[2], k4: d[3] }
            }
            Some(other) => {
                return Err(VioError::Configuration(format!(
                    "unsupported distortion model `{}`",
                    other
                )))
            }
        };

        let calibration = CameraCalibration {
            width: self.resolution[0],
            height: self.resolution[1],
            fx: self.intrinsics[0],
            fy: self.intrinsics[1],
            cx: self.intrinsics[2],
            cy: self.intrinsics[3],
            distortion,
            t_body_cam,
            ..CameraCalibration::default()
        };
        calibration.validate()?;
        Ok(calibration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const EUROC_CAM0: &str = r#"
sensor_type: camera
comment: VI-Sensor cam0 (MT9M034)
T_BS:
  cols: 4
  rows: 4
  data: [0.0148655429818, -0.999880929698, 0.00414029679422, -0.0216401454975,
         0.999557249008, 0.0149672133247, 0.025715529948, -0.064676986768,
        -0.0257744366974, 0.00375618835797, 0.999660727178, 0.00981073058949,
         0.0, 0.0, 0.0, 1.0]
rate_hz: 20
resolution: [752, 480]
camera_model: pinhole
intrinsics: [458.654, 457.296, 367.215, 248.375]
distortion_model: radial-tangential
distortion_coefficients: [-0.28340811, 0.07395907, 0.00019359, 1.76187114e-05]
"#;

    #[test]
    fn test_parse_euroc_sensor_yaml() {
        let calib = CameraCalibration::from_euroc_str(EUROC_CAM0).unwrap();
        assert_eq!(calib.width, 752);
        assert_eq!(calib.height, 480);
        assert_relative_eq!(calib.fx, 458.654);
        match calib.distortion {
            Distortion::Radtan { k1, p2, .. } => {
                assert_relative_eq!(k1, -0.28340811);
                assert_relative_eq!(p2, 1.76187114e-05);
            }
            other => panic!("unexpected distortion {:?}", other),
        }
        let t = calib.t_body_cam();
        assert_relative_eq!(t.translation.x, -0.0216401454975, epsilon = 1e-12);
    }

    #[test]
    fn test_unknown_distortion_is_configuration_error() {
        let text = EUROC_CAM0.replace("radial-tangential", "division");
        let err = CameraCalibration::from_euroc_str(&text).unwrap_err();
        assert!(matches!(err, VioError::Configuration(_)));
    }

    #[test]
    fn test_native_roundtrip_through_yaml() {
        let calib = CameraCalibration {
            distortion: Distortion::Equidistant {
                k1: 0.01,
                k2: -0.002,
                k3: 0.0,
                k4: 0.0,
            },
            ..CameraCalibration::pinhole(320, 240, 200.0)
        };
        let text = serde_yaml::to_string(&calib).unwrap();
        let back: CameraCalibration = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back, calib);
    }

    #[test]
    fn test_validate_rejects_bad_focal_length() {
        let mut calib = CameraCalibration::pinhole(320, 240, 200.0);
        calib.fx = -1.0;
        assert!(calib.validate().is_err());
    }
}
