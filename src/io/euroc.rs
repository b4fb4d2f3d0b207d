//! EuRoC MAV dataset reader (`mav0` directory layout).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use csv::ReaderBuilder;
use image::GrayImage;
use nalgebra::Vector3;
use tracing::warn;

use crate::camera::CameraCalibration;
use crate::geometry::SE3;
use crate::imu::ImuSample;

#[derive(Debug, Clone)]
pub struct ImageEntry {
    pub timestamp_ns: u64,
    pub filename: String,
}

#[derive(Debug, Clone)]
pub struct ImuEntry {
    pub timestamp_ns: u64,
    pub sample: ImuSample,
}

#[derive(Debug, Clone)]
pub struct GroundTruthEntry {
    pub timestamp_ns: u64,
    /// T_WB
    pub pose: SE3,
    pub velocity: Vector3<f64>,
    pub gyro_bias: Vector3<f64>,
    pub accel_bias: Vector3<f64>,
}

/// A timestamped item of the merged replay order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayItem {
    /// Index into `imu_entries`.
    Imu(usize),
    /// Camera and index into that camera's entries.
    Image { camera: usize, index: usize },
}

#[derive(Debug)]
pub struct EurocDataset {
    root: PathBuf,
    /// Image list per camera (`cam0`, `cam1`, ...).
    pub cameras: Vec<Vec<ImageEntry>>,
    pub calibrations: Vec<CameraCalibration>,
    pub imu_entries: Vec<ImuEntry>,
    pub groundtruth: Vec<GroundTruthEntry>,
}

impl EurocDataset {
    /// Load the first `camera_count` cameras, IMU and (if present) ground
    /// truth below `root`.
    pub fn new<P: AsRef<Path>>(root: P, camera_count: usize) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if camera_count == 0 {
            bail!("at least one camera is required");
        }

        let mut cameras = Vec::with_capacity(camera_count);
        let mut calibrations = Vec::with_capacity(camera_count);
        for c in 0..camera_count {
            let dir = root.join(format!("cam{}", c));
            cameras.push(load_image_list(dir.join("data.csv"))?);
            calibrations.push(
                CameraCalibration::load(dir.join("sensor.yaml"))
                    .with_context(|| format!("camera {} calibration", c))?,
            );
        }

        let imu_entries = load_imu_list(root.join("imu0/data.csv"))?;
        let groundtruth = load_groundtruth_list(root.join("state_groundtruth_estimate0/data.csv"))
            .unwrap_or_else(|e| {
                warn!("Could not load ground truth: {}. Continuing without it.", e);
                Vec::new()
            });

        Ok(Self { root, cameras, calibrations, imu_entries, groundtruth })
    }

    pub fn image_count(&self, camera: usize) -> usize {
        self.cameras.get(camera).map_or(0, Vec::len)
    }

    /// Decode image `index` of `camera` as 8-bit grayscale.
    pub fn load_image(&self, camera: usize, index: usize) -> Result<GrayImage> {
        let entry = self
            .cameras
            .get(camera)
            .and_then(|list| list.get(index))
            .with_context(|| format!("No frame {} for camera {}", index, camera))?;
        let path = self.root.join(format!("cam{}/data", camera)).join(&entry.filename);
        let image = image::open(&path).with_context(|| format!("Failed to read image {:?}", path))?;
        Ok(image.into_luma8())
    }

    /// All IMU samples and images merged by timestamp, IMU first on ties.
    pub fn replay_order(&self) -> Vec<(u64, ReplayItem)> {
        let mut items: Vec<(u64, ReplayItem)> = self
            .imu_entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.timestamp_ns, ReplayItem::Imu(i)))
            .collect();
        for (camera, list) in self.cameras.iter().enumerate() {
            items.extend(
                list.iter()
                    .enumerate()
                    .map(|(index, e)| (e.timestamp_ns, ReplayItem::Image { camera, index })),
            );
        }
        items.sort_by_key(|(t, item)| {
            let rank = match item {
                ReplayItem::Imu(_) => 0,
                ReplayItem::Image { .. } => 1,
            };
            (*t, rank)
        });
        items
    }

    /// Ground-truth pose closest in time to `timestamp_ns`.
    pub fn groundtruth_at(&self, timestamp_ns: u64) -> Option<&GroundTruthEntry> {
        if self.groundtruth.is_empty() {
            return None;
        }
        let idx = self.groundtruth.partition_point(|gt| gt.timestamp_ns < timestamp_ns);
        let after = self.groundtruth.get(idx);
        let before = idx.checked_sub(1).and_then(|i| self.groundtruth.get(i));
        match (before, after) {
            (Some(b), Some(a)) => {
                if timestamp_ns - b.timestamp_ns <= a.timestamp_ns - timestamp_ns {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (b, a) => b.or(a),
        }
    }
}

fn csv_reader(csv_path: &Path) -> Result<csv::Reader<std::fs::File>> {
    ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))
}

fn parse_vec3(rec: &csv::StringRecord, start: usize) -> Result<Vector3<f64>> {
    Ok(Vector3::new(rec[start].parse()?, rec[start + 1].parse()?, rec[start + 2].parse()?))
}

fn load_image_list(csv_path: PathBuf) -> Result<Vec<ImageEntry>> {
    let mut rdr = csv_reader(&csv_path)?;
    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 2 {
            continue;
        }
        entries.push(ImageEntry { timestamp_ns: rec[0].parse()?, filename: rec[1].to_string() });
    }
    Ok(entries)
}

fn load_imu_list(csv_path: PathBuf) -> Result<Vec<ImuEntry>> {
    let mut rdr = csv_reader(&csv_path)?;
    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 7 {
            continue;
        }
        let ts: u64 = rec[0].parse()?;
        // timestamp, w_x, w_y, w_z, a_x, a_y, a_z
        let gyro = parse_vec3(&rec, 1)?;
        let accel = parse_vec3(&rec, 4)?;
        entries.push(ImuEntry {
            timestamp_ns: ts,
            sample: ImuSample::new(ts as f64 * 1e-9, accel, gyro),
        });
    }
    Ok(entries)
}

fn load_groundtruth_list(csv_path: PathBuf) -> Result<Vec<GroundTruthEntry>> {
    let mut rdr = csv_reader(&csv_path)?;
    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        // timestamp, p(3), q_wxyz(4), v(3), b_w(3), b_a(3)
        if rec.len() < 17 {
            continue;
        }
        let position = parse_vec3(&rec, 1)?;
        let qw: f64 = rec[4].parse()?;
        let qx: f64 = rec[5].parse()?;
        let qy: f64 = rec[6].parse()?;
        let qz: f64 = rec[7].parse()?;
        entries.push(GroundTruthEntry {
            timestamp_ns: rec[0].parse()?,
            pose: SE3::from_quaternion(qw, qx, qy, qz, position),
            velocity: parse_vec3(&rec, 8)?,
            gyro_bias: parse_vec3(&rec, 11)?,
            accel_bias: parse_vec3(&rec, 14)?,
        });
    }
    Ok(entries)
}
