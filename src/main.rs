use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rust_pvio::camera::CameraCalibration;
use rust_pvio::io::{EurocDataset, ReplayItem};
use rust_pvio::{FilterConfig, VioError, VioSystem};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rust_pvio=info,pvio_euroc=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let dataset_path = args.next().unwrap_or_else(|| "data/euroc/MH_01_easy/mav0".to_string());
    let config_path = args.next();

    let mut config = match &config_path {
        Some(path) => FilterConfig::load(path).with_context(|| format!("loading config {}", path))?,
        None => FilterConfig::default(),
    };

    info!("Loading EuRoC dataset from: {}", dataset_path);
    let dataset = EurocDataset::new(&dataset_path, config.camera_count.max(1))?;
    info!(
        "Loaded {} images, {} IMU samples, {} ground truth entries",
        dataset.cameras.iter().map(Vec::len).sum::<usize>(),
        dataset.imu_entries.len(),
        dataset.groundtruth.len()
    );

    // Per-camera override: PVIO_CAMERA<i>_CONFIG points at a sensor.yaml.
    let mut cameras = dataset.calibrations.clone();
    for (i, camera) in cameras.iter_mut().enumerate() {
        if let Ok(path) = std::env::var(format!("PVIO_CAMERA{}_CONFIG", i)) {
            *camera = CameraCalibration::load(&path)
                .with_context(|| format!("camera override {}", path))?;
            info!("camera {} calibration overridden from {}", i, path);
        }
    }
    config.camera_count = cameras.len();
    config.cameras = cameras;

    let jacobian_tolerance = config.numerics.jacobian_check_tolerance;
    let mut system = VioSystem::new(config)?;

    let check = system.with_estimator(|estimator| estimator.check_jacobians())?;
    info!(
        "Jacobian self-test: prediction {:.2e}, anchor reset {:.2e}",
        check.prediction_max_error, check.reset_max_error
    );
    if !check.passes(jacobian_tolerance) {
        warn!(
            "Jacobian self-test exceeds tolerance {:.1e}; estimates may be inconsistent",
            jacobian_tolerance
        );
    }

    let order = dataset.replay_order();
    let t0_ns = order.first().map_or(0, |(t, _)| *t);
    let mut images_submitted = 0usize;
    let mut start_position = None;
    let mut gt_start = None;

    for (timestamp_ns, item) in &order {
        let t = *timestamp_ns as f64 * 1e-9;
        let result = match *item {
            ReplayItem::Imu(i) => {
                let sample = &dataset.imu_entries[i].sample;
                system.submit_imu(t, sample.gyro, sample.accel)
            }
            ReplayItem::Image { camera, index } => match dataset.load_image(camera, index) {
                Ok(image) => {
                    images_submitted += 1;
                    system.submit_image(t, camera, image)
                }
                Err(e) => {
                    warn!("skipping image {} of camera {}: {:#}", index, camera, e);
                    continue;
                }
            },
        };

        match result {
            Ok(()) => {}
            Err(VioError::EstimationDivergence(reason)) => {
                warn!(
                    "filter diverged at t={:.3}s ({}), resetting",
                    t - t0_ns as f64 * 1e-9,
                    reason
                );
                system.request_reset()?;
                start_position = None;
                gt_start = None;
            }
            Err(e) => warn!("measurement at t={:.6} rejected: {}", t, e),
        }

        if matches!(item, ReplayItem::Image { .. }) && images_submitted % 100 == 0 {
            system.flush()?;
            let snapshot = system.get_safe_state();
            if !snapshot.initialized {
                continue;
            }
            let position = snapshot.position();
            let start = *start_position.get_or_insert(position);
            let mut line = format!(
                "t={:.2}s images={} features={} travelled={:.2}m",
                t - t0_ns as f64 * 1e-9,
                snapshot.stats.images_processed,
                snapshot.valid_features().count(),
                (position - start).norm(),
            );
            if let Some(gt) = dataset.groundtruth_at(*timestamp_ns) {
                let gt_origin = *gt_start.get_or_insert(gt.pose.translation);
                let gt_travelled = (gt.pose.translation - gt_origin).norm();
                line.push_str(&format!(" gt_travelled={:.2}m", gt_travelled));
            }
            info!("{}", line);
        }
    }

    system.flush()?;
    let snapshot = system.get_safe_state();
    let p = snapshot.position();
    info!(
        "Done: {} IMU, {} images, {} late, {} skipped updates, {} anchor resets. \
         Final position [{:.3}, {:.3}, {:.3}]",
        snapshot.stats.imu_processed,
        snapshot.stats.images_processed,
        snapshot.stats.late_events_dropped,
        snapshot.stats.updates_skipped,
        snapshot.stats.anchor_resets,
        p.x,
        p.y,
        p.z
    );

    system.shutdown();
    Ok(())
}
