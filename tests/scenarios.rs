mod common;

use approx::assert_relative_eq;
use image::GrayImage;
use nalgebra::{DMatrix, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use common::{camera, push_and_brake, render, synthetic_config, Motion, PLANE_HEIGHT};
use rust_pvio::camera::{Camera, CameraCalibration, Distortion};
use rust_pvio::error::{OutOfBoundsPatch, VioError};
use rust_pvio::filter::feature_manager::{add_features, feature_prior, remove_feature};
use rust_pvio::filter::layout::FEATURE_DIM;
use rust_pvio::filter::{Estimator, SkipReason, TrackStatus};
use rust_pvio::geometry::{Bearing, SE3};
use rust_pvio::imu::ImuSample;
use rust_pvio::vision::{ImageF32, ImagePyramid, Patch};
use rust_pvio::VioSystem;

const IMU_RATE: f64 = 200.0;
/// One image every this many IMU samples (20 Hz).
const IMAGE_EVERY: usize = 10;

/// Feed `motion` to `est`, rendering an image at every `IMAGE_EVERY`th
/// sample. Calls `check` after every event.
fn replay(est: &mut Estimator, motion: &Motion, mut check: impl FnMut(&Estimator)) {
    let cam = camera();
    for (k, (sample, pose)) in motion.samples.iter().zip(&motion.poses).enumerate() {
        est.process_imu(*sample).unwrap();
        check(est);
        if k % IMAGE_EVERY == 0 {
            est.process_image(sample.timestamp_s, 0, &render(&cam, pose)).unwrap();
            check(est);
        }
    }
}

/// Distance from the anchor origin to the plane along `bearing`.
fn true_distance(anchor: &SE3, bearing: &Vector3<f64>) -> f64 {
    let d_world = anchor.rotation * bearing;
    (PLANE_HEIGHT - anchor.translation.z) / d_world.z
}

#[test]
fn test_pure_prediction_keeps_attitude_and_velocity() {
    let mut est = Estimator::new(synthetic_config()).unwrap();
    for sample in Motion::still(1.0, IMU_RATE).samples {
        est.process_imu(sample).unwrap();
    }
    let snap = est.snapshot();
    assert_relative_eq!(snap.timestamp, 1.0, epsilon = 1e-9);
    assert!(snap.attitude().angle() < 1e-9);
    let v = snap.velocity_world;
    assert!(Vector2::new(v.x, v.y).norm() < 1e-9);
    let p = snap.position();
    assert!(Vector2::new(p.x, p.y).norm() < 1e-9);
    // Gravity cancels the measured specific force, up to rounding.
    assert!(p.z.abs() < 1e-6);
    assert!(v.z.abs() < 1e-6);
}

#[test]
fn test_feature_depth_converges_under_translation() {
    let config = synthetic_config();
    let initial_distance = config.features.initial_distance;
    let mut est = Estimator::new(config).unwrap();
    let motion = Motion::lateral(2.1, IMU_RATE, push_and_brake);
    replay(&mut est, &motion, |_| {});

    let snap = est.snapshot();
    let truth = motion.poses.last().unwrap();
    assert!((snap.position() - truth.translation).norm() < 0.02);

    let mature: Vec<_> = snap.valid_features().filter(|f| f.observed >= 15).collect();
    assert!(!mature.is_empty(), "no feature was tracked long enough");
    for f in mature {
        let expected = true_distance(&snap.anchor_pose, &f.bearing);
        // The prior is far from the truth, so this is not met trivially.
        assert!((initial_distance - expected).abs() > 0.2 * expected);
        let error = (f.distance - expected).abs() / expected;
        assert!(
            error < 0.2,
            "feature {} distance {:.3} vs {:.3} after {} observations",
            f.id,
            f.distance,
            expected,
            f.observed
        );
    }
}

#[test]
fn test_slot_reuse_leaves_no_cross_covariance() {
    let config = synthetic_config();
    let mut est = Estimator::new(config.clone()).unwrap();
    // A few frames of motion couple the features with the rest of the state.
    let motion = Motion::lateral(0.5, IMU_RATE, push_and_brake);
    replay(&mut est, &motion, |_| {});
    assert!(est.state().slots.slot(0).valid);
    let old_id = est.state().slots.slot(0).id;

    let cam = camera();
    let prior = feature_prior(&config, &cam);
    remove_feature(est.state_mut(), 0, &config, prior);
    assert!(!est.state().slots.slot(0).valid);

    let image = render(&cam, motion.poses.last().unwrap());
    let pyramid = ImagePyramid::from_gray(&image, config.pyramid_levels);
    let added = add_features(est.state_mut(), 0, &cam, &pyramid, &config);
    assert!(added >= 1);

    let state = est.state();
    let slot = state.slots.slot(0);
    assert!(slot.valid);
    assert_ne!(slot.id, old_id);
    assert_eq!(slot.stats.age, 0);

    let s = state.layout.feature(0);
    let p = state.covariance();
    for r in s..s + FEATURE_DIM {
        for c in 0..state.layout.dim() {
            if (s..s + FEATURE_DIM).contains(&c) {
                continue;
            }
            assert_eq!(p[(r, c)], 0.0);
            assert_eq!(p[(c, r)], 0.0);
        }
    }
    assert_relative_eq!(p[(s, s)], prior.0);
    assert_relative_eq!(p[(s + 1, s + 1)], prior.0);
    assert_relative_eq!(p[(s + 2, s + 2)], prior.1);
    assert_eq!(p[(s, s + 2)], 0.0);
}

#[test]
fn test_patch_near_border_is_excluded_from_update() {
    let img = ImageF32::from_fn(64, 48, |x, y| (x * 3 + y * 5) as f32);
    let err: OutOfBoundsPatch = Patch::extract(&img, &Vector2::new(2.0, 20.0), 6, 0).unwrap_err();
    assert_eq!(err.level, 0);
    assert!(Patch::extract(&img, &Vector2::new(61.0, 20.0), 6, 0).is_err());
    assert!(Patch::extract(&img, &Vector2::new(20.0, 20.0), 6, 0).is_ok());

    let mut est = Estimator::new(synthetic_config()).unwrap();
    let cam = camera();
    let motion = Motion::still(0.05, IMU_RATE);
    replay(&mut est, &motion, |_| {});
    assert!(est.state().slots.slot(0).valid);

    // Point slot 0 at a pixel inside the image but too close to its edge.
    let ray = cam.unproject(&Vector2::new(1.5, 120.0)).unwrap();
    est.state_mut().mean.features[0].bearing = Bearing::from_vector(&ray).unwrap();

    let t = 0.06;
    est.process_imu(ImuSample::new(t, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros())).unwrap();
    let report = est.process_image(t, 0, &render(&cam, motion.poses.last().unwrap())).unwrap();
    assert!(report.candidates >= 1);
    let slot = est.state().slots.slot(0);
    assert!(slot.valid);
    assert_eq!(slot.stats.status, TrackStatus::Unobservable);
    assert!(slot.stats.consecutive_failures >= 1);
}

#[test]
fn test_corrupted_template_is_gated_as_outlier() {
    let mut est = Estimator::new(synthetic_config()).unwrap();
    let cam = camera();
    let motion = Motion::still(0.05, IMU_RATE);
    replay(&mut est, &motion, |_| {});
    assert!(est.state().slots.valid_count() >= 2);

    // Replace every template of slot 0 by a checkerboard the scene never shows.
    for patch in est.state_mut().slots.slot_mut(0).patches.iter_mut() {
        let n = patch.size();
        for k in 0..patch.len() {
            patch.intensity[k] = if (k % n + k / n) % 2 == 0 { 255.0 } else { 0.0 };
        }
    }

    let t = 0.06;
    est.process_imu(ImuSample::new(t, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros())).unwrap();
    let report = est.process_image(t, 0, &render(&cam, motion.poses.last().unwrap())).unwrap();
    assert!(report.outliers >= 1);
    assert_eq!(report.skipped, None);
    assert_eq!(est.state().slots.slot(0).stats.status, TrackStatus::Outlier);
}

#[test]
fn test_swapped_template_is_rejected() {
    let mut config = synthetic_config();
    config.update.patch_rejection_threshold = 12.0;
    let mut est = Estimator::new(config).unwrap();
    let cam = camera();
    let motion = Motion::still(0.05, IMU_RATE);
    replay(&mut est, &motion, |_| {});
    assert!(est.state().slots.valid_count() >= 2);
    assert!(est.state().slots.slot(0).valid);

    // Give slot 0 the patch bank of the track that looks least like it.
    let mean_abs_diff = |a: &Patch, b: &Patch| {
        let sum: f32 = a.intensity.iter().zip(&b.intensity).map(|(x, y)| (x - y).abs()).sum();
        sum as f64 / a.len() as f64
    };
    let slots = &est.state().slots;
    let own = &slots.slot(0).patches[0];
    let (donor, difference) = (1..slots.capacity())
        .filter(|&j| slots.slot(j).valid)
        .map(|j| (j, mean_abs_diff(own, &slots.slot(j).patches[0])))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap();
    assert!(difference > 24.0, "templates too similar: {}", difference);
    let bank = est.state().slots.slot(donor).patches.clone();
    est.state_mut().slots.slot_mut(0).patches = bank;

    let t = 0.06;
    est.process_imu(ImuSample::new(t, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros())).unwrap();
    let report = est.process_image(t, 0, &render(&cam, motion.poses.last().unwrap())).unwrap();
    assert!(report.outliers >= 1);
    assert_eq!(est.state().slots.slot(0).stats.status, TrackStatus::Outlier);
    assert_eq!(est.state().slots.slot(donor).stats.status, TrackStatus::Tracked);
}

#[test]
fn test_unconverged_update_leaves_prediction_only() {
    let mut config = synthetic_config();
    config.update.min_converged_features = config.max_features + 1;
    let mut est = Estimator::new(config.clone()).unwrap();
    let mut imu_only = Estimator::new(config).unwrap();

    let cam = camera();
    let motion = Motion::lateral(0.6, IMU_RATE, push_and_brake);
    let mut not_converged = 0;
    let mut kept_without_refill = 0;
    for (k, (sample, pose)) in motion.samples.iter().zip(&motion.poses).enumerate() {
        est.process_imu(*sample).unwrap();
        imu_only.process_imu(*sample).unwrap();
        if k % IMAGE_EVERY != 0 {
            continue;
        }
        let report = est.process_image(sample.timestamp_s, 0, &render(&cam, pose)).unwrap();
        if let Some(SkipReason::NotConverged { required, .. }) = report.skipped {
            assert_eq!(required, est.config().max_features + 1);
            assert!(matches!(report.error(), Some(VioError::UpdateNotConverged { .. })));
            not_converged += 1;
        }
        // New tracks only appear when the camera had none left.
        let valid = est.state().slots.valid_count();
        if report.added > 0 {
            assert_eq!(valid, report.added);
        } else if report.skipped.is_some() && valid > 0 {
            kept_without_refill += 1;
        }
    }
    assert!(not_converged > 0);
    assert!(kept_without_refill > 0);

    let with_images = est.snapshot();
    let predicted = imu_only.snapshot();
    assert_relative_eq!(with_images.position(), predicted.position(), epsilon = 1e-9);
    assert_relative_eq!(with_images.velocity_world, predicted.velocity_world, epsilon = 1e-9);
    assert!(with_images.attitude().angle_to(&predicted.attitude()) < 1e-9);
}

#[test]
fn test_project_unproject_round_trip_for_every_model() {
    let models = [
        Distortion::None,
        Distortion::Radtan { k1: -0.28, k2: 0.07, p1: 2e-4, p2: 1.8e-5 },
        Distortion::Equidistant { k1: 0.01, k2: -0.005, k3: 0.002, k4: -0.0005 },
    ];
    let mut rng = StdRng::seed_from_u64(7);
    for distortion in models {
        let cam = Camera::new(CameraCalibration {
            distortion,
            ..CameraCalibration::default()
        })
        .unwrap();
        for _ in 0..200 {
            // Up to about 40 deg off axis, inside the validity cone.
            let p = Vector3::new(rng.gen_range(-0.7..0.7), rng.gen_range(-0.45..0.45), 1.0)
                * rng.gen_range(0.5..20.0);
            let pixel = cam.project(&p).unwrap().pixel;
            let ray = cam.unproject(&pixel).unwrap();
            assert_relative_eq!(ray, p.normalize(), epsilon = 1e-7);
        }
    }
}

#[test]
fn test_covariance_stays_psd_under_random_sequences() {
    for seed in 0..3u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut est = Estimator::new(synthetic_config()).unwrap();
        let cam = camera();
        let motion = Motion::lateral(1.0, IMU_RATE, push_and_brake);
        let numerics = est.config().numerics.clone();

        for (k, (sample, pose)) in motion.samples.iter().zip(&motion.poses).enumerate() {
            let noisy = ImuSample::new(
                sample.timestamp_s,
                sample.accel + Vector3::from_fn(|_, _| rng.gen_range(-0.05..0.05)),
                sample.gyro + Vector3::from_fn(|_, _| rng.gen_range(-0.01..0.01)),
            );
            est.process_imu(noisy).unwrap();
            est.state().check_health(&numerics).unwrap();
            if k % IMAGE_EVERY == 0 {
                est.process_image(sample.timestamp_s, 0, &render(&cam, pose)).unwrap();
                est.state().check_health(&numerics).unwrap();
                let p: &DMatrix<f64> = est.state().covariance();
                assert_eq!(p, &p.transpose());
            }
        }
        assert!(est.snapshot().is_finite());
    }
}

#[test]
fn test_jacobians_match_finite_differences_with_features() {
    let mut est = Estimator::new(synthetic_config()).unwrap();
    let motion = Motion::lateral(0.5, IMU_RATE, push_and_brake);
    replay(&mut est, &motion, |_| {});
    assert!(est.state().slots.valid_count() > 0);
    let check = est.check_jacobians();
    assert!(check.prediction_max_error < 1e-6, "{:?}", check);
    assert!(check.reset_max_error < 1e-6, "{:?}", check);
}

#[test]
fn test_image_before_imu_is_reported() {
    let mut est = Estimator::new(synthetic_config()).unwrap();
    let report = est.process_image(0.0, 0, &GrayImage::new(320, 240)).unwrap();
    assert_eq!(report.skipped, Some(SkipReason::AwaitingImu));
    assert_eq!(est.stats().updates_skipped, 1);
}

#[test]
fn test_orchestrator_end_to_end() {
    let mut system = VioSystem::new(synthetic_config()).unwrap();
    let sender = system.sender();
    let cam = camera();
    let motion = Motion::lateral(1.0, IMU_RATE, push_and_brake);

    let images: Vec<GrayImage> = motion
        .poses
        .iter()
        .step_by(IMAGE_EVERY)
        .map(|pose| render(&cam, pose))
        .collect();

    // Each image arrives two IMU periods late, inside the reorder horizon.
    let lag = 2;
    let mut submitted = 0;
    for (k, s) in motion.samples.iter().enumerate() {
        sender.submit_imu(s.timestamp_s, s.gyro, s.accel).unwrap();
        if k >= lag && (k - lag) % IMAGE_EVERY == 0 {
            let t = motion.samples[k - lag].timestamp_s;
            match system.submit_image(t, 0, images[(k - lag) / IMAGE_EVERY].clone()) {
                Ok(()) => submitted += 1,
                // Only if the estimation thread idled and flushed past it.
                Err(VioError::StaleTimestamp { .. }) => {}
                Err(e) => panic!("unexpected submission error: {}", e),
            }
        }
    }
    system.flush().unwrap();

    let snap = system.get_safe_state();
    assert!(snap.is_finite());
    assert_relative_eq!(snap.timestamp, 1.0, epsilon = 1e-9);
    assert_eq!(snap.stats.imu_processed as usize, motion.samples.len());
    assert!(submitted > images.len() / 2);
    assert_eq!((snap.stats.images_processed + snap.stats.late_events_dropped) as usize, submitted);
    assert!(snap.stats.images_processed > 0);
    let truth = motion.poses.last().unwrap();
    assert!((snap.position() - truth.translation).norm() < 0.02);
    system.shutdown();
}

#[test]
fn test_startup_self_test_through_worker() {
    let system = VioSystem::new(synthetic_config()).unwrap();
    let check = system.with_estimator(|est| est.check_jacobians()).unwrap();
    let tolerance = synthetic_config().numerics.jacobian_check_tolerance;
    assert!(check.passes(tolerance));
    assert!(check.max_error() >= 0.0);
}

#[test]
fn test_stale_submission_is_reported() {
    let system = VioSystem::new(synthetic_config()).unwrap();
    let g = Vector3::new(0.0, 0.0, 9.81);
    system.submit_imu(1.0, Vector3::zeros(), g).unwrap();
    system.flush().unwrap();
    assert!(matches!(
        system.submit_imu(0.5, Vector3::zeros(), g),
        Err(VioError::StaleTimestamp { .. })
    ));
    assert!(matches!(
        system.submit_image(0.5, 0, GrayImage::new(320, 240)),
        Err(VioError::StaleTimestamp { .. })
    ));
    assert!(matches!(
        system.submit_imu(f64::NAN, Vector3::zeros(), g),
        Err(VioError::InvalidMeasurement(_))
    ));
}

#[test]
fn test_non_finite_state_raises_divergence() {
    let system = VioSystem::new(synthetic_config()).unwrap();
    let g = Vector3::new(0.0, 0.0, 9.81);
    system.submit_imu(0.0, Vector3::zeros(), g).unwrap();
    system.submit_imu(0.01, Vector3::zeros(), g).unwrap();
    system.flush().unwrap();
    let before = system.get_safe_state();

    system.with_estimator(|est| est.state_mut().mean.position.y = f64::NAN).unwrap();
    system.submit_imu(0.02, Vector3::zeros(), g).unwrap();
    system.flush().unwrap();

    assert!(system.divergence().is_some());
    let after = system.get_safe_state();
    assert!(after.is_finite());
    assert_eq!(after.timestamp, before.timestamp);
    assert!(matches!(
        system.submit_imu(0.03, Vector3::zeros(), g),
        Err(VioError::EstimationDivergence(_))
    ));

    system.request_reset().unwrap();
    assert!(system.divergence().is_none());
    system.submit_imu(0.0, Vector3::zeros(), g).unwrap();
    system.flush().unwrap();
    assert!(system.get_safe_state().initialized);
}

#[test]
fn test_reset_is_idempotent() {
    let system = VioSystem::new(synthetic_config()).unwrap();
    let cam = camera();
    let motion = Motion::lateral(0.3, IMU_RATE, push_and_brake);
    for (k, (s, pose)) in motion.samples.iter().zip(&motion.poses).enumerate() {
        system.submit_imu(s.timestamp_s, s.gyro, s.accel).unwrap();
        if k % IMAGE_EVERY == 0 {
            system.submit_image(s.timestamp_s, 0, render(&cam, pose)).unwrap();
        }
    }
    system.flush().unwrap();
    assert!(system.get_safe_state().valid_features().count() > 0);

    let state_after = |system: &VioSystem| {
        system
            .with_estimator(|est| {
                let state = est.state();
                (state.mean.clone(), state.covariance().clone(), est.stats())
            })
            .unwrap()
    };

    system.request_reset().unwrap();
    let once = state_after(&system);
    let snap_once = system.get_safe_state();
    system.request_reset().unwrap();
    let twice = state_after(&system);
    let snap_twice = system.get_safe_state();

    assert_eq!(once.0, twice.0);
    assert_eq!(once.1, twice.1);
    assert_eq!(once.2, twice.2);
    assert_eq!(snap_once.features.len(), snap_twice.features.len());
    assert_eq!(snap_twice.valid_features().count(), 0);
    assert!(!snap_twice.initialized);

    // The session accepts a fresh timeline.
    system.submit_imu(0.0, Vector3::zeros(), Vector3::new(0.0, 0.0, 9.81)).unwrap();
    system.flush().unwrap();
    assert!(system.get_safe_state().initialized);
}
