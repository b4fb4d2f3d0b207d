//! Feature removal and initialization.
//!
//! Removal runs after each update, initialization after the anchor reset
//! so new features are expressed in the current anchor. Both keep the slot
//! arena and the covariance consistent: a freed or newly claimed slot has
//! its covariance rows and columns reset to the feature prior.

use nalgebra::Vector2;
use tracing::debug;

use super::feature::TrackStatus;
use super::state::{FeatureMean, FilterState};
use super::update::predict_pixel;
use crate::camera::Camera;
use crate::config::FilterConfig;
use crate::geometry::Bearing;
use crate::vision::{detect_corners, CornerParams, ImagePyramid, Patch};

/// `(bearing variance, depth variance)` of a new feature seen by `camera`.
pub fn feature_prior(config: &FilterConfig, camera: &Camera) -> (f64, f64) {
    let f = &config.features;
    let bearing_sigma = f.initial_bearing_sigma_px / camera.focal();
    (bearing_sigma * bearing_sigma, f.initial_depth_sigma * f.initial_depth_sigma)
}

/// Why a track is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Failures,
    OutOfView,
    InvalidDepth,
    LowQuality,
}

fn removal_reason(state: &FilterState, i: usize, config: &FilterConfig) -> Option<RemovalReason> {
    let f = &config.features;
    let slot = state.slots.slot(i);
    let stats = &slot.stats;
    if !state.depth.is_valid(state.mean.features[i].depth) {
        Some(RemovalReason::InvalidDepth)
    } else if stats.status == TrackStatus::OutOfView {
        Some(RemovalReason::OutOfView)
    } else if stats.consecutive_failures > f.max_consecutive_failures {
        Some(RemovalReason::Failures)
    } else if stats.age >= f.min_age_for_quality && stats.quality() < f.min_track_quality {
        Some(RemovalReason::LowQuality)
    } else {
        None
    }
}

/// Free slot `i` and reset its mean and covariance to the prior.
pub fn remove_feature(state: &mut FilterState, i: usize, config: &FilterConfig, prior: (f64, f64)) {
    state.slots.release(i);
    state.mean.features[i] = FeatureMean {
        bearing: Bearing::forward(),
        depth: state.depth.parameter(config.features.initial_distance),
    };
    state.reset_feature_covariance(i, prior.0, prior.1);
}

/// Drop unreliable tracks. Returns the number removed.
pub fn prune(state: &mut FilterState, cameras: &[Camera], config: &FilterConfig) -> usize {
    let mut removed = 0;
    for i in 0..state.slots.capacity() {
        if !state.slots.slot(i).valid {
            continue;
        }
        if let Some(reason) = removal_reason(state, i, config) {
            let slot = state.slots.slot(i);
            debug!("removing feature {} (slot {}): {:?}", slot.id, i, reason);
            let prior = feature_prior(config, &cameras[slot.camera]);
            remove_feature(state, i, config, prior);
            removed += 1;
        }
    }
    removed
}

/// True if a level-0 `pixel` leaves room for every pyramid patch and the
/// configured border.
fn fits_all_levels(
    pixel: &Vector2<f64>,
    camera: &Camera,
    pyramid: &ImagePyramid,
    config: &FilterConfig,
) -> bool {
    if !camera.contains(pixel, config.features.border_margin_px) {
        return false;
    }
    (0..pyramid.n_levels()).all(|l| {
        let level = pyramid.level(l);
        let center = ImagePyramid::to_level(pixel, l);
        Patch::fits(level.width(), level.height(), &center, config.patch_size)
    })
}

/// Fill free slots with corners detected in camera `camera_idx`. Returns
/// the number of features added.
pub fn add_features(
    state: &mut FilterState,
    camera_idx: usize,
    camera: &Camera,
    pyramid: &ImagePyramid,
    config: &FilterConfig,
) -> usize {
    if state.slots.first_free().is_none() {
        return 0;
    }
    let f = &config.features;
    let level = f.detection_level.min(pyramid.n_levels() - 1);
    let params = CornerParams {
        window_half: f.corner_window_half,
        bucket_size: f.bucket_size_px,
        min_score: f.min_corner_score,
        border: 1,
    };
    let candidates = detect_corners(pyramid.level(level), level, &params);

    // Pixels of everything already tracked by this camera.
    let mut taken: Vec<Vector2<f64>> = state
        .slots
        .valid_for_camera(camera_idx)
        .into_iter()
        .filter_map(|i| predict_pixel(&state.mean, i, camera_idx, camera, state.depth).ok())
        .map(|p| p.pixel)
        .collect();

    let prior = feature_prior(config, camera);
    let min_distance = f.min_feature_distance_px;
    let extrinsic = state.mean.extrinsics[camera_idx];
    let body = state.mean.robocentric_pose();
    let mut added = 0;

    for candidate in candidates {
        let Some(i) = state.slots.first_free() else {
            break;
        };
        let pixel = candidate.pixel;
        if !fits_all_levels(&pixel, camera, pyramid, config) {
            continue;
        }
        if taken.iter().any(|p| (p - pixel).norm() < min_distance) {
            continue;
        }
        let Ok(ray) = camera.unproject(&pixel) else {
            continue;
        };

        let p_b = extrinsic.transform_point(&(ray * f.initial_distance));
        let p_a = body.transform_point(&p_b);
        let Some(bearing) = Bearing::from_vector(&p_a) else {
            continue;
        };

        let id = state.slots.claim(i, camera_idx, state.anchor_epoch);
        let slot = state.slots.slot_mut(i);
        let captured = slot.patches.iter_mut().enumerate().all(|(l, patch)| {
            patch.extract_into(pyramid.level(l), &ImagePyramid::to_level(&pixel, l), l).is_ok()
        });
        if !captured {
            state.slots.release(i);
            continue;
        }
        slot.last_pixel = Some(pixel);
        state.mean.features[i] = FeatureMean { bearing, depth: state.depth.parameter(p_a.norm()) };
        state.reset_feature_covariance(i, prior.0, prior.1);
        debug!(
            "added feature {} in slot {} at ({:.1}, {:.1}), score {:.1}",
            id, i, pixel.x, pixel.y, candidate.score
        );
        taken.push(pixel);
        added += 1;
    }
    added
}
