//! Photometric iterated EKF update.
//!
//! For each tracked feature the patch residual `I_obs(px + o_j) - T_j` over
//! all active pyramid levels is linearized in the predicted pixel and
//! compressed to an equivalent 2-D measurement through its normal
//! equations:
//!
//! ```text
//! G = Σ w_j g_j g_jᵀ = L Lᵀ,   h = Σ w_j g_j r_j
//! r̃ = L⁻¹ h,                 H̃ = Lᵀ ∂px/∂δx
//! ```
//!
//! The stacked 2-D blocks drive an iterated EKF with coarse-to-fine level
//! scheduling, a per-feature chi-square gate on the prior innovation, a
//! patch-rejection test on the mean absolute intensity error and a
//! Joseph-form covariance update.

use std::ops::RangeInclusive;

use nalgebra::{DMatrix, DVector, Matrix2, Vector2, Vector3};
use tracing::debug;

use super::feature::{DepthParameterization, FeatureArena, FeatureSlot, TrackStatus};
use super::layout::*;
use super::state::{FilterState, StateMean};
use crate::camera::Camera;
use crate::config::FilterConfig;
use crate::error::{DivergenceReason, ProjectionFailure, VioError};
use crate::geometry::skew;
use crate::vision::{ImagePyramid, Patch};

/// Why an image contributed prediction only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No IMU sample yet, so there is no attitude to work with.
    AwaitingImu,
    /// No feature of this camera could be observed.
    NoFeatures,
    /// Too few features converged.
    NotConverged { converged: usize, required: usize },
}

/// Per-image summary returned by the estimator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateReport {
    pub timestamp: f64,
    pub camera: usize,
    /// Valid features owned by the camera.
    pub candidates: usize,
    /// Candidates predicted inside the image.
    pub predicted_visible: usize,
    /// Features in the final linearization.
    pub used: usize,
    pub converged: usize,
    pub outliers: usize,
    pub iterations: usize,
    pub skipped: Option<SkipReason>,
    pub added: usize,
    pub removed: usize,
    pub anchor_reset: bool,
}

impl UpdateReport {
    pub fn new(timestamp: f64, camera: usize) -> Self {
        Self { timestamp, camera, ..Self::default() }
    }

    /// The skip reason as an error value, for callers that want one.
    pub fn error(&self) -> Option<VioError> {
        match self.skipped {
            Some(SkipReason::NotConverged { converged, required }) => {
                Some(VioError::UpdateNotConverged { converged, required })
            }
            _ => None,
        }
    }
}

/// Predicted pixel of a feature and its Jacobian w.r.t. the error state.
#[derive(Debug, Clone)]
pub struct PixelPrediction {
    pub pixel: Vector2<f64>,
    /// 2 x dim
    pub jacobian: DMatrix<f64>,
    pub point_camera: Vector3<f64>,
}

/// Project feature `slot` into camera `camera_idx`:
/// `P_C = R_BCᵀ (R_ABᵀ (d μ - p_AB) - p_BC)`.
pub fn predict_pixel(
    mean: &StateMean,
    slot: usize,
    camera_idx: usize,
    camera: &Camera,
    depth: DepthParameterization,
) -> Result<PixelPrediction, ProjectionFailure> {
    let layout = mean.layout();
    let f = &mean.features[slot];
    if !depth.is_valid(f.depth) {
        return Err(ProjectionFailure::NonFinite);
    }
    let mu = f.bearing.vector();
    let d = depth.distance(f.depth);
    let dd = depth.derivative(f.depth);

    let p_a = mu * d;
    let r_ab = mean.attitude.to_rotation_matrix().into_inner();
    let p_b = r_ab.transpose() * (p_a - mean.position);
    let ext = &mean.extrinsics[camera_idx];
    let r_bc = ext.rotation_matrix();
    let r_cb = r_bc.transpose();
    let p_c = r_cb * (p_b - ext.translation);

    let proj = camera.project(&p_c)?;
    let j = proj.jacobian;
    let r_ca = r_cb * r_ab.transpose();

    let mut jac = DMatrix::zeros(2, layout.dim());
    jac.fixed_view_mut::<2, 3>(0, POS).copy_from(&(j * (-r_ca)));
    jac.fixed_view_mut::<2, 3>(0, ATT).copy_from(&(j * r_cb * skew(&p_b)));
    let e = layout.extrinsic(camera_idx);
    jac.fixed_view_mut::<2, 3>(0, e).copy_from(&(j * (-r_cb)));
    jac.fixed_view_mut::<2, 3>(0, e + 3).copy_from(&(j * skew(&p_c)));
    let s = layout.feature(slot);
    jac.fixed_view_mut::<2, 2>(0, s).copy_from(&(j * r_ca * f.bearing.derivative() * d));
    jac.fixed_view_mut::<2, 1>(0, s + 2).copy_from(&(j * r_ca * mu * dd));

    Ok(PixelPrediction { pixel: proj.pixel, jacobian: jac, point_camera: p_c })
}

/// Reduced 2-D measurement of one feature at one linearization point.
#[derive(Debug, Clone)]
struct FeatureObservation {
    slot: usize,
    /// ∂px/∂δx, 2 x dim
    pixel_jacobian: DMatrix<f64>,
    residual: Vector2<f64>,
    /// Lᵀ ∂px/∂δx, 2 x dim
    jacobian: DMatrix<f64>,
    /// Mean absolute intensity error over every sampled pixel.
    patch_error: f64,
}

enum Observation {
    Observed(FeatureObservation),
    Unobservable,
    OutOfView,
}

/// One solved IEKF iteration.
struct Linearization {
    observations: Vec<FeatureObservation>,
    gain: DMatrix<f64>,
    stacked_jacobian: DMatrix<f64>,
    delta_prior: DVector<f64>,
    /// Predicted pixel motion of each observation caused by the last step.
    pixel_steps: Vec<f64>,
}

struct IekfOutcome {
    mean: StateMean,
    linearization: Option<Linearization>,
    iterations: usize,
    /// Classification at the prior for features that were not observed.
    unobserved: Vec<(usize, TrackStatus)>,
}

/// Photometric update of one camera image.
pub struct PhotometricUpdate<'a> {
    pub config: &'a FilterConfig,
    pub camera_idx: usize,
    pub camera: &'a Camera,
    pub pyramid: &'a ImagePyramid,
}

impl<'a> PhotometricUpdate<'a> {
    fn sigma2(&self) -> f64 {
        self.config.update.intensity_sigma * self.config.update.intensity_sigma
    }

    /// Levels used at iteration `iter`; one finer level joins per iteration.
    fn levels_for(&self, iter: usize) -> RangeInclusive<usize> {
        let coarsest = self.config.coarsest_level();
        let finest = self.config.update.finest_level.min(coarsest);
        coarsest.saturating_sub(iter).max(finest)..=coarsest
    }

    fn observe(
        &self,
        mean: &StateMean,
        slot_idx: usize,
        slot: &FeatureSlot,
        levels: RangeInclusive<usize>,
        depth: DepthParameterization,
        scratch: &mut [Patch],
    ) -> Observation {
        let pred = match predict_pixel(mean, slot_idx, self.camera_idx, self.camera, depth) {
            Ok(p) => p,
            Err(_) => return Observation::OutOfView,
        };
        if !self.camera.contains(&pred.pixel, 0.0) {
            return Observation::OutOfView;
        }

        let kernel = self.config.update.robust_kernel;
        let normalize = self.config.update.normalize_intensity;
        let mut info = Matrix2::zeros();
        let mut rhs = Vector2::zeros();
        let mut used_levels = 0;
        let mut abs_error = 0.0;
        let mut pixels = 0usize;

        for level in levels {
            let observed = &mut scratch[level];
            let center = ImagePyramid::to_level(&pred.pixel, level);
            if observed.extract_into(self.pyramid.level(level), &center, level).is_err() {
                continue;
            }
            let template = &slot.patches[level];
            let inv_scale = 1.0 / (1u32 << level) as f64;

            let (obs_mean, tmpl_mean, grad_mean) = if normalize {
                (
                    observed.mean_intensity() as f64,
                    template.mean_intensity() as f64,
                    observed.mean_gradient().map(|v| v as f64),
                )
            } else {
                (0.0, 0.0, Vector2::zeros())
            };

            for k in 0..observed.len() {
                let r = (observed.intensity[k] as f64 - obs_mean)
                    - (template.intensity[k] as f64 - tmpl_mean);
                let g = Vector2::new(
                    observed.grad_x[k] as f64 - grad_mean.x,
                    observed.grad_y[k] as f64 - grad_mean.y,
                ) * inv_scale;
                let w = kernel.weight(r);
                info += w * g * g.transpose();
                rhs += w * r * g;
                abs_error += r.abs();
            }
            pixels += observed.len();
            used_levels += 1;
        }
        if used_levels == 0 {
            return Observation::Unobservable;
        }

        let (a, b, c) = (info[(0, 0)], info[(0, 1)], info[(1, 1)]);
        let min_eig = 0.5 * (a + c) - (0.25 * (a - c) * (a - c) + b * b).sqrt();
        if !(min_eig >= self.config.update.min_patch_information) {
            return Observation::Unobservable;
        }
        let l = match info.cholesky() {
            Some(chol) => chol.l(),
            None => return Observation::Unobservable,
        };
        let residual = match l.solve_lower_triangular(&rhs) {
            Some(r) => r,
            None => return Observation::Unobservable,
        };
        let lt = l.transpose();
        let jacobian = DMatrix::from_fn(2, pred.jacobian.ncols(), |r, col| {
            lt[(r, 0)] * pred.jacobian[(0, col)] + lt[(r, 1)] * pred.jacobian[(1, col)]
        });

        Observation::Observed(FeatureObservation {
            slot: slot_idx,
            pixel_jacobian: pred.jacobian,
            residual,
            jacobian,
            patch_error: abs_error / pixels as f64,
        })
    }

    /// Solve one IEKF step: `δ = δ_prior - K (e + H δ_prior)`.
    fn solve(
        &self,
        p: &DMatrix<f64>,
        observations: &[FeatureObservation],
        delta_prior: &DVector<f64>,
    ) -> Option<(DVector<f64>, DMatrix<f64>, DMatrix<f64>)> {
        let n = p.nrows();
        let m = 2 * observations.len();
        let mut h = DMatrix::zeros(m, n);
        let mut e = DVector::zeros(m);
        for (f, o) in observations.iter().enumerate() {
            h.rows_mut(2 * f, 2).copy_from(&o.jacobian);
            e[2 * f] = o.residual.x;
            e[2 * f + 1] = o.residual.y;
        }

        let pht = p * h.transpose();
        let mut s = &h * &pht;
        for i in 0..m {
            s[(i, i)] += self.sigma2();
        }
        let chol = s.cholesky()?;
        let gain = chol.solve(&pht.transpose()).transpose();
        let innovation = e + &h * delta_prior;
        let delta = delta_prior - &gain * innovation;
        Some((delta, gain, h))
    }

    fn run_iekf(
        &self,
        prior: &StateMean,
        p: &DMatrix<f64>,
        active: &[usize],
        slots: &FeatureArena,
        depth: DepthParameterization,
        scratch: &mut [Patch],
    ) -> IekfOutcome {
        let u = &self.config.update;
        let finest = self.levels_for(usize::MAX);
        let mut x = prior.clone();
        let mut linearization = None;
        let mut iterations = 0;
        let mut unobserved = Vec::new();

        for iter in 0..u.max_iterations {
            let levels = self.levels_for(iter);
            let all_levels = levels.start() == finest.start();

            let mut observations = Vec::with_capacity(active.len());
            for &i in active {
                match self.observe(&x, i, slots.slot(i), levels.clone(), depth, scratch) {
                    Observation::Observed(o) => observations.push(o),
                    Observation::Unobservable if iter == 0 => {
                        unobserved.push((i, TrackStatus::Unobservable))
                    }
                    Observation::OutOfView if iter == 0 => {
                        unobserved.push((i, TrackStatus::OutOfView))
                    }
                    _ => {}
                }
            }
            if observations.is_empty() {
                break;
            }

            let delta_prior = prior.boxminus(&x);
            let Some((delta, gain, stacked_jacobian)) =
                self.solve(p, &observations, &delta_prior)
            else {
                break;
            };
            x.boxplus_in_place(&delta);
            iterations += 1;

            let pixel_steps: Vec<f64> = observations
                .iter()
                .map(|o| (&o.pixel_jacobian * &delta).norm())
                .collect();
            let step_small = delta.amax() < u.convergence_threshold
                || pixel_steps.iter().all(|s| *s < u.pixel_convergence_threshold);

            linearization = Some(Linearization {
                observations,
                gain,
                stacked_jacobian,
                delta_prior,
                pixel_steps,
            });
            if all_levels && step_small {
                break;
            }
        }

        IekfOutcome { mean: x, linearization, iterations, unobserved }
    }

    /// Slots whose prior innovation fails the chi-square gate, or whose
    /// stored patch no longer matches the image at the converged pixel.
    fn gate(&self, p: &DMatrix<f64>, lin: &Linearization) -> Vec<usize> {
        let gate = self.config.update.mahalanobis_gate;
        let rejection = self.config.update.patch_rejection_threshold;
        let mut outliers = Vec::new();
        for o in &lin.observations {
            if !(o.patch_error <= rejection) {
                debug!("slot {} rejected: patch error {:.1}", o.slot, o.patch_error);
                outliers.push(o.slot);
                continue;
            }
            let innovation = o.residual + {
                let v = &o.jacobian * &lin.delta_prior;
                Vector2::new(v[0], v[1])
            };
            let hp = &o.jacobian * p;
            let s_dyn = &hp * o.jacobian.transpose();
            let s = Matrix2::new(s_dyn[(0, 0)], s_dyn[(0, 1)], s_dyn[(1, 0)], s_dyn[(1, 1)])
                + Matrix2::identity() * self.sigma2();
            let d2 = match s.try_inverse() {
                Some(inv) => (innovation.transpose() * inv * innovation)[(0, 0)],
                None => f64::INFINITY,
            };
            if !(d2 <= gate) {
                outliers.push(o.slot);
            }
        }
        outliers
    }

    /// Run the update on `state`. Returns an error only when the resulting
    /// covariance fails the health check.
    pub fn apply(
        &self,
        state: &mut FilterState,
        timestamp: f64,
        scratch: &mut [Patch],
    ) -> Result<UpdateReport, DivergenceReason> {
        let mut report = UpdateReport::new(timestamp, self.camera_idx);
        let candidates = state.slots.valid_for_camera(self.camera_idx);
        report.candidates = candidates.len();
        if candidates.is_empty() {
            report.skipped = Some(SkipReason::NoFeatures);
            return Ok(report);
        }

        let prior = state.mean.clone();
        let depth = state.depth;
        let p = state.covariance().clone();

        let mut outcome = self.run_iekf(&prior, &p, &candidates, &state.slots, depth, scratch);
        let unobserved_at_prior = outcome.unobserved.clone();
        report.predicted_visible = candidates.len()
            - unobserved_at_prior.iter().filter(|(_, s)| *s == TrackStatus::OutOfView).count();

        let mut outliers = Vec::new();
        if let Some(lin) = &outcome.linearization {
            outliers = self.gate(&p, lin);
            if !outliers.is_empty() {
                let inliers: Vec<usize> = candidates
                    .iter()
                    .copied()
                    .filter(|i| !outliers.contains(i))
                    .collect();
                outcome = self.run_iekf(&prior, &p, &inliers, &state.slots, depth, scratch);
            }
        }
        report.outliers = outliers.len();
        report.iterations = outcome.iterations;

        // Classify every candidate.
        let mut statuses: Vec<(usize, TrackStatus)> = Vec::with_capacity(candidates.len());
        let mut converged = 0;
        for &i in &candidates {
            let status = if outliers.contains(&i) {
                TrackStatus::Outlier
            } else if let Some(f) = outcome
                .linearization
                .as_ref()
                .and_then(|lin| lin.observations.iter().position(|o| o.slot == i))
            {
                let threshold = self.config.update.pixel_convergence_threshold;
                let lin = outcome.linearization.as_ref();
                if lin.is_some_and(|l| l.pixel_steps[f] < threshold) {
                    converged += 1;
                }
                TrackStatus::Tracked
            } else {
                unobserved_at_prior
                    .iter()
                    .chain(outcome.unobserved.iter())
                    .find(|(s, _)| *s == i)
                    .map(|(_, st)| *st)
                    .unwrap_or(TrackStatus::Unobservable)
            };
            statuses.push((i, status));
        }
        report.used = statuses.iter().filter(|(_, s)| *s == TrackStatus::Tracked).count();
        report.converged = converged;

        let required = self.config.update.min_converged_features;
        let accepted = match &outcome.linearization {
            Some(_) if converged >= required => true,
            Some(_) => {
                report.skipped = Some(SkipReason::NotConverged { converged, required });
                false
            }
            None => {
                report.skipped = Some(SkipReason::NoFeatures);
                false
            }
        };

        if accepted {
            if let Some(lin) = &outcome.linearization {
                let n = p.nrows();
                let ikh = DMatrix::identity(n, n) - &lin.gain * &lin.stacked_jacobian;
                let p_new = &ikh * &p * ikh.transpose()
                    + (&lin.gain * lin.gain.transpose()) * self.sigma2();
                state.commit_covariance(p_new, &self.config.numerics)?;
                state.mean = outcome.mean;
            }
        } else {
            // Nothing was used; a frame that cannot be used counts as a failure.
            for (_, status) in statuses.iter_mut() {
                if *status == TrackStatus::Tracked {
                    *status = TrackStatus::Unobservable;
                }
            }
        }

        for (i, status) in statuses {
            let pixel = predict_pixel(&state.mean, i, self.camera_idx, self.camera, depth)
                .ok()
                .map(|p| p.pixel);
            let slot = state.slots.slot_mut(i);
            slot.stats.record(status);
            slot.last_pixel = pixel;
        }

        debug!(
            "update cam {} t={:.3}: {} candidates, {} used, {} converged, {} outliers, \
             {} iterations{}",
            self.camera_idx,
            timestamp,
            report.candidates,
            report.used,
            report.converged,
            report.outliers,
            report.iterations,
            if report.skipped.is_some() { " (skipped)" } else { "" }
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraCalibration;
    use crate::filter::numeric::numeric_jacobian;
    use crate::geometry::{Bearing, SE3};
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn config() -> FilterConfig {
        FilterConfig {
            max_features: 2,
            cameras: vec![CameraCalibration::pinhole(320, 240, 200.0)],
            ..FilterConfig::default()
        }
    }

    #[test]
    fn test_pixel_jacobian_matches_numeric() {
        let config = config();
        let camera = Camera::new(config.cameras[0].clone()).unwrap();
        let extrinsic = SE3::new(
            UnitQuaternion::from_euler_angles(0.02, -0.01, 0.03),
            Vector3::new(0.05, 0.0, 0.01),
        );
        let mut state = FilterState::new(&config, vec![extrinsic], (1e-4, 0.25));
        state.mean.position = Vector3::new(0.1, -0.05, 0.02);
        state.mean.attitude = UnitQuaternion::from_euler_angles(0.05, 0.04, -0.1);
        state.mean.features[1] = crate::filter::state::FeatureMean {
            bearing: Bearing::from_vector(&Vector3::new(0.1, -0.15, 1.0)).unwrap(),
            depth: 0.4,
        };

        for depth in [
            DepthParameterization::Inverse,
            DepthParameterization::Regular,
            DepthParameterization::Log,
        ] {
            let mut mean = state.mean.clone();
            mean.features[1].depth = depth.parameter(2.5);
            let analytic = predict_pixel(&mean, 1, 0, &camera, depth).unwrap().jacobian;
            let dim = mean.layout().dim();
            let numeric = numeric_jacobian(&mean, &[0..dim], 1e-6, |m| {
                let px = predict_pixel(m, 1, 0, &camera, depth).unwrap().pixel;
                DVector::from_vec(vec![px.x, px.y])
            });
            for r in 0..2 {
                for c in 0..dim {
                    assert_relative_eq!(
                        analytic[(r, c)],
                        numeric[(r, c)],
                        epsilon = 1e-4,
                        max_relative = 1e-5
                    );
                }
            }
        }
    }

    #[test]
    fn test_invalid_depth_is_projection_failure() {
        let config = config();
        let camera = Camera::new(config.cameras[0].clone()).unwrap();
        let mut state = FilterState::new(&config, vec![SE3::identity()], (1e-4, 0.25));
        state.mean.features[0].depth = -0.5;
        assert!(predict_pixel(&state.mean, 0, 0, &camera, DepthParameterization::Inverse).is_err());
    }

    #[test]
    fn test_level_schedule_is_coarse_to_fine() {
        let config = config();
        let camera = Camera::new(config.cameras[0].clone()).unwrap();
        let pyramid = ImagePyramid::new(320, 240, config.pyramid_levels);
        let update = PhotometricUpdate {
            config: &config,
            camera_idx: 0,
            camera: &camera,
            pyramid: &pyramid,
        };
        assert_eq!(update.levels_for(0), 3..=3);
        assert_eq!(update.levels_for(1), 2..=3);
        assert_eq!(update.levels_for(3), 0..=3);
        assert_eq!(update.levels_for(9), 0..=3);
    }

    #[test]
    fn test_no_features_skips() {
        let config = config();
        let camera = Camera::new(config.cameras[0].clone()).unwrap();
        let pyramid = ImagePyramid::new(320, 240, config.pyramid_levels);
        let mut state = FilterState::new(&config, vec![SE3::identity()], (1e-4, 0.25));
        let update = PhotometricUpdate {
            config: &config,
            camera_idx: 0,
            camera: &camera,
            pyramid: &pyramid,
        };
        let mut scratch: Vec<Patch> = (0..config.pyramid_levels)
            .map(|_| Patch::new(config.patch_size))
            .collect();
        let report = update.apply(&mut state, 0.0, &mut scratch).unwrap();
        assert_eq!(report.skipped, Some(SkipReason::NoFeatures));
        assert!(report.error().is_none());
    }
}
