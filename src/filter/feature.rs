//! Feature slots: depth parameterization, tracking statistics and the
//! pre-allocated slot arena.
//!
//! The filter mean of a feature (bearing and depth) lives in
//! [`StateMean`](super::state::StateMean); this module holds everything
//! else that belongs to a slot: validity, owning camera, anchor epoch,
//! multi-level patch templates and counters.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::vision::Patch;

/// How the scalar depth parameter maps to metric distance along the bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthParameterization {
    /// d = p
    Regular,
    /// d = 1 / p
    Inverse,
    /// d = exp(p)
    Log,
}

impl Default for DepthParameterization {
    fn default() -> Self {
        Self::Inverse
    }
}

impl DepthParameterization {
    /// Metric distance for parameter `p`.
    #[inline]
    pub fn distance(&self, p: f64) -> f64 {
        match self {
            Self::Regular => p,
            Self::Inverse => 1.0 / p,
            Self::Log => p.exp(),
        }
    }

    /// ∂distance/∂p
    #[inline]
    pub fn derivative(&self, p: f64) -> f64 {
        match self {
            Self::Regular => 1.0,
            Self::Inverse => -1.0 / (p * p),
            Self::Log => p.exp(),
        }
    }

    /// Parameter for metric distance `d`.
    #[inline]
    pub fn parameter(&self, d: f64) -> f64 {
        match self {
            Self::Regular => d,
            Self::Inverse => 1.0 / d,
            Self::Log => d.ln(),
        }
    }

    /// True if `p` maps to a finite, strictly positive distance.
    #[inline]
    pub fn is_valid(&self, p: f64) -> bool {
        if !p.is_finite() {
            return false;
        }
        match self {
            Self::Regular | Self::Inverse => p > 0.0,
            Self::Log => p.exp().is_finite(),
        }
    }
}

/// Outcome of the last frame for one feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackStatus {
    /// Not yet seen by an update.
    #[default]
    New,
    /// Used by the accepted update.
    Tracked,
    /// Rejected by the innovation gate.
    Outlier,
    /// Inside the image but no usable patch (border, textureless).
    Unobservable,
    /// Projection failed or fell outside the image.
    OutOfView,
}

/// Per-feature counters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FeatureStatistics {
    /// Images of the owning camera since initialization.
    pub age: usize,
    /// Times used by an accepted update.
    pub observed: usize,
    /// Times rejected by the gate.
    pub outliers: usize,
    /// Frames in a row that were outliers or unobservable.
    pub consecutive_failures: usize,
    pub status: TrackStatus,
}

impl FeatureStatistics {
    /// Fraction of frames in which the feature was used.
    pub fn quality(&self) -> f64 {
        if self.age == 0 {
            1.0
        } else {
            self.observed as f64 / self.age as f64
        }
    }

    /// Record the outcome of one frame.
    pub fn record(&mut self, status: TrackStatus) {
        self.age += 1;
        self.status = status;
        match status {
            TrackStatus::Tracked => {
                self.observed += 1;
                self.consecutive_failures = 0;
            }
            TrackStatus::Outlier => {
                self.outliers += 1;
                self.consecutive_failures += 1;
            }
            TrackStatus::Unobservable | TrackStatus::OutOfView => {
                self.consecutive_failures += 1;
            }
            TrackStatus::New => {}
        }
    }
}

/// Non-mean part of a feature sub-state.
#[derive(Debug, Clone)]
pub struct FeatureSlot {
    pub valid: bool,
    /// Unique track id; never reused.
    pub id: u64,
    pub camera: usize,
    /// Anchor epoch the bearing/depth are expressed in.
    pub anchor_epoch: u64,
    /// One template per pyramid level, captured at initialization.
    pub patches: Vec<Patch>,
    pub stats: FeatureStatistics,
    /// Pixel predicted at the end of the last update.
    pub last_pixel: Option<Vector2<f64>>,
}

impl FeatureSlot {
    fn empty(n_levels: usize, patch_size: usize) -> Self {
        Self {
            valid: false,
            id: 0,
            camera: 0,
            anchor_epoch: 0,
            patches: (0..n_levels).map(|_| Patch::new(patch_size)).collect(),
            stats: FeatureStatistics::default(),
            last_pixel: None,
        }
    }

    /// Invalidate the slot and wipe all per-track data.
    pub fn clear(&mut self) {
        self.valid = false;
        self.id = 0;
        self.camera = 0;
        self.anchor_epoch = 0;
        self.patches.iter_mut().for_each(Patch::clear);
        self.stats = FeatureStatistics::default();
        self.last_pixel = None;
    }
}

/// Fixed-capacity set of feature slots, allocated once.
#[derive(Debug, Clone)]
pub struct FeatureArena {
    slots: Vec<FeatureSlot>,
    next_id: u64,
}

impl FeatureArena {
    pub fn new(capacity: usize, n_levels: usize, patch_size: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| FeatureSlot::empty(n_levels, patch_size)).collect(),
            next_id: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, i: usize) -> &FeatureSlot {
        &self.slots[i]
    }

    pub fn slot_mut(&mut self, i: usize) -> &mut FeatureSlot {
        &mut self.slots[i]
    }

    pub fn slots(&self) -> &[FeatureSlot] {
        &self.slots
    }

    pub fn valid_count(&self) -> usize {
        self.slots.iter().filter(|s| s.valid).count()
    }

    /// Indices of valid slots tracked by `camera`.
    pub fn valid_for_camera(&self, camera: usize) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.valid && s.camera == camera)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.valid)
    }

    /// Claim slot `i` for a new track: everything is wiped and a fresh id
    /// is assigned. Patches must be filled by the caller.
    pub fn claim(&mut self, i: usize, camera: usize, anchor_epoch: u64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let slot = &mut self.slots[i];
        slot.clear();
        slot.valid = true;
        slot.id = id;
        slot.camera = camera;
        slot.anchor_epoch = anchor_epoch;
        id
    }

    pub fn release(&mut self, i: usize) {
        self.slots[i].clear();
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(FeatureSlot::clear);
        self.next_id = 1;
    }
}
