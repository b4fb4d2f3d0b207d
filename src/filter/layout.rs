//! Index map of the error state.
//!
//! ```text
//! | p_AB | v_B | θ_AB | b_g | b_a | p_WA | θ_WA | N × (p_BC, θ_BC) | M × (p_EW, θ_EW) | K × (δμ 2, δd 1) |
//!   0      3     6      9     12    15     18     21
//! ```

/// Robocentric position p_AB.
pub const POS: usize = 0;
/// Body-frame velocity v_B.
pub const VEL: usize = 3;
/// Robocentric attitude θ_AB.
pub const ATT: usize = 6;
pub const GYRO_BIAS: usize = 9;
pub const ACC_BIAS: usize = 12;
/// World position of the anchor p_WA.
pub const ANCHOR_POS: usize = 15;
/// World attitude of the anchor θ_WA.
pub const ANCHOR_ATT: usize = 18;
/// Dimension of the fixed core.
pub const CORE_DIM: usize = 21;
/// Rows of the core that prediction changes (pose, velocity, biases).
pub const PROPAGATED_DIM: usize = 15;

pub const EXTRINSIC_DIM: usize = 6;
pub const AUX_DIM: usize = 6;
pub const FEATURE_DIM: usize = 3;

/// Error-state dimensions for a given number of cameras, auxiliary poses
/// and feature slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateLayout {
    pub cameras: usize,
    pub aux_poses: usize,
    pub features: usize,
}

impl StateLayout {
    pub fn new(cameras: usize, aux_poses: usize, features: usize) -> Self {
        Self { cameras, aux_poses, features }
    }

    /// Total error-state dimension.
    pub fn dim(&self) -> usize {
        CORE_DIM
            + EXTRINSIC_DIM * self.cameras
            + AUX_DIM * self.aux_poses
            + FEATURE_DIM * self.features
    }

    /// Start of camera `c`'s extrinsic block (position, then attitude).
    pub fn extrinsic(&self, c: usize) -> usize {
        debug_assert!(c < self.cameras);
        CORE_DIM + EXTRINSIC_DIM * c
    }

    /// Start of auxiliary pose `k` (position, then attitude).
    pub fn aux(&self, k: usize) -> usize {
        debug_assert!(k < self.aux_poses);
        CORE_DIM + EXTRINSIC_DIM * self.cameras + AUX_DIM * k
    }

    /// Start of feature slot `i` (bearing 2, then depth 1).
    pub fn feature(&self, i: usize) -> usize {
        debug_assert!(i < self.features);
        CORE_DIM + EXTRINSIC_DIM * self.cameras + AUX_DIM * self.aux_poses + FEATURE_DIM * i
    }

    /// Human-readable name of the block containing `index`.
    pub fn block_name(&self, index: usize) -> &'static str {
        let extrinsics_end = CORE_DIM + EXTRINSIC_DIM * self.cameras;
        let aux_end = extrinsics_end + AUX_DIM * self.aux_poses;
        match index {
            i if i < VEL => "position",
            i if i < ATT => "velocity",
            i if i < GYRO_BIAS => "attitude",
            i if i < ACC_BIAS => "gyro_bias",
            i if i < ANCHOR_POS => "acc_bias",
            i if i < ANCHOR_ATT => "anchor_position",
            i if i < CORE_DIM => "anchor_attitude",
            i if i < extrinsics_end => "extrinsics",
            i if i < aux_end => "auxiliary_pose",
            i if i < self.dim() => "feature",
            _ => "out_of_range",
        }
    }
}
