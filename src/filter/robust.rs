//! Robust weighting of photometric residuals.
//!
//! Each pixel residual gets an IRLS weight; the weighted rows enter the
//! per-feature normal equations as `sqrt(w) * row`.
//!
//! | Kernel | Behavior |
//! |--------|----------|
//! | Huber | Linear beyond the threshold |
//! | Cauchy | Heavy-tailed |
//! | Tukey | Zero weight beyond the cutoff |

use serde::{Deserialize, Serialize};

/// Robust kernel applied to intensity residuals (intensity levels, 0..255).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RobustKernel {
    /// Plain least squares.
    None,

    /// Weight: 1.0 if |r| ≤ threshold, else threshold/|r|
    Huber { threshold: f64 },

    /// Weight: 1 / (1 + (r/scale)²)
    Cauchy { scale: f64 },

    /// Weight: (1 - (r/c)²)² if |r| ≤ c, else 0
    Tukey { c: f64 },
}

impl Default for RobustKernel {
    fn default() -> Self {
        Self::Huber { threshold: 20.0 }
    }
}

impl RobustKernel {
    /// IRLS weight in [0, 1] for one residual.
    #[inline]
    pub fn weight(&self, residual: f64) -> f64 {
        let r = residual.abs();
        match *self {
            Self::None => 1.0,
            Self::Huber { threshold } => {
                if r <= threshold {
                    1.0
                } else {
                    threshold / r
                }
            }
            Self::Cauchy { scale } => {
                let u = r / scale;
                1.0 / (1.0 + u * u)
            }
            Self::Tukey { c } => {
                if r <= c {
                    let u = r / c;
                    let v = 1.0 - u * u;
                    v * v
                } else {
                    0.0
                }
            }
        }
    }

    /// The kernel's scale parameter, if it has one.
    pub fn scale(&self) -> Option<f64> {
        match *self {
            Self::None => None,
            Self::Huber { threshold } => Some(threshold),
            Self::Cauchy { scale } => Some(scale),
            Self::Tukey { c } => Some(c),
        }
    }
}
