//! Finite-difference Jacobians on the state manifold.
//!
//! Used by the auxiliary pose update (which has no analytic Jacobian) and
//! by the Jacobian self-test.

use std::ops::Range;

use nalgebra::{DMatrix, DVector};

use super::state::StateMean;

/// Central-difference Jacobian of a vector-valued `f` with respect to the
/// error-state columns listed in `columns`. Columns not listed are zero.
pub fn numeric_jacobian<F>(
    mean: &StateMean,
    columns: &[Range<usize>],
    eps: f64,
    f: F,
) -> DMatrix<f64>
where
    F: Fn(&StateMean) -> DVector<f64>,
{
    let dim = mean.layout().dim();
    let rows = f(mean).len();
    let mut jac = DMatrix::zeros(rows, dim);
    let mut delta = DVector::zeros(dim);
    for range in columns {
        for j in range.clone() {
            delta[j] = eps;
            let plus = f(&mean.boxplus(&delta));
            delta[j] = -eps;
            let minus = f(&mean.boxplus(&delta));
            delta[j] = 0.0;
            jac.set_column(j, &((plus - minus) / (2.0 * eps)));
        }
    }
    jac
}

/// Central-difference Jacobian of a state-to-state map `g`, with outputs
/// compared on the manifold: column j is `(g(x ⊞ εe_j) ⊟ g(x ⊞ -εe_j)) / 2ε`.
pub fn numeric_state_jacobian<G>(mean: &StateMean, eps: f64, g: G) -> DMatrix<f64>
where
    G: Fn(&StateMean) -> StateMean,
{
    let dim = mean.layout().dim();
    let reference = g(mean);
    let mut jac = DMatrix::zeros(dim, dim);
    let mut delta = DVector::zeros(dim);
    for j in 0..dim {
        delta[j] = eps;
        let plus = g(&mean.boxplus(&delta)).boxminus(&reference);
        delta[j] = -eps;
        let minus = g(&mean.boxplus(&delta)).boxminus(&reference);
        delta[j] = 0.0;
        jac.set_column(j, &((plus - minus) / (2.0 * eps)));
    }
    jac
}

/// Largest absolute entry of `a - b`.
pub fn max_abs_difference(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
    (a - b).amax()
}
