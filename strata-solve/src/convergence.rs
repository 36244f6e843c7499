use num_traits::Float;
use strata::shape::numel;
use strata::Tensor;

use crate::error::{Result, SolveError};

/// Absolute/relative residual tolerances and the iteration limit.
///
/// A batch entry has converged when `‖r‖ < atol` or `‖r‖ / ‖r₀‖ < rtol`; the
/// solve stops once every entry has.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tolerances<F> {
    /// Absolute residual norm tolerance (default: 1e-10).
    pub atol: F,
    /// Relative residual norm tolerance (default: 1e-8).
    pub rtol: F,
    /// Iteration limit (default: 100).
    pub max_iterations: usize,
}

impl<F: strata::Float> Default for Tolerances<F> {
    fn default() -> Self {
        Tolerances {
            atol: F::lit(1e-10),
            rtol: F::lit(1e-8),
            max_iterations: 100,
        }
    }
}

impl<F: strata::Float> Tolerances<F> {
    pub fn validate(&self) -> Result<()> {
        if !(self.atol >= F::zero()) || !(self.rtol >= F::zero()) {
            return Err(SolveError::InvalidConfig(format!(
                "tolerances must be non-negative, got atol = {}, rtol = {}",
                self.atol, self.rtol
            )));
        }
        if self.max_iterations == 0 {
            return Err(SolveError::InvalidConfig(
                "max_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Whether every batch entry passes, given current and initial norms.
    pub fn converged(&self, nr: &[F], nr0: &[F]) -> bool {
        nr.iter()
            .zip(nr0)
            .all(|(&n, &n0)| n < self.atol || n / n0 < self.rtol)
    }
}

/// Compute the L2 norm of a vector.
pub fn norm<F: Float>(v: &[F]) -> F {
    let mut s = F::zero();
    for &x in v {
        s = s + x * x;
    }
    s.sqrt()
}

/// Compute the dot product of two vectors.
pub fn dot<F: Float>(a: &[F], b: &[F]) -> F {
    debug_assert_eq!(a.len(), b.len());
    let mut s = F::zero();
    for i in 0..a.len() {
        s = s + a[i] * b[i];
    }
    s
}

/// Per-entry rows of an assembled `(batch; n)` tensor, flattened row-major.
pub(crate) fn rows<F: strata::Float>(t: &Tensor<F>) -> (Vec<F>, usize) {
    (t.to_vec(), t.base_numel())
}

/// L2 norm of every batch entry of an assembled vector.
pub(crate) fn row_norms<F: strata::Float>(t: &Tensor<F>) -> Vec<F> {
    let (data, n) = rows(t);
    if n == 0 {
        return vec![F::zero(); numel(t.leading_sizes())];
    }
    data.chunks(n).map(norm).collect()
}

/// Largest entry, for log lines.
pub(crate) fn max_of<F: strata::Float>(v: &[F]) -> F {
    v.iter().copied().fold(F::zero(), F::max)
}
