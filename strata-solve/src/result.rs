use std::fmt;

use strata::Tensor;

/// Outcome of a nonlinear solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RetCode {
    /// Every batch entry met the absolute or relative tolerance.
    Success,
    /// The iteration limit was reached first.
    MaxIter,
}

impl fmt::Display for RetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetCode::Success => write!(f, "converged"),
            RetCode::MaxIter => write!(f, "maximum iterations reached"),
        }
    }
}

/// Result of [`NonlinearSolver::solve`](crate::NonlinearSolver::solve).
#[derive(Debug, Clone)]
pub struct SolveResult<F> {
    /// Why the solver stopped.
    pub ret: RetCode,
    /// Final iterate in assembly form `(batch; n)`.
    pub solution: Tensor<F>,
    /// Iterations taken; equals the iteration limit on [`RetCode::MaxIter`].
    pub iterations: usize,
}

impl<F> SolveResult<F> {
    pub fn converged(&self) -> bool {
        self.ret == RetCode::Success
    }
}
