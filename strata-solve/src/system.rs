//! The residual/Jacobian abstraction the solvers iterate on.

use strata::{Float, LabeledAxis, Tensor};

use crate::error::Result;

/// A square nonlinear system `r(u) = 0` in assembly form.
///
/// The solution `u` is `(batch; n)` laid out on [`unknown_axis`](Self::unknown_axis),
/// the residual `(batch; n)` on [`residual_axis`](Self::residual_axis) and the
/// Jacobian `(batch; n, n)`. Residual and Jacobian are always evaluated at the
/// most recent [`set_solution`](Self::set_solution).
pub trait NonlinearSystem<F: Float> {
    fn unknown_axis(&self) -> &LabeledAxis;

    fn residual_axis(&self) -> &LabeledAxis;

    fn set_solution(&mut self, u: &Tensor<F>) -> Result<()>;

    /// The current solution, if one was set.
    fn solution(&self) -> Option<&Tensor<F>>;

    fn residual(&mut self) -> Result<Tensor<F>>;

    fn jacobian(&mut self) -> Result<Tensor<F>>;

    /// Both at once; override when one evaluation yields both.
    fn residual_and_jacobian(&mut self) -> Result<(Tensor<F>, Tensor<F>)> {
        Ok((self.residual()?, self.jacobian()?))
    }

    /// Whether the residual feeds an outer differentiation, in which case a
    /// converged solve always finishes with one extra Newton update.
    fn requires_grad(&self) -> bool {
        false
    }
}
