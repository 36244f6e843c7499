//! Newton-family solvers sharing one iteration loop.

pub mod line_search;
pub mod newton;
pub mod trust_region;

use log::debug;
use strata::shape::broadcast_shapes;
use strata::{Float, Tensor};

use crate::convergence::{max_of, row_norms, Tolerances};
use crate::error::Result;
use crate::linalg::LinearSolver;
use crate::result::{RetCode, SolveResult};
use crate::system::NonlinearSystem;

/// Solves a [`NonlinearSystem`] from an initial guess.
pub trait NonlinearSolver<F: Float> {
    /// Iterate from `guess` (assembly form `(batch; n)`) until every batch
    /// entry converges or the iteration limit is hit.
    ///
    /// Running out of iterations is reported as [`RetCode::MaxIter`], not as
    /// an error. On return the system holds the returned solution.
    fn solve(
        &self,
        system: &mut dyn NonlinearSystem<F>,
        guess: &Tensor<F>,
    ) -> Result<SolveResult<F>>;
}

/// Hooks of the Newton-family iteration.
///
/// Every implementor gets [`NonlinearSolver`] through the shared loop:
/// check the initial residual, [`prepare`](Self::prepare), then
/// [`update`](Self::update) until converged.
pub trait NewtonIteration<F: Float> {
    /// Solver data living for one solve, e.g. trust-region radii.
    type State;

    fn tolerances(&self) -> &Tolerances<F>;

    fn linear_solver(&self) -> &dyn LinearSolver<F>;

    /// Check the configuration before iterating.
    fn validate(&self) -> Result<()> {
        self.tolerances().validate()
    }

    fn prepare(&self, system: &dyn NonlinearSystem<F>, u: &Tensor<F>) -> Result<Self::State>;

    /// Produce the next iterate from `u` with residual `r` and Jacobian `j`.
    ///
    /// The system may be moved to trial points; the loop resets it to the
    /// returned iterate afterwards.
    fn update(
        &self,
        system: &mut dyn NonlinearSystem<F>,
        state: &mut Self::State,
        u: &Tensor<F>,
        r: &Tensor<F>,
        j: &Tensor<F>,
    ) -> Result<Tensor<F>>;

    /// The extra update applied after convergence when the system requires grad.
    fn final_update(&self, u: &Tensor<F>, r: &Tensor<F>, j: &Tensor<F>) -> Result<Tensor<F>> {
        Ok(u.add(&newton_step(self.linear_solver(), r, j)?)?)
    }
}

/// The full Newton step `Δ = -J⁻¹ r`.
pub fn newton_step<F: Float>(
    linear_solver: &dyn LinearSolver<F>,
    r: &Tensor<F>,
    j: &Tensor<F>,
) -> Result<Tensor<F>> {
    linear_solver.solve(j, &r.neg())
}

fn finish<F: Float, S: NewtonIteration<F> + ?Sized>(
    solver: &S,
    system: &mut dyn NonlinearSystem<F>,
    u: Tensor<F>,
    r: &Tensor<F>,
    iterations: usize,
) -> Result<SolveResult<F>> {
    let solution = if system.requires_grad() {
        let j = system.jacobian()?;
        let u = solver.final_update(&u, r, &j)?;
        system.set_solution(&u)?;
        u
    } else {
        u
    };
    Ok(SolveResult {
        ret: RetCode::Success,
        solution,
        iterations,
    })
}

impl<F: Float, S: NewtonIteration<F>> NonlinearSolver<F> for S {
    fn solve(
        &self,
        system: &mut dyn NonlinearSystem<F>,
        guess: &Tensor<F>,
    ) -> Result<SolveResult<F>> {
        self.validate()?;
        let tol = self.tolerances();

        system.set_solution(guess)?;
        let mut r = system.residual()?;
        let batch = broadcast_shapes(guess.batch_sizes(), r.batch_sizes())?;
        let mut u = guess.batch_expand(&batch)?;
        let nr0 = row_norms(&r);
        debug!("iteration   0, |R| = {}", max_of(&nr0));

        if tol.converged(&nr0, &nr0) {
            return finish(self, system, u, &r, 0);
        }

        let mut state = self.prepare(system, &u)?;

        for i in 1..tol.max_iterations {
            let j = system.jacobian()?;
            u = self.update(system, &mut state, &u, &r, &j)?;
            system.set_solution(&u)?;
            r = system.residual()?;
            let nr = row_norms(&r);
            debug!(
                "iteration {i:>3}, |R| = {}, |R0| = {}",
                max_of(&nr),
                max_of(&nr0)
            );

            if tol.converged(&nr, &nr0) {
                return finish(self, system, u, &r, i);
            }
        }

        Ok(SolveResult {
            ret: RetCode::MaxIter,
            solution: u,
            iterations: tol.max_iterations,
        })
    }
}
