use strata::{Float, Tensor};

use crate::convergence::Tolerances;
use crate::error::Result;
use crate::linalg::{DenseLu, LinearSolver};
use crate::solvers::{newton_step, NewtonIteration};
use crate::system::NonlinearSystem;

/// Configuration for the plain Newton solver.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NewtonConfig<F> {
    /// Convergence parameters.
    pub convergence: Tolerances<F>,
}

impl<F: Float> Default for NewtonConfig<F> {
    fn default() -> Self {
        NewtonConfig {
            convergence: Tolerances::default(),
        }
    }
}

/// Newton-Raphson, always taking the full step `Δ = -J⁻¹ r`.
#[derive(Debug, Clone)]
pub struct Newton<F, L = DenseLu> {
    config: NewtonConfig<F>,
    linear_solver: L,
}

impl<F: Float> Newton<F> {
    pub fn new(config: NewtonConfig<F>) -> Self {
        Self::with_linear_solver(config, DenseLu)
    }
}

impl<F: Float> Default for Newton<F> {
    fn default() -> Self {
        Self::new(NewtonConfig::default())
    }
}

impl<F: Float, L: LinearSolver<F>> Newton<F, L> {
    pub fn with_linear_solver(config: NewtonConfig<F>, linear_solver: L) -> Self {
        Newton {
            config,
            linear_solver,
        }
    }

    pub fn config(&self) -> &NewtonConfig<F> {
        &self.config
    }
}

impl<F: Float, L: LinearSolver<F>> NewtonIteration<F> for Newton<F, L> {
    type State = ();

    fn tolerances(&self) -> &Tolerances<F> {
        &self.config.convergence
    }

    fn linear_solver(&self) -> &dyn LinearSolver<F> {
        &self.linear_solver
    }

    fn prepare(&self, _system: &dyn NonlinearSystem<F>, _u: &Tensor<F>) -> Result<()> {
        Ok(())
    }

    fn update(
        &self,
        _system: &mut dyn NonlinearSystem<F>,
        _state: &mut (),
        u: &Tensor<F>,
        r: &Tensor<F>,
        j: &Tensor<F>,
    ) -> Result<Tensor<F>> {
        Ok(u.add(&newton_step(&self.linear_solver, r, j)?)?)
    }
}
