use log::{trace, warn};
use strata::shape::broadcast_all;
use strata::{Float, Tensor};

use crate::convergence::{dot, rows, Tolerances};
use crate::error::{Result, SolveError};
use crate::linalg::{DenseLu, LinearSolver};
use crate::solvers::{newton_step, NewtonIteration};
use crate::system::NonlinearSystem;

/// Sufficient-decrease test applied to each trial step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LineSearchKind {
    /// `‖r(u+αΔ)‖² ≤ ‖r‖² + 2cα⟨r, Δ⟩`
    #[default]
    Backtracking,
    /// `‖r(u+αΔ)‖² ≤ (1 - cα)‖r‖²`
    StrongWolfe,
}

/// Configuration for Newton with line search.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LineSearchConfig<F> {
    /// Convergence parameters of the outer Newton loop.
    pub convergence: Tolerances<F>,
    pub kind: LineSearchKind,
    /// Trial steps per outer iteration (default: 10). The last trial is
    /// taken when none satisfies the criterion.
    pub max_iterations: usize,
    /// Divisor applied to α of entries that fail the criterion (default: 2).
    pub cutback: F,
    /// The constant `c` of the criterion (default: 1e-3).
    pub stopping_criteria: F,
    /// Log a warning when the criterion threshold turns negative (default: false).
    pub check_negative_criterion: bool,
}

impl<F: Float> Default for LineSearchConfig<F> {
    fn default() -> Self {
        LineSearchConfig {
            convergence: Tolerances::default(),
            kind: LineSearchKind::Backtracking,
            max_iterations: 10,
            cutback: F::lit(2.0),
            stopping_criteria: F::lit(1e-3),
            check_negative_criterion: false,
        }
    }
}

/// Newton-Raphson with a per-entry backtracking line search along the Newton direction.
#[derive(Debug, Clone)]
pub struct NewtonWithLineSearch<F, L = DenseLu> {
    config: LineSearchConfig<F>,
    linear_solver: L,
}

impl<F: Float> NewtonWithLineSearch<F> {
    pub fn new(config: LineSearchConfig<F>) -> Self {
        Self::with_linear_solver(config, DenseLu)
    }
}

impl<F: Float> Default for NewtonWithLineSearch<F> {
    fn default() -> Self {
        Self::new(LineSearchConfig::default())
    }
}

impl<F: Float, L: LinearSolver<F>> NewtonWithLineSearch<F, L> {
    pub fn with_linear_solver(config: LineSearchConfig<F>, linear_solver: L) -> Self {
        NewtonWithLineSearch {
            config,
            linear_solver,
        }
    }

    pub fn config(&self) -> &LineSearchConfig<F> {
        &self.config
    }

    /// Search along `du` from `u`; returns the accepted iterate and the step
    /// length of every batch entry. Leaves the system at the returned iterate.
    pub fn search(
        &self,
        system: &mut dyn NonlinearSystem<F>,
        u: &Tensor<F>,
        r: &Tensor<F>,
        du: &Tensor<F>,
    ) -> Result<(Tensor<F>, Vec<F>)> {
        let c = self.config.stopping_criteria;
        let atol = self.config.convergence.atol;
        let two = F::lit(2.0);

        let batch = broadcast_all([u.batch_sizes(), r.batch_sizes(), du.batch_sizes()])?;
        let (u0, n) = rows(&u.batch_expand(&batch)?);
        let (du, _) = rows(&du.batch_expand(&batch)?);
        let (r0, _) = rows(&r.batch_expand(&batch)?);
        let nbatch = if n == 0 { 0 } else { u0.len() / n };

        let nb0: Vec<F> = r0.chunks(n.max(1)).map(|r| dot(r, r)).collect();
        let slope: Vec<F> = r0
            .chunks(n.max(1))
            .zip(du.chunks(n.max(1)))
            .map(|(r, d)| dot(r, d))
            .collect();

        let mut alpha = vec![F::one(); nbatch];
        let mut crit = nb0.clone();
        let mut trial_iter = 1;
        let trial = loop {
            let data: Vec<F> = u0
                .iter()
                .zip(&du)
                .enumerate()
                .map(|(k, (&x, &d))| x + alpha[k / n] * d)
                .collect();
            let trial = Tensor::from_shape_vec(&batch, &[], &[n], data)?;
            system.set_solution(&trial)?;
            let (rt, _) = rows(&system.residual()?.batch_expand(&batch)?);

            let mut all_stop = true;
            let mut stop = vec![false; nbatch];
            for (b, rb) in rt.chunks(n.max(1)).take(nbatch).enumerate() {
                let nb = dot(rb, rb);
                crit[b] = match self.config.kind {
                    LineSearchKind::Backtracking => nb0[b] + two * c * alpha[b] * slope[b],
                    LineSearchKind::StrongWolfe => (F::one() - c * alpha[b]) * nb0[b],
                };
                stop[b] = nb <= crit[b] || nb <= atol * atol;
                all_stop &= stop[b];
            }
            trace!(
                "line search {trial_iter:>3}, min(alpha) = {}",
                alpha.iter().copied().fold(F::one(), F::min)
            );

            if all_stop || trial_iter >= self.config.max_iterations {
                break trial;
            }
            for (a, &done) in alpha.iter_mut().zip(&stop) {
                if !done {
                    *a = *a / self.config.cutback;
                }
            }
            trial_iter += 1;
        };

        if self.config.check_negative_criterion && criterion_is_negative(&crit) {
            warn!(
                "line search produced a negative stopping criterion, which may hinder \
                 convergence; try the strong Wolfe criterion, a larger cutback or a smaller \
                 stopping criterion"
            );
        }
        Ok((trial, alpha))
    }
}

/// Whether the stopping criterion is negative for every batch entry.
fn criterion_is_negative<F: Float>(crit: &[F]) -> bool {
    crit.iter().copied().reduce(F::max).is_some_and(|m| m < F::zero())
}

impl<F: Float, L: LinearSolver<F>> NewtonIteration<F> for NewtonWithLineSearch<F, L> {
    type State = ();

    fn tolerances(&self) -> &Tolerances<F> {
        &self.config.convergence
    }

    fn linear_solver(&self) -> &dyn LinearSolver<F> {
        &self.linear_solver
    }

    fn validate(&self) -> Result<()> {
        self.config.convergence.validate()?;
        if self.config.max_iterations == 0 {
            return Err(SolveError::InvalidConfig(
                "line search needs at least one trial step".into(),
            ));
        }
        if !(self.config.cutback > F::one()) {
            return Err(SolveError::InvalidConfig(format!(
                "line search cutback must exceed 1, got {}",
                self.config.cutback
            )));
        }
        Ok(())
    }

    fn prepare(&self, _system: &dyn NonlinearSystem<F>, _u: &Tensor<F>) -> Result<()> {
        Ok(())
    }

    fn update(
        &self,
        system: &mut dyn NonlinearSystem<F>,
        _state: &mut (),
        u: &Tensor<F>,
        r: &Tensor<F>,
        j: &Tensor<F>,
    ) -> Result<Tensor<F>> {
        let du = newton_step(&self.linear_solver, r, j)?;
        let (u, _) = self.search(system, u, r, &du)?;
        Ok(u)
    }
}
