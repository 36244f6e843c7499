use log::trace;
use strata::shape::{broadcast_all, numel};
use strata::{AxisBuilder, Float, LabeledAxis, Tensor, TensorShape};

use crate::convergence::{dot, norm, rows, Tolerances};
use crate::error::{Result, SolveError};
use crate::linalg::{lu_back_solve, lu_factor, DenseLu, LinearSolver};
use crate::solvers::newton::{Newton, NewtonConfig};
use crate::solvers::{newton_step, NewtonIteration, NonlinearSolver};
use crate::system::NonlinearSystem;

/// Configuration for the trust-region Newton solver.
///
/// The defaults were picked on a small set of problems and are expected to be tuned.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrustRegionConfig<F> {
    /// Convergence parameters of the outer Newton loop.
    pub convergence: Tolerances<F>,
    /// Initial trust-region radius (default: 1.0).
    pub delta_0: F,
    /// Maximum trust-region radius (default: 10.0).
    pub delta_max: F,
    /// Shrink the radius when the reduction ratio falls below this (default: 0.25).
    pub reduce_criteria: F,
    /// Grow the radius when the reduction ratio exceeds this (default: 0.75).
    pub expand_criteria: F,
    /// Default: 0.25.
    pub reduce_factor: F,
    /// Default: 2.0.
    pub expand_factor: F,
    /// Reject steps whose reduction ratio is below this (default: 0.1).
    pub accept_criteria: F,
    /// Tolerances of the inner Newton solve for the subproblem
    /// (default: atol 1e-8, rtol 1e-6, 10 iterations).
    pub subproblem: Tolerances<F>,
}

impl<F: Float> Default for TrustRegionConfig<F> {
    fn default() -> Self {
        TrustRegionConfig {
            convergence: Tolerances::default(),
            delta_0: F::one(),
            delta_max: F::lit(10.0),
            reduce_criteria: F::lit(0.25),
            expand_criteria: F::lit(0.75),
            reduce_factor: F::lit(0.25),
            expand_factor: F::lit(2.0),
            accept_criteria: F::lit(0.1),
            subproblem: Tolerances {
                atol: F::lit(1e-8),
                rtol: F::lit(1e-6),
                max_iterations: 10,
            },
        }
    }
}

/// The bound-constrained quadratic subproblem of one trust-region iteration.
///
/// For every batch entry the unknown is the Lagrange multiplier `s ≥ 0` of
/// the constraint `½‖p‖² ≤ δ` on the step `p(s) = -(JᵀJ + sI)⁻¹ Jᵀ r`. The
/// residual `1/‖p(s)‖ - 1/√(2δ)` vanishes on the region boundary. Entries
/// whose Newton step already lies inside the region have a zero residual, so
/// their multiplier stays at zero. Negative multipliers are evaluated at zero.
#[derive(Debug, Clone)]
pub struct TrustRegionSubproblem<F> {
    axis: LabeledAxis,
    batch: TensorShape,
    n: usize,
    /// `JᵀJ` per entry, row-major.
    jtj: Vec<F>,
    /// `Jᵀr` per entry.
    jtr: Vec<F>,
    radius: Vec<F>,
    inside: Vec<bool>,
    s: Option<Tensor<F>>,
}

impl<F: Float> TrustRegionSubproblem<F> {
    /// Set up the subproblem from the residual, Jacobian and Newton step at
    /// the current iterate, all sharing the batch shape `batch`, and the
    /// per-entry radii.
    pub fn new(
        batch: &[usize],
        r: &Tensor<F>,
        j: &Tensor<F>,
        p_newton: &Tensor<F>,
        delta: &[F],
    ) -> Result<Self> {
        let (r, n) = rows(&r.batch_expand(batch)?);
        let (j, _) = rows(&j.batch_expand(batch)?);
        let (pn, _) = rows(&p_newton.batch_expand(batch)?);
        let nbatch = numel(batch);
        if delta.len() != nbatch {
            return Err(strata::Error::InvalidShape(format!(
                "expected {nbatch} trust-region radii, got {}",
                delta.len()
            ))
            .into());
        }

        let mut jtj = vec![F::zero(); nbatch * n * n];
        let mut jtr = vec![F::zero(); nbatch * n];
        let mut radius = Vec::with_capacity(nbatch);
        let mut inside = Vec::with_capacity(nbatch);
        for b in 0..nbatch {
            let jb = &j[b * n * n..(b + 1) * n * n];
            let rb = &r[b * n..(b + 1) * n];
            for i in 0..n {
                for k in 0..n {
                    let mut v = F::zero();
                    for l in 0..n {
                        v = v + jb[l * n + i] * jb[l * n + k];
                    }
                    jtj[b * n * n + i * n + k] = v;
                }
                let mut v = F::zero();
                for l in 0..n {
                    v = v + jb[l * n + i] * rb[l];
                }
                jtr[b * n + i] = v;
            }
            let rad = (F::lit(2.0) * delta[b]).sqrt();
            inside.push(norm(&pn[b * n..(b + 1) * n]) <= rad);
            radius.push(rad);
        }

        let mut builder = AxisBuilder::new();
        builder.add_variable("multiplier", &[], &[])?;
        Ok(TrustRegionSubproblem {
            axis: builder.build(),
            batch: batch.to_vec(),
            n,
            jtj,
            jtr,
            radius,
            inside,
            s: None,
        })
    }

    /// Whether the Newton step of each entry lies inside its region.
    pub fn newton_inside(&self) -> &[bool] {
        &self.inside
    }

    /// `p(s)` of one entry together with the factors of `JᵀJ + sI`.
    fn shifted_step(&self, b: usize, s: F) -> Result<(Vec<F>, crate::linalg::LuFactors<F>)> {
        let n = self.n;
        let mut m = self.jtj[b * n * n..(b + 1) * n * n].to_vec();
        for i in 0..n {
            m[i * n + i] = m[i * n + i] + s.max(F::zero());
        }
        let factors = lu_factor(&m, n).ok_or(SolveError::SingularMatrix { batch_index: b })?;
        let p = lu_back_solve(&factors, &self.jtr[b * n..(b + 1) * n])
            .into_iter()
            .map(|v| -v)
            .collect();
        Ok((p, factors))
    }

    /// The constrained step `p(s)` for multipliers `s` in assembly form
    /// `(batch; 1)`. Entries with the Newton step inside the region get a
    /// zero step.
    pub fn step(&self, s: &Tensor<F>) -> Result<Tensor<F>> {
        let s = s.batch_expand(&self.batch)?.to_vec();
        let n = self.n;
        let mut out = vec![F::zero(); self.inside.len() * n];
        for (b, &inside) in self.inside.iter().enumerate() {
            if !inside {
                let (p, _) = self.shifted_step(b, s[b])?;
                out[b * n..(b + 1) * n].copy_from_slice(&p);
            }
        }
        Ok(Tensor::from_shape_vec(&self.batch, &[], &[n], out)?)
    }

    fn evaluate(&self) -> Result<(Vec<F>, Vec<F>)> {
        let s = match &self.s {
            Some(s) => s.batch_expand(&self.batch)?.to_vec(),
            None => vec![F::zero(); self.inside.len()],
        };
        let mut res = Vec::with_capacity(s.len());
        let mut jac = Vec::with_capacity(s.len());
        for (b, &inside) in self.inside.iter().enumerate() {
            if inside {
                res.push(F::zero());
                jac.push(F::one());
                continue;
            }
            let (p, factors) = self.shifted_step(b, s[b])?;
            let np = norm(&p);
            let minv_p = lu_back_solve(&factors, &p);
            res.push(F::one() / np - F::one() / self.radius[b]);
            jac.push(dot(&p, &minv_p) / (np * np * np));
        }
        Ok((res, jac))
    }
}

impl<F: Float> NonlinearSystem<F> for TrustRegionSubproblem<F> {
    fn unknown_axis(&self) -> &LabeledAxis {
        &self.axis
    }

    fn residual_axis(&self) -> &LabeledAxis {
        &self.axis
    }

    fn set_solution(&mut self, u: &Tensor<F>) -> Result<()> {
        self.s = Some(u.clone());
        Ok(())
    }

    fn solution(&self) -> Option<&Tensor<F>> {
        self.s.as_ref()
    }

    fn residual(&mut self) -> Result<Tensor<F>> {
        Ok(self.residual_and_jacobian()?.0)
    }

    fn jacobian(&mut self) -> Result<Tensor<F>> {
        Ok(self.residual_and_jacobian()?.1)
    }

    fn residual_and_jacobian(&mut self) -> Result<(Tensor<F>, Tensor<F>)> {
        let (res, jac) = self.evaluate()?;
        Ok((
            Tensor::from_shape_vec(&self.batch, &[], &[1], res)?,
            Tensor::from_shape_vec(&self.batch, &[], &[1, 1], jac)?,
        ))
    }
}

/// Newton-Raphson globalised with a trust region on the merit function `½‖r‖²`.
///
/// Each entry takes its Newton step when that step lies within the region,
/// otherwise the step solving [`TrustRegionSubproblem`]. The radius of each
/// entry adapts to the ratio of actual to predicted merit reduction, and
/// entries whose ratio is too small keep their previous iterate.
///
/// The merit function has stationary points wherever `Jᵀr = 0` with a singular
/// `J`, and the iteration can stall there. Stationarity systems such as the
/// gradient of Rosenbrock from `(-1.2, 1)` end in such a point, while the same
/// problem in least-squares form `[10 (x1 - x0²), 1 - x0]` reaches the root.
#[derive(Debug, Clone)]
pub struct NewtonWithTrustRegion<F, L = DenseLu> {
    config: TrustRegionConfig<F>,
    linear_solver: L,
}

impl<F: Float> NewtonWithTrustRegion<F> {
    pub fn new(config: TrustRegionConfig<F>) -> Self {
        Self::with_linear_solver(config, DenseLu)
    }
}

impl<F: Float> Default for NewtonWithTrustRegion<F> {
    fn default() -> Self {
        Self::new(TrustRegionConfig::default())
    }
}

impl<F: Float, L: LinearSolver<F>> NewtonWithTrustRegion<F, L> {
    pub fn with_linear_solver(config: TrustRegionConfig<F>, linear_solver: L) -> Self {
        NewtonWithTrustRegion {
            config,
            linear_solver,
        }
    }

    pub fn config(&self) -> &TrustRegionConfig<F> {
        &self.config
    }

    fn direction(
        &self,
        batch: &[usize],
        r: &Tensor<F>,
        j: &Tensor<F>,
        delta: &[F],
    ) -> Result<Tensor<F>> {
        let p_newton = newton_step(&self.linear_solver, r, j)?.batch_expand(batch)?;
        let mut subproblem = TrustRegionSubproblem::new(batch, r, j, &p_newton, delta)?;
        if subproblem.newton_inside().iter().all(|&inside| inside) {
            return Ok(p_newton);
        }

        let inner = Newton::new(NewtonConfig {
            convergence: self.config.subproblem.clone(),
        });
        let res = inner.solve(&mut subproblem, &Tensor::zeros(batch, &[], &[1]))?;
        trace!(
            "trust-region subproblem: {} after {} iterations",
            res.ret,
            res.iterations
        );
        let p_trust = subproblem.step(&res.solution)?;

        let (pn, n) = rows(&p_newton);
        let (pt, _) = rows(&p_trust);
        let mut p = pt;
        for (b, &inside) in subproblem.newton_inside().iter().enumerate() {
            if inside {
                p[b * n..(b + 1) * n].copy_from_slice(&pn[b * n..(b + 1) * n]);
            }
        }
        Ok(Tensor::from_shape_vec(batch, &[], &[n], p)?)
    }
}

impl<F: Float, L: LinearSolver<F>> NewtonIteration<F> for NewtonWithTrustRegion<F, L> {
    /// Radius of every batch entry.
    type State = Vec<F>;

    fn tolerances(&self) -> &Tolerances<F> {
        &self.config.convergence
    }

    fn linear_solver(&self) -> &dyn LinearSolver<F> {
        &self.linear_solver
    }

    fn validate(&self) -> Result<()> {
        let c = &self.config;
        c.convergence.validate()?;
        c.subproblem.validate()?;
        if !(c.delta_0 > F::zero()) || !(c.delta_max >= c.delta_0) {
            return Err(SolveError::InvalidConfig(format!(
                "trust-region radii must satisfy 0 < delta_0 <= delta_max, got {} and {}",
                c.delta_0, c.delta_max
            )));
        }
        if !(c.reduce_factor > F::zero() && c.reduce_factor < F::one())
            || !(c.expand_factor > F::one())
        {
            return Err(SolveError::InvalidConfig(
                "trust-region factors must satisfy 0 < reduce_factor < 1 < expand_factor".into(),
            ));
        }
        Ok(())
    }

    fn prepare(&self, _system: &dyn NonlinearSystem<F>, u: &Tensor<F>) -> Result<Vec<F>> {
        Ok(vec![self.config.delta_0; numel(u.batch_sizes())])
    }

    fn update(
        &self,
        system: &mut dyn NonlinearSystem<F>,
        delta: &mut Vec<F>,
        u: &Tensor<F>,
        r: &Tensor<F>,
        j: &Tensor<F>,
    ) -> Result<Tensor<F>> {
        let c = &self.config;
        let batch = broadcast_all([u.batch_sizes(), r.batch_sizes(), j.batch_sizes()])?;
        let nbatch = numel(&batch);
        if delta.len() == 1 && nbatch != 1 {
            *delta = vec![delta[0]; nbatch];
        }

        let p = self.direction(&batch, r, j, delta)?;
        let (u0, n) = rows(&u.batch_expand(&batch)?);
        let (pv, _) = rows(&p);
        let (r0, _) = rows(&r.batch_expand(&batch)?);
        let (jv, _) = rows(&j.batch_expand(&batch)?);

        let xp = u.add(&p)?.batch_expand(&batch)?;
        system.set_solution(&xp)?;
        let (rp, _) = rows(&system.residual()?.batch_expand(&batch)?);
        let (xpv, _) = rows(&xp);

        let half = F::lit(0.5);
        let mut out = u0.clone();
        let mut accepted = 0;
        for b in 0..nbatch {
            let rb = &r0[b * n..(b + 1) * n];
            let pb = &pv[b * n..(b + 1) * n];
            let jb = &jv[b * n * n..(b + 1) * n * n];
            let jp: Vec<F> = (0..n).map(|l| dot(&jb[l * n..(l + 1) * n], pb)).collect();
            let predicted = -dot(rb, &jp) - half * dot(&jp, &jp);
            let rpb = &rp[b * n..(b + 1) * n];
            let actual = half * dot(rb, rb) - half * dot(rpb, rpb);

            let rho = if predicted.abs() < F::epsilon() {
                if actual >= F::zero() {
                    F::one()
                } else {
                    F::zero()
                }
            } else {
                actual / predicted
            };

            if rho < c.reduce_criteria {
                delta[b] = c.reduce_factor * delta[b];
            } else if rho > c.expand_criteria {
                delta[b] = (c.expand_factor * delta[b]).min(c.delta_max);
            }
            if rho >= c.accept_criteria {
                out[b * n..(b + 1) * n].copy_from_slice(&xpv[b * n..(b + 1) * n]);
                accepted += 1;
            }
        }
        trace!(
            "trust region: accepted {accepted}/{nbatch}, delta in [{}, {}]",
            delta.iter().copied().fold(F::infinity(), F::min),
            delta.iter().copied().fold(F::neg_infinity(), F::max)
        );

        Ok(Tensor::from_shape_vec(&batch, &[], &[n], out)?)
    }
}
