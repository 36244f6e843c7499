//! Implicit updates: solve a residual model for its unknowns and propagate
//! sensitivities through the implicit function theorem.

use log::{debug, warn};
use strata::{
    from_assembly, AxisBuilder, DerivMap, Float, LabeledAxis, MatrixAssembler, Tensor, ValueMap,
    Variable, VariableName, VectorAssembler,
};

use crate::convergence::{max_of, row_norms};
use crate::error::{Result, SolveError};
use crate::linalg::{DenseLu, LinearSolver};
use crate::model::{Model, ModelNonlinearSystem, ModelOutput};
use crate::result::RetCode;
use crate::solvers::NonlinearSolver;
use crate::system::NonlinearSystem;

/// Configuration for [`ImplicitUpdate`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ImplicitUpdateConfig<F> {
    /// Input sub-axis holding the unknowns (default: `"state"`).
    pub unknown_subaxis: String,
    /// Output sub-axis holding the residual (default: `"residual"`).
    pub residual_subaxis: String,
    /// Residual norm above which sensitivities are reported as taken away
    /// from a root (default: 1e-6).
    pub root_tolerance: F,
}

impl<F: Float> Default for ImplicitUpdateConfig<F> {
    fn default() -> Self {
        ImplicitUpdateConfig {
            unknown_subaxis: "state".into(),
            residual_subaxis: "residual".into(),
            root_tolerance: F::lit(1e-6),
        }
    }
}

fn leaf_variables<F: Float>(axis: &LabeledAxis) -> Vec<Variable<F>> {
    axis.variables()
        .map(|v| {
            Variable::new(
                v.name().clone(),
                v.intmd_sizes(),
                v.intmd_sizes().len(),
                v.base_sizes(),
            )
        })
        .collect()
}

/// Solves `r(u; g) = 0` defined by a residual [`Model`] for the unknowns `u`.
///
/// The inputs are those of the wrapped model: the unknowns (read as the
/// initial guess) and the given inputs `g`. The outputs are the converged
/// unknowns and, on request, `du/dg = -(∂r/∂u)⁻¹ ∂r/∂g`. Since it is itself a
/// [`Model`], implicit updates nest.
pub struct ImplicitUpdate<F, M, S, L = DenseLu> {
    model: M,
    solver: S,
    linear_solver: L,
    config: ImplicitUpdateConfig<F>,
    unknown_axis: LabeledAxis,
    residual_axis: LabeledAxis,
    given_axis: LabeledAxis,
    output_axis: LabeledAxis,
    outputs: Vec<Variable<F>>,
    givens: Vec<Variable<F>>,
}

impl<F, M, S> ImplicitUpdate<F, M, S>
where
    F: Float,
    M: Model<F>,
    S: NonlinearSolver<F>,
{
    pub fn new(model: M, solver: S, config: ImplicitUpdateConfig<F>) -> Result<Self> {
        Self::with_linear_solver(model, solver, DenseLu, config)
    }
}

impl<F, M, S, L> ImplicitUpdate<F, M, S, L>
where
    F: Float,
    M: Model<F>,
    S: NonlinearSolver<F>,
    L: LinearSolver<F>,
{
    pub fn with_linear_solver(
        model: M,
        solver: S,
        linear_solver: L,
        config: ImplicitUpdateConfig<F>,
    ) -> Result<Self> {
        let unknown_axis = model.input_axis().subaxis(&config.unknown_subaxis)?.clone();
        let residual_axis = model.output_axis().subaxis(&config.residual_subaxis)?.clone();
        if unknown_axis.size() != residual_axis.size() {
            return Err(SolveError::InvalidConfig(format!(
                "residual '{}' has size {} but unknowns '{}' have size {}",
                config.residual_subaxis,
                residual_axis.size(),
                config.unknown_subaxis,
                unknown_axis.size()
            )));
        }

        let mut given = AxisBuilder::new();
        for v in model.input_axis().variables() {
            if !v.name().starts_with(unknown_axis.prefix()) {
                given.add_variable(v.name().clone(), v.intmd_sizes(), v.base_sizes())?;
            }
        }
        let given_axis = given.build();

        let mut output = AxisBuilder::new();
        for v in unknown_axis.variables() {
            output.add_variable(v.name().clone(), v.intmd_sizes(), v.base_sizes())?;
        }
        let output_axis = output.build();

        Ok(ImplicitUpdate {
            outputs: leaf_variables(&unknown_axis),
            givens: leaf_variables(&given_axis),
            model,
            solver,
            linear_solver,
            config,
            unknown_axis,
            residual_axis,
            given_axis,
            output_axis,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Inputs the unknowns depend on, i.e. the model inputs outside the unknown sub-axis.
    pub fn given_axis(&self) -> &LabeledAxis {
        &self.given_axis
    }

    /// The unknowns after the last evaluation.
    pub fn outputs(&self) -> &[Variable<F>] {
        &self.outputs
    }

    pub fn output(&self, name: &VariableName) -> Option<&Variable<F>> {
        self.outputs.iter().find(|v| v.name() == name)
    }

    fn check_inputs(&self, inputs: &ValueMap<F>) -> Result<()> {
        for v in self.unknown_axis.variables().chain(self.given_axis.variables()) {
            if !inputs.contains_key(v.name()) {
                return Err(SolveError::MissingInput(v.name().to_string()));
            }
        }
        Ok(())
    }

    /// `du/dg` at the converged solution, written to the output variables.
    fn sensitivities(&mut self, out: &ModelOutput<F>) -> Result<DerivMap<F>> {
        let r = VectorAssembler::new(&self.residual_axis).assemble_by_variable(&out.values)?;
        let nr = max_of(&row_norms(&r));
        if nr > self.config.root_tolerance {
            warn!(
                "implicit function theorem applied with |R| = {nr} > {}, sensitivities may be \
                 meaningless away from a root",
                self.config.root_tolerance
            );
        }
        if self.given_axis.nvariable() == 0 {
            return Ok(DerivMap::new());
        }

        let j = MatrixAssembler::new(&self.residual_axis, &self.unknown_axis)
            .assemble_by_variable(&out.derivatives)?;
        let b = match MatrixAssembler::new(&self.residual_axis, &self.given_axis)
            .assemble_by_variable(&out.derivatives)
        {
            Ok(b) => b,
            Err(strata::Error::EmptyAssembly) => Tensor::zeros(
                j.batch_sizes(),
                &[],
                &[self.residual_axis.size(), self.given_axis.size()],
            ),
            Err(e) => return Err(e.into()),
        };
        let x = self.linear_solver.ift(&j, &b)?;
        let blocks = MatrixAssembler::new(&self.unknown_axis, &self.given_axis).split_by_variable(&x)?;

        for y in &mut self.outputs {
            for g in &self.givens {
                let block = blocks
                    .get(y.name())
                    .and_then(|row| row.get(g.name()))
                    .ok_or_else(|| {
                        strata::Error::UnknownVariable(format!("d({})/d({})", y.name(), g.name()))
                    })?;
                let dense = from_assembly(
                    block,
                    &[y.intmd_sizes(), g.intmd_sizes()],
                    &[y.base_sizes(), g.base_sizes()],
                )?;
                y.d(g)?.assign(dense)?;
            }
        }
        Ok(blocks)
    }
}

impl<F, M, S, L> Model<F> for ImplicitUpdate<F, M, S, L>
where
    F: Float,
    M: Model<F>,
    S: NonlinearSolver<F>,
    L: LinearSolver<F>,
{
    fn input_axis(&self) -> &LabeledAxis {
        self.model.input_axis()
    }

    fn output_axis(&self) -> &LabeledAxis {
        &self.output_axis
    }

    fn evaluate(&mut self, inputs: &ValueMap<F>, derivatives: bool) -> Result<ModelOutput<F>> {
        self.check_inputs(inputs)?;
        self.model.invalidate();
        self.outputs.iter_mut().for_each(Variable::clear);

        let guess = VectorAssembler::new(&self.unknown_axis).assemble_by_variable(inputs)?;
        let given: ValueMap<F> = inputs
            .iter()
            .filter(|(name, _)| self.given_axis.has_variable(name))
            .map(|(name, t)| (name.clone(), t.clone()))
            .collect();

        let mut system = ModelNonlinearSystem::with_axes(
            &mut self.model,
            given,
            self.unknown_axis.clone(),
            self.residual_axis.clone(),
        )?;
        let res = self.solver.solve(&mut system, &guess)?;
        if res.ret != RetCode::Success {
            return Err(SolveError::NotConverged {
                iterations: res.iterations,
            });
        }
        debug!("implicit update converged in {} iterations", res.iterations);

        let values = VectorAssembler::new(&self.unknown_axis).split_by_variable(&res.solution)?;
        for y in &mut self.outputs {
            let v = values
                .get(y.name())
                .ok_or_else(|| strata::Error::UnknownVariable(y.name().to_string()))?;
            y.set_assembled_value(v)?;
        }

        let derivatives = if derivatives {
            system.set_solution(&res.solution)?;
            let out = system.evaluate(true)?;
            self.sensitivities(&out)?
        } else {
            DerivMap::new()
        };

        Ok(ModelOutput {
            values,
            derivatives,
        })
    }

    fn invalidate(&mut self) {
        self.model.invalidate();
    }
}
