//! Residual-defining models and their view as a nonlinear system.

use strata::{DerivMap, Float, LabeledAxis, MatrixAssembler, Tensor, ValueMap, VectorAssembler};

use crate::error::{Result, SolveError};
use crate::system::NonlinearSystem;

/// Values and (optionally) first derivatives from one model evaluation, in
/// assembly form and keyed by fully qualified variable name.
#[derive(Debug, Clone, Default)]
pub struct ModelOutput<F> {
    pub values: ValueMap<F>,
    /// `derivatives[output][input]` is `(batch; storage(output), storage(input))`.
    pub derivatives: DerivMap<F>,
}

/// A map from named inputs to named outputs.
pub trait Model<F: Float> {
    fn input_axis(&self) -> &LabeledAxis;

    fn output_axis(&self) -> &LabeledAxis;

    /// Evaluate at `inputs`; derivatives are only required when `derivatives` is set.
    fn evaluate(&mut self, inputs: &ValueMap<F>, derivatives: bool) -> Result<ModelOutput<F>>;

    /// Drop anything cached from a previous evaluation.
    fn invalidate(&mut self) {}
}

/// A [`Model`] viewed as the system `r(u) = 0`, with the unknowns `u` taken
/// from an input sub-axis and the residual from an output sub-axis. All other
/// inputs stay fixed.
pub struct ModelNonlinearSystem<'m, F, M: ?Sized> {
    model: &'m mut M,
    given: ValueMap<F>,
    unknown_axis: LabeledAxis,
    residual_axis: LabeledAxis,
    solution: Option<Tensor<F>>,
}

impl<'m, F: Float, M: Model<F> + ?Sized> ModelNonlinearSystem<'m, F, M> {
    pub fn new(
        model: &'m mut M,
        given: ValueMap<F>,
        unknown_subaxis: &str,
        residual_subaxis: &str,
    ) -> Result<Self> {
        let unknown_axis = model.input_axis().subaxis(unknown_subaxis)?.clone();
        let residual_axis = model.output_axis().subaxis(residual_subaxis)?.clone();
        Self::with_axes(model, given, unknown_axis, residual_axis)
    }

    pub(crate) fn with_axes(
        model: &'m mut M,
        given: ValueMap<F>,
        unknown_axis: LabeledAxis,
        residual_axis: LabeledAxis,
    ) -> Result<Self> {
        if unknown_axis.size() != residual_axis.size() {
            return Err(SolveError::InvalidConfig(format!(
                "system is not square: {} unknowns '{}' but {} residuals '{}'",
                unknown_axis.size(),
                unknown_axis.prefix(),
                residual_axis.size(),
                residual_axis.prefix()
            )));
        }
        Ok(ModelNonlinearSystem {
            model,
            given,
            unknown_axis,
            residual_axis,
            solution: None,
        })
    }

    /// Evaluate the model at the fixed inputs and the current solution.
    pub fn evaluate(&mut self, derivatives: bool) -> Result<ModelOutput<F>> {
        let u = self
            .solution
            .as_ref()
            .ok_or_else(|| SolveError::MissingInput(self.unknown_axis.prefix().to_string()))?;
        let mut inputs = self.given.clone();
        inputs.extend(VectorAssembler::new(&self.unknown_axis).split_by_variable(u)?);
        self.model.evaluate(&inputs, derivatives)
    }

    fn assemble_residual(&self, out: &ModelOutput<F>) -> Result<Tensor<F>> {
        Ok(VectorAssembler::new(&self.residual_axis).assemble_by_variable(&out.values)?)
    }

    fn assemble_jacobian(&self, out: &ModelOutput<F>) -> Result<Tensor<F>> {
        Ok(MatrixAssembler::new(&self.residual_axis, &self.unknown_axis)
            .assemble_by_variable(&out.derivatives)?)
    }
}

impl<F: Float, M: Model<F> + ?Sized> NonlinearSystem<F> for ModelNonlinearSystem<'_, F, M> {
    fn unknown_axis(&self) -> &LabeledAxis {
        &self.unknown_axis
    }

    fn residual_axis(&self) -> &LabeledAxis {
        &self.residual_axis
    }

    fn set_solution(&mut self, u: &Tensor<F>) -> Result<()> {
        self.solution = Some(u.clone());
        Ok(())
    }

    fn solution(&self) -> Option<&Tensor<F>> {
        self.solution.as_ref()
    }

    fn residual(&mut self) -> Result<Tensor<F>> {
        let out = self.evaluate(false)?;
        self.assemble_residual(&out)
    }

    fn jacobian(&mut self) -> Result<Tensor<F>> {
        let out = self.evaluate(true)?;
        self.assemble_jacobian(&out)
    }

    fn residual_and_jacobian(&mut self) -> Result<(Tensor<F>, Tensor<F>)> {
        let out = self.evaluate(true)?;
        Ok((self.assemble_residual(&out)?, self.assemble_jacobian(&out)?))
    }
}
