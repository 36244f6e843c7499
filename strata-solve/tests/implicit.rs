//! Implicit updates: converged unknowns and their sensitivities to the given inputs.

use approx::assert_relative_eq;
use strata::{AxisBuilder, DerivMap, LabeledAxis, Tensor, ValueMap, VariableName};
use strata_solve::{
    ImplicitUpdate, ImplicitUpdateConfig, Model, ModelOutput, Newton, NewtonConfig,
    NewtonWithLineSearch, Result, SolveError, Tolerances,
};

fn name(s: &str) -> VariableName {
    VariableName::from(s)
}

fn scalar(batch: &[usize], values: Vec<f64>) -> Tensor<f64> {
    Tensor::from_shape_vec(batch, &[], &[1], values).unwrap()
}

/// `r(u; a) = u² - a`
struct Parabola {
    inputs: LabeledAxis,
    outputs: LabeledAxis,
    invalidated: usize,
}

impl Parabola {
    fn new() -> Self {
        let mut inputs = AxisBuilder::new();
        inputs.add_variable("state/u", &[], &[]).unwrap();
        inputs.add_variable("forces/a", &[], &[]).unwrap();
        let mut outputs = AxisBuilder::new();
        outputs.add_variable("residual/u", &[], &[]).unwrap();
        Parabola {
            inputs: inputs.build(),
            outputs: outputs.build(),
            invalidated: 0,
        }
    }
}

impl Model<f64> for Parabola {
    fn input_axis(&self) -> &LabeledAxis {
        &self.inputs
    }

    fn output_axis(&self) -> &LabeledAxis {
        &self.outputs
    }

    fn evaluate(&mut self, inputs: &ValueMap<f64>, derivatives: bool) -> Result<ModelOutput<f64>> {
        let u = &inputs[&name("state/u")];
        let a = &inputs[&name("forces/a")];
        let mut out = ModelOutput::default();
        out.values.insert(name("residual/u"), u.mul(u)?.sub(a)?);
        if derivatives {
            let row = out.derivatives.entry(name("residual/u")).or_default();
            row.insert(name("state/u"), u.scale(2.0).base_reshape(&[1, 1])?);
            row.insert(
                name("forces/a"),
                Tensor::full(a.batch_sizes(), &[], &[1, 1], -1.0),
            );
        }
        Ok(out)
    }

    fn invalidate(&mut self) {
        self.invalidated += 1;
    }
}

fn inputs(u0: Tensor<f64>, a: Tensor<f64>) -> ValueMap<f64> {
    [(name("state/u"), u0), (name("forces/a"), a)]
        .into_iter()
        .collect()
}

fn sqrt_update() -> ImplicitUpdate<f64, Parabola, Newton<f64>> {
    ImplicitUpdate::new(
        Parabola::new(),
        Newton::default(),
        ImplicitUpdateConfig::default(),
    )
    .unwrap()
}

#[test]
fn solves_and_applies_the_implicit_function_theorem() {
    let mut update = sqrt_update();
    let out = update
        .evaluate(&inputs(scalar(&[], vec![1.0]), scalar(&[], vec![4.0])), true)
        .unwrap();
    assert_eq!(update.model().invalidated, 1);

    let u = out.values[&name("state/u")].to_vec()[0];
    assert_relative_eq!(u, 2.0, max_relative = 1e-10);
    let du_da = out.derivatives[&name("state/u")][&name("forces/a")].to_vec()[0];
    assert_relative_eq!(du_da, 0.25, max_relative = 1e-10);

    let var = update.output(&name("state/u")).unwrap();
    assert_relative_eq!(var.value().unwrap().to_vec()[0], 2.0, max_relative = 1e-10);
    let d = var.derivative(&name("forces/a")).unwrap();
    assert_relative_eq!(d.tensor().unwrap().to_vec()[0], 0.25, max_relative = 1e-10);

    // central differences of the converged solution
    let h = 1e-6;
    let mut solve_at = |a: f64| {
        update
            .evaluate(&inputs(scalar(&[], vec![1.0]), scalar(&[], vec![a])), false)
            .unwrap()
            .values[&name("state/u")]
            .to_vec()[0]
    };
    let fd = (solve_at(4.0 + h) - solve_at(4.0 - h)) / (2.0 * h);
    assert_relative_eq!(du_da, fd, max_relative = 1e-6);
}

#[test]
fn batched_forces_with_a_shared_guess() {
    let mut update = sqrt_update();
    let out = update
        .evaluate(
            &inputs(scalar(&[], vec![1.0]), scalar(&[3], vec![4.0, 9.0, 16.0])),
            true,
        )
        .unwrap();
    let u = out.values[&name("state/u")].to_vec();
    let du_da = out.derivatives[&name("state/u")][&name("forces/a")].to_vec();
    for ((ui, di), expected) in u.iter().zip(&du_da).zip([2.0, 3.0, 4.0]) {
        assert_relative_eq!(*ui, expected, max_relative = 1e-10);
        assert_relative_eq!(*di, 0.5 / expected, max_relative = 1e-10);
    }
}

#[test]
fn derivatives_are_only_computed_on_request() {
    let mut update = sqrt_update();
    let out = update
        .evaluate(&inputs(scalar(&[], vec![1.0]), scalar(&[], vec![4.0])), false)
        .unwrap();
    assert!(out.derivatives.is_empty());
    let var = update.output(&name("state/u")).unwrap();
    assert!(var.derivative(&name("forces/a")).is_none());
}

#[test]
fn missing_inputs_are_reported_by_name() {
    let mut update = sqrt_update();
    let mut values = inputs(scalar(&[], vec![1.0]), scalar(&[], vec![4.0]));
    values.remove(&name("forces/a"));
    assert_eq!(
        update.evaluate(&values, false).unwrap_err(),
        SolveError::MissingInput("forces/a".into())
    );
}

#[test]
fn hitting_the_iteration_limit_is_an_error() {
    let solver = Newton::<f64>::new(NewtonConfig {
        convergence: Tolerances {
            max_iterations: 2,
            ..Tolerances::default()
        },
    });
    let mut update =
        ImplicitUpdate::new(Parabola::new(), solver, ImplicitUpdateConfig::default()).unwrap();
    let err = update
        .evaluate(&inputs(scalar(&[], vec![1.0]), scalar(&[], vec![4.0])), false)
        .unwrap_err();
    assert_eq!(err, SolveError::NotConverged { iterations: 2 });
}

/// `r(u; p) = A u - p` with a fixed upper-triangular `A`
struct Linear {
    inputs: LabeledAxis,
    outputs: LabeledAxis,
}

const A: [f64; 4] = [2.0, 1.0, 0.0, 4.0];

impl Linear {
    fn new() -> Self {
        let mut inputs = AxisBuilder::new();
        inputs.add_variable("state/u", &[], &[2]).unwrap();
        inputs.add_variable("forces/p", &[], &[2]).unwrap();
        let mut outputs = AxisBuilder::new();
        outputs.add_variable("residual/u", &[], &[2]).unwrap();
        Linear {
            inputs: inputs.build(),
            outputs: outputs.build(),
        }
    }
}

impl Model<f64> for Linear {
    fn input_axis(&self) -> &LabeledAxis {
        &self.inputs
    }

    fn output_axis(&self) -> &LabeledAxis {
        &self.outputs
    }

    fn evaluate(&mut self, inputs: &ValueMap<f64>, derivatives: bool) -> Result<ModelOutput<f64>> {
        let u = inputs[&name("state/u")].to_vec();
        let p = &inputs[&name("forces/p")];
        let au = vec![A[0] * u[0] + A[1] * u[1], A[2] * u[0] + A[3] * u[1]];
        let au = Tensor::from_shape_vec(&[], &[], &[2], au)?;
        let mut values = ValueMap::new();
        values.insert(name("residual/u"), au.sub(p)?);
        let mut derivs = DerivMap::new();
        if derivatives {
            let row = derivs.entry(name("residual/u")).or_default();
            row.insert(
                name("state/u"),
                Tensor::from_shape_vec(&[], &[], &[2, 2], A.to_vec())?,
            );
            row.insert(name("forces/p"), Tensor::identity(&[], 2).neg());
        }
        Ok(ModelOutput {
            values,
            derivatives: derivs,
        })
    }
}

#[test]
fn coupled_sensitivities_are_the_inverse_jacobian() {
    let mut update = ImplicitUpdate::new(
        Linear::new(),
        NewtonWithLineSearch::<f64>::default(),
        ImplicitUpdateConfig::default(),
    )
    .unwrap();
    let values: ValueMap<f64> = [
        (name("state/u"), Tensor::zeros(&[], &[], &[2])),
        (
            name("forces/p"),
            Tensor::from_shape_vec(&[], &[], &[2], vec![3.0, 4.0]).unwrap(),
        ),
    ]
    .into_iter()
    .collect();
    let out = update.evaluate(&values, true).unwrap();

    // A⁻¹ = [[4, -1], [0, 2]] / 8
    let u = out.values[&name("state/u")].to_vec();
    assert_relative_eq!(u[0], 1.0, max_relative = 1e-12);
    assert_relative_eq!(u[1], 1.0, max_relative = 1e-12);
    let du_dp = &out.derivatives[&name("state/u")][&name("forces/p")];
    assert_eq!(du_dp.base_sizes(), &[2, 2]);
    for (v, e) in du_dp.to_vec().iter().zip([0.5, -0.125, 0.0, 0.25]) {
        assert_relative_eq!(*v, e, epsilon = 1e-12);
    }
}

#[test]
fn implicit_updates_are_models() {
    let update = sqrt_update();
    let model: &dyn Model<f64> = &update;
    assert_eq!(model.input_axis().nvariable(), 2);
    let outputs = model.output_axis();
    assert_eq!(outputs.variable_names(), vec![name("state/u")]);
    assert_eq!(update.given_axis().variable_names(), vec![name("forces/a")]);
}
