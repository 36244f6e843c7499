//! Small closure-backed systems for unit tests.

use strata::{AxisBuilder, LabeledAxis, Tensor};

use crate::error::Result;
use crate::system::NonlinearSystem;

/// A system whose residual and row-major Jacobian are computed per batch entry.
pub(crate) struct RowSystem<R, J> {
    axis: LabeledAxis,
    n: usize,
    u: Option<Tensor<f64>>,
    residual: R,
    jacobian: J,
    pub(crate) requires_grad: bool,
    pub(crate) jacobian_calls: usize,
}

impl<R, J> RowSystem<R, J>
where
    R: Fn(&[f64]) -> Vec<f64>,
    J: Fn(&[f64]) -> Vec<f64>,
{
    pub(crate) fn new(n: usize, residual: R, jacobian: J) -> Self {
        let mut builder = AxisBuilder::new();
        builder.add_variable("x", &[], &[n]).unwrap();
        RowSystem {
            axis: builder.build(),
            n,
            u: None,
            residual,
            jacobian,
            requires_grad: false,
            jacobian_calls: 0,
        }
    }

    fn map_rows(&self, f: impl Fn(&[f64]) -> Vec<f64>, base: &[usize]) -> Result<Tensor<f64>> {
        let u = self.u.as_ref().unwrap();
        let data: Vec<f64> = u.to_vec().chunks(self.n).flat_map(f).collect();
        Ok(Tensor::from_shape_vec(u.batch_sizes(), &[], base, data)?)
    }
}

impl<R, J> NonlinearSystem<f64> for RowSystem<R, J>
where
    R: Fn(&[f64]) -> Vec<f64>,
    J: Fn(&[f64]) -> Vec<f64>,
{
    fn unknown_axis(&self) -> &LabeledAxis {
        &self.axis
    }

    fn residual_axis(&self) -> &LabeledAxis {
        &self.axis
    }

    fn set_solution(&mut self, u: &Tensor<f64>) -> Result<()> {
        self.u = Some(u.clone());
        Ok(())
    }

    fn solution(&self) -> Option<&Tensor<f64>> {
        self.u.as_ref()
    }

    fn residual(&mut self) -> Result<Tensor<f64>> {
        self.map_rows(&self.residual, &[self.n])
    }

    fn jacobian(&mut self) -> Result<Tensor<f64>> {
        self.jacobian_calls += 1;
        self.map_rows(&self.jacobian, &[self.n, self.n])
    }

    fn requires_grad(&self) -> bool {
        self.requires_grad
    }
}

/// `atan(x) = 0`, where plain Newton diverges from `|x| > 1.39`.
pub(crate) fn atan_system() -> RowSystem<impl Fn(&[f64]) -> Vec<f64>, impl Fn(&[f64]) -> Vec<f64>> {
    RowSystem::new(
        1,
        |x: &[f64]| vec![x[0].atan()],
        |x: &[f64]| vec![1.0 / (1.0 + x[0] * x[0])],
    )
}

pub(crate) fn scalar(batch: &[usize], values: Vec<f64>) -> Tensor<f64> {
    Tensor::from_shape_vec(batch, &[], &[1], values).unwrap()
}
