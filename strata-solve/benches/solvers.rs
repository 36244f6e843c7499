use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use strata::{AxisBuilder, LabeledAxis, Tensor};
use strata_solve::{
    Newton, NewtonWithLineSearch, NewtonWithTrustRegion, NonlinearSolver, NonlinearSystem, Result,
};

/// `x_i^(i+1) - 1 = 0` for every batch entry.
struct Power {
    axis: LabeledAxis,
    n: usize,
    x: Option<Tensor<f64>>,
}

impl Power {
    fn new(n: usize) -> Self {
        let mut builder = AxisBuilder::new();
        builder.add_variable("x", &[], &[n]).unwrap();
        Power {
            axis: builder.build(),
            n,
            x: None,
        }
    }

    fn current(&self) -> (&[usize], Vec<f64>) {
        let x = self.x.as_ref().unwrap();
        (x.batch_sizes(), x.to_vec())
    }
}

impl NonlinearSystem<f64> for Power {
    fn unknown_axis(&self) -> &LabeledAxis {
        &self.axis
    }

    fn residual_axis(&self) -> &LabeledAxis {
        &self.axis
    }

    fn set_solution(&mut self, u: &Tensor<f64>) -> Result<()> {
        self.x = Some(u.clone());
        Ok(())
    }

    fn solution(&self) -> Option<&Tensor<f64>> {
        self.x.as_ref()
    }

    fn residual(&mut self) -> Result<Tensor<f64>> {
        let n = self.n;
        let (batch, x) = self.current();
        let r = x
            .iter()
            .enumerate()
            .map(|(k, xi)| xi.powi((k % n) as i32 + 1) - 1.0)
            .collect();
        Ok(Tensor::from_shape_vec(batch, &[], &[n], r)?)
    }

    fn jacobian(&mut self) -> Result<Tensor<f64>> {
        let n = self.n;
        let (batch, x) = self.current();
        let mut j = vec![0.0; x.len() * n];
        for (k, xi) in x.iter().enumerate() {
            let (b, i) = (k / n, k % n);
            j[b * n * n + i * n + i] = (i + 1) as f64 * xi.powi(i as i32);
        }
        Ok(Tensor::from_shape_vec(batch, &[], &[n, n], j)?)
    }
}

fn bench_solvers(c: &mut Criterion) {
    let solvers: Vec<(&str, Box<dyn NonlinearSolver<f64>>)> = vec![
        ("newton", Box::new(Newton::<f64>::default())),
        ("line_search", Box::new(NewtonWithLineSearch::<f64>::default())),
        ("trust_region", Box::new(NewtonWithTrustRegion::<f64>::default())),
    ];
    let n = 4;
    for (name, solver) in &solvers {
        let mut group = c.benchmark_group(format!("power_{name}"));
        for nb in [1, 100, 1000] {
            let guess = Tensor::full(&[nb], &[], &[n], 2.0);
            group.bench_with_input(BenchmarkId::new("batch", nb), &guess, |b, guess| {
                b.iter(|| {
                    let mut system = Power::new(n);
                    black_box(solver.solve(&mut system, black_box(guess)).unwrap())
                })
            });
        }
        group.finish();
    }
}

criterion_group!(benches, bench_solvers);
criterion_main!(benches);
