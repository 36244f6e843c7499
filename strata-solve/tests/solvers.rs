//! Newton-family solvers on small batched systems with known roots.

use approx::assert_relative_eq;
use strata::{AxisBuilder, LabeledAxis, Tensor};
use strata_solve::{
    LineSearchConfig, LineSearchKind, Newton, NewtonWithLineSearch, NewtonWithTrustRegion,
    NonlinearSolver, NonlinearSystem, RetCode, Result,
};

/// A residual defined independently for each batch entry.
trait Problem {
    fn n(&self) -> usize;
    fn residual(&self, x: &[f64]) -> Vec<f64>;
    /// Row-major `n x n`.
    fn jacobian(&self, x: &[f64]) -> Vec<f64>;
}

struct Rows<P> {
    problem: P,
    axis: LabeledAxis,
    x: Option<Tensor<f64>>,
}

impl<P: Problem> Rows<P> {
    fn new(problem: P) -> Self {
        let mut builder = AxisBuilder::new();
        for i in 0..problem.n() {
            builder.add_variable(format!("x{i}"), &[], &[]).unwrap();
        }
        Rows {
            problem,
            axis: builder.build(),
            x: None,
        }
    }

    fn map(&self, f: impl Fn(&[f64]) -> Vec<f64>, base: &[usize]) -> Result<Tensor<f64>> {
        let x = self.x.as_ref().unwrap();
        let data = x.to_vec().chunks(self.problem.n()).flat_map(f).collect();
        Ok(Tensor::from_shape_vec(x.batch_sizes(), &[], base, data)?)
    }
}

impl<P: Problem> NonlinearSystem<f64> for Rows<P> {
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
        let n = self.problem.n();
        self.map(|x| self.problem.residual(x), &[n])
    }

    fn jacobian(&mut self) -> Result<Tensor<f64>> {
        let n = self.problem.n();
        self.map(|x| self.problem.jacobian(x), &[n, n])
    }
}

/// `x_i^(i+1) - 1 = 0`
struct Power(usize);

impl Problem for Power {
    fn n(&self) -> usize {
        self.0
    }

    fn residual(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .enumerate()
            .map(|(i, xi)| xi.powi(i as i32 + 1) - 1.0)
            .collect()
    }

    fn jacobian(&self, x: &[f64]) -> Vec<f64> {
        let n = self.0;
        let mut j = vec![0.0; n * n];
        for i in 0..n {
            j[i * n + i] = (i + 1) as f64 * x[i].powi(i as i32);
        }
        j
    }
}

/// Stationarity of the extended Rosenbrock function.
struct Rosenbrock(usize);

impl Problem for Rosenbrock {
    fn n(&self) -> usize {
        self.0
    }

    fn residual(&self, x: &[f64]) -> Vec<f64> {
        let n = self.0;
        let mut r = vec![0.0; n];
        for i in 0..n {
            if i + 1 < n {
                r[i] += -400.0 * x[i] * (x[i + 1] - x[i] * x[i]) - 2.0 * (1.0 - x[i]);
            }
            if i > 0 {
                r[i] += 200.0 * (x[i] - x[i - 1] * x[i - 1]);
            }
        }
        r
    }

    fn jacobian(&self, x: &[f64]) -> Vec<f64> {
        let n = self.0;
        let mut j = vec![0.0; n * n];
        for i in 0..n {
            if i + 1 < n {
                j[i * n + i] += 1200.0 * x[i] * x[i] - 400.0 * x[i + 1] + 2.0;
                j[i * n + i + 1] = -400.0 * x[i];
            }
            if i > 0 {
                j[i * n + i] += 200.0;
                j[i * n + i - 1] = -400.0 * x[i - 1];
            }
        }
        j
    }
}

/// Rosenbrock in least-squares form, `r = [10 (x1 - x0²), 1 - x0]`.
struct RosenbrockResidual;

impl Problem for RosenbrockResidual {
    fn n(&self) -> usize {
        2
    }

    fn residual(&self, x: &[f64]) -> Vec<f64> {
        vec![10.0 * (x[1] - x[0] * x[0]), 1.0 - x[0]]
    }

    fn jacobian(&self, x: &[f64]) -> Vec<f64> {
        vec![-20.0 * x[0], 10.0, -1.0, 0.0]
    }
}

struct Atan;

impl Problem for Atan {
    fn n(&self) -> usize {
        1
    }

    fn residual(&self, x: &[f64]) -> Vec<f64> {
        vec![x[0].atan()]
    }

    fn jacobian(&self, x: &[f64]) -> Vec<f64> {
        vec![1.0 / (1.0 + x[0] * x[0])]
    }
}

fn solvers() -> Vec<(&'static str, Box<dyn NonlinearSolver<f64>>)> {
    vec![
        ("newton", Box::new(Newton::<f64>::default())),
        ("line_search", Box::new(NewtonWithLineSearch::<f64>::default())),
        ("trust_region", Box::new(NewtonWithTrustRegion::<f64>::default())),
    ]
}

fn full(batch: &[usize], n: usize, value: f64) -> Tensor<f64> {
    Tensor::full(batch, &[], &[n], value)
}

#[test]
fn power_system_converges_to_ones() {
    let _ = env_logger::builder().is_test(true).try_init();
    for (name, solver) in solvers() {
        let mut system = Rows::new(Power(4));
        let res = solver.solve(&mut system, &full(&[2], 4, 2.0)).unwrap();
        assert_eq!(res.ret, RetCode::Success, "{name}");
        assert_eq!(res.solution.shape(), &[2, 4]);
        for x in res.solution.to_vec() {
            assert_relative_eq!(x, 1.0, max_relative = 1e-8);
        }
        assert_eq!(system.solution().unwrap(), &res.solution, "{name}");
    }
}

#[test]
fn converged_guess_returns_at_iteration_zero() {
    for (name, solver) in solvers() {
        let guess = full(&[2], 4, 1.0);
        let res = solver.solve(&mut Rows::new(Power(4)), &guess).unwrap();
        assert_eq!(res.ret, RetCode::Success, "{name}");
        assert_eq!(res.iterations, 0, "{name}");
        assert_eq!(res.solution, guess);
    }
}

#[test]
fn line_search_needs_no_more_iterations_than_newton() {
    let guess = full(&[2], 4, 2.0);
    let newton = Newton::<f64>::default()
        .solve(&mut Rows::new(Power(4)), &guess)
        .unwrap();
    let line_search = NewtonWithLineSearch::<f64>::default()
        .solve(&mut Rows::new(Power(4)), &guess)
        .unwrap();
    assert_eq!(newton.ret, RetCode::Success);
    assert_eq!(line_search.ret, RetCode::Success);
    assert!(line_search.iterations <= newton.iterations);
}

#[test]
fn rosenbrock_stationary_point() {
    for (name, solver) in solvers() {
        let res = solver
            .solve(&mut Rows::new(Rosenbrock(4)), &full(&[2], 4, 0.75))
            .unwrap();
        assert_eq!(res.ret, RetCode::Success, "{name}");
        for x in res.solution.to_vec() {
            assert!((x - 1.0).abs() < 1e-6, "{name}: {x}");
        }
    }
}

#[test]
fn trust_region_reaches_rosenbrock_root_from_a_poor_guess() {
    let guess = Tensor::from_shape_vec(&[], &[], &[2], vec![-1.2, 1.0]).unwrap();
    let res = NewtonWithTrustRegion::<f64>::default()
        .solve(&mut Rows::new(RosenbrockResidual), &guess)
        .unwrap();
    assert_eq!(res.ret, RetCode::Success);
    assert!(res.iterations > 1);
    for x in res.solution.to_vec() {
        assert!((x - 1.0).abs() < 1e-8, "{x}");
    }
}

#[test]
fn globalised_solvers_converge_where_newton_fails() {
    // entries far from and close to the root share one batch
    let guess = Tensor::from_shape_vec(&[2], &[], &[1], vec![2.0, 0.5]).unwrap();
    let newton = Newton::<f64>::default().solve(&mut Rows::new(Atan), &guess);
    assert!(!matches!(newton, Ok(ref res) if res.ret == RetCode::Success));

    for solver in [
        Box::new(NewtonWithLineSearch::<f64>::default()) as Box<dyn NonlinearSolver<f64>>,
        Box::new(NewtonWithTrustRegion::<f64>::default()),
    ] {
        let res = solver.solve(&mut Rows::new(Atan), &guess).unwrap();
        assert_eq!(res.ret, RetCode::Success);
        for x in res.solution.to_vec() {
            assert!(x.abs() < 1e-8, "{x}");
        }
    }
}

#[test]
fn linear_system_takes_one_step() {
    struct Shifted;
    impl Problem for Shifted {
        fn n(&self) -> usize {
            1
        }
        fn residual(&self, x: &[f64]) -> Vec<f64> {
            vec![x[0] - 3.0]
        }
        fn jacobian(&self, _: &[f64]) -> Vec<f64> {
            vec![1.0]
        }
    }
    let guess = full(&[3], 1, 0.0);
    let res = Newton::<f64>::default()
        .solve(&mut Rows::new(Shifted), &guess)
        .unwrap();
    assert_eq!(res.iterations, 1);
    assert_eq!(res.solution.to_vec(), vec![3.0; 3]);
}

#[test]
fn strong_wolfe_line_search_converges_on_atan() {
    let guess = Tensor::from_shape_vec(&[2], &[], &[1], vec![2.0, 0.5]).unwrap();
    let solver = NewtonWithLineSearch::new(LineSearchConfig {
        kind: LineSearchKind::StrongWolfe,
        ..LineSearchConfig::<f64>::default()
    });
    let res = solver.solve(&mut Rows::new(Atan), &guess).unwrap();
    assert_eq!(res.ret, RetCode::Success);
    assert_eq!(res.iterations, 5);
    for x in res.solution.to_vec() {
        assert!(x.abs() < 1e-8, "{x}");
    }
}
