//! Chain rule composition checked against finite differences of the composite map.

use approx::assert_relative_eq;
use strata::{chain_rule, Derivative, Participant, Tensor};

// u = g(x) = [x0^2, x0 x1, exp(x1)]
fn g(x: &[f64]) -> Vec<f64> {
    vec![x[0] * x[0], x[0] * x[1], x[1].exp()]
}

fn dg(x: &[f64]) -> Vec<f64> {
    vec![2.0 * x[0], 0.0, x[1], x[0], 0.0, x[1].exp()]
}

// y = f(u) = [u0 u1 + u2, sin(u0)]
fn f(u: &[f64]) -> Vec<f64> {
    vec![u[0] * u[1] + u[2], u[0].sin()]
}

fn df(u: &[f64]) -> Vec<f64> {
    vec![u[1], u[0], 1.0, u[0].cos(), 0.0, 0.0]
}

const POINTS: [[f64; 2]; 3] = [[0.3, -0.7], [1.1, 0.2], [-0.5, 0.9]];

fn batched(values: impl Fn(&[f64]) -> Vec<f64>, at: impl Fn(&[f64]) -> Vec<f64>) -> Vec<f64> {
    POINTS.iter().flat_map(|x| values(&at(x))).collect()
}

#[test]
fn chain_rule_matches_finite_differences() {
    let mut dy_du = Derivative::new(0, Participant::base("y", &[2]), [Participant::base("u", &[3])])
        .unwrap();
    dy_du
        .assign(Tensor::from_shape_vec(&[3], &[], &[2, 3], batched(df, g)).unwrap())
        .unwrap();
    let mut du_dx = Derivative::new(0, Participant::base("u", &[3]), [Participant::base("x", &[2])])
        .unwrap();
    du_dx
        .assign(Tensor::from_shape_vec(&[3], &[], &[3, 2], batched(dg, |x| x.to_vec())).unwrap())
        .unwrap();

    let dy_dx = chain_rule(&dy_du, &du_dx).unwrap();
    let t = dy_dx.tensor().unwrap();
    assert_eq!(t.shape(), &[3, 2, 2]);
    let values = t.to_vec();

    let h = 1e-6;
    for (b, x) in POINTS.iter().enumerate() {
        for j in 0..2 {
            let mut xp = *x;
            let mut xm = *x;
            xp[j] += h;
            xm[j] -= h;
            let yp = f(&g(&xp));
            let ym = f(&g(&xm));
            for i in 0..2 {
                let fd = (yp[i] - ym[i]) / (2.0 * h);
                assert_relative_eq!(values[b * 4 + i * 2 + j], fd, epsilon = 1e-7);
            }
        }
    }
}

#[test]
fn unbatched_derivative_broadcasts_against_batched() {
    // dy/du shared by every batch entry, du/dx batched over 4
    let mut dy_du = Derivative::new(0, Participant::base("y", &[]), [Participant::base("u", &[2])])
        .unwrap();
    dy_du
        .assign(Tensor::from_shape_vec(&[], &[], &[2], vec![1.0, -1.0]).unwrap())
        .unwrap();
    let mut du_dx = Derivative::new(0, Participant::base("u", &[2]), [Participant::base("x", &[])])
        .unwrap();
    let values: Vec<f64> = (0..8).map(f64::from).collect();
    du_dx
        .assign(Tensor::from_shape_vec(&[4], &[], &[2], values).unwrap())
        .unwrap();

    let dy_dx = chain_rule(&dy_du, &du_dx).unwrap();
    let t = dy_dx.tensor().unwrap();
    assert_eq!(t.batch_sizes(), &[4]);
    assert_eq!(t.base_sizes(), &[] as &[usize]);
    assert_eq!(t.to_vec(), vec![-1.0; 4]);
}

#[test]
fn extrinsic_intermediate_dims_are_elementwise() {
    // y_c = 3 u_c, u_c = x_c^2 for each of 5 cells
    let cell = |n: &str| Participant::new(n, &[5], 0, &[]);
    let x: Vec<f64> = (1..=5).map(f64::from).collect();
    let mut dy_du = Derivative::new(0, cell("y"), [cell("u")]).unwrap();
    dy_du.assign(Tensor::full(&[], &[5], &[], 3.0)).unwrap();
    let mut du_dx = Derivative::new(0, cell("u"), [cell("x")]).unwrap();
    du_dx
        .assign(Tensor::from_shape_vec(&[], &[5], &[], x.iter().map(|v| 2.0 * v).collect()).unwrap())
        .unwrap();

    let dy_dx = chain_rule(&dy_du, &du_dx).unwrap();
    let t = dy_dx.tensor().unwrap();
    assert_eq!(t.intmd_sizes(), &[5]);
    for (v, xc) in t.to_vec().iter().zip(&x) {
        assert_relative_eq!(*v, 6.0 * xc);
    }
}
