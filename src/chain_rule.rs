//! Composition of derivatives of nested functions.
//!
//! All three rules flatten base shapes into matrices (or rank-3 tensors),
//! contract over the shared quantity `u` for every broadcast leading index and
//! reshape the result back to `base(y) ⊕ base(x…)`.

use std::borrow::Cow;

use crate::derivative::{Derivative, Participant};
use crate::error::{Error, Result};
use crate::float::Float;
use crate::shape::{add_shapes, numel};
use crate::tensor::{batched_matmul, contract_leading};

fn check_base<F: Float, const A: usize, const B: usize>(
    outer: &Derivative<F, A>,
    slot: usize,
    inner: &Derivative<F, B>,
) -> Result<()> {
    let expected = outer.args()[slot].base_sizes();
    let actual = inner.var().base_sizes();
    if expected != actual {
        return Err(Error::BaseShapeMismatch {
            name: format!("{} and {}", outer.name(), inner.name()),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}

/// `dy/dx = dy/du · du/dx`.
pub fn chain_rule<F: Float>(
    dy_du: &Derivative<F, 1>,
    du_dx: &Derivative<F, 1>,
) -> Result<Derivative<F, 1>> {
    let ku = dy_du.args()[0].intrsc_intmd_dim();
    let ku2 = du_dx.var().intrsc_intmd_dim();
    if ku != ku2 {
        log::trace!(
            "reinterpreting {} intrinsic dims to compose {} with {}",
            ku.abs_diff(ku2),
            dy_du.name(),
            du_dx.name()
        );
    }
    if ku > ku2 {
        return chain_rule(dy_du, &du_dx.reinterpret(ku - ku2)?);
    }
    if ku < ku2 {
        return chain_rule(&dy_du.reinterpret(ku2 - ku)?, du_dx);
    }
    check_base(dy_du, 0, du_dx)?;

    let y = dy_du.var();
    let u = &dy_du.args()[0];
    let x = &du_dx.args()[0];
    let (ky, kx) = (y.intrsc_intmd_dim(), x.intrsc_intmd_dim());
    let ny = numel(y.base_sizes());
    let nu = numel(u.base_sizes());
    let nx = numel(x.base_sizes());
    let mut a = dy_du.tensor()?.base_reshape(&[ny, nu])?;
    let mut b = du_dx.tensor()?.base_reshape(&[nu, nx])?;

    // align dependent intrinsic dims for the contraction
    let a_dense = !dy_du.is_intrsc_intmd_broadcast();
    let b_dense = !du_dx.is_intrsc_intmd_broadcast();
    if a_dense {
        let at = b.intmd_dim() - du_dx.intrsc_intmd_dim().min(b.intmd_dim());
        b = b.intmd_unsqueeze(at, ky)?;
    }
    if b_dense {
        a = a.intmd_unsqueeze(a.intmd_dim(), kx)?;
    }

    let mut c = batched_matmul(&a, &b)?;
    if ku > 0 && a_dense && b_dense {
        let n = c.intmd_dim();
        let dims: Vec<usize> = (n - ku - kx..n - kx).collect();
        c = c.intmd_sum(&dims)?;
    }

    // the product of two diagonal derivatives stays diagonal
    let m = if a_dense || b_dense { ky + kx } else { ky };
    let mut out = Derivative::new(m, y.clone(), [x.clone()])?;
    out.assign(c.base_reshape(&add_shapes(&[y.base_sizes(), x.base_sizes()]))?)?;
    Ok(out)
}

/// Bring a first derivative `du/dx` in line with slot `slot` of `d2y`.
fn align_slot<'a, F: Float>(
    d2y: &mut Cow<'_, Derivative<F, 2>>,
    slot: usize,
    du: &'a Derivative<F, 1>,
) -> Result<Cow<'a, Derivative<F, 1>>> {
    let ku = d2y.args()[slot].intrsc_intmd_dim();
    let ku2 = du.var().intrsc_intmd_dim();
    if ku2 < ku {
        return Ok(Cow::Owned(du.reinterpret(ku - ku2)?));
    }
    if ku2 > ku {
        *d2y = Cow::Owned(d2y.reinterpret(ku2 - ku)?);
    }
    Ok(Cow::Borrowed(du))
}

/// Participant of a second-order result: shapes kept, intrinsic dims dropped.
fn elementwise(p: &Participant) -> Participant {
    Participant::new(p.name().clone(), p.intmd_sizes(), 0, p.base_sizes())
}

/// `d²y/dx₁dx₂` from `d²y/du₁du₂` and the optional inner derivatives.
///
/// A missing inner derivative leaves its slot uncontracted (the slot keeps
/// `u`); it is not treated as zero. At least one must be given.
pub fn chain_rule_second_order<F: Float>(
    d2y_du1u2: &Derivative<F, 2>,
    du1_dx1: Option<&Derivative<F, 1>>,
    du2_dx2: Option<&Derivative<F, 1>>,
) -> Result<Derivative<F, 2>> {
    if du1_dx1.is_none() && du2_dx2.is_none() {
        return Err(Error::InvalidDerivative {
            name: d2y_du1u2.name(),
            reason: "second order chain rule needs at least one inner derivative".into(),
        });
    }

    let mut d2y = Cow::Borrowed(d2y_du1u2);
    let du1 = du1_dx1.map(|d| align_slot(&mut d2y, 0, d)).transpose()?;
    let du2 = du2_dx2.map(|d| align_slot(&mut d2y, 1, d)).transpose()?;
    if let Some(d) = &du1 {
        check_base(d2y.as_ref(), 0, d.as_ref())?;
    }
    if let Some(d) = &du2 {
        check_base(d2y.as_ref(), 1, d.as_ref())?;
    }

    let y = d2y.var();
    let x1 = du1.as_ref().map_or(&d2y.args()[0], |d| &d.args()[0]);
    let x2 = du2.as_ref().map_or(&d2y.args()[1], |d| &d.args()[0]);
    let ny = numel(y.base_sizes());
    let nu1 = numel(d2y.args()[0].base_sizes());
    let nu2 = numel(d2y.args()[1].base_sizes());
    let nx1 = numel(x1.base_sizes());
    let nx2 = numel(x2.base_sizes());

    let a = d2y.tensor()?.base_reshape(&[ny, nu1, nu2])?;
    let c = match (&du1, &du2) {
        (Some(d1), Some(d2)) => {
            let b1 = d1.tensor()?.base_reshape(&[nu1, nx1])?;
            let b2 = d2.tensor()?.base_reshape(&[nu2, nx2])?;
            // ipq,pj,qk -> ijk
            contract_leading(&[&a, &b1, &b2], &[ny, nx1, nx2], |blk, out| {
                let (a, b1, b2) = (blk[0], blk[1], blk[2]);
                for i in 0..ny {
                    for p in 0..nu1 {
                        for q in 0..nu2 {
                            let apq = a[(i * nu1 + p) * nu2 + q];
                            if apq == F::zero() {
                                continue;
                            }
                            for j in 0..nx1 {
                                let w = apq * b1[p * nx1 + j];
                                for k in 0..nx2 {
                                    let o = (i * nx1 + j) * nx2 + k;
                                    out[o] = out[o] + w * b2[q * nx2 + k];
                                }
                            }
                        }
                    }
                }
            })?
        }
        (Some(d1), None) => {
            let b1 = d1.tensor()?.base_reshape(&[nu1, nx1])?;
            // ipk,pj -> ijk
            contract_leading(&[&a, &b1], &[ny, nx1, nu2], |blk, out| {
                let (a, b1) = (blk[0], blk[1]);
                for i in 0..ny {
                    for p in 0..nu1 {
                        for j in 0..nx1 {
                            let w = b1[p * nx1 + j];
                            for k in 0..nu2 {
                                let o = (i * nx1 + j) * nu2 + k;
                                out[o] = out[o] + a[(i * nu1 + p) * nu2 + k] * w;
                            }
                        }
                    }
                }
            })?
        }
        (None, Some(d2)) => {
            let b2 = d2.tensor()?.base_reshape(&[nu2, nx2])?;
            // ijq,qk -> ijk
            contract_leading(&[&a, &b2], &[ny, nu1, nx2], |blk, out| {
                let (a, b2) = (blk[0], blk[1]);
                for i in 0..ny {
                    for j in 0..nu1 {
                        for q in 0..nu2 {
                            let aq = a[(i * nu1 + j) * nu2 + q];
                            for k in 0..nx2 {
                                let o = (i * nu1 + j) * nx2 + k;
                                out[o] = out[o] + aq * b2[q * nx2 + k];
                            }
                        }
                    }
                }
            })?
        }
        (None, None) => unreachable!("checked above"),
    };

    let mut out = Derivative::new(0, elementwise(y), [elementwise(x1), elementwise(x2)])?;
    out.assign(c.base_reshape(&add_shapes(&[
        y.base_sizes(),
        x1.base_sizes(),
        x2.base_sizes(),
    ]))?)?;
    Ok(out)
}

/// `d²y/dx₁dx₂ = dy/du · d²u/dx₁dx₂`.
pub fn chain_rule_through_second<F: Float>(
    dy_du: &Derivative<F, 1>,
    d2u_dx1x2: &Derivative<F, 2>,
) -> Result<Derivative<F, 2>> {
    check_base(dy_du, 0, d2u_dx1x2)?;
    let y = dy_du.var();
    let [x1, x2] = d2u_dx1x2.args();
    let ny = numel(y.base_sizes());
    let nu = numel(dy_du.args()[0].base_sizes());
    let nx1 = numel(x1.base_sizes());
    let nx2 = numel(x2.base_sizes());

    let a = dy_du.tensor()?.base_reshape(&[ny, nu])?;
    let b = d2u_dx1x2.tensor()?.base_reshape(&[nu, nx1, nx2])?;
    // ip,pjk -> ijk
    let c = contract_leading(&[&a, &b], &[ny, nx1, nx2], |blk, out| {
        let (a, b) = (blk[0], blk[1]);
        let njk = nx1 * nx2;
        for i in 0..ny {
            for p in 0..nu {
                let aip = a[i * nu + p];
                if aip == F::zero() {
                    continue;
                }
                for jk in 0..njk {
                    out[i * njk + jk] = out[i * njk + jk] + aip * b[p * njk + jk];
                }
            }
        }
    })?;

    let mut out = Derivative::new(0, elementwise(y), [elementwise(x1), elementwise(x2)])?;
    out.assign(c.base_reshape(&add_shapes(&[
        y.base_sizes(),
        x1.base_sizes(),
        x2.base_sizes(),
    ]))?)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;
    use approx::assert_relative_eq;

    fn first(y: &str, ny: usize, x: &str, nx: usize, values: Vec<f64>) -> Derivative<f64, 1> {
        let mut d = Derivative::new(
            0,
            Participant::base(y, &[ny]),
            [Participant::base(x, &[nx])],
        )
        .unwrap();
        d.assign(Tensor::from_shape_vec(&[], &[], &[ny, nx], values).unwrap())
            .unwrap();
        d
    }

    #[test]
    fn first_order_is_matrix_product() {
        let dy_du = first("y", 1, "u", 2, vec![1.0, 2.0]);
        let du_dx = first("u", 2, "x", 2, vec![1.0, 0.0, 3.0, 4.0]);
        let dy_dx = chain_rule(&dy_du, &du_dx).unwrap();
        assert_eq!(dy_dx.name(), "d(y)/d(x)");
        assert_eq!(dy_dx.tensor().unwrap().to_vec(), vec![7.0, 8.0]);
    }

    #[test]
    fn mismatched_u_base_errors() {
        let dy_du = first("y", 1, "u", 2, vec![1.0, 2.0]);
        let du_dx = first("u", 3, "x", 1, vec![1.0, 1.0, 1.0]);
        assert!(matches!(
            chain_rule(&dy_du, &du_dx),
            Err(Error::BaseShapeMismatch { .. })
        ));
    }

    #[test]
    fn dense_intrinsic_dims_are_summed() {
        // y, u, x each carry one intrinsic intermediate dim of size 2
        let p = |n: &str| Participant::new(n, &[2], 1, &[]);
        let mut dy_du = Derivative::<f64, 1>::new(2, p("y"), [p("u")]).unwrap();
        let mut du_dx = Derivative::<f64, 1>::new(2, p("u"), [p("x")]).unwrap();
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let b = vec![5.0, 6.0, 7.0, 8.0];
        dy_du
            .assign(Tensor::from_shape_vec(&[], &[2, 2], &[], a).unwrap())
            .unwrap();
        du_dx
            .assign(Tensor::from_shape_vec(&[], &[2, 2], &[], b).unwrap())
            .unwrap();
        let c = chain_rule(&dy_du, &du_dx).unwrap();
        assert!(!c.is_intrsc_intmd_broadcast());
        assert_eq!(c.intmd_sizes().unwrap(), &[2, 2]);
        assert_eq!(c.tensor().unwrap().to_vec(), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn diagonal_times_dense_keeps_dense() {
        let p = |n: &str| Participant::new(n, &[2], 1, &[]);
        let mut dy_du = Derivative::<f64, 1>::new(1, p("y"), [p("u")]).unwrap();
        let mut du_dx = Derivative::<f64, 1>::new(2, p("u"), [p("x")]).unwrap();
        dy_du
            .assign(Tensor::from_shape_vec(&[], &[2], &[], vec![2.0, 3.0]).unwrap())
            .unwrap();
        du_dx
            .assign(Tensor::from_shape_vec(&[], &[2, 2], &[], vec![1.0, 2.0, 3.0, 4.0]).unwrap())
            .unwrap();
        let c = chain_rule(&dy_du, &du_dx).unwrap();
        // diag(2, 3) · [[1, 2], [3, 4]]
        assert_eq!(c.tensor().unwrap().to_vec(), vec![2.0, 4.0, 9.0, 12.0]);
    }

    #[test]
    fn second_order_both_sides() {
        // y = u1 * u2, u1 = 2 x1, u2 = 3 x2
        let mut d2 = Derivative::<f64, 2>::new(
            0,
            Participant::base("y", &[]),
            [Participant::base("u1", &[]), Participant::base("u2", &[])],
        )
        .unwrap();
        d2.assign(Tensor::ones(&[], &[], &[])).unwrap();
        let mut du1 =
            Derivative::new(0, Participant::base("u1", &[]), [Participant::base("x1", &[])])
                .unwrap();
        du1.assign(Tensor::full(&[], &[], &[], 2.0)).unwrap();
        let mut du2 =
            Derivative::new(0, Participant::base("u2", &[]), [Participant::base("x2", &[])])
                .unwrap();
        du2.assign(Tensor::full(&[], &[], &[], 3.0)).unwrap();

        let both = chain_rule_second_order(&d2, Some(&du1), Some(&du2)).unwrap();
        assert_eq!(both.name(), "d2(y)/d(x1)d(x2)");
        assert_relative_eq!(both.tensor().unwrap().to_vec()[0], 6.0);

        let left = chain_rule_second_order(&d2, Some(&du1), None).unwrap();
        assert_eq!(left.name(), "d2(y)/d(x1)d(u2)");
        assert_relative_eq!(left.tensor().unwrap().to_vec()[0], 2.0);

        let right = chain_rule_second_order(&d2, None, Some(&du2)).unwrap();
        assert_relative_eq!(right.tensor().unwrap().to_vec()[0], 3.0);

        assert!(chain_rule_second_order(&d2, None, None).is_err());
    }

    #[test]
    fn second_order_needing_reinterpretation_is_unsupported() {
        let mut d2 = Derivative::<f64, 2>::new(
            0,
            Participant::base("y", &[]),
            [Participant::base("u", &[]), Participant::base("v", &[])],
        )
        .unwrap();
        d2.assign(Tensor::ones(&[], &[], &[])).unwrap();
        let mut du = Derivative::<f64, 1>::new(
            1,
            Participant::new("u", &[2], 1, &[]),
            [Participant::new("x", &[2], 1, &[])],
        )
        .unwrap();
        du.assign(Tensor::ones(&[], &[2], &[])).unwrap();
        assert!(matches!(
            chain_rule_second_order(&d2, Some(&du), None),
            Err(Error::NotImplemented(_))
        ));
    }

    #[test]
    fn through_second_order() {
        let dy_du = first("y", 2, "u", 1, vec![1.0, -1.0]);
        let mut d2u = Derivative::<f64, 2>::new(
            0,
            Participant::base("u", &[1]),
            [Participant::base("a", &[2]), Participant::base("b", &[])],
        )
        .unwrap();
        d2u.assign(Tensor::from_shape_vec(&[], &[], &[1, 2], vec![4.0, 5.0]).unwrap())
            .unwrap();
        let d2y = chain_rule_through_second(&dy_du, &d2u).unwrap();
        assert_eq!(d2y.base_sizes(), vec![2, 2]);
        assert_eq!(d2y.tensor().unwrap().to_vec(), vec![4.0, 5.0, -4.0, -5.0]);
    }
}
