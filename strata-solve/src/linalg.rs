use num_traits::Float;
use strata::shape::broadcast_shapes;
use strata::Tensor;

use crate::error::{Result, SolveError};

/// Result of LU factorization with partial pivoting.
///
/// Stores the combined L/U factors of a row-major `n x n` matrix in a single
/// buffer (L below diagonal, U on and above diagonal) plus the row permutation.
#[derive(Debug, Clone)]
pub struct LuFactors<F> {
    lu: Vec<F>,
    /// Row permutation: `perm[i]` is the original row index for factored row `i`.
    perm: Vec<usize>,
    n: usize,
}

/// Factorize a row-major `n x n` matrix via LU decomposition with partial pivoting.
///
/// Returns `None` if the matrix is singular (zero or near-zero pivot).
// Explicit indexing is clearer for pivoted LU: row/col indices drive pivot search and elimination
#[allow(clippy::needless_range_loop)]
pub fn lu_factor<F: Float>(a: &[F], n: usize) -> Option<LuFactors<F>> {
    debug_assert_eq!(a.len(), n * n);

    let mut lu = a.to_vec();
    let mut perm: Vec<usize> = (0..n).collect();

    let eps = F::from(1e-12).unwrap_or_else(|| F::epsilon());

    for col in 0..n {
        let mut max_val = lu[col * n + col].abs();
        let mut max_row = col;
        for row in (col + 1)..n {
            let v = lu[row * n + col].abs();
            if v > max_val {
                max_val = v;
                max_row = row;
            }
        }

        // also catches NaN pivots
        if !(max_val >= eps) {
            return None;
        }

        if max_row != col {
            for j in 0..n {
                lu.swap(col * n + j, max_row * n + j);
            }
            perm.swap(col, max_row);
        }

        let pivot = lu[col * n + col];

        for row in (col + 1)..n {
            let factor = lu[row * n + col] / pivot;
            lu[row * n + col] = factor;
            for j in (col + 1)..n {
                let val = lu[col * n + j];
                lu[row * n + j] = lu[row * n + j] - factor * val;
            }
        }
    }

    Some(LuFactors { lu, perm, n })
}

/// Solve `A * x = b` using a pre-computed LU factorization.
// Explicit indexing is clearer for forward/back substitution with permuted indices
#[allow(clippy::needless_range_loop)]
pub fn lu_back_solve<F: Float>(factors: &LuFactors<F>, b: &[F]) -> Vec<F> {
    let n = factors.n;
    debug_assert_eq!(b.len(), n);

    let mut y = vec![F::zero(); n];
    for i in 0..n {
        y[i] = b[factors.perm[i]];
    }

    // L has unit diagonal
    for i in 1..n {
        for j in 0..i {
            let l_ij = factors.lu[i * n + j];
            let y_j = y[j];
            y[i] = y[i] - l_ij * y_j;
        }
    }

    let mut x = vec![F::zero(); n];
    for i in (0..n).rev() {
        let mut sum = y[i];
        for j in (i + 1)..n {
            sum = sum - factors.lu[i * n + j] * x[j];
        }
        x[i] = sum / factors.lu[i * n + i];
    }

    x
}

/// Batched linear solves against an assembled Jacobian `(batch; n, n)`.
pub trait LinearSolver<F: strata::Float> {
    /// Solve `J x = b` for every batch entry; `b` is `(batch; n)`.
    fn solve(&self, jacobian: &Tensor<F>, rhs: &Tensor<F>) -> Result<Tensor<F>>;

    /// Implicit-function-theorem sensitivities `X = -J⁻¹ B`; `B` is `(batch; n, m)`.
    ///
    /// Each batch entry is factorised once and reused for all `m` columns.
    fn ift(&self, jacobian: &Tensor<F>, rhs: &Tensor<F>) -> Result<Tensor<F>>;
}

/// Dense LU with partial pivoting, one factorisation per batch entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DenseLu;

fn square_size<F: strata::Float>(jacobian: &Tensor<F>) -> Result<usize> {
    match jacobian.base_sizes() {
        [r, c] if r == c && jacobian.intmd_dim() == 0 => Ok(*r),
        _ => Err(strata::Error::InvalidShape(format!(
            "expected an assembled square matrix, got shape {:?}",
            jacobian.shape()
        ))
        .into()),
    }
}

fn factorize<F: strata::Float>(jacobian: &Tensor<F>, batch: &[usize], n: usize) -> Result<Vec<LuFactors<F>>> {
    let data = jacobian.batch_expand(batch)?.to_vec();
    data.chunks(n * n)
        .enumerate()
        .map(|(batch_index, a)| {
            lu_factor(a, n).ok_or(SolveError::SingularMatrix { batch_index })
        })
        .collect()
}

fn check_rhs<F: strata::Float>(rhs: &Tensor<F>, expected: &[usize]) -> Result<()> {
    if rhs.intmd_dim() != 0 || rhs.base_sizes() != expected {
        return Err(strata::Error::InvalidShape(format!(
            "right-hand side must have base shape {expected:?}, got shape {:?}",
            rhs.shape()
        ))
        .into());
    }
    Ok(())
}

impl<F: strata::Float> LinearSolver<F> for DenseLu {
    fn solve(&self, jacobian: &Tensor<F>, rhs: &Tensor<F>) -> Result<Tensor<F>> {
        let n = square_size(jacobian)?;
        check_rhs(rhs, &[n])?;
        let batch = broadcast_shapes(jacobian.batch_sizes(), rhs.batch_sizes())?;
        if n == 0 {
            return Ok(Tensor::zeros(&batch, &[], &[0]));
        }
        let factors = factorize(jacobian, &batch, n)?;
        let b = rhs.batch_expand(&batch)?.to_vec();
        let mut out = Vec::with_capacity(b.len());
        for (f, bi) in factors.iter().zip(b.chunks(n)) {
            out.extend(lu_back_solve(f, bi));
        }
        Ok(Tensor::from_shape_vec(&batch, &[], &[n], out)?)
    }

    fn ift(&self, jacobian: &Tensor<F>, rhs: &Tensor<F>) -> Result<Tensor<F>> {
        let n = square_size(jacobian)?;
        let m = rhs.base_sizes().get(1).copied().unwrap_or(0);
        check_rhs(rhs, &[n, m])?;
        let batch = broadcast_shapes(jacobian.batch_sizes(), rhs.batch_sizes())?;
        if n == 0 || m == 0 {
            return Ok(Tensor::zeros(&batch, &[], &[n, m]));
        }
        let factors = factorize(jacobian, &batch, n)?;
        let b = rhs.batch_expand(&batch)?.to_vec();
        let mut out = vec![F::zero(); b.len()];
        let mut column = vec![F::zero(); n];
        for (k, f) in factors.iter().enumerate() {
            let block = &b[k * n * m..(k + 1) * n * m];
            for c in 0..m {
                for i in 0..n {
                    column[i] = block[i * m + c];
                }
                let x = lu_back_solve(f, &column);
                for i in 0..n {
                    out[k * n * m + i * m + c] = -x[i];
                }
            }
        }
        Ok(Tensor::from_shape_vec(&batch, &[], &[n, m], out)?)
    }
}
