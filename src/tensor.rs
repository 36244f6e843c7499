//! A three-tier tensor: `batch ⊕ intermediate ⊕ base`.
//!
//! The leading *batch* dimensions index independent problem instances, the
//! *intermediate* dimensions index a fixed-cardinality collection (slip
//! systems, cells, ...) and the trailing *base* dimensions hold the
//! components of one physical quantity. Broadcasting is always performed
//! tier by tier: shapes are right-aligned within each tier, never across
//! tier boundaries.

use ndarray::{ArrayD, Axis, Dimension, IxDyn, Slice};

use crate::error::{Error, Result};
use crate::float::Float;
use crate::shape::{add_shapes, broadcast_all, numel, TensorShape};

/// Dense tensor with explicit batch / intermediate / base tiers.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<F> {
    data: ArrayD<F>,
    batch_dim: usize,
    intmd_dim: usize,
}

impl<F: Float> Tensor<F> {
    /// Wrap an array, declaring how many leading dims are batch and intermediate.
    pub fn new(data: ArrayD<F>, batch_dim: usize, intmd_dim: usize) -> Result<Self> {
        if batch_dim + intmd_dim > data.ndim() {
            return Err(Error::InvalidShape(format!(
                "batch dimension {batch_dim} plus intermediate dimension {intmd_dim} exceeds \
                 tensor dimension {}",
                data.ndim()
            )));
        }
        Ok(Tensor {
            data,
            batch_dim,
            intmd_dim,
        })
    }

    /// Build a tensor from row-major values.
    pub fn from_shape_vec(
        batch: &[usize],
        intmd: &[usize],
        base: &[usize],
        values: Vec<F>,
    ) -> Result<Self> {
        let shape = add_shapes(&[batch, intmd, base]);
        let data = ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| Error::InvalidShape(format!("{e} (requested shape {shape:?})")))?;
        Ok(Tensor {
            data,
            batch_dim: batch.len(),
            intmd_dim: intmd.len(),
        })
    }

    /// Tensor filled with `value`.
    pub fn full(batch: &[usize], intmd: &[usize], base: &[usize], value: F) -> Self {
        let shape = add_shapes(&[batch, intmd, base]);
        Tensor {
            data: ArrayD::from_elem(IxDyn(&shape), value),
            batch_dim: batch.len(),
            intmd_dim: intmd.len(),
        }
    }

    /// Tensor filled with zeros.
    pub fn zeros(batch: &[usize], intmd: &[usize], base: &[usize]) -> Self {
        Self::full(batch, intmd, base, F::zero())
    }

    /// Tensor filled with ones.
    pub fn ones(batch: &[usize], intmd: &[usize], base: &[usize]) -> Self {
        Self::full(batch, intmd, base, F::one())
    }

    /// Zeros with the same tiers as `self`.
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.batch_sizes(), self.intmd_sizes(), self.base_sizes())
    }

    /// Identity matrices `(batch; n, n)`.
    pub fn identity(batch: &[usize], n: usize) -> Self {
        let mut shape = batch.to_vec();
        shape.extend([n, n]);
        Tensor {
            data: ArrayD::from_shape_fn(IxDyn(&shape), |idx| {
                let k = idx.ndim();
                if idx[k - 1] == idx[k - 2] {
                    F::one()
                } else {
                    F::zero()
                }
            }),
            batch_dim: batch.len(),
            intmd_dim: 0,
        }
    }

    /// Underlying array.
    pub fn data(&self) -> &ArrayD<F> {
        &self.data
    }

    /// Consume the tensor and return the underlying array.
    pub fn into_data(self) -> ArrayD<F> {
        self.data
    }

    /// Values in logical row-major order.
    pub fn to_vec(&self) -> Vec<F> {
        self.data.iter().copied().collect()
    }

    /// Full shape.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn dim(&self) -> usize {
        self.data.ndim()
    }

    pub fn batch_dim(&self) -> usize {
        self.batch_dim
    }

    pub fn intmd_dim(&self) -> usize {
        self.intmd_dim
    }

    pub fn base_dim(&self) -> usize {
        self.dim() - self.batch_dim - self.intmd_dim
    }

    pub fn batch_sizes(&self) -> &[usize] {
        &self.shape()[..self.batch_dim]
    }

    pub fn intmd_sizes(&self) -> &[usize] {
        &self.shape()[self.batch_dim..self.batch_dim + self.intmd_dim]
    }

    pub fn base_sizes(&self) -> &[usize] {
        &self.shape()[self.batch_dim + self.intmd_dim..]
    }

    /// Batch and intermediate shapes together.
    pub fn leading_sizes(&self) -> &[usize] {
        &self.shape()[..self.batch_dim + self.intmd_dim]
    }

    /// Number of base elements.
    pub fn base_numel(&self) -> usize {
        numel(self.base_sizes())
    }

    /// Reshape into new tiers; the total number of elements must be preserved.
    pub fn reshape_tiers(&self, batch: &[usize], intmd: &[usize], base: &[usize]) -> Result<Self> {
        let shape = add_shapes(&[batch, intmd, base]);
        if numel(&shape) != self.data.len() {
            return Err(Error::InvalidShape(format!(
                "cannot reshape tensor of shape {:?} into {:?}",
                self.shape(),
                shape
            )));
        }
        Self::from_shape_vec(batch, intmd, base, self.to_vec())
    }

    /// Reshape the base tier, keeping batch and intermediate tiers.
    pub fn base_reshape(&self, base: &[usize]) -> Result<Self> {
        self.reshape_tiers(
            &self.batch_sizes().to_vec(),
            &self.intmd_sizes().to_vec(),
            base,
        )
    }

    /// Insert `n` unit dimensions into the batch tier before batch index `at`.
    pub fn batch_unsqueeze(&self, at: usize, n: usize) -> Result<Self> {
        if at > self.batch_dim {
            return Err(Error::InvalidShape(format!(
                "batch unsqueeze position {at} out of range for batch dimension {}",
                self.batch_dim
            )));
        }
        let mut data = self.data.clone();
        for _ in 0..n {
            data = data.insert_axis(Axis(at));
        }
        Ok(Tensor {
            data,
            batch_dim: self.batch_dim + n,
            intmd_dim: self.intmd_dim,
        })
    }

    /// Insert `n` unit dimensions into the intermediate tier before intermediate index `at`.
    pub fn intmd_unsqueeze(&self, at: usize, n: usize) -> Result<Self> {
        if at > self.intmd_dim {
            return Err(Error::InvalidShape(format!(
                "intermediate unsqueeze position {at} out of range for intermediate dimension {}",
                self.intmd_dim
            )));
        }
        let mut data = self.data.clone();
        for _ in 0..n {
            data = data.insert_axis(Axis(self.batch_dim + at));
        }
        Ok(Tensor {
            data,
            batch_dim: self.batch_dim,
            intmd_dim: self.intmd_dim + n,
        })
    }

    /// Insert `n` unit dimensions at the front of the base tier.
    pub fn base_unsqueeze_front(&self, n: usize) -> Self {
        let mut data = self.data.clone();
        for _ in 0..n {
            data = data.insert_axis(Axis(self.batch_dim + self.intmd_dim));
        }
        Tensor {
            data,
            batch_dim: self.batch_dim,
            intmd_dim: self.intmd_dim,
        }
    }

    /// Expand batch and intermediate tiers to the given shapes.
    ///
    /// Tiers with fewer dimensions than the target are left-padded with unit
    /// dimensions first; only unit dimensions are ever expanded.
    pub fn expand_leading(&self, batch: &[usize], intmd: &[usize]) -> Result<Self> {
        if batch.len() < self.batch_dim || intmd.len() < self.intmd_dim {
            return Err(Error::InvalidShape(format!(
                "cannot expand leading shape {:?}/{:?} to {:?}/{:?}",
                self.batch_sizes(),
                self.intmd_sizes(),
                batch,
                intmd
            )));
        }
        let padded = self
            .batch_unsqueeze(0, batch.len() - self.batch_dim)?
            .intmd_unsqueeze(0, intmd.len() - self.intmd_dim)?;
        let shape = add_shapes(&[batch, intmd, padded.base_sizes()]);
        let view = padded
            .data
            .broadcast(IxDyn(&shape))
            .ok_or_else(|| Error::NotBroadcastable {
                lhs: padded.shape().to_vec(),
                rhs: shape.clone(),
            })?;
        Ok(Tensor {
            data: view.to_owned(),
            batch_dim: batch.len(),
            intmd_dim: intmd.len(),
        })
    }

    /// Expand the batch tier.
    pub fn batch_expand(&self, batch: &[usize]) -> Result<Self> {
        self.expand_leading(batch, &self.intmd_sizes().to_vec())
    }

    /// Expand the intermediate tier.
    pub fn intmd_expand(&self, intmd: &[usize]) -> Result<Self> {
        self.expand_leading(&self.batch_sizes().to_vec(), intmd)
    }

    /// Sum over the given intermediate dimensions (tier-relative indices).
    pub fn intmd_sum(&self, dims: &[usize]) -> Result<Self> {
        let mut dims = dims.to_vec();
        dims.sort_unstable();
        dims.dedup();
        if dims.last().is_some_and(|&d| d >= self.intmd_dim) {
            return Err(Error::InvalidShape(format!(
                "intermediate sum over {dims:?} out of range for intermediate dimension {}",
                self.intmd_dim
            )));
        }
        let mut data = self.data.clone();
        for &d in dims.iter().rev() {
            data = data.sum_axis(Axis(self.batch_dim + d));
        }
        Ok(Tensor {
            data,
            batch_dim: self.batch_dim,
            intmd_dim: self.intmd_dim - dims.len(),
        })
    }

    /// Permute all dimensions and re-declare the tiers.
    pub fn permute(&self, perm: &[usize], batch_dim: usize, intmd_dim: usize) -> Result<Self> {
        let mut seen = vec![false; self.dim()];
        if perm.len() != self.dim() || perm.iter().any(|&p| p >= seen.len()) {
            return Err(Error::InvalidShape(format!(
                "invalid permutation {perm:?} for tensor of dimension {}",
                self.dim()
            )));
        }
        for &p in perm {
            if std::mem::replace(&mut seen[p], true) {
                return Err(Error::InvalidShape(format!(
                    "invalid permutation {perm:?}: repeated axis {p}"
                )));
            }
        }
        Tensor::new(
            self.data.clone().permuted_axes(IxDyn(perm)),
            batch_dim,
            intmd_dim,
        )
    }

    /// Slice `start..end` along base axis `axis`.
    pub fn base_narrow(&self, axis: usize, start: usize, end: usize) -> Result<Self> {
        if axis >= self.base_dim() || end > self.base_sizes()[axis] || start > end {
            return Err(Error::InvalidShape(format!(
                "base slice {start}..{end} on axis {axis} out of range for base shape {:?}",
                self.base_sizes()
            )));
        }
        let view = self.data.slice_axis(
            Axis(self.batch_dim + self.intmd_dim + axis),
            Slice::from(start..end),
        );
        Ok(Tensor {
            data: view.to_owned(),
            batch_dim: self.batch_dim,
            intmd_dim: self.intmd_dim,
        })
    }

    /// Split along base axis `axis` into consecutive chunks of the given sizes.
    pub fn base_split(&self, sizes: &[usize], axis: usize) -> Result<Vec<Self>> {
        let total: usize = sizes.iter().sum();
        if axis >= self.base_dim() || total != self.base_sizes()[axis] {
            return Err(Error::InvalidShape(format!(
                "cannot split base shape {:?} along axis {axis} into {sizes:?}",
                self.base_sizes()
            )));
        }
        let mut start = 0;
        let mut out = Vec::with_capacity(sizes.len());
        for &s in sizes {
            out.push(self.base_narrow(axis, start, start + s)?);
            start += s;
        }
        Ok(out)
    }

    /// Concatenate tensors with identical leading shapes along base axis `axis`.
    pub fn base_cat(tensors: &[Tensor<F>], axis: usize) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::InvalidShape("cannot concatenate zero tensors".into()))?;
        for t in tensors {
            if t.leading_sizes() != first.leading_sizes()
                || t.batch_dim != first.batch_dim
                || t.base_dim() != first.base_dim()
            {
                return Err(Error::InvalidShape(format!(
                    "cannot concatenate tensors of shapes {:?} and {:?}",
                    first.shape(),
                    t.shape()
                )));
            }
        }
        let views: Vec<_> = tensors.iter().map(|t| t.data.view()).collect();
        let data = ndarray::concatenate(
            Axis(first.batch_dim + first.intmd_dim + axis),
            &views,
        )
        .map_err(|e| Error::InvalidShape(e.to_string()))?;
        Tensor::new(data, first.batch_dim, first.intmd_dim)
    }

    /// Embed the trailing `k` intermediate dimensions (shape `S`) on the
    /// diagonal of a new `S ⊕ S` block; off-diagonal entries are zero.
    pub fn intmd_diagonalize(&self, k: usize) -> Result<Self> {
        if k > self.intmd_dim {
            return Err(Error::InvalidShape(format!(
                "cannot diagonalize {k} of {} intermediate dimensions",
                self.intmd_dim
            )));
        }
        let split = self.intmd_dim - k;
        let outer_intmd = &self.intmd_sizes()[..split];
        let block = &self.intmd_sizes()[split..];
        let diag = numel(block);
        let base = self.base_numel();
        let outer = numel(self.batch_sizes()) * numel(outer_intmd);
        let src = self.to_vec();
        let mut dst = vec![F::zero(); outer * diag * diag * base];
        for o in 0..outer {
            for p in 0..diag {
                let from = (o * diag + p) * base;
                let to = ((o * diag + p) * diag + p) * base;
                dst[to..to + base].copy_from_slice(&src[from..from + base]);
            }
        }
        let intmd = add_shapes(&[outer_intmd, block, block]);
        Self::from_shape_vec(self.batch_sizes(), &intmd, self.base_sizes(), dst)
    }

    /// Multiply every element by `s`.
    pub fn scale(&self, s: F) -> Self {
        Tensor {
            data: &self.data * s,
            batch_dim: self.batch_dim,
            intmd_dim: self.intmd_dim,
        }
    }

    /// Elementwise negation.
    pub fn neg(&self) -> Self {
        self.scale(-F::one())
    }

    /// Elementwise sum with tier-wise broadcasting.
    pub fn add(&self, other: &Tensor<F>) -> Result<Self> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Elementwise difference with tier-wise broadcasting.
    pub fn sub(&self, other: &Tensor<F>) -> Result<Self> {
        self.zip_with(other, |a, b| a - b)
    }

    /// Elementwise product with tier-wise broadcasting.
    pub fn mul(&self, other: &Tensor<F>) -> Result<Self> {
        self.zip_with(other, |a, b| a * b)
    }

    /// Pad each tier on the left with unit dimensions.
    fn align(&self, batch_dim: usize, intmd_dim: usize, base_dim: usize) -> Result<Self> {
        Ok(self
            .batch_unsqueeze(0, batch_dim - self.batch_dim)?
            .intmd_unsqueeze(0, intmd_dim - self.intmd_dim)?
            .base_unsqueeze_front(base_dim - self.base_dim()))
    }

    fn zip_with(&self, other: &Tensor<F>, f: impl Fn(F, F) -> F) -> Result<Self> {
        let bd = self.batch_dim.max(other.batch_dim);
        let id = self.intmd_dim.max(other.intmd_dim);
        let sd = self.base_dim().max(other.base_dim());
        let a = self.align(bd, id, sd)?;
        let b = other.align(bd, id, sd)?;
        let shape = broadcast_all([a.shape(), b.shape()])?;
        let not_broadcastable = || Error::NotBroadcastable {
            lhs: self.shape().to_vec(),
            rhs: other.shape().to_vec(),
        };
        let av = a.data.broadcast(IxDyn(&shape)).ok_or_else(not_broadcastable)?;
        let bv = b.data.broadcast(IxDyn(&shape)).ok_or_else(not_broadcastable)?;
        let values = av.iter().zip(bv.iter()).map(|(&x, &y)| f(x, y)).collect();
        let data = ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| Error::InvalidShape(e.to_string()))?;
        Tensor::new(data, bd, id)
    }
}

/// Operands broadcast to a common batch/intermediate shape, flattened per leading index.
pub(crate) struct Leading<F> {
    pub batch: TensorShape,
    pub intmd: TensorShape,
    /// For each operand, its values laid out as `[lead][base...]`.
    pub blocks: Vec<Vec<F>>,
    /// For each operand, the number of base elements.
    pub base_len: Vec<usize>,
}

impl<F> Leading<F> {
    pub fn len(&self) -> usize {
        numel(&self.batch) * numel(&self.intmd)
    }
}

/// Broadcast the batch and intermediate tiers of all operands together.
pub(crate) fn broadcast_leading<F: Float>(operands: &[&Tensor<F>]) -> Result<Leading<F>> {
    let bd = operands.iter().map(|t| t.batch_dim()).max().unwrap_or(0);
    let id = operands.iter().map(|t| t.intmd_dim()).max().unwrap_or(0);
    let aligned = operands
        .iter()
        .map(|t| {
            t.batch_unsqueeze(0, bd - t.batch_dim())?
                .intmd_unsqueeze(0, id - t.intmd_dim())
        })
        .collect::<Result<Vec<_>>>()?;
    let batch = broadcast_all(aligned.iter().map(|t| t.batch_sizes()))?;
    let intmd = broadcast_all(aligned.iter().map(|t| t.intmd_sizes()))?;
    let mut blocks = Vec::with_capacity(aligned.len());
    let mut base_len = Vec::with_capacity(aligned.len());
    for t in &aligned {
        let expanded = t.expand_leading(&batch, &intmd)?;
        base_len.push(expanded.base_numel());
        blocks.push(expanded.to_vec());
    }
    Ok(Leading {
        batch,
        intmd,
        blocks,
        base_len,
    })
}

/// Apply `kernel` to the base blocks of all operands for every broadcast
/// leading index, producing a tensor with base shape `out_base`.
pub(crate) fn contract_leading<F: Float>(
    operands: &[&Tensor<F>],
    out_base: &[usize],
    kernel: impl Fn(&[&[F]], &mut [F]),
) -> Result<Tensor<F>> {
    let lead = broadcast_leading(operands)?;
    let out_len = numel(out_base);
    let mut out = vec![F::zero(); lead.len() * out_len];
    for l in 0..lead.len() {
        let blocks: Vec<&[F]> = lead
            .blocks
            .iter()
            .zip(&lead.base_len)
            .map(|(b, &n)| &b[l * n..(l + 1) * n])
            .collect();
        kernel(&blocks, &mut out[l * out_len..(l + 1) * out_len]);
    }
    Tensor::from_shape_vec(&lead.batch, &lead.intmd, out_base, out)
}

/// Batched matrix product over base tiers `(…; m, k) × (…; k, n) → (…; m, n)`.
///
/// Batch and intermediate tiers broadcast independently.
pub fn batched_matmul<F: Float>(a: &Tensor<F>, b: &Tensor<F>) -> Result<Tensor<F>> {
    if a.base_dim() != 2 || b.base_dim() != 2 || a.base_sizes()[1] != b.base_sizes()[0] {
        return Err(Error::InvalidShape(format!(
            "cannot multiply base shapes {:?} and {:?}",
            a.base_sizes(),
            b.base_sizes()
        )));
    }
    let (m, k) = (a.base_sizes()[0], a.base_sizes()[1]);
    let n = b.base_sizes()[1];
    contract_leading(&[a, b], &[m, n], |blocks, out| {
        let (ab, bb) = (blocks[0], blocks[1]);
        for i in 0..m {
            for p in 0..k {
                let aip = ab[i * k + p];
                if aip == F::zero() {
                    continue;
                }
                for j in 0..n {
                    out[i * n + j] = out[i * n + j] + aip * bb[p * n + j];
                }
            }
        }
    })
}
