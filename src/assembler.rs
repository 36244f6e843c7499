//! Packing named variable dictionaries into flat vectors and matrices.

use std::collections::BTreeMap;

use crate::axis::{LabeledAxis, VariableLayout, VariableName};
use crate::error::{Error, Result};
use crate::float::Float;
use crate::shape::{broadcast_all, TensorShape};
use crate::tensor::Tensor;

/// Per-variable values in assembly form, keyed by fully qualified name.
pub type ValueMap<F> = BTreeMap<VariableName, Tensor<F>>;

/// Per-(row, column) derivatives in assembly form.
pub type DerivMap<F> = BTreeMap<VariableName, ValueMap<F>>;

fn check_entry<F: Float>(
    name: &VariableName,
    t: &Tensor<F>,
    expected: &[usize],
) -> Result<()> {
    if t.intmd_dim() != 0 || t.base_sizes() != expected {
        return Err(Error::AssemblySize {
            variable: name.to_string(),
            expected: expected.to_vec(),
            actual: t.shape()[t.batch_dim()..].to_vec(),
        });
    }
    Ok(())
}

/// Expand present tensors to the common batch shape, zero-fill the rest and
/// concatenate along base axis `axis`.
fn fill_and_cat<F: Float>(
    parts: Vec<Option<Tensor<F>>>,
    zero_base: impl Fn(usize) -> TensorShape,
    axis: usize,
) -> Result<Option<Tensor<F>>> {
    if parts.iter().all(Option::is_none) {
        return Ok(None);
    }
    let batch = broadcast_all(parts.iter().flatten().map(Tensor::batch_sizes))?;
    let filled = parts
        .into_iter()
        .enumerate()
        .map(|(i, p)| match p {
            Some(t) => t.batch_expand(&batch),
            None => Ok(Tensor::zeros(&batch, &[], &zero_base(i))),
        })
        .collect::<Result<Vec<_>>>()?;
    Tensor::base_cat(&filled, axis).map(Some)
}

/// Packs a [`ValueMap`] laid out on one [`LabeledAxis`] into a vector `(batch; n)`.
#[derive(Debug, Clone, Copy)]
pub struct VectorAssembler<'a> {
    axis: &'a LabeledAxis,
}

impl<'a> VectorAssembler<'a> {
    pub fn new(axis: &'a LabeledAxis) -> Self {
        VectorAssembler { axis }
    }

    pub fn axis(&self) -> &'a LabeledAxis {
        self.axis
    }

    /// Assemble present variables; absent ones are zero.
    ///
    /// Fails with [`Error::EmptyAssembly`] when no variable of the axis is present.
    pub fn assemble_by_variable<F: Float>(&self, values: &ValueMap<F>) -> Result<Tensor<F>> {
        let vars: Vec<&VariableLayout> = self.axis.variables().collect();
        let mut parts = Vec::with_capacity(vars.len());
        for v in &vars {
            let part = match values.get(v.name()) {
                Some(t) => {
                    check_entry(v.name(), t, &[v.storage_size()])?;
                    Some(t.clone())
                }
                None => None,
            };
            parts.push(part);
        }
        fill_and_cat(parts, |i| vec![vars[i].storage_size()], 0)?.ok_or(Error::EmptyAssembly)
    }

    /// Slice an assembled vector back into per-variable tensors.
    pub fn split_by_variable<F: Float>(&self, t: &Tensor<F>) -> Result<ValueMap<F>> {
        check_entry(&VariableName::from("<assembled>"), t, &[self.axis.size()])?;
        let parts = t.base_split(&self.axis.storage_sizes(), 0)?;
        Ok(self.axis.variable_names().into_iter().zip(parts).collect())
    }

    /// Slice an assembled vector into its direct sub-axes.
    pub fn split_by_subaxis<F: Float>(&self, t: &Tensor<F>) -> Result<ValueMap<F>> {
        check_entry(&VariableName::from("<assembled>"), t, &[self.axis.size()])?;
        self.axis
            .subaxis_names()
            .map(|name| {
                let r = self.axis.subaxis_range(name)?;
                Ok((self.axis.qualify(name), t.base_narrow(0, r.start, r.end)?))
            })
            .collect()
    }
}

/// Packs a [`DerivMap`] over a (row, column) pair of axes into a matrix `(batch; n, m)`.
#[derive(Debug, Clone, Copy)]
pub struct MatrixAssembler<'a> {
    row_axis: &'a LabeledAxis,
    col_axis: &'a LabeledAxis,
}

impl<'a> MatrixAssembler<'a> {
    pub fn new(row_axis: &'a LabeledAxis, col_axis: &'a LabeledAxis) -> Self {
        MatrixAssembler { row_axis, col_axis }
    }

    pub fn row_axis(&self) -> &'a LabeledAxis {
        self.row_axis
    }

    pub fn col_axis(&self) -> &'a LabeledAxis {
        self.col_axis
    }

    /// Assemble present blocks row by row; absent blocks (and rows) are zero.
    pub fn assemble_by_variable<F: Float>(&self, values: &DerivMap<F>) -> Result<Tensor<F>> {
        let cols: Vec<&VariableLayout> = self.col_axis.variables().collect();
        let ncol = self.col_axis.size();
        let rows: Vec<&VariableLayout> = self.row_axis.variables().collect();
        let mut row_parts = Vec::with_capacity(rows.len());
        for r in &rows {
            let Some(row) = values.get(r.name()) else {
                row_parts.push(None);
                continue;
            };
            let mut parts = Vec::with_capacity(cols.len());
            for c in &cols {
                let part = match row.get(c.name()) {
                    Some(t) => {
                        check_entry(
                            &r.name().join(c.name()),
                            t,
                            &[r.storage_size(), c.storage_size()],
                        )?;
                        Some(t.clone())
                    }
                    None => None,
                };
                parts.push(part);
            }
            row_parts.push(fill_and_cat(
                parts,
                |j| vec![r.storage_size(), cols[j].storage_size()],
                1,
            )?);
        }
        fill_and_cat(row_parts, |i| vec![rows[i].storage_size(), ncol], 0)?
            .ok_or(Error::EmptyAssembly)
    }

    /// Slice an assembled matrix back into per-(row, column) blocks.
    pub fn split_by_variable<F: Float>(&self, t: &Tensor<F>) -> Result<DerivMap<F>> {
        check_entry(
            &VariableName::from("<assembled>"),
            t,
            &[self.row_axis.size(), self.col_axis.size()],
        )?;
        let col_names = self.col_axis.variable_names();
        let col_sizes = self.col_axis.storage_sizes();
        let rows = t.base_split(&self.row_axis.storage_sizes(), 0)?;
        self.row_axis
            .variable_names()
            .into_iter()
            .zip(rows)
            .map(|(name, row)| {
                let blocks = row.base_split(&col_sizes, 1)?;
                Ok((name, col_names.iter().cloned().zip(blocks).collect()))
            })
            .collect()
    }

    /// Slice an assembled matrix into (row sub-axis, column sub-axis) blocks.
    pub fn split_by_subaxis<F: Float>(&self, t: &Tensor<F>) -> Result<DerivMap<F>> {
        check_entry(
            &VariableName::from("<assembled>"),
            t,
            &[self.row_axis.size(), self.col_axis.size()],
        )?;
        let mut out = DerivMap::new();
        for rname in self.row_axis.subaxis_names() {
            let rr = self.row_axis.subaxis_range(rname)?;
            let row = t.base_narrow(0, rr.start, rr.end)?;
            let mut blocks = ValueMap::new();
            for cname in self.col_axis.subaxis_names() {
                let cr = self.col_axis.subaxis_range(cname)?;
                blocks.insert(
                    self.col_axis.qualify(cname),
                    row.base_narrow(1, cr.start, cr.end)?,
                );
            }
            out.insert(self.row_axis.qualify(rname), blocks);
        }
        Ok(out)
    }
}
