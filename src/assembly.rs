//! Conversion between tiered tensors and the flat "assembly" form.
//!
//! A tensor of shape `(batch; I₁ ⊕ … ⊕ I_N; B₁ ⊕ … ⊕ B_N)` is in *tiered*
//! form. Its assembly form has no intermediate dimensions and base shape
//! `(|I₁|·|B₁|, …, |I_N|·|B_N|)`, with each group's intermediate dims folded
//! into the front of its base dims. Assemblers only ever see assembly form.

use crate::error::{Error, Result};
use crate::float::Float;
use crate::shape::{add_shapes, is_expandable_to, numel, TensorShape};
use crate::tensor::Tensor;

fn assembly_sizes(intmd_groups: &[&[usize]], base_groups: &[&[usize]]) -> TensorShape {
    intmd_groups
        .iter()
        .zip(base_groups)
        .map(|(i, b)| numel(i) * numel(b))
        .collect()
}

/// Expand a tensor whose intermediate shape only covers the first group.
///
/// With two groups the result is diagonal in the two intermediate blocks when
/// they have equal shapes.
fn diagonalize_if_needed<F: Float>(t: &Tensor<F>, intmd_groups: &[&[usize]]) -> Result<Tensor<F>> {
    let expected = add_shapes(intmd_groups);
    if t.intmd_sizes() == expected.as_slice() {
        return Ok(t.clone());
    }
    let first = intmd_groups[0];
    if !is_expandable_to(t.intmd_sizes(), first) {
        return Err(Error::IntermediateShapeMismatch {
            name: "assembly".into(),
            expected,
            actual: t.intmd_sizes().to_vec(),
        });
    }
    let expanded = t.intmd_expand(first)?;
    match intmd_groups {
        [_] => Ok(expanded),
        [_, second] if numel(second) == 1 => {
            expanded.reshape_tiers(&t.batch_sizes().to_vec(), &expected, t.base_sizes())
        }
        [_, second] if *second == first => expanded.intmd_diagonalize(first.len()),
        _ => Err(Error::NotImplemented(format!(
            "assembly of intermediate shape {:?} into groups {intmd_groups:?}",
            t.intmd_sizes()
        ))),
    }
}

/// Fold each group's intermediate dims into its base dims.
pub fn to_assembly<F: Float>(
    t: &Tensor<F>,
    intmd_groups: &[&[usize]],
    base_groups: &[&[usize]],
) -> Result<Tensor<F>> {
    if intmd_groups.is_empty() || intmd_groups.len() != base_groups.len() {
        return Err(Error::InvalidShape(format!(
            "assembly needs matching, non-empty intermediate and base groups, got {} and {}",
            intmd_groups.len(),
            base_groups.len()
        )));
    }
    let expected_base = add_shapes(base_groups);
    if t.base_sizes() != expected_base.as_slice() {
        return Err(Error::InvalidShape(format!(
            "incompatible base shape for assembly: expected {expected_base:?}, got {:?}",
            t.base_sizes()
        )));
    }
    let expanded = diagonalize_if_needed(t, intmd_groups)?;

    // (batch; I1, I2; B1, B2) -> (batch; I1, B1, I2, B2)
    let nb = expanded.batch_dim();
    let mut perm: Vec<usize> = (0..nb).collect();
    let mut intmd_at = nb;
    let mut base_at = nb + expanded.intmd_dim();
    for (i, b) in intmd_groups.iter().zip(base_groups) {
        perm.extend(intmd_at..intmd_at + i.len());
        perm.extend(base_at..base_at + b.len());
        intmd_at += i.len();
        base_at += b.len();
    }
    expanded
        .permute(&perm, nb, 0)?
        .base_reshape(&assembly_sizes(intmd_groups, base_groups))
}

/// Inverse of [`to_assembly`].
pub fn from_assembly<F: Float>(
    t: &Tensor<F>,
    intmd_groups: &[&[usize]],
    base_groups: &[&[usize]],
) -> Result<Tensor<F>> {
    let sizes = assembly_sizes(intmd_groups, base_groups);
    if t.intmd_dim() != 0 || t.base_sizes() != sizes.as_slice() {
        return Err(Error::InvalidShape(format!(
            "tensor of shape {:?} (intermediate dimension {}) is not in assembly form {sizes:?}",
            t.shape(),
            t.intmd_dim()
        )));
    }
    let unflattened: TensorShape = intmd_groups
        .iter()
        .zip(base_groups)
        .flat_map(|(i, b)| i.iter().chain(b.iter()).copied())
        .collect();
    let unfl = t.base_reshape(&unflattened)?;

    // (batch; I1, B1, I2, B2) -> (batch; I1, I2; B1, B2)
    let nb = unfl.batch_dim();
    let mut intmd_perm = Vec::new();
    let mut base_perm = Vec::new();
    let mut at = nb;
    for (i, b) in intmd_groups.iter().zip(base_groups) {
        intmd_perm.extend(at..at + i.len());
        at += i.len();
        base_perm.extend(at..at + b.len());
        at += b.len();
    }
    let intmd_dim = intmd_perm.len();
    let perm: Vec<usize> = (0..nb).chain(intmd_perm).chain(base_perm).collect();
    unfl.permute(&perm, nb, intmd_dim)
}
