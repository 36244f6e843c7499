//! Shape utilities shared by tensors, derivatives and assemblers.

use crate::error::{Error, Result};

/// A tensor shape (or one tier of it).
pub type TensorShape = Vec<usize>;

/// Number of elements described by a shape. The empty shape is a scalar.
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Concatenate several shapes into one.
pub fn add_shapes(shapes: &[&[usize]]) -> TensorShape {
    shapes.iter().flat_map(|s| s.iter().copied()).collect()
}

/// Right-aligned broadcast of two shapes, numpy style.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<TensorShape> {
    let n = a.len().max(b.len());
    let mut out = vec![1; n];
    for i in 0..n {
        let da = if i < n - a.len() { 1 } else { a[i - (n - a.len())] };
        let db = if i < n - b.len() { 1 } else { b[i - (n - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(Error::NotBroadcastable {
                    lhs: a.to_vec(),
                    rhs: b.to_vec(),
                })
            }
        };
    }
    Ok(out)
}

/// Broadcast any number of shapes together.
pub fn broadcast_all<'a>(shapes: impl IntoIterator<Item = &'a [usize]>) -> Result<TensorShape> {
    let mut out = TensorShape::new();
    for s in shapes {
        out = broadcast_shapes(&out, s)?;
    }
    Ok(out)
}

/// Whether `shape` can be expanded (without adding dimensions on the right) to `target`.
///
/// `shape` may have fewer dimensions than `target`; it is aligned on the right
/// and every dimension must either match or be 1.
pub fn is_expandable_to(shape: &[usize], target: &[usize]) -> bool {
    if shape.len() > target.len() {
        return false;
    }
    let offset = target.len() - shape.len();
    shape
        .iter()
        .enumerate()
        .all(|(i, &s)| s == target[offset + i] || s == 1)
}
