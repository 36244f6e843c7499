use std::fmt::{Debug, Display};

use ndarray::ScalarOperand;
use num_traits::{Float as NumFloat, FloatConst, FromPrimitive};

/// Marker trait for the element type of a [`Tensor`](crate::Tensor) (`f32`, `f64`).
///
/// Bundles the numeric traits needed by derivative bookkeeping and the
/// solvers, plus [`ScalarOperand`] so tensors can be scaled by a plain float.
pub trait Float:
    NumFloat
    + FloatConst
    + FromPrimitive
    + ScalarOperand
    + Copy
    + Send
    + Sync
    + Default
    + Debug
    + Display
    + 'static
{
    /// Convert an `f64` constant into this type.
    ///
    /// Every literal used by the library is representable in `f32`, so this
    /// never fails for the two implementors.
    fn lit(v: f64) -> Self {
        Self::from_f64(v).unwrap_or_else(Self::nan)
    }
}

impl Float for f32 {}
impl Float for f64 {}
