//! Partial derivatives of one variable with respect to `N` arguments.
//!
//! A derivative tensor has shape `batch ⊕ extrinsic ⊕ intrinsic ⊕ base` where
//! the base is `base(y) ⊕ base(x₁) ⊕ … ⊕ base(x_N)`. The trailing
//! `intrsc_intmd_dim` intermediate dimensions are *intrinsic*: they belong to
//! the derivative itself. Every leading intermediate dimension is extrinsic and
//! treated elementwise.
//!
//! The intrinsic block takes one of two forms:
//!
//! - **dense**: it spans the intrinsic shapes of the variable and of every
//!   argument, `iis(y) ⊕ iis(x₁) ⊕ …`;
//! - **broadcast** (diagonal): it spans at most the variable's intrinsic shape,
//!   and the derivative is implicitly diagonal in the remaining intrinsic
//!   dimensions.

use std::fmt;

use crate::axis::VariableName;
use crate::error::{Error, Result};
use crate::float::Float;
use crate::shape::{add_shapes, is_expandable_to, TensorShape};
use crate::tensor::Tensor;

/// Human readable name: `d(y)/d(x)`, `d2(y)/d(x)d(z)`.
pub fn derivative_name<const N: usize>(var: &VariableName, args: &[VariableName; N]) -> String {
    let mut name = String::from("d");
    if N > 1 {
        name.push_str(&N.to_string());
    }
    name.push_str(&format!("({var})/"));
    for arg in args {
        name.push_str(&format!("d({arg})"));
    }
    name
}

/// Shape metadata of a variable or argument taking part in a derivative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    name: VariableName,
    intmd_sizes: TensorShape,
    intrsc_intmd_dim: usize,
    base_sizes: TensorShape,
}

impl Participant {
    pub fn new(
        name: impl Into<VariableName>,
        intmd_sizes: &[usize],
        intrsc_intmd_dim: usize,
        base_sizes: &[usize],
    ) -> Self {
        Participant {
            name: name.into(),
            intmd_sizes: intmd_sizes.to_vec(),
            intrsc_intmd_dim,
            base_sizes: base_sizes.to_vec(),
        }
    }

    /// A participant without intermediate dimensions.
    pub fn base(name: impl Into<VariableName>, base_sizes: &[usize]) -> Self {
        Self::new(name, &[], 0, base_sizes)
    }

    pub fn name(&self) -> &VariableName {
        &self.name
    }

    pub fn intmd_sizes(&self) -> &[usize] {
        &self.intmd_sizes
    }

    pub fn intrsc_intmd_dim(&self) -> usize {
        self.intrsc_intmd_dim
    }

    /// The trailing intrinsic part of the intermediate shape.
    pub fn intrsc_intmd_sizes(&self) -> &[usize] {
        let n = self.intmd_sizes.len();
        &self.intmd_sizes[n - self.intrsc_intmd_dim.min(n)..]
    }

    pub fn base_sizes(&self) -> &[usize] {
        &self.base_sizes
    }

    fn with_extra_intrsc(&self, k: usize) -> Self {
        Participant {
            intrsc_intmd_dim: self.intrsc_intmd_dim + k,
            ..self.clone()
        }
    }
}

/// Holder for `∂y/∂(x₁..x_N)` with intrinsic intermediate bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Derivative<F, const N: usize> {
    intrsc_intmd_dim: usize,
    var: Participant,
    args: [Participant; N],
    value: Option<Tensor<F>>,
}

impl<F: Float, const N: usize> Derivative<F, N> {
    /// Declare a derivative.
    ///
    /// `intrsc_intmd_dim` must either be at most the variable's intrinsic
    /// dimension (broadcast form) or equal the total over all participants
    /// (dense form).
    pub fn new(intrsc_intmd_dim: usize, var: Participant, args: [Participant; N]) -> Result<Self> {
        let arg_names = std::array::from_fn(|i| args[i].name.clone());
        let name = derivative_name::<N>(&var.name, &arg_names);
        for p in std::iter::once(&var).chain(args.iter()) {
            if p.intrsc_intmd_dim > p.intmd_sizes.len() {
                return Err(Error::InvalidDerivative {
                    name,
                    reason: format!(
                        "intrinsic intermediate dimension ({}) of '{}' is larger than its \
                         intermediate dimension ({})",
                        p.intrsc_intmd_dim,
                        p.name,
                        p.intmd_sizes.len()
                    ),
                });
            }
        }
        let total = var.intrsc_intmd_dim + args.iter().map(|a| a.intrsc_intmd_dim).sum::<usize>();
        if intrsc_intmd_dim > var.intrsc_intmd_dim && intrsc_intmd_dim != total {
            return Err(Error::InvalidDerivative {
                name,
                reason: format!(
                    "intrinsic intermediate dimension ({intrsc_intmd_dim}) should be at most the \
                     variable's ({}) or equal to the total over all participants ({total})",
                    var.intrsc_intmd_dim
                ),
            });
        }
        Ok(Derivative {
            intrsc_intmd_dim,
            var,
            args,
            value: None,
        })
    }

    pub fn name(&self) -> String {
        derivative_name::<N>(&self.var.name, &std::array::from_fn(|i| self.args[i].name.clone()))
    }

    pub fn var(&self) -> &Participant {
        &self.var
    }

    pub fn args(&self) -> &[Participant; N] {
        &self.args
    }

    pub fn defined(&self) -> bool {
        self.value.is_some()
    }

    pub fn clear(&mut self) {
        self.value = None;
    }

    /// The stored tensor; errors when undefined or non-finite.
    pub fn tensor(&self) -> Result<&Tensor<F>> {
        let t = self.value.as_ref().ok_or_else(|| Error::InvalidDerivative {
            name: self.name(),
            reason: "derivative is undefined".into(),
        })?;
        if t.data().iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidDerivative {
                name: self.name(),
                reason: "derivative has non-finite values".into(),
            });
        }
        Ok(t)
    }

    /// The stored tensor, if any, without validation.
    pub fn value(&self) -> Option<&Tensor<F>> {
        self.value.as_ref()
    }

    pub fn intrsc_intmd_dim(&self) -> usize {
        self.intrsc_intmd_dim
    }

    /// Sum of the intrinsic dimensions of all participants.
    pub fn total_intrsc_intmd_dim(&self) -> usize {
        self.var.intrsc_intmd_dim + self.args.iter().map(|a| a.intrsc_intmd_dim).sum::<usize>()
    }

    /// Whether the intrinsic block is stored in broadcast (diagonal) form.
    pub fn is_intrsc_intmd_broadcast(&self) -> bool {
        self.intrsc_intmd_dim < self.total_intrsc_intmd_dim()
    }

    /// `base(y) ⊕ base(x₁) ⊕ …`.
    pub fn base_sizes(&self) -> TensorShape {
        let mut shape = self.var.base_sizes.clone();
        for a in &self.args {
            shape.extend_from_slice(&a.base_sizes);
        }
        shape
    }

    pub fn base_dim(&self) -> usize {
        self.base_sizes().len()
    }

    /// Intermediate shape of the stored tensor.
    pub fn intmd_sizes(&self) -> Option<&[usize]> {
        self.value.as_ref().map(Tensor::intmd_sizes)
    }

    /// Trailing intrinsic part of the stored intermediate shape.
    pub fn intrsc_intmd_sizes(&self) -> Option<&[usize]> {
        self.intmd_sizes().map(|s| &s[s.len() - self.intrsc_intmd_dim.min(s.len())..])
    }

    /// Dense intrinsic shape `iis(y) ⊕ iis(x₁) ⊕ …`.
    fn total_intrsc_intmd_sizes(&self) -> TensorShape {
        let mut shape = self.var.intrsc_intmd_sizes().to_vec();
        for a in &self.args {
            shape.extend_from_slice(a.intrsc_intmd_sizes());
        }
        shape
    }

    /// Replace the stored value.
    pub fn assign(&mut self, tensor: Tensor<F>) -> Result<&mut Self> {
        self.check_base(&tensor)?;
        self.value = Some(self.try_intmd_expand(tensor)?);
        Ok(self)
    }

    /// Add a contribution to the stored value (or assign when undefined).
    pub fn accumulate(&mut self, tensor: &Tensor<F>) -> Result<&mut Self> {
        self.check_base(tensor)?;
        let expanded = self.try_intmd_expand(tensor.clone())?;
        self.value = Some(match self.value.take() {
            Some(existing) => existing.add(&expanded)?,
            None => expanded,
        });
        Ok(self)
    }

    /// Accumulate another derivative of the same quantity.
    pub fn accumulate_derivative(&mut self, other: &Derivative<F, N>) -> Result<&mut Self> {
        if self.defined() && self.intrsc_intmd_dim != other.intrsc_intmd_dim {
            return Err(Error::InvalidDerivative {
                name: self.name(),
                reason: format!(
                    "cannot accumulate a derivative with intrinsic intermediate dimension {} \
                     into one with {}",
                    other.intrsc_intmd_dim, self.intrsc_intmd_dim
                ),
            });
        }
        self.intrsc_intmd_dim = other.intrsc_intmd_dim;
        let t = other.tensor()?.clone();
        self.accumulate(&t)
    }

    fn check_base(&self, tensor: &Tensor<F>) -> Result<()> {
        let expected = self.base_sizes();
        if tensor.base_sizes() != expected.as_slice() {
            return Err(Error::BaseShapeMismatch {
                name: self.name(),
                expected,
                actual: tensor.base_sizes().to_vec(),
            });
        }
        Ok(())
    }

    /// Validate the intrinsic block, expanding a broadcast block to the
    /// variable's intrinsic shape.
    fn try_intmd_expand(&self, tensor: Tensor<F>) -> Result<Tensor<F>> {
        let m = self.intrsc_intmd_dim;
        let t = if tensor.intmd_dim() < m {
            tensor.intmd_unsqueeze(tensor.intmd_dim(), m - tensor.intmd_dim())?
        } else {
            tensor
        };
        let n = t.intmd_dim();
        let block = &t.intmd_sizes()[n - m..];
        if block == self.total_intrsc_intmd_sizes().as_slice() {
            return Ok(t);
        }

        let var_iis = self.var.intrsc_intmd_sizes();
        if !is_expandable_to(block, var_iis) {
            return Err(Error::IntermediateShapeMismatch {
                name: self.name(),
                expected: var_iis.to_vec(),
                actual: block.to_vec(),
            });
        }
        let target = add_shapes(&[&t.intmd_sizes()[..n - m], var_iis]);
        t.intmd_unsqueeze(n - m, var_iis.len() - m)?
            .intmd_expand(&target)
    }
}

impl<F: Float> Derivative<F, 1> {
    /// Promote `k` trailing extrinsic intermediate dimensions to intrinsic
    /// dimensions of both the variable and the argument.
    ///
    /// The stored intrinsic block must equal the variable's intrinsic shape.
    pub fn reinterpret(&self, k: usize) -> Result<Self> {
        let t = self.tensor()?;
        let block = self.intrsc_intmd_sizes().unwrap_or(&[]);
        if block != self.var.intrsc_intmd_sizes() {
            return Err(Error::InvalidDerivative {
                name: self.name(),
                reason: format!(
                    "reinterpretation requires the intrinsic intermediate shape {block:?} to match \
                     the variable's intrinsic intermediate shape {:?}",
                    self.var.intrsc_intmd_sizes()
                ),
            });
        }
        let mut out = Derivative::new(
            self.intrsc_intmd_dim + k,
            self.var.with_extra_intrsc(k),
            [self.args[0].with_extra_intrsc(k)],
        )
        .map_err(|e| Error::InvalidDerivative {
            name: self.name(),
            reason: format!("cannot add {k} intrinsic intermediate dimensions: {e}"),
        })?;
        out.assign(t.clone())?;
        Ok(out)
    }

    /// Materialize a broadcast (diagonal) derivative as a dense one.
    ///
    /// The result has intermediate shape `extrinsic ⊕ iis(y) ⊕ iis(x)`. Dense
    /// derivatives are returned unchanged.
    pub fn fullify(&self) -> Result<Tensor<F>> {
        let t = self.tensor()?;
        if !self.is_intrsc_intmd_broadcast() {
            return Ok(t.clone());
        }
        let vis = self.var.intrsc_intmd_sizes();
        let ais = self.args[0].intrsc_intmd_sizes();
        if vis != ais {
            return Err(Error::NotImplemented(format!(
                "fullify of '{}' with variable intrinsic shape {vis:?} and argument intrinsic \
                 shape {ais:?}",
                self.name()
            )));
        }
        // after assignment the trailing block of a broadcast derivative spans iis(y)
        t.intmd_diagonalize(vis.len())
    }
}

impl<F: Float> Derivative<F, 2> {
    /// Second derivatives cannot be reinterpreted.
    pub fn reinterpret(&self, _k: usize) -> Result<Self> {
        Err(Error::NotImplemented(format!(
            "reinterpretation of second derivative '{}'",
            self.name()
        )))
    }
}

impl<F: Float, const N: usize> fmt::Display for Derivative<F, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}
