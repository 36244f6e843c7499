//! Named quantities with their value and derivatives.

use std::collections::BTreeMap;

use crate::assembler::ValueMap;
use crate::assembly::{from_assembly, to_assembly};
use crate::axis::VariableName;
use crate::derivative::{Derivative, Participant};
use crate::error::{Error, Result};
use crate::float::Float;
use crate::shape::{is_expandable_to, numel, TensorShape};
use crate::tensor::Tensor;

/// A named tensor quantity declared on a [`LabeledAxis`](crate::LabeledAxis).
///
/// Holds the current value, first derivatives keyed by argument and second
/// derivatives keyed by argument pair. Everything is cleared between
/// evaluations with [`Variable::clear`].
#[derive(Debug, Clone)]
pub struct Variable<F> {
    name: VariableName,
    intmd_sizes: TensorShape,
    intrsc_intmd_dim: usize,
    base_sizes: TensorShape,
    value: Option<Tensor<F>>,
    derivs: BTreeMap<VariableName, Derivative<F, 1>>,
    sec_derivs: BTreeMap<(VariableName, VariableName), Derivative<F, 2>>,
}

impl<F: Float> Variable<F> {
    pub fn new(
        name: impl Into<VariableName>,
        intmd_sizes: &[usize],
        intrsc_intmd_dim: usize,
        base_sizes: &[usize],
    ) -> Self {
        Variable {
            name: name.into(),
            intmd_sizes: intmd_sizes.to_vec(),
            intrsc_intmd_dim,
            base_sizes: base_sizes.to_vec(),
            value: None,
            derivs: BTreeMap::new(),
            sec_derivs: BTreeMap::new(),
        }
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

    pub fn base_sizes(&self) -> &[usize] {
        &self.base_sizes
    }

    /// Number of scalars in assembly form.
    pub fn storage_size(&self) -> usize {
        numel(&self.intmd_sizes) * numel(&self.base_sizes)
    }

    /// Shape metadata used when this variable takes part in a derivative.
    pub fn participant(&self) -> Participant {
        Participant::new(
            self.name.clone(),
            &self.intmd_sizes,
            self.intrsc_intmd_dim,
            &self.base_sizes,
        )
    }

    pub fn value(&self) -> Option<&Tensor<F>> {
        self.value.as_ref()
    }

    /// Set the value; the base shape must match and the intermediate shape
    /// must be expandable to the declared one.
    pub fn set_value(&mut self, value: Tensor<F>) -> Result<()> {
        if value.base_sizes() != self.base_sizes.as_slice() {
            return Err(Error::BaseShapeMismatch {
                name: self.name.to_string(),
                expected: self.base_sizes.clone(),
                actual: value.base_sizes().to_vec(),
            });
        }
        if !is_expandable_to(value.intmd_sizes(), &self.intmd_sizes) {
            return Err(Error::IntermediateShapeMismatch {
                name: self.name.to_string(),
                expected: self.intmd_sizes.clone(),
                actual: value.intmd_sizes().to_vec(),
            });
        }
        self.value = Some(value);
        Ok(())
    }

    /// Set the value from assembly form `(batch; storage_size)`.
    pub fn set_assembled_value(&mut self, value: &Tensor<F>) -> Result<()> {
        let v = from_assembly(value, &[&self.intmd_sizes], &[&self.base_sizes])?;
        self.set_value(v)
    }

    /// The value in assembly form `(batch; storage_size)`.
    pub fn assembled_value(&self) -> Result<Tensor<F>> {
        let v = self
            .value
            .as_ref()
            .ok_or_else(|| Error::UnknownVariable(format!("value of '{}'", self.name)))?;
        to_assembly(
            &v.intmd_expand(&self.intmd_sizes)?,
            &[&self.intmd_sizes],
            &[&self.base_sizes],
        )
    }

    /// Declare `d(self)/d(arg)` with an explicit intrinsic intermediate dimension.
    ///
    /// Redeclaring an existing derivative replaces it.
    pub fn declare_derivative(
        &mut self,
        arg: &Variable<F>,
        intrsc_intmd_dim: usize,
    ) -> Result<&mut Derivative<F, 1>> {
        let d = Derivative::new(intrsc_intmd_dim, self.participant(), [arg.participant()])?;
        self.derivs.insert(arg.name.clone(), d);
        self.derivative_mut(&arg.name)
    }

    /// `d(self)/d(arg)`, declared in dense form on first use.
    pub fn d(&mut self, arg: &Variable<F>) -> Result<&mut Derivative<F, 1>> {
        if !self.derivs.contains_key(&arg.name) {
            let dense = self.intrsc_intmd_dim + arg.intrsc_intmd_dim;
            return self.declare_derivative(arg, dense);
        }
        self.derivative_mut(&arg.name)
    }

    /// `d²(self)/d(a)d(b)`, declared on first use.
    pub fn d2(&mut self, a: &Variable<F>, b: &Variable<F>) -> Result<&mut Derivative<F, 2>> {
        let key = (a.name.clone(), b.name.clone());
        if !self.sec_derivs.contains_key(&key) {
            let d = Derivative::new(0, self.participant(), [a.participant(), b.participant()])?;
            self.sec_derivs.insert(key.clone(), d);
        }
        self.sec_derivs
            .get_mut(&key)
            .ok_or_else(|| Error::UnknownVariable(format!("d2({})/d({})d({})", self.name, key.0, key.1)))
    }

    pub fn derivative(&self, arg: &VariableName) -> Option<&Derivative<F, 1>> {
        self.derivs.get(arg)
    }

    fn derivative_mut(&mut self, arg: &VariableName) -> Result<&mut Derivative<F, 1>> {
        let name = self.name.clone();
        self.derivs
            .get_mut(arg)
            .ok_or_else(|| Error::UnknownVariable(format!("d({name})/d({arg})")))
    }

    pub fn second_derivative(
        &self,
        a: &VariableName,
        b: &VariableName,
    ) -> Option<&Derivative<F, 2>> {
        self.sec_derivs.get(&(a.clone(), b.clone()))
    }

    /// Declared first derivatives keyed by argument.
    pub fn derivatives(&self) -> impl Iterator<Item = (&VariableName, &Derivative<F, 1>)> {
        self.derivs.iter()
    }

    /// Defined first derivatives in assembly form `(batch; storage(self), storage(arg))`.
    pub fn assembled_derivatives(&self) -> Result<ValueMap<F>> {
        let mut out = ValueMap::new();
        for (arg, d) in self.derivs.iter().filter(|(_, d)| d.defined()) {
            let x = &d.args()[0];
            let full = d.fullify()?;
            let t = to_assembly(
                &full,
                &[&self.intmd_sizes, x.intmd_sizes()],
                &[&self.base_sizes, x.base_sizes()],
            )?;
            out.insert(arg.clone(), t);
        }
        Ok(out)
    }

    /// Drop the value and every derivative value, keeping declarations.
    pub fn clear(&mut self) {
        self.value = None;
        self.derivs.values_mut().for_each(Derivative::clear);
        self.sec_derivs.values_mut().for_each(Derivative::clear);
    }
}
