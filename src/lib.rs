//! Three-tier tensors, derivative bookkeeping and variable assembly.
//!
//! A [`Tensor`] splits its shape into batch, intermediate and base dims. A
//! [`Derivative`] records `∂y/∂(x₁..x_N)` together with how many intermediate
//! dims each participant owns, so that [`chain_rule`] can compose derivatives
//! whose intermediate dims are dense, diagonal or broadcast. The assemblers pack
//! dictionaries of named variables into flat vectors and matrices for solvers.

pub mod assembler;
pub mod assembly;
pub mod axis;
pub mod chain_rule;
pub mod derivative;
pub mod error;
pub mod float;
pub mod shape;
pub mod tensor;
pub mod variable;

pub use assembler::{DerivMap, MatrixAssembler, ValueMap, VectorAssembler};
pub use assembly::{from_assembly, to_assembly};
pub use axis::{AxisBuilder, LabeledAxis, VariableLayout, VariableName};
pub use chain_rule::{chain_rule, chain_rule_second_order, chain_rule_through_second};
pub use derivative::{derivative_name, Derivative, Participant};
pub use error::{Error, Result};
pub use float::Float;
pub use shape::TensorShape;
pub use tensor::{batched_matmul, Tensor};
pub use variable::Variable;

/// First derivative over `f64`.
pub type Derivative64 = Derivative<f64, 1>;
/// Second derivative over `f64`.
pub type SecondDerivative64 = Derivative<f64, 2>;
