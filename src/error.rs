//! Error types for derivative bookkeeping and assembly.

use thiserror::Error;

use crate::shape::TensorShape;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Contract violations raised by tensors, derivatives and assemblers.
///
/// None of these are recoverable runtime conditions: they signal that a caller
/// handed over data whose shape disagrees with a declared layout.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// A tensor's base shape does not match the declared base shape.
    #[error("'{name}' has incompatible base shape: expected {expected:?}, got {actual:?}")]
    BaseShapeMismatch {
        name: String,
        expected: TensorShape,
        actual: TensorShape,
    },

    /// An intrinsic intermediate shape is neither equal nor broadcastable to the declared one.
    #[error(
        "intrinsic intermediate shape {actual:?} of '{name}' is not broadcastable to the declared \
         intrinsic intermediate shape {expected:?}"
    )]
    IntermediateShapeMismatch {
        name: String,
        expected: TensorShape,
        actual: TensorShape,
    },

    /// Two shapes cannot be broadcast together.
    #[error("shapes {lhs:?} and {rhs:?} are not broadcastable")]
    NotBroadcastable { lhs: TensorShape, rhs: TensorShape },

    /// A generic shape contract violation.
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// A derivative was declared with inconsistent intrinsic dimensions.
    #[error("invalid derivative '{name}': {reason}")]
    InvalidDerivative { name: String, reason: String },

    /// Assembly was requested from a dictionary with no known variable.
    #[error("no variable values found for assembly")]
    EmptyAssembly,

    /// A tensor handed to an assembler has the wrong storage size.
    #[error("invalid size for variable '{variable}' during assembly: expected {expected:?}, got {actual:?}")]
    AssemblySize {
        variable: String,
        expected: TensorShape,
        actual: TensorShape,
    },

    /// A variable or sub-axis lookup failed.
    #[error("unknown variable or sub-axis '{0}'")]
    UnknownVariable(String),

    /// A variable or sub-axis was declared twice.
    #[error("'{0}' is already declared on this axis")]
    DuplicateItem(String),

    /// A reachable path that has no implementation yet.
    #[error("not implemented: {0}")]
    NotImplemented(String),
}
