//! Errors raised by the nonlinear solvers and implicit updates.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SolveError>;

/// Failures of a solve or an implicit update.
///
/// Hitting the iteration limit is not an error for the solvers themselves
/// (see [`RetCode::MaxIter`](crate::RetCode::MaxIter)); only
/// [`ImplicitUpdate`](crate::ImplicitUpdate) turns it into
/// [`SolveError::NotConverged`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolveError {
    /// A shape or layout contract was violated by the system or model.
    #[error(transparent)]
    Tensor(#[from] strata::Error),

    /// A linear system could not be factorised.
    #[error("singular matrix in batch entry {batch_index}")]
    SingularMatrix { batch_index: usize },

    /// The nonlinear solve stopped without meeting the tolerances.
    #[error("nonlinear solve did not converge after {iterations} iterations")]
    NotConverged { iterations: usize },

    /// A configuration value is out of range.
    #[error("invalid solver configuration: {0}")]
    InvalidConfig(String),

    /// An input the update depends on was not provided.
    #[error("missing input '{0}'")]
    MissingInput(String),
}
