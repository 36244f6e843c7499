//! Newton-family nonlinear solvers and implicit updates over [`strata`] tensors.
//!
//! Systems are solved in assembly form: the unknowns of every batch entry are
//! a flat vector `(batch; n)` and the Jacobian a matrix `(batch; n, n)`. Batch
//! entries are independent; a solve stops once all of them have converged.

pub mod convergence;
pub mod error;
pub mod implicit;
pub mod linalg;
pub mod model;
pub mod result;
pub mod solvers;
pub mod system;

#[cfg(test)]
mod testing;

pub use convergence::Tolerances;
pub use error::{Result, SolveError};
pub use implicit::{ImplicitUpdate, ImplicitUpdateConfig};
pub use linalg::{DenseLu, LinearSolver};
pub use model::{Model, ModelNonlinearSystem, ModelOutput};
pub use result::{RetCode, SolveResult};
pub use solvers::line_search::{LineSearchConfig, LineSearchKind, NewtonWithLineSearch};
pub use solvers::newton::{Newton, NewtonConfig};
pub use solvers::trust_region::{NewtonWithTrustRegion, TrustRegionConfig, TrustRegionSubproblem};
pub use solvers::{newton_step, NewtonIteration, NonlinearSolver};
pub use system::NonlinearSystem;
