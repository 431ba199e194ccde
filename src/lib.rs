//! An implicit variable-order BDF integrator for semi-explicit index-1 DAEs
//!
//! ```text
//! xdot = f_ode(t, x, z, p, u)
//!    0 = f_alg(t, x, z, p, u)
//!    q = integral of f_quad(t, x, z, p, u)
//! ```
//!
//! with forward sensitivities carried as extra directions of the state and a checkpointed
//! adjoint (backward) pass. A problem is described by a [dae::DaeModel] and a [DaeConfig],
//! validated once by [DaeIntegrator::new]. Each [IntegratorMemory] created from it holds
//! the mutable state of one integration and is driven with
//! [IntegratorMemory::reset]/[IntegratorMemory::advance] forward and
//! [IntegratorMemory::reset_backward]/[IntegratorMemory::retreat] backward.
//!
//! The Newton systems are solved either directly, with a dense or sparse LU of the
//! assembled Jacobian, or with one of the Krylov methods in [linear_solver::krylov]
//! right-preconditioned by the factorised nominal block of the Jacobian.

pub mod dae;
pub mod dae_solver;
pub mod error;
pub mod linear_solver;
pub mod matrix;
pub mod nonlinear_solver;

pub use dae::{BackwardArgs, DaeArgs, DaeModel, Dimensions, JacobianBlocks, JacobianPattern};
pub use dae_solver::{
    AdvanceOutput, DaeConfig, DaeIntegrator, IntegratorMemory, IntegratorStatistics,
    PersistedRecord, RetreatOutput,
};
pub use error::{CallbackError, DaeError};
