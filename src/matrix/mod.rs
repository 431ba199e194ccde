//! Sparse Jacobian assembly.
//!
//! The model hands over four rectangular blocks of the Jacobian. [copy_block] places a
//! block into the square system matrix, and [JacobianAssembly] owns that matrix together
//! with the scratch space needed to rebuild it on every linear-solver setup.

mod assembly;
mod block;

pub use assembly::JacobianAssembly;
pub use block::copy_block;
