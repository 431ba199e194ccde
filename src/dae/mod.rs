//! The model contract consumed by the integrator.
//!
//! A [DaeModel] supplies the callbacks of a semi-explicit index-1 DAE
//!
//! ```text
//! dx/dt = ode(t, x, z, p, u)
//!     0 = alg(t, x, z, p, u)
//! ```
//!
//! plus, optionally, the backward (adjoint) problem that is integrated from the end
//! of the horizon towards its start
//!
//! ```text
//! -drx/dt = rode(t, x, z, rx, rz, p, u, rp)
//!       0 = ralg(t, x, z, rx, rz, p, u, rp)
//! ```
//!
//! When forward sensitivities are requested (`nfwd > 0`), `x` and `z` hold `1 + nfwd`
//! blocks each, stored direction-major: the first `nx / (1 + nfwd)` entries of `x` are
//! the undifferentiated states, followed by the tangent of each direction. The same
//! layout applies to `rx` and `rz`. Jacobian blocks only describe the undifferentiated
//! problem, the Jacobian-vector products act on the full augmented state.

use nalgebra::{DVector, DVectorView};
use nalgebra_sparse::{pattern::SparsityPattern, CscMatrix};

use crate::error::{CallbackError, ConfigError, DaeError, MatrixError};

mod callback;

pub mod test_models;

pub use callback::guard;

/// Sizes of every vector crossing the callback boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dimensions {
    /// differential states (all sensitivity directions included)
    pub nx: usize,
    /// algebraic states (all sensitivity directions included)
    pub nz: usize,
    pub nu: usize,
    pub np: usize,
    pub nq: usize,
    pub nrx: usize,
    pub nrz: usize,
    pub nrp: usize,
    pub nrq: usize,
    /// adjoint quadratures with respect to the controls
    pub nuq: usize,
    pub nfwd: usize,
}

impl Dimensions {
    pub fn ndir(&self) -> usize {
        1 + self.nfwd
    }
    pub fn nx1(&self) -> usize {
        self.nx / self.ndir()
    }
    pub fn nz1(&self) -> usize {
        self.nz / self.ndir()
    }
    pub fn nrx1(&self) -> usize {
        self.nrx / self.ndir()
    }
    pub fn nrz1(&self) -> usize {
        self.nrz / self.ndir()
    }
    pub fn nxz(&self) -> usize {
        self.nx + self.nz
    }
    pub fn nrxz(&self) -> usize {
        self.nrx + self.nrz
    }
    pub fn has_backward(&self) -> bool {
        self.nrx + self.nrz > 0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ndir = self.ndir();
        for (name, n) in [
            ("nx", self.nx),
            ("nz", self.nz),
            ("nrx", self.nrx),
            ("nrz", self.nrz),
        ] {
            if n % ndir != 0 {
                return Err(ConfigError::InvalidValue {
                    name,
                    reason: format!("{n} is not a multiple of 1 + nfwd = {ndir}"),
                });
            }
        }
        if !self.has_backward() && (self.nrp + self.nrq + self.nuq) > 0 {
            return Err(ConfigError::InvalidValue {
                name: "nrq",
                reason: "backward quadratures or parameters without backward states".to_string(),
            });
        }
        Ok(())
    }
}

/// Arguments of a forward callback.
#[derive(Debug, Clone, Copy)]
pub struct DaeArgs<'a> {
    pub t: f64,
    pub x: DVectorView<'a, f64>,
    pub z: DVectorView<'a, f64>,
    pub p: &'a DVector<f64>,
    pub u: &'a DVector<f64>,
}

/// Arguments of a backward callback: the forward point plus the adjoint state.
#[derive(Debug, Clone, Copy)]
pub struct BackwardArgs<'a> {
    pub fwd: DaeArgs<'a>,
    pub rx: DVectorView<'a, f64>,
    pub rz: DVectorView<'a, f64>,
    pub rp: &'a DVector<f64>,
}

/// Sparsity of the four Jacobian blocks of the undifferentiated problem.
///
/// For the forward problem these are `d ode/dx`, `d alg/dx`, `d ode/dz` and `d alg/dz`.
/// The backward problem uses the same structure with `rode`, `ralg`, `rx` and `rz`.
#[derive(Debug, Clone, PartialEq)]
pub struct JacobianPattern {
    pub ode_x: SparsityPattern,
    pub alg_x: SparsityPattern,
    pub ode_z: SparsityPattern,
    pub alg_z: SparsityPattern,
}

impl JacobianPattern {
    /// Build a pattern from compressed-column parts `(col_offsets, row_indices)` of each block.
    pub fn from_csc_parts(
        n_diff: usize,
        n_alg: usize,
        ode_x: (Vec<usize>, Vec<usize>),
        alg_x: (Vec<usize>, Vec<usize>),
        ode_z: (Vec<usize>, Vec<usize>),
        alg_z: (Vec<usize>, Vec<usize>),
    ) -> Result<Self, DaeError> {
        let pattern = |ncols: usize, nrows: usize, (offsets, indices): (Vec<usize>, Vec<usize>)| {
            SparsityPattern::try_from_offsets_and_indices(ncols, nrows, offsets, indices)
                .map_err(|e| DaeError::from(MatrixError::Other(e.to_string())))
        };
        Ok(Self {
            ode_x: pattern(n_diff, n_diff, ode_x)?,
            alg_x: pattern(n_diff, n_alg, alg_x)?,
            ode_z: pattern(n_alg, n_diff, ode_z)?,
            alg_z: pattern(n_alg, n_alg, alg_z)?,
        })
    }

    /// Fully dense blocks.
    pub fn dense(n_diff: usize, n_alg: usize) -> Self {
        let dense = |ncols: usize, nrows: usize| {
            let offsets = (0..=ncols).map(|j| j * nrows).collect();
            let indices = (0..ncols).flat_map(|_| 0..nrows).collect();
            SparsityPattern::try_from_offsets_and_indices(ncols, nrows, offsets, indices)
                .unwrap_or_else(|_| SparsityPattern::zeros(ncols, nrows))
        };
        Self {
            ode_x: dense(n_diff, n_diff),
            alg_x: dense(n_diff, n_alg),
            ode_z: dense(n_alg, n_diff),
            alg_z: dense(n_alg, n_alg),
        }
    }

    pub fn empty() -> Self {
        Self::dense(0, 0)
    }

    /// number of differential rows/columns
    pub fn n_diff(&self) -> usize {
        self.ode_x.major_dim()
    }

    /// number of algebraic rows/columns
    pub fn n_alg(&self) -> usize {
        self.alg_z.major_dim()
    }

    pub(crate) fn check_shape(&self, n_diff: usize, n_alg: usize) -> Result<(), ConfigError> {
        // (ncols, nrows) as stored by a compressed-column pattern
        let expected = [
            ("jacobian ode_x", &self.ode_x, n_diff, n_diff),
            ("jacobian alg_x", &self.alg_x, n_diff, n_alg),
            ("jacobian ode_z", &self.ode_z, n_alg, n_diff),
            ("jacobian alg_z", &self.alg_z, n_alg, n_alg),
        ];
        for (name, pattern, ncols, nrows) in expected {
            if pattern.major_dim() != ncols {
                return Err(ConfigError::DimensionMismatch {
                    name,
                    expected: ncols,
                    found: pattern.major_dim(),
                });
            }
            if pattern.minor_dim() != nrows {
                return Err(ConfigError::DimensionMismatch {
                    name,
                    expected: nrows,
                    found: pattern.minor_dim(),
                });
            }
        }
        Ok(())
    }
}

/// Numeric values of the four Jacobian blocks, laid out on a fixed [JacobianPattern].
#[derive(Debug, Clone)]
pub struct JacobianBlocks {
    pub ode_x: CscMatrix<f64>,
    pub alg_x: CscMatrix<f64>,
    pub ode_z: CscMatrix<f64>,
    pub alg_z: CscMatrix<f64>,
}

impl JacobianBlocks {
    pub fn zeros(pattern: &JacobianPattern) -> Result<Self, DaeError> {
        let zeros = |p: &SparsityPattern| {
            CscMatrix::try_from_pattern_and_values(p.clone(), vec![0.0; p.nnz()])
                .map_err(|e| DaeError::from(MatrixError::SparseFormat(e)))
        };
        Ok(Self {
            ode_x: zeros(&pattern.ode_x)?,
            alg_x: zeros(&pattern.alg_x)?,
            ode_z: zeros(&pattern.ode_z)?,
            alg_z: zeros(&pattern.alg_z)?,
        })
    }
}

/// Callbacks of a DAE and, optionally, of its backward problem.
///
/// Every callback may fail with [CallbackError::Recoverable], in which case the integrator
/// retries with a smaller step or a fresh linearisation, or with [CallbackError::Fatal],
/// which aborts the current `reset`, `advance` or `retreat`.
///
/// Callbacks run synchronously on the caller's thread and must not re-enter the integrator.
pub trait DaeModel {
    fn dimensions(&self) -> Dimensions;

    /// Evaluate `[ode; alg]` into `out` (length `nx + nz`).
    fn residual(&self, args: &DaeArgs<'_>, out: &mut DVector<f64>) -> Result<(), CallbackError>;

    fn jacobian_pattern(&self) -> JacobianPattern;

    /// Fill the values of the undifferentiated Jacobian blocks at `args`.
    fn jacobian_blocks(
        &self,
        args: &DaeArgs<'_>,
        blocks: &mut JacobianBlocks,
    ) -> Result<(), CallbackError>;

    /// `out = d[ode; alg]/d[x; z] * [vx; vz]` over the full augmented state.
    fn jacobian_vector_product(
        &self,
        args: &DaeArgs<'_>,
        vx: DVectorView<'_, f64>,
        vz: DVectorView<'_, f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), CallbackError>;

    /// Quadrature right-hand side, length `nq`.
    fn quadrature(&self, _args: &DaeArgs<'_>, _out: &mut DVector<f64>) -> Result<(), CallbackError> {
        Ok(())
    }

    /// Evaluate `[rode; ralg]` into `out` (length `nrx + nrz`).
    fn backward_residual(
        &self,
        _args: &BackwardArgs<'_>,
        _out: &mut DVector<f64>,
    ) -> Result<(), CallbackError> {
        Err(CallbackError::Fatal(
            "model does not define a backward problem".to_string(),
        ))
    }

    fn backward_jacobian_pattern(&self) -> JacobianPattern {
        JacobianPattern::empty()
    }

    fn backward_jacobian_blocks(
        &self,
        _args: &BackwardArgs<'_>,
        _blocks: &mut JacobianBlocks,
    ) -> Result<(), CallbackError> {
        Err(CallbackError::Fatal(
            "model does not define a backward problem".to_string(),
        ))
    }

    fn backward_jacobian_vector_product(
        &self,
        _args: &BackwardArgs<'_>,
        _vrx: DVectorView<'_, f64>,
        _vrz: DVectorView<'_, f64>,
        _out: &mut DVector<f64>,
    ) -> Result<(), CallbackError> {
        Err(CallbackError::Fatal(
            "model does not define a backward problem".to_string(),
        ))
    }

    /// Backward quadrature integrands `[rq; uq]` (length `nrq + nuq`).
    ///
    /// The integrator negates these so that the reported values are the integrals
    /// from the current backward time to the end of the horizon.
    fn backward_quadrature(
        &self,
        _args: &BackwardArgs<'_>,
        _out: &mut DVector<f64>,
    ) -> Result<(), CallbackError> {
        Ok(())
    }
}
