//! Newton iteration on the implicit BDF stage equations, and the linear strategies that
//! solve its correction equation.
//!
//! A [NewtonSystem] evaluates `F(t, y, ydot) = f(t, y) + mass_sign * ydot` on the
//! differential rows and `f(t, y)` on the algebraic rows. The Newton matrix is therefore
//! `df/dy + mass_sign * cj * I_diff`, and a [LinearStrategy] knows how to invert it, either by
//! factorising it directly or by running a Krylov method on Jacobian-vector products.

use nalgebra::DVector;

use crate::{
    dae::{JacobianBlocks, JacobianPattern},
    error::DaeError,
};

mod block_solve;
pub mod convergence;
pub mod direct;
pub mod iterative;
pub mod newton;

pub use convergence::{Convergence, ConvergenceStatus};
pub use direct::DirectStrategy;
pub use iterative::IterativeStrategy;
pub use newton::{newton_iteration, NewtonStage, NewtonWork};

/// Point at which the Newton matrix is evaluated.
#[derive(Debug, Clone, Copy)]
pub struct NewtonPoint<'a> {
    pub t: f64,
    pub y: &'a DVector<f64>,
    /// coefficient of `ydot` with respect to `y` in the discretisation
    pub cj: f64,
}

/// Layout of a state vector holding `ndir` directions of `nx1` differential and `nz1`
/// algebraic entries.
///
/// The full vector is stored as `[x_0, x_1, ..., z_0, z_1, ...]`. The Newton matrix of the
/// augmented problem is block lower triangular when reordered direction-major into
/// `[x_0, z_0, x_1, z_1, ...]`, with the nominal block repeated on the diagonal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub nx1: usize,
    pub nz1: usize,
    pub ndir: usize,
}

impl BlockLayout {
    pub fn new(nx1: usize, nz1: usize, ndir: usize) -> Self {
        Self { nx1, nz1, ndir }
    }

    /// size of one direction
    pub fn n1(&self) -> usize {
        self.nx1 + self.nz1
    }

    pub fn n(&self) -> usize {
        self.ndir * self.n1()
    }

    pub fn nx(&self) -> usize {
        self.ndir * self.nx1
    }

    pub fn is_differential(&self, i: usize) -> bool {
        i < self.nx()
    }

    /// Copy direction `d` of `v` into `out`, `[x_d; z_d]`.
    pub fn gather(&self, v: &DVector<f64>, d: usize, out: &mut DVector<f64>) {
        let nx = self.nx();
        out.rows_mut(0, self.nx1)
            .copy_from(&v.rows(d * self.nx1, self.nx1));
        out.rows_mut(self.nx1, self.nz1)
            .copy_from(&v.rows(nx + d * self.nz1, self.nz1));
    }

    /// Inverse of [Self::gather].
    pub fn scatter(&self, block: &DVector<f64>, d: usize, v: &mut DVector<f64>) {
        let nx = self.nx();
        v.rows_mut(d * self.nx1, self.nx1)
            .copy_from(&block.rows(0, self.nx1));
        v.rows_mut(nx + d * self.nz1, self.nz1)
            .copy_from(&block.rows(self.nx1, self.nz1));
    }
}

/// The implicit system integrated by the BDF core.
pub trait NewtonSystem {
    fn layout(&self) -> BlockLayout;

    /// Sign of the `ydot` term on the differential rows of the residual.
    fn mass_sign(&self) -> f64;

    fn residual(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        ydot: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), DaeError>;

    /// Pattern of the undifferentiated Jacobian blocks.
    fn jacobian_pattern(&self) -> JacobianPattern;

    fn jacobian_blocks(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        blocks: &mut JacobianBlocks,
    ) -> Result<(), DaeError>;

    /// `out = df/dy * v` over the full augmented state, without the `ydot` term.
    fn jac_times_vec(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        v: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), DaeError>;

    /// number of quadrature states integrated alongside the system
    fn nq(&self) -> usize {
        0
    }

    /// Right-hand side of the quadratures.
    fn quadrature(
        &mut self,
        _t: f64,
        _y: &DVector<f64>,
        _out: &mut DVector<f64>,
    ) -> Result<(), DaeError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinearStatistics {
    pub n_setups: usize,
    pub n_solves: usize,
    pub n_krylov_iterations: usize,
    pub n_jac_times_vec: usize,
}

/// Solver for the Newton correction equation `(df/dy + mass_sign * cj * I_diff) x = b`.
pub trait LinearStrategy {
    /// Evaluate and prepare the Newton matrix at `point`.
    fn setup(&mut self, system: &mut dyn NewtonSystem, point: &NewtonPoint<'_>)
        -> Result<(), DaeError>;

    /// Overwrite `b` with the Newton correction. `weight` holds the inverse error scale of
    /// each state, so that `|weight * v|_2 / sqrt(n)` is the weighted RMS norm of `v`.
    fn solve(
        &mut self,
        system: &mut dyn NewtonSystem,
        point: &NewtonPoint<'_>,
        b: &mut DVector<f64>,
        weight: &DVector<f64>,
    ) -> Result<(), DaeError>;

    fn is_setup(&self) -> bool;

    /// Drop the current setup, the next solve needs a fresh [Self::setup].
    fn invalidate(&mut self);

    fn statistics(&self) -> LinearStatistics;
}

/// Weighted root-mean-square norm of `v`, restricted to the entries where `mask` is set.
pub fn wrms_norm(v: &DVector<f64>, weight: &DVector<f64>, mask: Option<&[bool]>) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for i in 0..v.len() {
        if mask.map_or(true, |m| m[i]) {
            let e = v[i] * weight[i];
            sum += e * e;
            n += 1;
        }
    }
    if n == 0 {
        0.0
    } else {
        (sum / n as f64).sqrt()
    }
}
