//! Matrix-free Krylov solvers for `Ax = b` with right preconditioning.
//!
//! All three methods start from `x = 0` and stop once the Euclidean norm of the residual
//! drops below [KrylovConfig::tol]. The caller is expected to scale the operator so that
//! this norm is meaningful.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{DaeError, LinearSolverError};

mod bicgstab;
mod gmres;
mod tfqmr;

pub use bicgstab::bicgstab;
pub use gmres::gmres;
pub use tfqmr::tfqmr;

/// A linear operator `A` together with an optional right preconditioner `P`.
pub trait LinearOperator {
    fn nrows(&self) -> usize;

    /// `out = A v`
    fn apply(&mut self, v: &DVector<f64>, out: &mut DVector<f64>) -> Result<(), DaeError>;

    /// `out = P^-1 v`, the identity unless overridden.
    fn precondition(&mut self, v: &DVector<f64>, out: &mut DVector<f64>) -> Result<(), DaeError> {
        out.copy_from(v);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KrylovMethod {
    Gmres,
    Bicgstab,
    Tfqmr,
}

impl KrylovMethod {
    pub fn name(&self) -> &'static str {
        match self {
            KrylovMethod::Gmres => "gmres",
            KrylovMethod::Bicgstab => "bicgstab",
            KrylovMethod::Tfqmr => "tfqmr",
        }
    }

    pub fn solve(
        &self,
        op: &mut impl LinearOperator,
        b: &DVector<f64>,
        config: &KrylovConfig,
    ) -> Result<(DVector<f64>, KrylovResult), DaeError> {
        match self {
            KrylovMethod::Gmres => gmres(op, b, config),
            KrylovMethod::Bicgstab => bicgstab(op, b, config),
            KrylovMethod::Tfqmr => tfqmr(op, b, config),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KrylovConfig {
    /// absolute tolerance on the Euclidean residual norm
    pub tol: f64,
    /// Krylov subspace size for GMRES, iteration limit for the other methods
    pub max_krylov: usize,
    /// GMRES only
    pub max_restarts: usize,
}

impl Default for KrylovConfig {
    fn default() -> Self {
        Self {
            tol: 1e-10,
            max_krylov: 10,
            max_restarts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KrylovResult {
    pub iterations: usize,
    /// Euclidean norm of the final residual
    pub residual: f64,
    pub converged: bool,
}

impl KrylovResult {
    /// Turn a non-converged result into a recoverable linear solver error.
    pub fn check(&self, method: KrylovMethod) -> Result<(), DaeError> {
        if self.converged {
            Ok(())
        } else {
            Err(LinearSolverError::KrylovDidNotConverge {
                method: method.name(),
                iterations: self.iterations,
                residual: self.residual,
            }
            .into())
        }
    }
}

/// `r = b - A x`, returns the norm of `r`
pub(crate) fn true_residual(
    op: &mut impl LinearOperator,
    b: &DVector<f64>,
    x: &DVector<f64>,
    r: &mut DVector<f64>,
) -> Result<f64, DaeError> {
    op.apply(x, r)?;
    r.neg_mut();
    *r += b;
    Ok(r.norm())
}

#[cfg(test)]
pub(crate) mod tests {
    use nalgebra::{DMatrix, DVector};

    use super::*;
    use crate::error::DaeError;

    /// Dense test operator with an optional Jacobi preconditioner.
    pub struct DenseOperator {
        pub a: DMatrix<f64>,
        pub jacobi: bool,
        pub applications: usize,
    }

    impl DenseOperator {
        pub fn new(a: DMatrix<f64>, jacobi: bool) -> Self {
            Self {
                a,
                jacobi,
                applications: 0,
            }
        }
    }

    impl LinearOperator for DenseOperator {
        fn nrows(&self) -> usize {
            self.a.nrows()
        }
        fn apply(&mut self, v: &DVector<f64>, out: &mut DVector<f64>) -> Result<(), DaeError> {
            self.applications += 1;
            out.gemv(1.0, &self.a, v, 0.0);
            Ok(())
        }
        fn precondition(&mut self, v: &DVector<f64>, out: &mut DVector<f64>) -> Result<(), DaeError> {
            out.copy_from(v);
            if self.jacobi {
                for i in 0..v.len() {
                    out[i] /= self.a[(i, i)];
                }
            }
            Ok(())
        }
    }

    /// Nonsymmetric, diagonally dominant 5x5 system with known solution.
    pub fn test_system() -> (DMatrix<f64>, DVector<f64>, DVector<f64>) {
        let a = DMatrix::from_row_slice(
            5,
            5,
            &[
                10.0, 1.0, 0.0, 2.0, 0.0, //
                -1.0, 8.0, 1.0, 0.0, 0.0, //
                0.0, 2.0, 12.0, -1.0, 1.0, //
                1.0, 0.0, -2.0, 9.0, 0.5, //
                0.0, 0.0, 1.0, 0.0, 5.0,
            ],
        );
        let x = DVector::from_vec(vec![1.0, -2.0, 0.5, 3.0, -1.0]);
        let b = &a * &x;
        (a, b, x)
    }

    pub fn check_method(method: KrylovMethod, jacobi: bool) {
        let (a, b, x_exact) = test_system();
        let mut op = DenseOperator::new(a, jacobi);
        let config = KrylovConfig {
            tol: 1e-10,
            max_krylov: 20,
            max_restarts: 5,
        };
        let (x, result) = method.solve(&mut op, &b, &config).unwrap();
        assert!(result.converged, "{} failed: {result:?}", method.name());
        assert!(result.check(method).is_ok());
        approx::assert_relative_eq!(x, x_exact, epsilon = 1e-8);
    }

    #[test]
    fn zero_rhs_is_solved_immediately() {
        let (a, _, _) = test_system();
        let b = DVector::zeros(5);
        for method in [KrylovMethod::Gmres, KrylovMethod::Bicgstab, KrylovMethod::Tfqmr] {
            let mut op = DenseOperator::new(a.clone(), false);
            let (x, result) = method.solve(&mut op, &b, &KrylovConfig::default()).unwrap();
            assert!(result.converged);
            assert_eq!(result.iterations, 0);
            assert_eq!(x, DVector::zeros(5));
        }
    }

    #[test]
    fn non_convergence_is_recoverable() {
        let result = KrylovResult {
            iterations: 3,
            residual: 1.0,
            converged: false,
        };
        let err = result.check(KrylovMethod::Tfqmr).unwrap_err();
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("tfqmr"));
    }
}
