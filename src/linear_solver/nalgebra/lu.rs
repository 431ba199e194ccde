use nalgebra::{DMatrix, DVector, Dyn};
use nalgebra_sparse::{convert::serial::convert_csc_dense, CscMatrix};

use crate::{
    error::{DaeError, LinearSolverError},
    linear_solver::LinearSolver,
    linear_solver_error,
};

/// A [LinearSolver] that uses the dense LU decomposition in the [`nalgebra` library](https://nalgebra.org/).
#[derive(Clone, Default)]
pub struct LU {
    n: usize,
    lu: Option<nalgebra::LU<f64, Dyn, Dyn>>,
}

impl LinearSolver for LU {
    fn set_pattern(&mut self, template: &CscMatrix<f64>) -> Result<(), DaeError> {
        if template.nrows() != template.ncols() {
            return Err(linear_solver_error!(LinearSolverMatrixNotSquare));
        }
        self.n = template.nrows();
        self.lu = None;
        Ok(())
    }

    fn factorise(&mut self, matrix: &CscMatrix<f64>) -> Result<(), DaeError> {
        if matrix.nrows() != self.n || matrix.ncols() != self.n {
            return Err(linear_solver_error!(LinearSolverMatrixVectorNotCompatible));
        }
        let dense: DMatrix<f64> = convert_csc_dense(matrix);
        let lu = dense.lu();
        if !lu.is_invertible() {
            self.lu = None;
            return Err(linear_solver_error!(
                FactorisationFailed,
                "matrix is singular".to_string()
            ));
        }
        self.lu = Some(lu);
        Ok(())
    }

    fn solve_in_place(&self, b: &mut DVector<f64>) -> Result<(), DaeError> {
        let Some(lu) = self.lu.as_ref() else {
            return Err(linear_solver_error!(LuNotInitialized));
        };
        if b.len() != self.n {
            return Err(linear_solver_error!(LinearSolverMatrixVectorNotCompatible));
        }
        match lu.solve_mut(b) && b.iter().all(|x| x.is_finite()) {
            true => Ok(()),
            false => Err(linear_solver_error!(LuSolveFailed)),
        }
    }

    fn is_factorised(&self) -> bool {
        self.lu.is_some()
    }
}

#[cfg(test)]
mod tests {
    use nalgebra_sparse::CooMatrix;

    use super::*;

    #[test]
    fn singular_matrix_is_recoverable() {
        let mut coo = CooMatrix::new(2, 2);
        coo.push(0, 0, 1.0);
        coo.push(1, 0, 1.0);
        let a = CscMatrix::from(&coo);
        let mut lu = LU::default();
        lu.set_pattern(&a).unwrap();
        let err = lu.factorise(&a).unwrap_err();
        assert!(err.is_recoverable());
        assert!(!lu.is_factorised());
        let mut b = DVector::from_element(2, 1.0);
        assert!(matches!(
            lu.solve_in_place(&mut b),
            Err(DaeError::LinearSolverError(LinearSolverError::LuNotInitialized))
        ));
    }
}
