use faer::{
    linalg::solvers::Solve,
    reborrow::Reborrow,
    sparse::{
        linalg::solvers::{Lu, SymbolicLu},
        SparseColMat, SymbolicSparseColMat,
    },
    Col,
};
use nalgebra::DVector;
use nalgebra_sparse::CscMatrix;

use crate::{
    error::{DaeError, LinearSolverError},
    linear_solver::LinearSolver,
    linear_solver_error,
};

/// A [LinearSolver] that uses the sparse LU decomposition in the [`faer`](https://github.com/sarah-ek/faer-rs) library.
///
/// The symbolic analysis is done once per pattern, each factorisation only redoes the
/// numeric phase.
#[derive(Default)]
pub struct FaerSparseLU {
    symbolic: Option<SymbolicSparseColMat<usize>>,
    lu_symbolic: Option<SymbolicLu<usize>>,
    lu: Option<Lu<usize, f64>>,
}

impl LinearSolver for FaerSparseLU {
    fn set_pattern(&mut self, template: &CscMatrix<f64>) -> Result<(), DaeError> {
        if template.nrows() != template.ncols() {
            return Err(linear_solver_error!(LinearSolverMatrixNotSquare));
        }
        let symbolic = SymbolicSparseColMat::new_checked(
            template.nrows(),
            template.ncols(),
            template.col_offsets().to_vec(),
            None,
            template.row_indices().to_vec(),
        );
        let lu_symbolic = SymbolicLu::try_new(symbolic.as_ref())
            .map_err(|e| linear_solver_error!(FactorisationFailed, format!("{e:?}")))?;
        self.symbolic = Some(symbolic);
        self.lu_symbolic = Some(lu_symbolic);
        self.lu = None;
        Ok(())
    }

    fn factorise(&mut self, matrix: &CscMatrix<f64>) -> Result<(), DaeError> {
        let (Some(symbolic), Some(lu_symbolic)) = (self.symbolic.as_ref(), self.lu_symbolic.as_ref())
        else {
            return Err(linear_solver_error!(LuNotInitialized));
        };
        if matrix.nnz() != symbolic.row_idx().len() {
            return Err(linear_solver_error!(LinearSolverMatrixVectorNotCompatible));
        }
        let mat = SparseColMat::new(symbolic.clone(), matrix.values().to_vec());
        self.lu = None;
        let lu = Lu::try_new_with_symbolic(lu_symbolic.clone(), mat.rb())
            .map_err(|e| linear_solver_error!(FactorisationFailed, format!("{e:?}")))?;
        self.lu = Some(lu);
        Ok(())
    }

    fn solve_in_place(&self, b: &mut DVector<f64>) -> Result<(), DaeError> {
        let Some(lu) = self.lu.as_ref() else {
            return Err(linear_solver_error!(LuNotInitialized));
        };
        let mut col = Col::from_fn(b.len(), |i| b[i]);
        lu.solve_in_place(&mut col);
        for (i, bi) in b.iter_mut().enumerate() {
            *bi = col[i];
        }
        if b.iter().all(|x| x.is_finite()) {
            Ok(())
        } else {
            Err(linear_solver_error!(LuSolveFailed))
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
    fn refactorises_on_fixed_pattern() {
        let mut coo = CooMatrix::new(2, 2);
        coo.push(0, 0, 1.0);
        coo.push(1, 1, 1.0);
        coo.push(0, 1, 0.0);
        let mut a = CscMatrix::from(&coo);
        let mut lu = FaerSparseLU::default();
        lu.set_pattern(&a).unwrap();
        for scale in [2.0, 4.0] {
            a.values_mut().iter_mut().for_each(|v| {
                if *v != 0.0 {
                    *v = scale
                }
            });
            lu.factorise(&a).unwrap();
            let mut b = DVector::from_vec(vec![scale, 2.0 * scale]);
            lu.solve_in_place(&mut b).unwrap();
            approx::assert_relative_eq!(b, DVector::from_vec(vec![1.0, 2.0]), epsilon = 1e-12);
        }
    }
}
