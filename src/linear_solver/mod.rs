use ::nalgebra::DVector;
use nalgebra_sparse::CscMatrix;
use serde::{Deserialize, Serialize};

use crate::error::DaeError;

pub mod nalgebra;

#[cfg(feature = "faer")]
pub mod faer;

pub mod krylov;

#[cfg(feature = "faer")]
pub use faer::sparse_lu::FaerSparseLU;
pub use nalgebra::lu::LU as NalgebraLU;

/// A direct solver for `Ax = b`, where `A` is a square matrix with a fixed sparsity pattern
/// that is refactorised every time the Newton matrix is set up.
pub trait LinearSolver {
    /// Fix the pattern of the matrices passed to [Self::factorise]. Any previous factorisation
    /// is discarded.
    fn set_pattern(&mut self, template: &CscMatrix<f64>) -> Result<(), DaeError>;

    /// Factorise `matrix`, which must share the pattern given to [Self::set_pattern].
    fn factorise(&mut self, matrix: &CscMatrix<f64>) -> Result<(), DaeError>;

    /// Overwrite `b` with the solution of `Ax = b` for the last factorised `A`.
    fn solve_in_place(&self, b: &mut DVector<f64>) -> Result<(), DaeError>;

    fn is_factorised(&self) -> bool;
}

/// The factorisation backend of the direct and preconditioned paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DirectSolverKind {
    #[default]
    DenseLu,
    SparseLu,
}

impl DirectSolverKind {
    pub fn name(&self) -> &'static str {
        match self {
            DirectSolverKind::DenseLu => "dense_lu",
            DirectSolverKind::SparseLu => "sparse_lu",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "dense_lu" => Some(DirectSolverKind::DenseLu),
            "sparse_lu" => Some(DirectSolverKind::SparseLu),
            _ => None,
        }
    }

    pub fn build(&self) -> Box<dyn LinearSolver> {
        match self {
            DirectSolverKind::DenseLu => Box::new(NalgebraLU::default()),
            #[cfg(feature = "faer")]
            DirectSolverKind::SparseLu => Box::new(FaerSparseLU::default()),
            #[cfg(not(feature = "faer"))]
            DirectSolverKind::SparseLu => {
                log::warn!("sparse_lu requested without the faer feature, using dense_lu");
                Box::new(NalgebraLU::default())
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use nalgebra::DVector;
    use nalgebra_sparse::{CooMatrix, CscMatrix};

    use super::{DirectSolverKind, LinearSolver};

    pub struct LinearSolveSolution {
        pub x: DVector<f64>,
        pub b: DVector<f64>,
    }

    pub fn linear_problem() -> (CscMatrix<f64>, Vec<LinearSolveSolution>) {
        // [2 1 0; 0 2 0; 1 0 4]
        let mut coo = CooMatrix::new(3, 3);
        for (i, j, v) in [
            (0, 0, 2.0),
            (0, 1, 1.0),
            (1, 1, 2.0),
            (2, 0, 1.0),
            (2, 2, 4.0),
        ] {
            coo.push(i, j, v);
        }
        let a = CscMatrix::from(&coo);
        let solns = vec![
            LinearSolveSolution {
                x: DVector::from_vec(vec![1.0, 2.0, 3.0]),
                b: DVector::from_vec(vec![4.0, 4.0, 13.0]),
            },
            LinearSolveSolution {
                x: DVector::from_vec(vec![0.0, -1.0, 0.5]),
                b: DVector::from_vec(vec![-1.0, -2.0, 2.0]),
            },
        ];
        (a, solns)
    }

    pub fn test_linear_solver(mut solver: Box<dyn LinearSolver>) {
        let (a, solns) = linear_problem();
        assert!(!solver.is_factorised());
        solver.set_pattern(&a).unwrap();
        solver.factorise(&a).unwrap();
        assert!(solver.is_factorised());
        for soln in solns {
            let mut x = soln.b.clone();
            solver.solve_in_place(&mut x).unwrap();
            approx::assert_relative_eq!(x, soln.x, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_lu_nalgebra() {
        test_linear_solver(DirectSolverKind::DenseLu.build());
    }

    #[test]
    fn test_sparse_lu_faer() {
        test_linear_solver(DirectSolverKind::SparseLu.build());
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [DirectSolverKind::DenseLu, DirectSolverKind::SparseLu] {
            assert_eq!(DirectSolverKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(DirectSolverKind::from_name("klu"), None);
    }
}
