use nalgebra::DVector;

use crate::{
    error::{DaeError, NonLinearSolverError},
    non_linear_solver_error,
};

use super::{wrms_norm, Convergence, ConvergenceStatus, LinearStrategy, NewtonPoint, NewtonSystem};

/// One implicit stage, parametrised by the correction `d` to the prediction:
/// `y = y_pred + d` and `ydot = cj * (psi + d)`.
#[derive(Debug, Clone, Copy)]
pub struct NewtonStage<'a> {
    pub t: f64,
    pub y_pred: &'a DVector<f64>,
    pub psi: &'a DVector<f64>,
    pub cj: f64,
    pub weight: &'a DVector<f64>,
}

impl NewtonStage<'_> {
    fn update(&self, d: &DVector<f64>, work: &mut NewtonWork) {
        work.y.copy_from(self.y_pred);
        work.y += d;
        work.ydot.copy_from(self.psi);
        work.ydot += d;
        work.ydot *= self.cj;
    }
}

/// Scratch vectors of [newton_iteration]. On success `y` and `ydot` hold the converged
/// stage values.
#[derive(Debug, Clone)]
pub struct NewtonWork {
    pub y: DVector<f64>,
    pub ydot: DVector<f64>,
    pub tmp: DVector<f64>,
}

impl NewtonWork {
    pub fn new(n: usize) -> Self {
        Self {
            y: DVector::zeros(n),
            ydot: DVector::zeros(n),
            tmp: DVector::zeros(n),
        }
    }
}

pub fn newton_iteration(
    system: &mut dyn NewtonSystem,
    strategy: &mut dyn LinearStrategy,
    stage: &NewtonStage<'_>,
    d: &mut DVector<f64>,
    work: &mut NewtonWork,
    convergence: &mut Convergence,
) -> Result<(), DaeError> {
    convergence.reset();
    loop {
        stage.update(d, work);
        system.residual(stage.t, &work.y, &work.ydot, &mut work.tmp)?;
        //tmp = F(d_n)

        let point = NewtonPoint {
            t: stage.t,
            y: &work.y,
            cj: stage.cj,
        };
        strategy.solve(system, &point, &mut work.tmp, stage.weight)?;
        //tmp = -delta_n

        *d -= &work.tmp;
        // d_n+1 = d_n + delta_n

        let norm = wrms_norm(&work.tmp, stage.weight, None);
        match convergence.check_new_iteration(norm) {
            ConvergenceStatus::Continue => continue,
            ConvergenceStatus::Converged => {
                stage.update(d, work);
                return Ok(());
            }
            ConvergenceStatus::Diverged => return Err(non_linear_solver_error!(NewtonDiverged)),
            ConvergenceStatus::MaximumIterations => {
                return Err(non_linear_solver_error!(NewtonDidNotConverge))
            }
        }
    }
}
