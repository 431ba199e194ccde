use log::trace;
use nalgebra::DVector;

use crate::{
    error::DaeError,
    linear_solver::{
        krylov::{KrylovConfig, KrylovMethod, LinearOperator},
        DirectSolverKind,
    },
};

use super::{
    block_solve::BlockSolver, LinearStatistics, LinearStrategy, NewtonPoint, NewtonSystem,
};

/// Solve the Newton correction with a Krylov method on Jacobian-vector products.
///
/// The operator is scaled by the error weights, so the Krylov tolerance is a bound on the
/// weighted RMS norm of the linear residual. When enabled, the factorised nominal block
/// acts as a right preconditioner.
pub struct IterativeStrategy {
    method: KrylovMethod,
    config: KrylovConfig,
    /// bound on the weighted RMS norm of the linear residual
    lin_tol: f64,
    preconditioner: Option<BlockSolver>,
    is_setup: bool,
    statistics: LinearStatistics,
}

impl IterativeStrategy {
    pub fn new(
        system: &dyn NewtonSystem,
        method: KrylovMethod,
        max_krylov: usize,
        lin_tol: f64,
        preconditioner: Option<(DirectSolverKind, bool)>,
    ) -> Result<Self, DaeError> {
        let preconditioner = match preconditioner {
            Some((kind, second_order_correction)) => {
                Some(BlockSolver::new(system, kind, second_order_correction)?)
            }
            None => None,
        };
        Ok(Self {
            method,
            config: KrylovConfig {
                tol: lin_tol,
                max_krylov,
                max_restarts: 5,
            },
            lin_tol,
            preconditioner,
            is_setup: false,
            statistics: LinearStatistics::default(),
        })
    }
}

/// `W (df/dy + mass_sign * cj * I_diff) W^-1` with the preconditioner `W P^-1 W^-1`.
struct ScaledNewtonOperator<'a, 'b> {
    system: &'a mut dyn NewtonSystem,
    point: &'a NewtonPoint<'b>,
    preconditioner: Option<&'a mut BlockSolver>,
    weight: &'a DVector<f64>,
    nx: usize,
    mass: f64,
    unscaled: DVector<f64>,
    n_jac_times_vec: usize,
}

impl LinearOperator for ScaledNewtonOperator<'_, '_> {
    fn nrows(&self) -> usize {
        self.weight.len()
    }

    fn apply(&mut self, v: &DVector<f64>, out: &mut DVector<f64>) -> Result<(), DaeError> {
        self.unscaled.copy_from(v);
        self.unscaled.component_div_assign(self.weight);
        self.system
            .jac_times_vec(self.point.t, self.point.y, &self.unscaled, out)?;
        self.n_jac_times_vec += 1;
        for i in 0..self.nx {
            out[i] += self.mass * self.unscaled[i];
        }
        out.component_mul_assign(self.weight);
        Ok(())
    }

    fn precondition(&mut self, v: &DVector<f64>, out: &mut DVector<f64>) -> Result<(), DaeError> {
        out.copy_from(v);
        if let Some(block) = self.preconditioner.as_deref_mut() {
            out.component_div_assign(self.weight);
            self.n_jac_times_vec += block.solve(&mut *self.system, self.point, out)?;
            out.component_mul_assign(self.weight);
        }
        Ok(())
    }
}

impl LinearStrategy for IterativeStrategy {
    fn setup(
        &mut self,
        system: &mut dyn NewtonSystem,
        point: &NewtonPoint<'_>,
    ) -> Result<(), DaeError> {
        self.statistics.n_setups += 1;
        self.is_setup = false;
        if let Some(block) = self.preconditioner.as_mut() {
            block.setup(system, point)?;
        }
        self.is_setup = true;
        Ok(())
    }

    fn solve(
        &mut self,
        system: &mut dyn NewtonSystem,
        point: &NewtonPoint<'_>,
        b: &mut DVector<f64>,
        weight: &DVector<f64>,
    ) -> Result<(), DaeError> {
        self.statistics.n_solves += 1;
        let n = b.len();
        let nx = system.layout().nx();
        let mass = system.mass_sign() * point.cj;
        let mut op = ScaledNewtonOperator {
            system,
            point,
            preconditioner: self.preconditioner.as_mut(),
            weight,
            nx,
            mass,
            unscaled: DVector::zeros(n),
            n_jac_times_vec: 0,
        };
        let rhs = b.component_mul(weight);
        self.config.tol = self.lin_tol * (n as f64).sqrt();
        let (x, result) = self.method.solve(&mut op, &rhs, &self.config)?;
        self.statistics.n_jac_times_vec += op.n_jac_times_vec;
        self.statistics.n_krylov_iterations += result.iterations;
        trace!(
            "{}: {} iterations, residual {:e}",
            self.method.name(),
            result.iterations,
            result.residual
        );
        result.check(self.method)?;
        b.copy_from(&x);
        b.component_div_assign(weight);
        Ok(())
    }

    fn is_setup(&self) -> bool {
        self.is_setup
    }

    fn invalidate(&mut self) {
        self.is_setup = false;
        if let Some(block) = self.preconditioner.as_mut() {
            block.invalidate();
        }
    }

    fn statistics(&self) -> LinearStatistics {
        self.statistics
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{DMatrix, DVector};

    use super::*;
    use crate::{
        dae::{JacobianBlocks, JacobianPattern},
        nonlinear_solver::BlockLayout,
    };

    // two coupled differential states and one algebraic state
    // x0' = -3 x0 + x1, x1' = x0 - 4 x1 + z, 0 = x0 - 2 z
    struct Coupled;

    fn jac() -> DMatrix<f64> {
        DMatrix::from_row_slice(3, 3, &[-3.0, 1.0, 0.0, 1.0, -4.0, 1.0, 1.0, 0.0, -2.0])
    }

    impl NewtonSystem for Coupled {
        fn layout(&self) -> BlockLayout {
            BlockLayout::new(2, 1, 1)
        }
        fn mass_sign(&self) -> f64 {
            -1.0
        }
        fn residual(
            &mut self,
            _t: f64,
            y: &DVector<f64>,
            ydot: &DVector<f64>,
            out: &mut DVector<f64>,
        ) -> Result<(), DaeError> {
            out.gemv(1.0, &jac(), y, 0.0);
            out[0] -= ydot[0];
            out[1] -= ydot[1];
            Ok(())
        }
        fn jacobian_pattern(&self) -> JacobianPattern {
            JacobianPattern::dense(2, 1)
        }
        fn jacobian_blocks(
            &mut self,
            _t: f64,
            _y: &DVector<f64>,
            blocks: &mut JacobianBlocks,
        ) -> Result<(), DaeError> {
            // column-major values of each dense block
            blocks.ode_x.values_mut().copy_from_slice(&[-3.0, 1.0, 1.0, -4.0]);
            blocks.alg_x.values_mut().copy_from_slice(&[1.0, 0.0]);
            blocks.ode_z.values_mut().copy_from_slice(&[0.0, 1.0]);
            blocks.alg_z.values_mut().copy_from_slice(&[-2.0]);
            Ok(())
        }
        fn jac_times_vec(
            &mut self,
            _t: f64,
            _y: &DVector<f64>,
            v: &DVector<f64>,
            out: &mut DVector<f64>,
        ) -> Result<(), DaeError> {
            out.gemv(1.0, &jac(), v, 0.0);
            Ok(())
        }
    }

    fn expected(cj: f64, b: &DVector<f64>) -> DVector<f64> {
        let mut m = jac();
        m[(0, 0)] -= cj;
        m[(1, 1)] -= cj;
        m.lu().solve(b).unwrap()
    }

    #[test]
    fn krylov_methods_match_direct_solution() {
        let mut system = Coupled;
        let y = DVector::zeros(3);
        let point = NewtonPoint { t: 0.0, y: &y, cj: 10.0 };
        let weight = DVector::from_vec(vec![1e4, 2e4, 5e3]);
        let b0 = DVector::from_vec(vec![1.0, -2.0, 0.5]);
        let x_exact = expected(10.0, &b0);
        for method in [KrylovMethod::Gmres, KrylovMethod::Bicgstab, KrylovMethod::Tfqmr] {
            for preconditioner in [None, Some((DirectSolverKind::DenseLu, true))] {
                let mut strategy =
                    IterativeStrategy::new(&system, method, 10, 1e-8, preconditioner).unwrap();
                strategy.setup(&mut system, &point).unwrap();
                let mut b = b0.clone();
                strategy.solve(&mut system, &point, &mut b, &weight).unwrap();
                approx::assert_relative_eq!(b, x_exact, epsilon = 1e-9);
                let stats = strategy.statistics();
                assert!(stats.n_jac_times_vec > 0);
                if preconditioner.is_some() {
                    // the exact preconditioner solves the system in one iteration
                    assert!(stats.n_krylov_iterations <= 2, "{}", method.name());
                }
            }
        }
    }
}
