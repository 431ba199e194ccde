use nalgebra::DVector;

use crate::{error::DaeError, linear_solver::DirectSolverKind};

use super::{
    block_solve::BlockSolver, LinearStatistics, LinearStrategy, NewtonPoint, NewtonSystem,
};

/// Solve the Newton correction with a factorisation of the Newton matrix.
///
/// The factorisation is reused across steps until the integrator asks for a new setup. When
/// `cj` has drifted since the last setup and `cj_scaling` is on, the correction is scaled
/// by `2 / (1 + cj / cj_setup)` to compensate for the stale matrix.
pub struct DirectStrategy {
    block: BlockSolver,
    cj_scaling: bool,
    cj_setup: f64,
    statistics: LinearStatistics,
}

impl DirectStrategy {
    pub fn new(
        system: &dyn NewtonSystem,
        kind: DirectSolverKind,
        second_order_correction: bool,
        cj_scaling: bool,
    ) -> Result<Self, DaeError> {
        Ok(Self {
            block: BlockSolver::new(system, kind, second_order_correction)?,
            cj_scaling,
            cj_setup: 0.0,
            statistics: LinearStatistics::default(),
        })
    }
}

impl LinearStrategy for DirectStrategy {
    fn setup(
        &mut self,
        system: &mut dyn NewtonSystem,
        point: &NewtonPoint<'_>,
    ) -> Result<(), DaeError> {
        self.statistics.n_setups += 1;
        self.block.setup(system, point)?;
        self.cj_setup = point.cj;
        Ok(())
    }

    fn solve(
        &mut self,
        system: &mut dyn NewtonSystem,
        point: &NewtonPoint<'_>,
        b: &mut DVector<f64>,
        _weight: &DVector<f64>,
    ) -> Result<(), DaeError> {
        self.statistics.n_solves += 1;
        self.statistics.n_jac_times_vec += self.block.solve(system, point, b)?;
        if self.cj_scaling && self.cj_setup != 0.0 && point.cj != self.cj_setup {
            let cjratio = point.cj / self.cj_setup;
            *b *= 2.0 / (1.0 + cjratio);
        }
        Ok(())
    }

    fn is_setup(&self) -> bool {
        self.block.is_setup()
    }

    fn invalidate(&mut self) {
        self.block.invalidate();
    }

    fn statistics(&self) -> LinearStatistics {
        self.statistics
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::DVector;

    use super::*;
    use crate::{
        dae::{JacobianBlocks, JacobianPattern},
        nonlinear_solver::BlockLayout,
    };

    // x' = -x
    struct Decay;

    impl NewtonSystem for Decay {
        fn layout(&self) -> BlockLayout {
            BlockLayout::new(1, 0, 1)
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
            out[0] = -y[0] - ydot[0];
            Ok(())
        }
        fn jacobian_pattern(&self) -> JacobianPattern {
            JacobianPattern::dense(1, 0)
        }
        fn jacobian_blocks(
            &mut self,
            _t: f64,
            _y: &DVector<f64>,
            blocks: &mut JacobianBlocks,
        ) -> Result<(), DaeError> {
            blocks.ode_x.values_mut()[0] = -1.0;
            Ok(())
        }
        fn jac_times_vec(
            &mut self,
            _t: f64,
            _y: &DVector<f64>,
            v: &DVector<f64>,
            out: &mut DVector<f64>,
        ) -> Result<(), DaeError> {
            out[0] = -v[0];
            Ok(())
        }
    }

    #[test]
    fn scales_correction_when_cj_drifts() {
        let mut system = Decay;
        let y = DVector::zeros(1);
        let weight = DVector::from_element(1, 1.0);
        for (cj_scaling, expected) in [(true, -1.0 / 3.0 * 2.0 / 3.0), (false, -1.0 / 3.0)] {
            let mut strategy =
                DirectStrategy::new(&system, DirectSolverKind::DenseLu, true, cj_scaling).unwrap();
            let setup_point = NewtonPoint { t: 0.0, y: &y, cj: 2.0 };
            strategy.setup(&mut system, &setup_point).unwrap();
            assert!(strategy.is_setup());

            // matrix is -1 - 2 = -3, but cj has doubled since the setup
            let point = NewtonPoint { t: 0.0, y: &y, cj: 4.0 };
            let mut b = DVector::from_element(1, 1.0);
            strategy.solve(&mut system, &point, &mut b, &weight).unwrap();
            approx::assert_relative_eq!(b[0], expected, epsilon = 1e-12);

            strategy.invalidate();
            assert!(!strategy.is_setup());
            let stats = strategy.statistics();
            assert_eq!(stats.n_setups, 1);
            assert_eq!(stats.n_solves, 1);
        }
    }
}
