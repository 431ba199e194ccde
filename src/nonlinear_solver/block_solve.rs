use log::debug;
use nalgebra::DVector;

use crate::{
    dae::JacobianBlocks,
    error::DaeError,
    linear_solver::{DirectSolverKind, LinearSolver},
    matrix::JacobianAssembly,
};

use super::{BlockLayout, NewtonPoint, NewtonSystem};

/// Factorised nominal Newton block, used to solve the full block lower-triangular Newton
/// system one direction at a time.
///
/// Both the direct strategy and the preconditioner of the iterative strategy go through
/// here, so the sensitivity directions share a single factorisation of size `nx1 + nz1`.
pub(crate) struct BlockSolver {
    layout: BlockLayout,
    assembly: JacobianAssembly,
    blocks: JacobianBlocks,
    lu: Box<dyn LinearSolver>,
    second_order_correction: bool,
    rhs: DVector<f64>,
    seed: DVector<f64>,
    jv: DVector<f64>,
    cross: DVector<f64>,
    is_setup: bool,
}

impl BlockSolver {
    pub(crate) fn new(
        system: &dyn NewtonSystem,
        kind: DirectSolverKind,
        second_order_correction: bool,
    ) -> Result<Self, DaeError> {
        let layout = system.layout();
        let pattern = system.jacobian_pattern();
        pattern.check_shape(layout.nx1, layout.nz1)?;
        let assembly = JacobianAssembly::new(&pattern)?;
        let blocks = JacobianBlocks::zeros(&pattern)?;
        let mut lu = kind.build();
        lu.set_pattern(assembly.matrix())?;
        debug!(
            "block solver: {} with block size {} and {} directions",
            kind.name(),
            layout.n1(),
            layout.ndir
        );
        Ok(Self {
            layout,
            assembly,
            blocks,
            lu,
            second_order_correction,
            rhs: DVector::zeros(layout.n1()),
            seed: DVector::zeros(layout.n()),
            jv: DVector::zeros(layout.n()),
            cross: DVector::zeros(layout.n1()),
            is_setup: false,
        })
    }

    pub(crate) fn is_setup(&self) -> bool {
        self.is_setup
    }

    pub(crate) fn invalidate(&mut self) {
        self.is_setup = false;
    }

    /// Evaluate and factorise `df/dy + mass_sign * cj * I_diff` of the nominal direction.
    pub(crate) fn setup(
        &mut self,
        system: &mut dyn NewtonSystem,
        point: &NewtonPoint<'_>,
    ) -> Result<(), DaeError> {
        self.is_setup = false;
        system.jacobian_blocks(point.t, point.y, &mut self.blocks)?;
        let shift = system.mass_sign() * point.cj;
        let matrix = self.assembly.assemble(&self.blocks, shift)?;
        self.lu.factorise(matrix)?;
        self.is_setup = true;
        Ok(())
    }

    /// Overwrite `b` with the solution of the block system. Returns the number of
    /// Jacobian-vector products used for the coupling terms.
    pub(crate) fn solve(
        &mut self,
        system: &mut dyn NewtonSystem,
        point: &NewtonPoint<'_>,
        b: &mut DVector<f64>,
    ) -> Result<usize, DaeError> {
        let layout = self.layout;

        // nominal direction
        layout.gather(b, 0, &mut self.rhs);
        self.lu.solve_in_place(&mut self.rhs)?;
        layout.scatter(&self.rhs, 0, b);
        if layout.ndir == 1 {
            return Ok(0);
        }

        let mut n_jv = 0;
        if self.second_order_correction {
            // coupling of each direction to the nominal correction
            self.seed.fill(0.0);
            layout.scatter(&self.rhs, 0, &mut self.seed);
            system.jac_times_vec(point.t, point.y, &self.seed, &mut self.jv)?;
            n_jv += 1;
        }
        for d in 1..layout.ndir {
            layout.gather(b, d, &mut self.rhs);
            if self.second_order_correction {
                layout.gather(&self.jv, d, &mut self.cross);
                self.rhs -= &self.cross;
            }
            self.lu.solve_in_place(&mut self.rhs)?;
            layout.scatter(&self.rhs, d, b);
        }
        Ok(n_jv)
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::DVector;

    use super::*;
    use crate::{
        dae::JacobianPattern,
        nonlinear_solver::NewtonSystem,
    };

    // x' = -2 x, s' = -2 s - x with a single sensitivity direction
    struct Augmented;

    impl NewtonSystem for Augmented {
        fn layout(&self) -> BlockLayout {
            BlockLayout::new(1, 0, 2)
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
            out[0] = -2.0 * y[0] - ydot[0];
            out[1] = -2.0 * y[1] - y[0] - ydot[1];
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
            blocks.ode_x.values_mut()[0] = -2.0;
            Ok(())
        }
        fn jac_times_vec(
            &mut self,
            _t: f64,
            _y: &DVector<f64>,
            v: &DVector<f64>,
            out: &mut DVector<f64>,
        ) -> Result<(), DaeError> {
            out[0] = -2.0 * v[0];
            out[1] = -2.0 * v[1] - v[0];
            Ok(())
        }
    }

    #[test]
    fn solves_block_lower_triangular_system() {
        let mut system = Augmented;
        let y = DVector::zeros(2);
        let point = NewtonPoint { t: 0.0, y: &y, cj: 3.0 };
        // full matrix [-5 0; -1 -5]
        for (soc, expected) in [(true, [-0.2, -0.16]), (false, [-0.2, -0.2])] {
            let mut solver = BlockSolver::new(&system, DirectSolverKind::DenseLu, soc).unwrap();
            assert!(!solver.is_setup());
            solver.setup(&mut system, &point).unwrap();
            assert!(solver.is_setup());
            let mut b = DVector::from_vec(vec![1.0, 1.0]);
            let n_jv = solver.solve(&mut system, &point, &mut b).unwrap();
            assert_eq!(n_jv, usize::from(soc));
            approx::assert_relative_eq!(b[0], expected[0], epsilon = 1e-12);
            approx::assert_relative_eq!(b[1], expected[1], epsilon = 1e-12);
        }
    }
}
