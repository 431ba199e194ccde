use nalgebra::{DVector, DVectorView};

use crate::{
    dae::{BackwardArgs, DaeArgs, DaeModel, Dimensions, JacobianBlocks, JacobianPattern},
    error::CallbackError,
};

// exponential decay coupled through an algebraic state
// dx/dt = -p z
//     0 = z - x
//
// adjoint problem
// -drx/dt = -rz
//       0 = -p rx + rz
// rq integrand = [-z rx]
pub struct DecayWithAlgebraic;

fn pattern_1x1(nnz: bool) -> (Vec<usize>, Vec<usize>) {
    if nnz {
        (vec![0, 1], vec![0])
    } else {
        (vec![0, 0], vec![])
    }
}

fn pattern() -> JacobianPattern {
    // ode_x is structurally zero
    JacobianPattern::from_csc_parts(
        1,
        1,
        pattern_1x1(false),
        pattern_1x1(true),
        pattern_1x1(true),
        pattern_1x1(true),
    )
    .unwrap()
}

impl DaeModel for DecayWithAlgebraic {
    fn dimensions(&self) -> Dimensions {
        Dimensions {
            nx: 1,
            nz: 1,
            np: 1,
            nrx: 1,
            nrz: 1,
            nrq: 1,
            ..Default::default()
        }
    }

    fn residual(&self, args: &DaeArgs<'_>, out: &mut DVector<f64>) -> Result<(), CallbackError> {
        out[0] = -args.p[0] * args.z[0];
        out[1] = args.z[0] - args.x[0];
        Ok(())
    }

    fn jacobian_pattern(&self) -> JacobianPattern {
        pattern()
    }

    fn jacobian_blocks(
        &self,
        args: &DaeArgs<'_>,
        blocks: &mut JacobianBlocks,
    ) -> Result<(), CallbackError> {
        blocks.alg_x.values_mut()[0] = -1.0;
        blocks.ode_z.values_mut()[0] = -args.p[0];
        blocks.alg_z.values_mut()[0] = 1.0;
        Ok(())
    }

    fn jacobian_vector_product(
        &self,
        args: &DaeArgs<'_>,
        vx: DVectorView<'_, f64>,
        vz: DVectorView<'_, f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), CallbackError> {
        out[0] = -args.p[0] * vz[0];
        out[1] = vz[0] - vx[0];
        Ok(())
    }

    fn backward_residual(
        &self,
        args: &BackwardArgs<'_>,
        out: &mut DVector<f64>,
    ) -> Result<(), CallbackError> {
        out[0] = -args.rz[0];
        out[1] = -args.fwd.p[0] * args.rx[0] + args.rz[0];
        Ok(())
    }

    fn backward_jacobian_pattern(&self) -> JacobianPattern {
        pattern()
    }

    fn backward_jacobian_blocks(
        &self,
        args: &BackwardArgs<'_>,
        blocks: &mut JacobianBlocks,
    ) -> Result<(), CallbackError> {
        blocks.alg_x.values_mut()[0] = -args.fwd.p[0];
        blocks.ode_z.values_mut()[0] = -1.0;
        blocks.alg_z.values_mut()[0] = 1.0;
        Ok(())
    }

    fn backward_jacobian_vector_product(
        &self,
        args: &BackwardArgs<'_>,
        vrx: DVectorView<'_, f64>,
        vrz: DVectorView<'_, f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), CallbackError> {
        out[0] = -vrz[0];
        out[1] = -args.fwd.p[0] * vrx[0] + vrz[0];
        Ok(())
    }

    fn backward_quadrature(
        &self,
        args: &BackwardArgs<'_>,
        out: &mut DVector<f64>,
    ) -> Result<(), CallbackError> {
        out[0] = -args.fwd.z[0] * args.rx[0];
        Ok(())
    }
}
