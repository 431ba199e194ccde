use nalgebra::{DVector, DVectorView};

use crate::{
    dae::{DaeArgs, DaeModel, Dimensions, JacobianBlocks, JacobianPattern},
    error::CallbackError,
};

// exponential decay augmented with forward sensitivity equations
// dx/dt   = -p x
// ds_d/dt = -p s_d - dp_d x      for each direction d
//
// with s_d(0) = dx0_d supplied through the initial state.
pub struct DecaySensitivities {
    /// parameter seed of each direction
    pub dp: Vec<f64>,
}

impl DaeModel for DecaySensitivities {
    fn dimensions(&self) -> Dimensions {
        Dimensions {
            nx: 1 + self.dp.len(),
            np: 1,
            nfwd: self.dp.len(),
            ..Default::default()
        }
    }

    fn residual(&self, args: &DaeArgs<'_>, out: &mut DVector<f64>) -> Result<(), CallbackError> {
        let p = args.p[0];
        out[0] = -p * args.x[0];
        for (d, dp) in self.dp.iter().enumerate() {
            out[d + 1] = -p * args.x[d + 1] - dp * args.x[0];
        }
        Ok(())
    }

    fn jacobian_pattern(&self) -> JacobianPattern {
        JacobianPattern::dense(1, 0)
    }

    fn jacobian_blocks(
        &self,
        args: &DaeArgs<'_>,
        blocks: &mut JacobianBlocks,
    ) -> Result<(), CallbackError> {
        blocks.ode_x.values_mut()[0] = -args.p[0];
        Ok(())
    }

    fn jacobian_vector_product(
        &self,
        args: &DaeArgs<'_>,
        vx: DVectorView<'_, f64>,
        _vz: DVectorView<'_, f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), CallbackError> {
        let p = args.p[0];
        out[0] = -p * vx[0];
        for (d, dp) in self.dp.iter().enumerate() {
            out[d + 1] = -p * vx[d + 1] - dp * vx[0];
        }
        Ok(())
    }
}
