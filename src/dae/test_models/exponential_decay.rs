use std::cell::Cell;

use nalgebra::{DVector, DVectorView};

use crate::{
    dae::{BackwardArgs, DaeArgs, DaeModel, Dimensions, JacobianBlocks, JacobianPattern},
    error::CallbackError,
};

// exponential decay with a control input
// dx/dt = -p x + u
// dq/dt = x
//
// adjoint problem (derivatives of x(tf) with respect to x0, p and u)
// -drx/dt = -p rx
// rq integrand = [-x rx]
// uq integrand = [rx]
pub struct ExponentialDecay {
    adjoint: bool,
}

impl ExponentialDecay {
    pub fn new() -> Self {
        Self { adjoint: false }
    }
    pub fn with_adjoint() -> Self {
        Self { adjoint: true }
    }
}

impl Default for ExponentialDecay {
    fn default() -> Self {
        Self::new()
    }
}

impl DaeModel for ExponentialDecay {
    fn dimensions(&self) -> Dimensions {
        let b = usize::from(self.adjoint);
        Dimensions {
            nx: 1,
            nu: 1,
            np: 1,
            nq: 1,
            nrx: b,
            nrq: b,
            nuq: b,
            ..Default::default()
        }
    }

    fn residual(&self, args: &DaeArgs<'_>, out: &mut DVector<f64>) -> Result<(), CallbackError> {
        out[0] = -args.p[0] * args.x[0] + args.u[0];
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
        out[0] = -args.p[0] * vx[0];
        Ok(())
    }

    fn quadrature(&self, args: &DaeArgs<'_>, out: &mut DVector<f64>) -> Result<(), CallbackError> {
        out[0] = args.x[0];
        Ok(())
    }

    fn backward_residual(
        &self,
        args: &BackwardArgs<'_>,
        out: &mut DVector<f64>,
    ) -> Result<(), CallbackError> {
        out[0] = -args.fwd.p[0] * args.rx[0];
        Ok(())
    }

    fn backward_jacobian_pattern(&self) -> JacobianPattern {
        JacobianPattern::dense(usize::from(self.adjoint), 0)
    }

    fn backward_jacobian_blocks(
        &self,
        args: &BackwardArgs<'_>,
        blocks: &mut JacobianBlocks,
    ) -> Result<(), CallbackError> {
        blocks.ode_x.values_mut()[0] = -args.fwd.p[0];
        Ok(())
    }

    fn backward_jacobian_vector_product(
        &self,
        args: &BackwardArgs<'_>,
        vrx: DVectorView<'_, f64>,
        _vrz: DVectorView<'_, f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), CallbackError> {
        out[0] = -args.fwd.p[0] * vrx[0];
        Ok(())
    }

    fn backward_quadrature(
        &self,
        args: &BackwardArgs<'_>,
        out: &mut DVector<f64>,
    ) -> Result<(), CallbackError> {
        out[0] = -args.fwd.x[0] * args.rx[0];
        out[1] = args.rx[0];
        Ok(())
    }
}

/// Decay whose residual fails recoverably once, on call number `recoverable_at`,
/// and fatally whenever the state exceeds `threshold`.
pub struct FlakyDecay {
    pub threshold: f64,
    pub recoverable_at: usize,
    calls: Cell<usize>,
}

impl FlakyDecay {
    pub fn new(threshold: f64, recoverable_at: usize) -> Self {
        Self {
            threshold,
            recoverable_at,
            calls: Cell::new(0),
        }
    }
}

impl DaeModel for FlakyDecay {
    fn dimensions(&self) -> Dimensions {
        Dimensions {
            nx: 1,
            np: 1,
            ..Default::default()
        }
    }

    fn residual(&self, args: &DaeArgs<'_>, out: &mut DVector<f64>) -> Result<(), CallbackError> {
        let n = self.calls.get();
        self.calls.set(n + 1);
        if n == self.recoverable_at {
            return Err(CallbackError::Recoverable(1));
        }
        if args.x[0] > self.threshold {
            return Err(CallbackError::Fatal("state left the valid region".to_string()));
        }
        out[0] = -args.p[0] * args.x[0];
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
        out[0] = -args.p[0] * vx[0];
        Ok(())
    }
}
