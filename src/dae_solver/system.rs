//! The forward and backward problems seen through the [NewtonSystem] interface.
//!
//! Both are transient views: they borrow the model, the parameters and the controls from the
//! integrator memory for the duration of one call, and route every model callback through
//! [guard] so that failures are classified at the callback boundary.

use nalgebra::DVector;

use crate::{
    dae::{guard, BackwardArgs, DaeArgs, DaeModel, Dimensions, JacobianBlocks, JacobianPattern},
    error::DaeError,
    nonlinear_solver::{
        BlockLayout, DirectStrategy, IterativeStrategy, LinearStrategy, NewtonSystem,
    },
};

use super::{
    checkpointing::{Checkpoint, TrajectoryCursor},
    config::DaeConfig,
};

/// Counters of the callbacks evaluated through a system view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackCounters {
    pub n_residuals: usize,
    pub n_jacobians: usize,
    pub n_jac_times_vec: usize,
    pub n_quadratures: usize,
}

/// `F(t, [x; z], [xdot; zdot]) = [ode - xdot; alg]`
pub struct ForwardSystem<'a, M: DaeModel + ?Sized> {
    pub model: &'a M,
    pub dims: Dimensions,
    pub p: &'a DVector<f64>,
    pub u: &'a DVector<f64>,
    pub counters: &'a mut CallbackCounters,
}

impl<'a, M: DaeModel + ?Sized> ForwardSystem<'a, M> {
    fn args<'b>(&'b self, t: f64, y: &'b DVector<f64>) -> DaeArgs<'b> {
        DaeArgs {
            t,
            x: y.rows(0, self.dims.nx),
            z: y.rows(self.dims.nx, self.dims.nz),
            p: self.p,
            u: self.u,
        }
    }
}

impl<M: DaeModel + ?Sized> NewtonSystem for ForwardSystem<'_, M> {
    fn layout(&self) -> BlockLayout {
        BlockLayout::new(self.dims.nx1(), self.dims.nz1(), self.dims.ndir())
    }

    fn mass_sign(&self) -> f64 {
        -1.0
    }

    fn residual(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        ydot: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), DaeError> {
        self.counters.n_residuals += 1;
        let args = self.args(t, y);
        guard("residual", || self.model.residual(&args, out))?;
        for i in 0..self.dims.nx {
            out[i] -= ydot[i];
        }
        Ok(())
    }

    fn jacobian_pattern(&self) -> JacobianPattern {
        self.model.jacobian_pattern()
    }

    fn jacobian_blocks(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        blocks: &mut JacobianBlocks,
    ) -> Result<(), DaeError> {
        self.counters.n_jacobians += 1;
        let args = self.args(t, y);
        guard("jacobian", || self.model.jacobian_blocks(&args, blocks))
    }

    fn jac_times_vec(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        v: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), DaeError> {
        self.counters.n_jac_times_vec += 1;
        let args = self.args(t, y);
        let (nx, nz) = (self.dims.nx, self.dims.nz);
        guard("jacobian_vector_product", || {
            self.model
                .jacobian_vector_product(&args, v.rows(0, nx), v.rows(nx, nz), out)
        })
    }

    fn nq(&self) -> usize {
        self.dims.nq
    }

    fn quadrature(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), DaeError> {
        self.counters.n_quadratures += 1;
        let args = self.args(t, y);
        guard("quadrature", || self.model.quadrature(&args, out))
    }
}

/// `F(t, [rx; rz], [rxdot; rzdot]) = [rode + rxdot; ralg]`, evaluated on the forward
/// trajectory recovered from the checkpoints.
pub struct BackwardSystem<'a, M: DaeModel + ?Sized> {
    pub model: &'a M,
    pub dims: Dimensions,
    pub p: &'a DVector<f64>,
    pub rp: &'a DVector<f64>,
    pub u: &'a DVector<f64>,
    pub checkpoints: &'a [Checkpoint],
    pub cursor: &'a mut TrajectoryCursor,
    pub counters: &'a mut CallbackCounters,
}

impl<M: DaeModel + ?Sized> BackwardSystem<'_, M> {
    /// Evaluate `f(args)` at time `t` with the forward state interpolated at `t`.
    fn with_args<T>(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        f: impl FnOnce(&M, &BackwardArgs<'_>) -> Result<T, DaeError>,
    ) -> Result<T, DaeError> {
        self.cursor
            .seek(self.model, self.dims, self.p, self.checkpoints, t)?;
        let fwd = self.cursor.y();
        let (nx, nz) = (self.dims.nx, self.dims.nz);
        let (nrx, nrz) = (self.dims.nrx, self.dims.nrz);
        let args = BackwardArgs {
            fwd: DaeArgs {
                t,
                x: fwd.rows(0, nx),
                z: fwd.rows(nx, nz),
                p: self.p,
                u: self.u,
            },
            rx: y.rows(0, nrx),
            rz: y.rows(nrx, nrz),
            rp: self.rp,
        };
        f(self.model, &args)
    }
}

impl<M: DaeModel + ?Sized> NewtonSystem for BackwardSystem<'_, M> {
    fn layout(&self) -> BlockLayout {
        BlockLayout::new(self.dims.nrx1(), self.dims.nrz1(), self.dims.ndir())
    }

    fn mass_sign(&self) -> f64 {
        1.0
    }

    fn residual(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        ydot: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), DaeError> {
        self.counters.n_residuals += 1;
        self.with_args(t, y, |model, args| {
            guard("backward_residual", || model.backward_residual(args, out))
        })?;
        for i in 0..self.dims.nrx {
            out[i] += ydot[i];
        }
        Ok(())
    }

    fn jacobian_pattern(&self) -> JacobianPattern {
        self.model.backward_jacobian_pattern()
    }

    fn jacobian_blocks(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        blocks: &mut JacobianBlocks,
    ) -> Result<(), DaeError> {
        self.counters.n_jacobians += 1;
        self.with_args(t, y, |model, args| {
            guard("backward_jacobian", || {
                model.backward_jacobian_blocks(args, blocks)
            })
        })
    }

    fn jac_times_vec(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        v: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), DaeError> {
        self.counters.n_jac_times_vec += 1;
        let (nrx, nrz) = (self.dims.nrx, self.dims.nrz);
        self.with_args(t, y, |model, args| {
            guard("backward_jacobian_vector_product", || {
                model.backward_jacobian_vector_product(args, v.rows(0, nrx), v.rows(nrx, nrz), out)
            })
        })
    }

    fn nq(&self) -> usize {
        self.dims.nrq + self.dims.nuq
    }

    fn quadrature(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), DaeError> {
        self.counters.n_quadratures += 1;
        self.with_args(t, y, |model, args| {
            guard("backward_quadrature", || model.backward_quadrature(args, out))
        })?;
        // integrated from the end of the horizon, so the reported values are the
        // integrals from t to tf
        out.neg_mut();
        Ok(())
    }
}

/// Build the linear strategy selected by `config` for `system`.
pub fn build_strategy(
    config: &DaeConfig,
    system: &dyn NewtonSystem,
    cj_scaling: bool,
) -> Result<Box<dyn LinearStrategy>, DaeError> {
    let strategy: Box<dyn LinearStrategy> = match config.newton_scheme.krylov_method() {
        None => Box::new(DirectStrategy::new(
            system,
            config.linear_solver,
            config.second_order_correction,
            cj_scaling,
        )?),
        Some(method) => {
            let preconditioner = config
                .use_preconditioner
                .then_some((config.linear_solver, config.second_order_correction));
            Box::new(IterativeStrategy::new(
                system,
                method,
                config.max_krylov,
                0.05 * config.nonlin_conv_coeff,
                preconditioner,
            )?)
        }
    };
    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use nalgebra::DVector;

    use super::*;
    use crate::{
        dae::test_models::exponential_decay::{ExponentialDecay, FlakyDecay},
        error::CallbackError,
    };

    #[test]
    fn forward_residual_subtracts_derivative() {
        let model = ExponentialDecay::new();
        let p = DVector::from_element(1, 2.0);
        let u = DVector::from_element(1, 0.5);
        let mut counters = CallbackCounters::default();
        let mut system = ForwardSystem {
            model: &model,
            dims: model.dimensions(),
            p: &p,
            u: &u,
            counters: &mut counters,
        };
        let y = DVector::from_element(1, 1.0);
        let ydot = DVector::from_element(1, 0.25);
        let mut out = DVector::zeros(1);
        system.residual(0.0, &y, &ydot, &mut out).unwrap();
        // -2 * 1 + 0.5 - 0.25
        approx::assert_relative_eq!(out[0], -1.75);
        let mut q = DVector::zeros(1);
        system.quadrature(0.0, &y, &mut q).unwrap();
        approx::assert_relative_eq!(q[0], 1.0);
        assert_eq!(system.layout(), BlockLayout::new(1, 0, 1));
        assert_eq!(counters.n_residuals, 1);
        assert_eq!(counters.n_quadratures, 1);
    }

    #[test]
    fn callback_failures_keep_their_operation() {
        let model = FlakyDecay::new(10.0, 0);
        let p = DVector::from_element(1, 1.0);
        let u = DVector::zeros(0);
        let mut counters = CallbackCounters::default();
        let mut system = ForwardSystem {
            model: &model,
            dims: model.dimensions(),
            p: &p,
            u: &u,
            counters: &mut counters,
        };
        let ydot = DVector::zeros(1);
        let mut out = DVector::zeros(1);
        let err = system
            .residual(0.0, &DVector::from_element(1, 1.0), &ydot, &mut out)
            .unwrap_err();
        assert!(err.is_recoverable());
        let err = system
            .residual(0.0, &DVector::from_element(1, 20.0), &ydot, &mut out)
            .unwrap_err();
        match err {
            DaeError::Callback { operation, source } => {
                assert_eq!(operation, "residual");
                assert!(matches!(source, CallbackError::Fatal(_)));
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn strategy_follows_newton_scheme() {
        let model = ExponentialDecay::new();
        let p = DVector::from_element(1, 1.0);
        let u = DVector::zeros(1);
        let mut counters = CallbackCounters::default();
        let system = ForwardSystem {
            model: &model,
            dims: model.dimensions(),
            p: &p,
            u: &u,
            counters: &mut counters,
        };
        let mut config = DaeConfig::default();
        for scheme in ["direct", "gmres", "bcgstab", "tfqmr"] {
            config.set_option("newton_scheme", scheme).unwrap();
            let strategy = build_strategy(&config, &system, true).unwrap();
            assert!(!strategy.is_setup());
        }
    }
}
