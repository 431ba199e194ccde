//! Backward problems integrated over the checkpointed forward trajectory.

use log::{debug, trace};
use nalgebra::DVector;

use crate::{
    dae::DaeModel,
    error::{DaeError, DaeSolverError, SolverFlag},
    nonlinear_solver::LinearStatistics,
};

use super::{
    bdf::{Bdf, StopReason},
    checkpointing::TrajectoryCursor,
    config::BdfConfig,
    ic::{calc_ic, initial_step},
    memory::{
        backward_options, differential_mask, forward_options, solver_failure, IntegratorMemory,
        IntegratorStatistics, RetreatOutput,
    },
    system::{build_strategy, BackwardSystem, CallbackCounters, ForwardSystem},
};

/// Solver of one backward problem. Its linear strategy lives with the other linear
/// solver handles of the memory.
pub(super) struct BackwardSolver {
    bdf: Bdf,
    cursor: TrajectoryCursor,
    rp: DVector<f64>,
    counters: CallbackCounters,
    linear_baseline: LinearStatistics,
    /// set by `reset_backward`, cleared by the forward `reset`
    armed: bool,
}

impl BackwardSolver {
    /// Forget the backward state, the forward trajectory it was reading is gone.
    pub(super) fn disarm(&mut self) {
        self.armed = false;
        self.cursor.invalidate();
    }
}

impl<M: DaeModel> IntegratorMemory<M> {
    fn check_slot(&self, slot: usize) -> Result<(), DaeError> {
        let count = self.solvers.backward.len();
        if slot >= count {
            return Err(DaeError::from(DaeSolverError::BackwardSlotOutOfRange {
                slot,
                count,
            }));
        }
        Ok(())
    }

    /// Allocate the solver, the trajectory cursor and the linear strategy of `slot`.
    fn create_backward(&mut self, slot: usize) -> Result<(), DaeError> {
        let dims = self.dims;
        let config = &self.config;
        let mut counters = CallbackCounters::default();

        let replay_strategy = {
            let view = ForwardSystem {
                model: &*self.model,
                dims,
                p: &self.p,
                u: &self.u,
                counters: &mut counters,
            };
            build_strategy(config, &view, config.cj_scaling)?
        };
        let replay = Bdf::new(
            dims.nxz(),
            0,
            forward_options(config, &dims),
            BdfConfig::default(),
        );
        let mut cursor =
            TrajectoryCursor::new(config.interpolation, replay, replay_strategy, dims.nxz());

        let rp = DVector::zeros(dims.nrp);
        let strategy = {
            let view = BackwardSystem {
                model: &*self.model,
                dims,
                p: &self.p,
                rp: &rp,
                u: &self.u,
                checkpoints: &[],
                cursor: &mut cursor,
                counters: &mut counters,
            };
            build_strategy(config, &view, config.cj_scaling_backward)?
        };
        let bdf = Bdf::new(
            dims.nrxz(),
            dims.nrq + dims.nuq,
            backward_options(config, &dims),
            BdfConfig::default(),
        );
        self.solvers.backward[slot] = Some(BackwardSolver {
            bdf,
            cursor,
            rp,
            counters: CallbackCounters::default(),
            linear_baseline: LinearStatistics::default(),
            armed: false,
        });
        self.linear.backward[slot] = Some(strategy);
        debug!("created backward problem {}", slot);
        Ok(())
    }

    /// Start backward problem `slot` at the time of the last output, with the adjoint
    /// states `rx0`, `rz0` and the adjoint parameters `rp`.
    ///
    /// The first call for a slot creates its solver. With `calc_icB` the algebraic adjoint
    /// states and the adjoint derivatives are corrected to be consistent with the forward
    /// trajectory. The backward quadratures restart from zero.
    pub fn reset_backward(
        &mut self,
        slot: usize,
        rx0: &DVector<f64>,
        rz0: &DVector<f64>,
        rp: &DVector<f64>,
    ) -> Result<(), DaeError> {
        let dims = self.dims;
        let t_start = self
            .t_out
            .ok_or(DaeError::from(DaeSolverError::NotReset("reset_backward")))?;
        if !dims.has_backward() {
            return Err(DaeError::from(DaeSolverError::SolverFailure {
                operation: "reset_backward",
                flag: SolverFlag::NoBck,
                time: t_start,
                detail: "the model defines no backward problem".to_string(),
            }));
        }
        self.check_slot(slot)?;
        Self::check_len("rx0", dims.nrx, rx0)?;
        Self::check_len("rz0", dims.nrz, rz0)?;
        Self::check_len("rp", dims.nrp, rp)?;

        self.close_trajectory();
        if self.solvers.backward[slot].is_none() {
            self.create_backward(slot)?;
        }
        let (Some(solver), Some(strategy)) = (
            self.solvers.backward[slot].as_mut(),
            self.linear.backward[slot].as_mut(),
        ) else {
            return Err(DaeError::from(DaeSolverError::BackwardNotReset { slot }));
        };
        let strategy = &mut **strategy;
        let config = &self.config;

        solver.rp.copy_from(rp);
        solver.counters = CallbackCounters::default();
        solver.linear_baseline = strategy.statistics();
        solver.cursor.invalidate();
        let (nrx, nrz) = (dims.nrx, dims.nrz);
        let mut y = DVector::zeros(nrx + nrz);
        y.rows_mut(0, nrx).copy_from(rx0);
        y.rows_mut(nrx, nrz).copy_from(rz0);
        let ydot = &mut self.derivatives.rxzdot[slot];
        ydot.fill(0.0);
        let weight = solver.bdf.options().error_weights(&y);

        let mut system = BackwardSystem {
            model: &*self.model,
            dims,
            p: &self.p,
            rp: &solver.rp,
            u: &self.u,
            checkpoints: &self.solvers.checkpoints,
            cursor: &mut solver.cursor,
            counters: &mut solver.counters,
        };
        if config.calc_icb() {
            calc_ic(
                &mut system,
                strategy,
                t_start,
                config.t0,
                &mut y,
                ydot,
                &weight,
                0.01 * config.nonlin_conv_coeff,
            )
            .map_err(|e| solver_failure("reset_backward", t_start, e))?;
        }
        let h = if let Some(step0) = config.step0_capped() {
            -step0
        } else {
            let mask = differential_mask(nrx + nrz, nrx);
            initial_step(
                t_start,
                config.t0,
                ydot,
                &weight,
                Some(&mask),
                config.max_step_size,
            )
        };
        let ruq = &mut self.quadratures.ruq[slot];
        ruq.fill(0.0);
        solver
            .bdf
            .reinit(&mut system, strategy, t_start, &y, ydot, ruq, h)
            .map_err(|e| solver_failure("reset_backward", t_start, e))?;
        solver.armed = true;
        debug!("backward problem {} reset at t = {}", slot, t_start);
        Ok(())
    }

    /// Add `rx`, `rz` and `rp` to the adjoint states and parameters of `slot` at its
    /// current time, and restart its integration from there.
    ///
    /// The backward quadratures keep their accumulated values.
    pub fn impulse_backward(
        &mut self,
        slot: usize,
        rx: &DVector<f64>,
        rz: &DVector<f64>,
        rp: &DVector<f64>,
    ) -> Result<(), DaeError> {
        let dims = self.dims;
        self.check_slot(slot)?;
        Self::check_len("rx", dims.nrx, rx)?;
        Self::check_len("rz", dims.nrz, rz)?;
        Self::check_len("rp", dims.nrp, rp)?;
        let (Some(solver), Some(strategy)) = (
            self.solvers.backward[slot].as_mut(),
            self.linear.backward[slot].as_mut(),
        ) else {
            return Err(DaeError::from(DaeSolverError::BackwardNotReset { slot }));
        };
        if !solver.armed {
            return Err(DaeError::from(DaeSolverError::BackwardNotReset { slot }));
        }
        let strategy = &mut **strategy;
        let config = &self.config;

        let state = solver.bdf.state();
        let t = state.t();
        let (nrx, nrz) = (dims.nrx, dims.nrz);
        let mut y = state.y().clone();
        y.rows_mut(0, nrx).axpy(1.0, rx, 1.0);
        y.rows_mut(nrx, nrz).axpy(1.0, rz, 1.0);
        let ydot = &mut self.derivatives.rxzdot[slot];
        ydot.copy_from(state.dy());
        let ruq = &mut self.quadratures.ruq[slot];
        ruq.copy_from(state.q());
        solver.rp += rp;
        let weight = solver.bdf.options().error_weights(&y);

        let mut system = BackwardSystem {
            model: &*self.model,
            dims,
            p: &self.p,
            rp: &solver.rp,
            u: &self.u,
            checkpoints: &self.solvers.checkpoints,
            cursor: &mut solver.cursor,
            counters: &mut solver.counters,
        };
        if config.calc_icb() {
            calc_ic(
                &mut system,
                strategy,
                t,
                config.t0,
                &mut y,
                ydot,
                &weight,
                0.01 * config.nonlin_conv_coeff,
            )
            .map_err(|e| solver_failure("impulse_backward", t, e))?;
        }
        let mask = differential_mask(nrx + nrz, nrx);
        let h = initial_step(
            t,
            config.t0,
            ydot,
            &weight,
            Some(&mask),
            config.max_step_size,
        );
        solver
            .bdf
            .reinit(&mut system, strategy, t, &y, ydot, ruq, h)
            .map_err(|e| solver_failure("impulse_backward", t, e))?;
        trace!("impulse applied to backward problem {} at t = {}", slot, t);
        Ok(())
    }

    /// Integrate backward problem `slot` with the controls `u` down to time `t`.
    ///
    /// Nothing is integrated unless `t` precedes the current backward time. The forward
    /// states needed along the way are recovered from the checkpoints.
    pub fn retreat(
        &mut self,
        slot: usize,
        u: &DVector<f64>,
        t: f64,
    ) -> Result<RetreatOutput, DaeError> {
        let dims = self.dims;
        self.check_slot(slot)?;
        Self::check_len("u", dims.nu, u)?;
        match &self.solvers.backward[slot] {
            Some(solver) if solver.armed => {}
            _ => return Err(DaeError::from(DaeSolverError::BackwardNotReset { slot })),
        }
        self.u.copy_from(u);
        self.close_trajectory();

        let (Some(solver), Some(strategy)) = (
            self.solvers.backward[slot].as_mut(),
            self.linear.backward[slot].as_mut(),
        ) else {
            return Err(DaeError::from(DaeSolverError::BackwardNotReset { slot }));
        };
        let strategy = &mut **strategy;
        let config = &self.config;
        let t_cur = solver.bdf.state().t();
        if t < config.t0 - 1e-9 {
            return Err(DaeError::from(DaeSolverError::SolverFailure {
                operation: "retreat",
                flag: SolverFlag::BadT,
                time: t_cur,
                detail: format!("requested time {t} precedes the start of the horizon"),
            }));
        }

        if t_cur - t >= 1e-9 {
            let bdf = &mut solver.bdf;
            bdf.set_stop_time(t)
                .map_err(|e| solver_failure("retreat", t_cur, e))?;
            let mut system = BackwardSystem {
                model: &*self.model,
                dims,
                p: &self.p,
                rp: &solver.rp,
                u: &self.u,
                checkpoints: &self.solvers.checkpoints,
                cursor: &mut solver.cursor,
                counters: &mut solver.counters,
            };
            let mut n_steps = 0;
            loop {
                if n_steps >= config.max_num_steps {
                    return Err(DaeError::from(DaeSolverError::SolverFailure {
                        operation: "retreat",
                        flag: SolverFlag::TooMuchWork,
                        time: bdf.state().t(),
                        detail: format!("took {n_steps} steps before reaching t = {t}"),
                    }));
                }
                let reason = bdf
                    .step(&mut system, strategy)
                    .map_err(|e| solver_failure("retreat", bdf.state().t(), e))?;
                n_steps += 1;
                if reason == StopReason::TstopReached || bdf.state().t() <= t {
                    break;
                }
            }
            trace!(
                "retreated backward problem {} to t = {} in {} steps",
                slot,
                bdf.state().t(),
                n_steps
            );
        }

        let state = solver.bdf.state();
        let (nrx, nrz, nrq) = (dims.nrx, dims.nrz, dims.nrq);
        self.quadratures.ruq[slot].copy_from(state.q());
        self.derivatives.rxzdot[slot].copy_from(state.dy());
        let ruq = &self.quadratures.ruq[slot];
        let statistics = IntegratorStatistics::collect(
            &solver.bdf,
            &solver.counters,
            strategy.statistics(),
            solver.linear_baseline,
            self.solvers.checkpoints.len(),
        );
        Ok(RetreatOutput {
            t: state.t(),
            rx: state.y().rows(0, nrx).into_owned(),
            rz: state.y().rows(nrx, nrz).into_owned(),
            rq: ruq.rows(0, nrq).into_owned(),
            uq: ruq.rows(nrq, dims.nuq).into_owned(),
            statistics,
        })
    }

    /// Statistics of backward problem `slot` since its last reset.
    pub fn backward_statistics(&self, slot: usize) -> Result<IntegratorStatistics, DaeError> {
        self.check_slot(slot)?;
        match (&self.solvers.backward[slot], &self.linear.backward[slot]) {
            (Some(solver), Some(strategy)) => Ok(IntegratorStatistics::collect(
                &solver.bdf,
                &solver.counters,
                strategy.statistics(),
                solver.linear_baseline,
                self.solvers.checkpoints.len(),
            )),
            _ => Err(DaeError::from(DaeSolverError::BackwardNotReset { slot })),
        }
    }

    /// Number of forward segments re-integrated by backward problem `slot`.
    pub fn backward_replays(&self, slot: usize) -> Result<usize, DaeError> {
        self.check_slot(slot)?;
        self.solvers.backward[slot]
            .as_ref()
            .map(|solver| solver.cursor.n_replays())
            .ok_or(DaeError::from(DaeSolverError::BackwardNotReset { slot }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use nalgebra::DVector;

    use crate::{
        dae::test_models::{
            decay_with_algebraic::DecayWithAlgebraic, exponential_decay::ExponentialDecay,
        },
        error::{DaeError, DaeSolverError},
        DaeConfig, DaeIntegrator,
    };

    const P: f64 = 0.8;
    const TF: f64 = 2.0;

    fn config(scheme: &str, interpolation: &str, tol: f64) -> DaeConfig {
        let mut config = DaeConfig {
            reltol: tol,
            abstol: tol,
            grid: vec![0.5, 1.0, 1.5, TF],
            steps_per_checkpoint: 10,
            ..Default::default()
        };
        config.set_option("newton_scheme", scheme).unwrap();
        config.set_option("interpolation_type", interpolation).unwrap();
        config
    }

    /// Forward to `TF`, then backward from `rx(TF) = 1`, one grid interval at a time.
    fn adjoint_of_decay(config: DaeConfig) -> crate::RetreatOutput {
        let integrator = DaeIntegrator::new(Arc::new(ExponentialDecay::with_adjoint()), config)
            .unwrap();
        let mut memory = integrator.create_memory().unwrap();
        let p = DVector::from_element(1, P);
        memory
            .reset(&DVector::from_element(1, 1.0), &DVector::zeros(0), &p)
            .unwrap();
        let u = DVector::zeros(1);
        for t in [0.5, 1.0, 1.5, TF] {
            memory.advance(&u, t).unwrap();
        }
        assert!(memory.statistics().n_checkpoints > 1);
        memory
            .reset_backward(0, &DVector::from_element(1, 1.0), &DVector::zeros(0), &DVector::zeros(0))
            .unwrap();
        let mut out = None;
        for t in [1.5, 1.0, 0.5, 0.0] {
            out = Some(memory.retreat(0, &u, t).unwrap());
        }
        let out = out.unwrap();
        assert!(memory.backward_replays(0).unwrap() > 0);
        out
    }

    fn check_analytic(out: &crate::RetreatOutput, epsilon: f64) {
        let decay = (-P * TF).exp();
        approx::assert_relative_eq!(out.t, 0.0, epsilon = 1e-12);
        approx::assert_relative_eq!(out.rx[0], decay, epsilon = epsilon);
        // d x(tf) / dp = -tf x0 exp(-p tf)
        approx::assert_relative_eq!(out.rq[0], -TF * decay, epsilon = epsilon);
        // d x(tf) / du for a constant control
        approx::assert_relative_eq!(out.uq[0], (1.0 - decay) / P, epsilon = epsilon);
    }

    #[test]
    fn adjoint_matches_analytic_direct() {
        check_analytic(&adjoint_of_decay(config("direct", "hermite", 1e-10)), 1e-6);
    }

    #[test]
    fn adjoint_matches_analytic_polynomial() {
        check_analytic(&adjoint_of_decay(config("direct", "polynomial", 1e-10)), 1e-6);
    }

    #[test]
    fn adjoint_matches_analytic_iterative() {
        for scheme in ["gmres", "bcgstab", "tfqmr"] {
            check_analytic(&adjoint_of_decay(config(scheme, "hermite", 1e-7)), 1e-4);
        }
    }

    #[test]
    fn independent_cj_scaling_toggles() {
        let mut config = config("direct", "hermite", 1e-8);
        config.cj_scaling = true;
        config.cj_scaling_backward = false;
        check_analytic(&adjoint_of_decay(config), 1e-5);
    }

    #[test]
    fn backward_first_step_is_capped_by_max_step_size() {
        let mut config = config("direct", "hermite", 1e-6);
        config.step0 = 0.5;
        config.max_step_size = 0.05;
        let integrator = DaeIntegrator::new(Arc::new(ExponentialDecay::with_adjoint()), config)
            .unwrap();
        let mut memory = integrator.create_memory().unwrap();
        let u = DVector::zeros(1);
        let none = DVector::zeros(0);
        memory
            .reset(&DVector::from_element(1, 1.0), &none, &DVector::from_element(1, P))
            .unwrap();
        memory.advance(&u, TF).unwrap();
        memory
            .reset_backward(0, &DVector::from_element(1, 1.0), &none, &none)
            .unwrap();
        let out = memory.retreat(0, &u, TF - 0.25).unwrap();
        let stats = out.statistics;
        assert!(stats.n_steps >= 5);
        assert!(stats.h_inused < 0.0);
        assert!(stats.h_inused.abs() <= 0.05 + 1e-15);
        assert!(stats.h_last.abs() <= 0.05 + 1e-15);
        assert!(stats.h_cur.abs() <= 0.05 + 1e-15);
    }

    #[test]
    fn adjoint_with_algebraic_states() {
        let config = DaeConfig {
            reltol: 1e-9,
            abstol: 1e-9,
            grid: vec![1.0],
            ..Default::default()
        };
        let integrator = DaeIntegrator::new(Arc::new(DecayWithAlgebraic), config).unwrap();
        let mut memory = integrator.create_memory().unwrap();
        let p = DVector::from_element(1, 0.5);
        let x0 = DVector::from_element(1, 1.0);
        memory.reset(&x0, &x0, &p).unwrap();
        memory.advance(&DVector::zeros(0), 1.0).unwrap();
        // inconsistent rz0, corrected to p rx
        memory
            .reset_backward(
                0,
                &DVector::from_element(1, 1.0),
                &DVector::zeros(1),
                &DVector::zeros(0),
            )
            .unwrap();
        let out = memory.retreat(0, &DVector::zeros(0), 0.0).unwrap();
        let decay = (-0.5f64).exp();
        approx::assert_relative_eq!(out.rx[0], decay, epsilon = 1e-6);
        approx::assert_relative_eq!(out.rz[0], 0.5 * decay, epsilon = 1e-6);
        approx::assert_relative_eq!(out.rq[0], -decay, epsilon = 1e-6);
        assert_eq!(out.uq.len(), 0);
        let stats = memory.backward_statistics(0).unwrap();
        assert!(stats.n_steps > 0);
        assert!(stats.t_cur.abs() < 1e-12);
    }

    #[test]
    fn impulse_adds_to_adjoint_state() {
        let integrator = DaeIntegrator::new(
            Arc::new(ExponentialDecay::with_adjoint()),
            config("direct", "hermite", 1e-9),
        )
        .unwrap();
        let mut memory = integrator.create_memory().unwrap();
        let p = DVector::from_element(1, P);
        let u = DVector::zeros(1);
        memory
            .reset(&DVector::from_element(1, 1.0), &DVector::zeros(0), &p)
            .unwrap();
        memory.advance(&u, TF).unwrap();
        let seed = DVector::from_element(1, 1.0);
        let none = DVector::zeros(0);
        memory.reset_backward(0, &seed, &none, &none).unwrap();
        memory.retreat(0, &u, 1.0).unwrap();
        // d (x(1) + x(tf)) / dx0
        memory.impulse_backward(0, &seed, &none, &none).unwrap();
        let out = memory.retreat(0, &u, 0.0).unwrap();
        let expect = (-P).exp() + (-P * TF).exp();
        approx::assert_relative_eq!(out.rx[0], expect, epsilon = 1e-6);
    }

    #[test]
    fn backward_requires_reset() {
        let integrator = DaeIntegrator::new(
            Arc::new(ExponentialDecay::with_adjoint()),
            config("direct", "hermite", 1e-6),
        )
        .unwrap();
        let mut memory = integrator.create_memory().unwrap();
        let u = DVector::zeros(1);
        let seed = DVector::from_element(1, 1.0);
        let none = DVector::zeros(0);
        assert!(matches!(
            memory.reset_backward(0, &seed, &none, &none),
            Err(DaeError::DaeSolverError(DaeSolverError::NotReset(_)))
        ));
        memory
            .reset(&seed, &none, &DVector::from_element(1, P))
            .unwrap();
        memory.advance(&u, TF).unwrap();
        assert!(matches!(
            memory.retreat(0, &u, 1.0),
            Err(DaeError::DaeSolverError(DaeSolverError::BackwardNotReset { slot: 0 }))
        ));
        assert!(matches!(
            memory.retreat(3, &u, 1.0),
            Err(DaeError::DaeSolverError(DaeSolverError::BackwardSlotOutOfRange { .. }))
        ));
        memory.reset_backward(0, &seed, &none, &none).unwrap();
        memory.retreat(0, &u, 1.0).unwrap();
        // a forward reset disarms the backward problem
        memory
            .reset(&seed, &none, &DVector::from_element(1, P))
            .unwrap();
        assert!(matches!(
            memory.retreat(0, &u, 0.5),
            Err(DaeError::DaeSolverError(DaeSolverError::BackwardNotReset { slot: 0 }))
        ));
    }
}
