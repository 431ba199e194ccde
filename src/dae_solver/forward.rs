//! `reset` and `advance` of the forward problem.

use log::{debug, trace};
use nalgebra::DVector;

use crate::{
    config_error,
    dae::DaeModel,
    dae_solver_error,
    error::{ConfigError, DaeError, DaeSolverError, SolverFlag},
};

use super::{
    bdf::StopReason,
    ic::{calc_ic, initial_step},
    memory::{
        differential_mask, record_checkpoint, solver_failure, AdvanceOutput, IntegratorMemory,
    },
    system::ForwardSystem,
};

/// distance below which two times are considered equal
const TTOL: f64 = 1e-9;

impl<M: DaeModel> IntegratorMemory<M> {
    /// Start a new integration at `t0` from the differential states `x0`, the algebraic
    /// states `z0` and the parameters `p`.
    ///
    /// The derivatives start from `init_xdot`, and with `calc_ic` the algebraic states and
    /// the derivatives are corrected to be consistent. The controls are those of the last
    /// [Self::advance], zeros before the first one. Recorded checkpoints are dropped and
    /// every backward problem has to be reset again before it can retreat.
    pub fn reset(
        &mut self,
        x0: &DVector<f64>,
        z0: &DVector<f64>,
        p: &DVector<f64>,
    ) -> Result<(), DaeError> {
        let dims = self.dims;
        let (nx, nz) = (dims.nx, dims.nz);
        Self::check_len("x0", nx, x0)?;
        Self::check_len("z0", nz, z0)?;
        Self::check_len("p", dims.np, p)?;

        let mut y = DVector::zeros(nx + nz);
        y.rows_mut(0, nx).copy_from(x0);
        y.rows_mut(nx, nz).copy_from(z0);
        for (index, constraint) in self.config.constraints.iter().enumerate() {
            if !constraint.is_satisfied(y[index]) {
                return Err(config_error!(ConstraintViolated {
                    index,
                    value: y[index],
                    constraint: constraint.code(),
                }));
            }
        }

        let config = &self.config;
        let t0 = config.t0;
        self.p.copy_from(p);
        self.t_out = None;
        self.counters = Default::default();
        self.linear_baseline = self.linear.forward.statistics();
        let mut ydot = if config.init_xdot.is_empty() {
            DVector::zeros(nx + nz)
        } else {
            DVector::from_column_slice(&config.init_xdot)
        };
        let weight = self.solvers.forward.options().error_weights(&y);

        let mut system = ForwardSystem {
            model: &*self.model,
            dims,
            p: &self.p,
            u: &self.u,
            counters: &mut self.counters,
        };
        if config.calc_ic {
            let tout1 = t0 + config.first_time * (config.tf() - t0);
            calc_ic(
                &mut system,
                &mut *self.linear.forward,
                t0,
                tout1,
                &mut y,
                &mut ydot,
                &weight,
                0.01 * config.nonlin_conv_coeff,
            )
            .map_err(|e| solver_failure("reset", t0, e))?;
        }
        let h = if let Some(step0) = config.step0_capped() {
            step0
        } else {
            let mask = differential_mask(nx + nz, nx);
            initial_step(
                t0,
                config.tf(),
                &ydot,
                &weight,
                Some(&mask),
                config.max_step_size,
            )
        };
        let q0 = DVector::zeros(dims.nq);
        self.solvers
            .forward
            .reinit(&mut system, &mut *self.linear.forward, t0, &y, &ydot, &q0, h)
            .map_err(|e| solver_failure("reset", t0, e))?;

        self.derivatives.xzdot.copy_from(&ydot);
        self.quadratures.q.fill(0.0);
        self.solvers.checkpoints.clear();
        self.steps_at_checkpoint = 0;
        for solver in self.solvers.backward.iter_mut().flatten() {
            solver.disarm();
        }
        self.t_out = Some(t0);
        debug!("reset at t = {} with initial step {}", t0, h);
        Ok(())
    }

    /// Integrate with the controls `u` up to time `t` and return the state there.
    ///
    /// The integrator never steps past the first grid point at or after `t`, so that a
    /// change of the controls at that grid point is resolved exactly. The returned state is
    /// interpolated at `t`. Nothing is integrated when `t` is already reached.
    pub fn advance(&mut self, u: &DVector<f64>, t: f64) -> Result<AdvanceOutput, DaeError> {
        if self.t_out.is_none() {
            return Err(dae_solver_error!(NotReset, "advance"));
        }
        let dims = self.dims;
        Self::check_len("u", dims.nu, u)?;
        self.u.copy_from(u);

        let tf = self.config.tf();
        if t > tf + TTOL {
            return Err(DaeError::from(DaeSolverError::SolverFailure {
                operation: "advance",
                flag: SolverFlag::BadT,
                time: self.solvers.forward.state().t(),
                detail: format!("requested time {t} is beyond the end of the horizon {tf}"),
            }));
        }
        let record = dims.has_backward();
        if record {
            self.record_checkpoint();
        }

        let t_cur = self.solvers.forward.state().t();
        if t > t_cur && (t - t_cur).abs() >= TTOL {
            let t_stop = self
                .config
                .grid
                .iter()
                .copied()
                .find(|&g| g >= t - TTOL)
                .unwrap_or(tf)
                .min(tf);
            let config = &self.config;
            let solver = &mut self.solvers.forward;
            let strategy = &mut *self.linear.forward;
            solver
                .set_stop_time(t_stop)
                .map_err(|e| solver_failure("advance", t_cur, e))?;
            let mut system = ForwardSystem {
                model: &*self.model,
                dims,
                p: &self.p,
                u: &self.u,
                counters: &mut self.counters,
            };
            let mut n_steps = 0;
            loop {
                if n_steps >= config.max_num_steps {
                    return Err(DaeError::from(DaeSolverError::SolverFailure {
                        operation: "advance",
                        flag: SolverFlag::TooMuchWork,
                        time: solver.state().t(),
                        detail: format!("took {n_steps} steps before reaching t = {t}"),
                    }));
                }
                let reason = solver
                    .step(&mut system, strategy)
                    .map_err(|e| solver_failure("advance", solver.state().t(), e))?;
                n_steps += 1;
                if record
                    && solver.statistics().number_of_steps - self.steps_at_checkpoint
                        >= config.steps_per_checkpoint
                {
                    record_checkpoint(
                        solver,
                        strategy,
                        &mut self.solvers.checkpoints,
                        &mut self.steps_at_checkpoint,
                        system.u,
                    );
                }
                if reason == StopReason::TstopReached || solver.state().t() >= t {
                    break;
                }
            }
            trace!(
                "advanced to t = {} in {} steps (target {})",
                solver.state().t(),
                n_steps,
                t
            );
        }

        let solver = &self.solvers.forward;
        let state = solver.state();
        let mut xz = DVector::zeros(dims.nxz());
        if (state.t() - t).abs() < TTOL {
            xz.copy_from(state.y());
            self.quadratures.q.copy_from(state.q());
        } else {
            solver
                .interpolate(t, &mut xz)
                .and_then(|_| solver.interpolate_quad(t, &mut self.quadratures.q))
                .map_err(|e| solver_failure("advance", state.t(), e))?;
        }
        self.t_out = Some(t);
        Ok(AdvanceOutput {
            t,
            x: xz.rows(0, dims.nx).into_owned(),
            z: xz.rows(dims.nx, dims.nz).into_owned(),
            q: self.quadratures.q.clone(),
            statistics: self.statistics(),
        })
    }
}
