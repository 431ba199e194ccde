use log::trace;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::{
    dae_solver_error,
    error::{DaeError, DaeSolverError, SolverFlag},
    nonlinear_solver::{
        newton_iteration, Convergence, LinearStrategy, NewtonPoint, NewtonStage, NewtonSystem,
        NewtonWork,
    },
};

use super::{
    bdf_state::BdfState,
    config::{BdfConfig, Constraint},
    jacobian_update::{JacobianUpdate, SolverState},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BdfStatistics {
    pub number_of_steps: usize,
    pub number_of_error_test_failures: usize,
    pub number_of_nonlinear_solver_iterations: usize,
    pub number_of_nonlinear_solver_fails: usize,
    pub number_of_constraint_failures: usize,
    /// step size of the first step after the last reinitialisation
    pub initial_step_size: f64,
    /// order and step size of the last accepted step
    pub last_order: usize,
    pub last_step_size: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopReason {
    InternalTimestep,
    TstopReached,
}

/// Error control and step limits of one integration.
#[derive(Debug, Clone)]
pub struct BdfOptions {
    pub rtol: f64,
    /// per-component absolute tolerance
    pub atol: DVector<f64>,
    /// absolute tolerance of the quadratures
    pub quad_atol: f64,
    pub quad_err_con: bool,
    /// components included in the local error test, all when `None`
    pub error_mask: Option<Vec<bool>>,
    pub constraints: Vec<Constraint>,
    pub max_order: usize,
    /// 0 means unbounded
    pub max_step_size: f64,
    pub nonlin_conv_coeff: f64,
}

impl BdfOptions {
    pub fn new(rtol: f64, atol: DVector<f64>) -> Self {
        Self {
            rtol,
            atol,
            quad_atol: 1e-8,
            quad_err_con: false,
            error_mask: None,
            constraints: Vec::new(),
            max_order: BdfState::MAX_ORDER,
            max_step_size: 0.0,
            nonlin_conv_coeff: 0.33,
        }
    }

    /// Inverse error scale `1 / (rtol * |y_i| + atol_i)` of each component of `y`.
    pub fn error_weights(&self, y: &DVector<f64>) -> DVector<f64> {
        DVector::from_fn(y.len(), |i, _| 1.0 / (self.rtol * y[i].abs() + self.atol[i]))
    }
}

/// Variable order, variable step BDF integrator (NDF variant) for implicit DAEs, written in
/// terms of modified divided differences.
///
/// The integrator does not own the system it integrates: every step borrows a
/// [NewtonSystem] and the [LinearStrategy] attached to it, so the same engine drives both
/// the forward problem and each backward problem.
///
/// References:
/// 1. Byrne & Hindmarsh, "A Polyalgorithm for the Numerical Solution of Ordinary
///    Differential Equations", ACM TOMS 1975.
/// 2. Shampine & Reichelt, "The MATLAB ODE Suite", SIAM J. Sci. Comput. 1997.
pub struct Bdf {
    config: BdfConfig,
    options: BdfOptions,
    state: BdfState,
    statistics: BdfStatistics,
    alpha: Vec<f64>,
    gamma: Vec<f64>,
    error_const2: Vec<f64>,
    u: DMatrix<f64>,
    diff_tmp: DMatrix<f64>,
    qdiff_tmp: DMatrix<f64>,
    y_predict: DVector<f64>,
    psi: DVector<f64>,
    y_delta: DVector<f64>,
    q_delta: DVector<f64>,
    qdot: DVector<f64>,
    ewt: DVector<f64>,
    q_ewt: DVector<f64>,
    t_predict: f64,
    work: NewtonWork,
    convergence: Convergence,
    jacobian_update: JacobianUpdate,
    tstop: Option<f64>,
    n_equal_steps: usize,
    first_step: bool,
}

impl Bdf {
    pub fn new(n: usize, nq: usize, options: BdfOptions, config: BdfConfig) -> Self {
        // kappa values for difference orders, taken from Table 1 of [1]
        let kappa = [0.0, -0.1850, -1.0 / 9.0, -0.0823, -0.0415, 0.0];
        let mut alpha = vec![0.0];
        let mut gamma = vec![0.0];
        let mut error_const2 = vec![1.0];
        for i in 1..=BdfState::MAX_ORDER {
            let i_t = i as f64;
            gamma.push(gamma[i - 1] + 1.0 / i_t);
            alpha.push(1.0 / ((1.0 - kappa[i]) * gamma[i]));
            error_const2.push((kappa[i] * gamma[i] + 1.0 / (i_t + 1.0)).powi(2));
        }
        let convergence = Convergence::new(options.nonlin_conv_coeff, config.maximum_newton_iterations);
        Self {
            state: BdfState::new(n, nq),
            statistics: BdfStatistics::default(),
            alpha,
            gamma,
            error_const2,
            u: Self::compute_r(1, 1.0),
            diff_tmp: DMatrix::zeros(n, BdfState::MAX_ORDER + 3),
            qdiff_tmp: DMatrix::zeros(nq, BdfState::MAX_ORDER + 3),
            y_predict: DVector::zeros(n),
            psi: DVector::zeros(n),
            y_delta: DVector::zeros(n),
            q_delta: DVector::zeros(nq),
            qdot: DVector::zeros(nq),
            ewt: DVector::zeros(n),
            q_ewt: DVector::zeros(nq),
            t_predict: 0.0,
            work: NewtonWork::new(n),
            convergence,
            jacobian_update: JacobianUpdate::default(),
            tstop: None,
            n_equal_steps: 0,
            first_step: true,
            options,
            config,
        }
    }

    pub fn state(&self) -> &BdfState {
        &self.state
    }

    pub fn statistics(&self) -> &BdfStatistics {
        &self.statistics
    }

    pub fn options(&self) -> &BdfOptions {
        &self.options
    }

    /// Restart the integration at `(t, y, dy)` with a first order method and step size `h`.
    ///
    /// `q` are the initial quadratures, their derivative is evaluated here.
    pub fn reinit(
        &mut self,
        system: &mut dyn NewtonSystem,
        strategy: &mut dyn LinearStrategy,
        t: f64,
        y: &DVector<f64>,
        dy: &DVector<f64>,
        q: &DVector<f64>,
        h: f64,
    ) -> Result<(), DaeError> {
        self.state.t = t;
        self.state.h = h;
        self.state.y.copy_from(y);
        self.state.dy.copy_from(dy);
        self.state.q.copy_from(q);
        if self.state.q.len() > 0 {
            system.quadrature(t, y, &mut self.state.dq)?;
        }
        self.initialise_to_first_order();
        self.tstop = None;
        self.first_step = true;
        self.statistics = BdfStatistics::default();
        self.jacobian_update = JacobianUpdate::default();
        strategy.invalidate();
        Ok(())
    }

    /// Replace the current state, typically with one returned by [Self::checkpoint].
    pub fn set_state(&mut self, state: BdfState, strategy: &mut dyn LinearStrategy) {
        self.state = state;
        self.u = Self::compute_r(self.state.order, 1.0);
        self.n_equal_steps = 0;
        self.tstop = None;
        self.jacobian_updates(strategy, self.cj(), SolverState::Checkpoint);
    }

    /// Snapshot of the current state. The Newton matrix is re-evaluated on the next step,
    /// so that a restart from the snapshot reproduces the steps taken from here.
    pub fn checkpoint(&mut self, strategy: &mut dyn LinearStrategy) -> BdfState {
        self.n_equal_steps = 0;
        self.jacobian_updates(strategy, self.cj(), SolverState::Checkpoint);
        self.state.clone()
    }

    pub fn set_stop_time(&mut self, tstop: f64) -> Result<(), DaeError> {
        self.tstop = Some(tstop);
        if let Some(StopReason::TstopReached) = self.handle_tstop(tstop)? {
            self.tstop = None;
            return Err(dae_solver_error!(StopTimeAtCurrentTime));
        }
        Ok(())
    }

    fn cj(&self) -> f64 {
        1.0 / (self.state.h * self.alpha[self.state.order])
    }

    fn compute_r(order: usize, factor: f64) -> DMatrix<f64> {
        //computes the R matrix with entries
        //given by the first equation on page 8 of [1]
        //
        //This is used to update the differences matrix when step size h is varied
        //according to factor = h_{n+1} / h_n
        //
        //Note that the U matrix also defined in the same section can be also be
        //found using factor = 1, which corresponds to R with a constant step size
        let n = order + 1;
        let mut r = DMatrix::zeros(n, n);
        for j in 0..n {
            r[(0, j)] = 1.0;
        }
        for j in 1..n {
            for i in 1..n {
                r[(i, j)] = r[(i - 1, j)] * (i as f64 - 1.0 - factor * j as f64) / i as f64;
            }
        }
        r
    }

    fn jacobian_updates(&mut self, strategy: &mut dyn LinearStrategy, cj: f64, state: SolverState) {
        if self.jacobian_update.check_jacobian_update(cj, state) {
            strategy.invalidate();
        }
    }

    fn update_step_size(&mut self, factor: f64) -> Result<f64, DaeError> {
        let mut factor = factor;
        if self.options.max_step_size > 0.0
            && (factor * self.state.h).abs() > self.options.max_step_size
        {
            factor = self.options.max_step_size / self.state.h.abs();
        }
        let new_h = factor * self.state.h;
        self.n_equal_steps = 0;

        // update D using equations in section 3.2 of [1]
        let order = self.state.order;
        let ru = Self::compute_r(order, factor) * &self.u;
        Self::update_diff_for_step_size(&ru, &mut self.state.diff, &mut self.diff_tmp, order);
        if self.state.qdiff.nrows() > 0 {
            Self::update_diff_for_step_size(&ru, &mut self.state.qdiff, &mut self.qdiff_tmp, order);
        }
        self.state.h = new_h;

        if self.state.h.abs() < self.config.minimum_timestep {
            return Err(DaeError::from(DaeSolverError::StepSizeTooSmall {
                time: self.state.t,
            }));
        }
        Ok(new_h)
    }

    fn update_diff_for_step_size(
        ru: &DMatrix<f64>,
        diff: &mut DMatrix<f64>,
        diff_tmp: &mut DMatrix<f64>,
        order: usize,
    ) {
        // D[0:order+1] = D[0:order+1] * RU
        diff_tmp.copy_from(diff);
        diff_tmp
            .columns_mut(0, order + 1)
            .gemm(1.0, &diff.columns(0, order + 1), ru, 0.0);
        std::mem::swap(diff, diff_tmp);
    }

    fn update_diff(order: usize, d: &DVector<f64>, diff: &mut DMatrix<f64>) {
        //From first equation on page 4 of [1]:
        //d = y_n - y^0_n = D^{k + 1} y_n
        //
        //Standard backwards difference gives
        //D^{j + 1} y_n = D^{j} y_n - D^{j} y_{n - 1}
        let d_minus_order_plus_one = d - diff.column(order + 1);
        diff.column_mut(order + 2).copy_from(&d_minus_order_plus_one);
        diff.column_mut(order + 1).copy_from(d);
        for i in (0..=order).rev() {
            let next = diff.column(i + 1).clone_owned();
            diff.column_mut(i).axpy(1.0, &next, 1.0);
        }
    }

    fn predict_using_diff(predict: &mut DVector<f64>, diff: &DMatrix<f64>, order: usize) {
        predict.fill(0.0);
        for i in 0..=order {
            *predict += diff.column(i);
        }
    }

    /// `alpha_k * sum_{i=1..k} gamma_i D_i`
    fn psi_from_diff(
        psi: &mut DVector<f64>,
        diff: &DMatrix<f64>,
        gamma: &[f64],
        alpha: f64,
        order: usize,
    ) {
        psi.fill(0.0);
        for i in 1..=order {
            psi.axpy(gamma[i] * alpha, &diff.column(i), 1.0);
        }
    }

    // predict forward to new step (eq 2 in [1])
    fn predict_forward(&mut self) {
        let order = self.state.order;
        Self::predict_using_diff(&mut self.y_predict, &self.state.diff, order);
        Self::psi_from_diff(
            &mut self.psi,
            &self.state.diff,
            &self.gamma,
            self.alpha[order],
            order,
        );
        self.t_predict = self.state.t + self.state.h;
    }

    fn initialise_to_first_order(&mut self) {
        self.n_equal_steps = 0;
        self.state.initialise_diff_to_first_order();
        self.state.initialise_qdiff_to_first_order();
        self.u = Self::compute_r(1, 1.0);
    }

    fn handle_tstop(&mut self, tstop: f64) -> Result<Option<StopReason>, DaeError> {
        let state = &self.state;
        let troundoff = 100.0 * f64::EPSILON * (state.t.abs() + state.h.abs());
        if (state.t - tstop).abs() <= troundoff {
            self.tstop = None;
            return Ok(Some(StopReason::TstopReached));
        } else if (state.h > 0.0 && tstop < state.t - troundoff)
            || (state.h < 0.0 && tstop > state.t + troundoff)
        {
            let error = DaeSolverError::StopTimeBeforeCurrentTime {
                stop_time: tstop,
                state_time: state.t,
            };
            self.tstop = None;
            return Err(DaeError::from(error));
        }

        // check if the next step will be beyond tstop, if so adjust the step size
        if (state.h > 0.0 && state.t + state.h > tstop + troundoff)
            || (state.h < 0.0 && state.t + state.h < tstop - troundoff)
        {
            let factor = (tstop - state.t) / state.h;
            // update step size ignoring the possible "step size too small" error
            _ = self.update_step_size(factor);
        }
        Ok(None)
    }

    fn update_error_weights(&mut self) {
        let rtol = self.options.rtol;
        for i in 0..self.ewt.len() {
            self.ewt[i] = 1.0 / (rtol * self.state.y[i].abs() + self.options.atol[i]);
        }
        for i in 0..self.q_ewt.len() {
            self.q_ewt[i] = 1.0 / (rtol * self.state.q[i].abs() + self.options.quad_atol);
        }
    }

    fn error_control(&self) -> f64 {
        let order = self.state.order;
        let mask = self.options.error_mask.as_deref();
        let mut error_norm =
            squared_wrms(self.y_delta.iter(), &self.ewt, mask) * self.error_const2[order];
        if self.options.quad_err_con && self.q_delta.len() > 0 {
            error_norm += squared_wrms(self.q_delta.iter(), &self.q_ewt, None)
                * self.error_const2[order];
            error_norm /= 2.0;
        }
        error_norm
    }

    fn predict_error_control(&self, order: usize) -> f64 {
        let mask = self.options.error_mask.as_deref();
        let mut error_norm = squared_wrms(
            self.state.diff.column(order + 1).iter(),
            &self.ewt,
            mask,
        ) * self.error_const2[order];
        if self.options.quad_err_con && self.q_delta.len() > 0 {
            error_norm += squared_wrms(self.state.qdiff.column(order + 1).iter(), &self.q_ewt, None)
                * self.error_const2[order];
            error_norm /= 2.0;
        }
        error_norm
    }

    fn satisfies_constraints(&self, y: &DVector<f64>) -> bool {
        self.options
            .constraints
            .iter()
            .zip(y.iter())
            .all(|(c, &v)| c.is_satisfied(v))
    }

    /// Solve the stage equation of the current prediction and evaluate the quadrature
    /// increment at the new point.
    fn solve_stage(
        &mut self,
        system: &mut dyn NewtonSystem,
        strategy: &mut dyn LinearStrategy,
    ) -> Result<(), DaeError> {
        let cj = self.cj();
        if !strategy.is_setup() {
            let point = NewtonPoint {
                t: self.t_predict,
                y: &self.y_predict,
                cj,
            };
            strategy.setup(system, &point)?;
            self.jacobian_update.update_jacobian(cj);
            self.convergence.reset_eta();
        }
        self.y_delta.fill(0.0);
        let stage = NewtonStage {
            t: self.t_predict,
            y_pred: &self.y_predict,
            psi: &self.psi,
            cj,
            weight: &self.ewt,
        };
        let result = newton_iteration(
            system,
            strategy,
            &stage,
            &mut self.y_delta,
            &mut self.work,
            &mut self.convergence,
        );
        self.statistics.number_of_nonlinear_solver_iterations += self.convergence.niter();
        result?;

        if self.q_delta.len() > 0 {
            // q_delta = c * qdot - psi_q
            system.quadrature(self.t_predict, &self.work.y, &mut self.qdot)?;
            let order = self.state.order;
            Self::psi_from_diff(
                &mut self.q_delta,
                &self.state.qdiff,
                &self.gamma,
                self.alpha[order],
                order,
            );
            self.q_delta.axpy(1.0 / cj, &self.qdot, -1.0);
        }
        Ok(())
    }

    pub fn step(
        &mut self,
        system: &mut dyn NewtonSystem,
        strategy: &mut dyn LinearStrategy,
    ) -> Result<StopReason, DaeError> {
        let mut safety: f64;
        let mut error_norm: f64;
        let mut n_error_test_failures = 0;
        let mut n_convergence_failures = 0;

        self.update_error_weights();
        self.predict_forward();

        // loop until step is accepted
        loop {
            let order = self.state.order;
            if let Err(e) = self.solve_stage(system, strategy) {
                if !e.is_recoverable() {
                    return Err(e);
                }
                self.statistics.number_of_nonlinear_solver_fails += 1;
                n_convergence_failures += 1;
                if n_convergence_failures >= self.config.maximum_convergence_failures {
                    return Err(e);
                }
                if n_convergence_failures > 1 {
                    // the Newton matrix is already fresh, so reduce the step size by 0.3
                    // (as per [1]) and try again
                    if self.update_step_size(0.3).is_err() {
                        return Err(e);
                    }
                    self.jacobian_updates(strategy, self.cj(), SolverState::SecondConvergenceFail);
                    self.predict_forward();
                } else {
                    // re-evaluate the Newton matrix and retry with the same prediction
                    self.jacobian_updates(strategy, self.cj(), SolverState::FirstConvergenceFail);
                }
                trace!(
                    "convergence failure at t = {}, h = {}: {}",
                    self.state.t,
                    self.state.h,
                    e
                );
                continue;
            }

            if !self.satisfies_constraints(&self.work.y) {
                self.statistics.number_of_constraint_failures += 1;
                let factor = self.config.constraint_timestep_shrink;
                if self.update_step_size(factor).is_err() {
                    return Err(DaeError::from(DaeSolverError::SolverFailure {
                        operation: "step",
                        flag: SolverFlag::ConstrFail,
                        time: self.state.t,
                        detail: "constraints violated at the minimum step size".to_string(),
                    }));
                }
                self.jacobian_updates(strategy, self.cj(), SolverState::ErrorTestFail);
                self.predict_forward();
                continue;
            }

            error_norm = self.error_control();

            // need to calculate safety even if step is accepted
            let maxiter = self.convergence.max_iter() as f64;
            let niter = self.convergence.niter() as f64;
            safety = 0.9 * (2.0 * maxiter + 1.0) / (2.0 * maxiter + niter);

            // do the error test
            if error_norm <= 1.0 {
                break;
            }

            // step is rejected, calculate optimal step size factor as per eq 2.46 of [2]
            // and reduce step size and try again
            let factor = (safety * error_norm.powf(-0.5 / (order as f64 + 1.0)))
                .max(self.config.minimum_timestep_shrink);
            let new_h = self.update_step_size(factor)?;
            self.jacobian_updates(strategy, self.cj(), SolverState::ErrorTestFail);
            self.predict_forward();
            trace!(
                "error test failed at t = {} (error {:.3e}), new h = {}",
                self.state.t,
                error_norm,
                new_h
            );

            self.statistics.number_of_error_test_failures += 1;
            n_error_test_failures += 1;
            if n_error_test_failures >= self.config.maximum_error_test_failures {
                return Err(DaeError::from(DaeSolverError::TooManyErrorTestFailures {
                    time: self.state.t,
                }));
            }
        }

        // take the accepted step
        let order = self.state.order;
        Self::update_diff(order, &self.y_delta, &mut self.state.diff);
        if self.q_delta.len() > 0 {
            Self::predict_using_diff(&mut self.state.q, &self.state.qdiff, order);
            self.state.q += &self.q_delta;
            Self::update_diff(order, &self.q_delta, &mut self.state.qdiff);
            self.state.dq.copy_from(&self.qdot);
        }
        self.state.y.copy_from(&self.work.y);
        self.state.dy.copy_from(&self.work.ydot);
        self.state.t = self.t_predict;

        if self.first_step {
            self.statistics.initial_step_size = self.state.h;
            self.first_step = false;
        }
        self.statistics.number_of_steps += 1;
        self.statistics.last_order = order;
        self.statistics.last_step_size = self.state.h;
        self.jacobian_update.step();
        trace!(
            "step {} to t = {} with h = {}, order {}",
            self.statistics.number_of_steps,
            self.state.t,
            self.state.h,
            order
        );

        // a change in order is only done after running at order k for k + 1 steps
        // (see page 83 of [2])
        self.n_equal_steps += 1;

        if self.n_equal_steps > self.state.order {
            let order = self.state.order;
            // the optimal step size factors for orders k-1 and k+1 follow from
            // error = C_k * D^{k+1} y_n
            let error_m_norm = if order > 1 {
                self.predict_error_control(order - 1)
            } else {
                f64::INFINITY
            };
            let error_p_norm = if order < self.options.max_order.min(BdfState::MAX_ORDER) {
                self.predict_error_control(order + 1)
            } else {
                f64::INFINITY
            };
            let factors = [error_m_norm, error_norm, error_p_norm]
                .into_iter()
                .enumerate()
                .map(|(i, error_norm)| error_norm.powf(-0.5 / (i as f64 + order as f64)))
                .collect::<Vec<_>>();

            // pick the order that maximises the resultant step size
            let mut max_index = 1;
            for (i, factor) in factors.iter().enumerate() {
                if *factor > factors[max_index] {
                    max_index = i;
                }
            }

            let new_order = match max_index {
                0 => order - 1,
                2 => order + 1,
                _ => order,
            };
            self.state.order = new_order;
            if new_order != order {
                self.u = Self::compute_r(new_order, 1.0);
            }

            let factor = (safety * factors[max_index])
                .min(self.config.maximum_timestep_growth)
                .max(self.config.minimum_timestep_shrink);
            if factor >= self.config.minimum_timestep_growth
                || factor < self.config.maximum_timestep_shrink
                || new_order != order
            {
                self.update_step_size(factor)?;
                self.jacobian_updates(strategy, self.cj(), SolverState::StepSuccess);
            }
        } else if self.options.max_step_size > 0.0
            && self.state.h.abs() > self.options.max_step_size
        {
            self.update_step_size(1.0)?;
        }

        if let Some(tstop) = self.tstop {
            if let Some(reason) = self.handle_tstop(tstop)? {
                return Ok(reason);
            }
        }
        Ok(StopReason::InternalTimestep)
    }

    fn check_interpolation_time(&self, t: f64) -> Result<(), DaeError> {
        let state = &self.state;
        let troundoff = 100.0 * f64::EPSILON * (state.t.abs() + state.h.abs());
        let past = if state.h >= 0.0 {
            t > state.t + troundoff
        } else {
            t < state.t - troundoff
        };
        if past {
            let (t_min, t_max) = if state.h >= 0.0 {
                (state.t - state.h, state.t)
            } else {
                (state.t, state.t - state.h)
            };
            return Err(DaeError::from(DaeSolverError::InterpolationOutOfRange {
                t,
                t_min,
                t_max,
            }));
        }
        Ok(())
    }

    /// State at a time `t` within the last step.
    pub fn interpolate(&self, t: f64, y: &mut DVector<f64>) -> Result<(), DaeError> {
        self.check_interpolation_time(t)?;
        let state = &self.state;
        interpolate_from_diff(t, &state.diff, state.t, state.h, state.order, y);
        Ok(())
    }

    /// Quadratures at a time `t` within the last step.
    pub fn interpolate_quad(&self, t: f64, q: &mut DVector<f64>) -> Result<(), DaeError> {
        self.check_interpolation_time(t)?;
        let state = &self.state;
        interpolate_from_diff(t, &state.qdiff, state.t, state.h, state.order, q);
        Ok(())
    }
}

//interpolate solution at time values t* where t-h < t* < t
//definition of the interpolating polynomial can be found on page 7 of [1]
pub(crate) fn interpolate_from_diff(
    t: f64,
    diff: &DMatrix<f64>,
    t1: f64,
    h: f64,
    order: usize,
    y: &mut DVector<f64>,
) {
    let mut time_factor = 1.0;
    y.copy_from(&diff.column(0));
    for i in 0..order {
        let i_t = i as f64;
        time_factor *= (t - (t1 - h * i_t)) / (h * (1.0 + i_t));
        y.axpy(time_factor, &diff.column(i + 1), 1.0);
    }
}

/// Mean of the squared weighted entries selected by `mask`.
fn squared_wrms<'a>(
    v: impl Iterator<Item = &'a f64>,
    weight: &DVector<f64>,
    mask: Option<&[bool]>,
) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for (i, x) in v.enumerate() {
        if mask.map_or(true, |m| m[i]) {
            let e = x * weight[i];
            sum += e * e;
            n += 1;
        }
    }
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}
