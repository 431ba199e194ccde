use std::sync::Arc;

use log::debug;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::{
    config_error,
    dae::{DaeModel, Dimensions},
    error::{ConfigError, DaeError, DaeSolverError, LinearSolverError, SolverFlag},
    nonlinear_solver::{LinearStatistics, LinearStrategy},
};

use super::{
    adjoint::BackwardSolver,
    bdf::{Bdf, BdfOptions},
    checkpointing::Checkpoint,
    config::{BdfConfig, DaeConfig},
    system::{build_strategy, CallbackCounters, ForwardSystem},
};

/// Counters and step size telemetry of one integration, forward or backward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegratorStatistics {
    pub n_steps: usize,
    /// residual evaluations
    pub n_fevals: usize,
    pub n_linsetups: usize,
    pub n_etfails: usize,
    /// order of the last step
    pub q_last: usize,
    /// order of the next step
    pub q_cur: usize,
    /// step size of the first step
    pub h_inused: f64,
    pub h_last: f64,
    pub h_cur: f64,
    pub t_cur: f64,
    pub n_niters: usize,
    pub n_ncfails: usize,
    pub n_checkpoints: usize,
}

impl IntegratorStatistics {
    pub(super) fn collect(
        solver: &Bdf,
        counters: &CallbackCounters,
        linear: LinearStatistics,
        baseline: LinearStatistics,
        n_checkpoints: usize,
    ) -> Self {
        let stats = solver.statistics();
        let state = solver.state();
        Self {
            n_steps: stats.number_of_steps,
            n_fevals: counters.n_residuals,
            n_linsetups: linear.n_setups.saturating_sub(baseline.n_setups),
            n_etfails: stats.number_of_error_test_failures,
            q_last: stats.last_order,
            q_cur: state.order(),
            h_inused: stats.initial_step_size,
            h_last: stats.last_step_size,
            h_cur: state.h(),
            t_cur: state.t(),
            n_niters: stats.number_of_nonlinear_solver_iterations,
            n_ncfails: stats.number_of_nonlinear_solver_fails,
            n_checkpoints,
        }
    }
}

/// Result of [IntegratorMemory::advance].
#[derive(Debug, Clone)]
pub struct AdvanceOutput {
    pub t: f64,
    pub x: DVector<f64>,
    pub z: DVector<f64>,
    pub q: DVector<f64>,
    pub statistics: IntegratorStatistics,
}

/// Result of [IntegratorMemory::retreat].
#[derive(Debug, Clone)]
pub struct RetreatOutput {
    pub t: f64,
    pub rx: DVector<f64>,
    pub rz: DVector<f64>,
    pub rq: DVector<f64>,
    pub uq: DVector<f64>,
    pub statistics: IntegratorStatistics,
}

pub(super) struct QuadratureBuffers {
    pub(super) q: DVector<f64>,
    /// `[rq; uq]` of each backward problem
    pub(super) ruq: Vec<DVector<f64>>,
}

pub(super) struct DerivativeBuffers {
    pub(super) xzdot: DVector<f64>,
    pub(super) rxzdot: Vec<DVector<f64>>,
}

pub(super) struct SolverHandles {
    pub(super) forward: Bdf,
    pub(super) checkpoints: Vec<Checkpoint>,
    pub(super) backward: Vec<Option<BackwardSolver>>,
}

pub(super) struct LinearHandles {
    pub(super) forward: Box<dyn LinearStrategy>,
    pub(super) backward: Vec<Option<Box<dyn LinearStrategy>>>,
}

/// Mutable state of one integration of a [crate::DaeIntegrator] problem.
///
/// Created by [crate::DaeIntegrator::create_memory]. The forward solver and its linear
/// strategy are allocated up front, each backward problem on its first
/// [Self::reset_backward]. Dropping the memory releases the quadrature buffers, then the
/// derivative vectors, then the solvers and finally the linear solvers.
pub struct IntegratorMemory<M: DaeModel> {
    // released in declaration order
    pub(super) quadratures: QuadratureBuffers,
    pub(super) derivatives: DerivativeBuffers,
    pub(super) solvers: SolverHandles,
    pub(super) linear: LinearHandles,
    pub(super) model: Arc<M>,
    pub(super) config: Arc<DaeConfig>,
    pub(super) dims: Dimensions,
    pub(super) p: DVector<f64>,
    pub(super) u: DVector<f64>,
    pub(super) counters: CallbackCounters,
    pub(super) linear_baseline: LinearStatistics,
    /// time of the last output, `None` before the first reset
    pub(super) t_out: Option<f64>,
    /// forward steps taken when the last checkpoint was recorded
    pub(super) steps_at_checkpoint: usize,
}

impl<M: DaeModel> IntegratorMemory<M> {
    pub(super) fn new(model: Arc<M>, config: Arc<DaeConfig>) -> Result<Self, DaeError> {
        let dims = model.dimensions();
        let p = DVector::zeros(dims.np);
        let u = DVector::zeros(dims.nu);
        let mut counters = CallbackCounters::default();
        let strategy = {
            let view = ForwardSystem {
                model: &*model,
                dims,
                p: &p,
                u: &u,
                counters: &mut counters,
            };
            build_strategy(&config, &view, config.cj_scaling)?
        };
        let forward = Bdf::new(
            dims.nxz(),
            dims.nq,
            forward_options(&config, &dims),
            BdfConfig::default(),
        );
        let n_backward = if dims.has_backward() {
            config.n_backward
        } else {
            0
        };
        debug!(
            "created integrator memory: {} states, {} quadratures, {} backward problems",
            dims.nxz(),
            dims.nq,
            n_backward
        );
        Ok(Self {
            quadratures: QuadratureBuffers {
                q: DVector::zeros(dims.nq),
                ruq: (0..n_backward)
                    .map(|_| DVector::zeros(dims.nrq + dims.nuq))
                    .collect(),
            },
            derivatives: DerivativeBuffers {
                xzdot: DVector::zeros(dims.nxz()),
                rxzdot: (0..n_backward).map(|_| DVector::zeros(dims.nrxz())).collect(),
            },
            solvers: SolverHandles {
                forward,
                checkpoints: Vec::new(),
                backward: (0..n_backward).map(|_| None).collect(),
            },
            linear: LinearHandles {
                forward: strategy,
                backward: (0..n_backward).map(|_| None).collect(),
            },
            linear_baseline: LinearStatistics::default(),
            model,
            config,
            dims,
            p,
            u,
            counters,
            t_out: None,
            steps_at_checkpoint: 0,
        })
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dims
    }

    /// Checkpoints recorded since the last reset.
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.solvers.checkpoints
    }

    /// Statistics of the forward integration since the last reset.
    pub fn statistics(&self) -> IntegratorStatistics {
        IntegratorStatistics::collect(
            &self.solvers.forward,
            &self.counters,
            self.linear.forward.statistics(),
            self.linear_baseline,
            self.solvers.checkpoints.len(),
        )
    }

    /// Record a checkpoint at the current forward time carrying the current controls.
    ///
    /// When no step was taken since the last checkpoint, the controls of that checkpoint
    /// are overwritten instead.
    pub(super) fn record_checkpoint(&mut self) {
        record_checkpoint(
            &mut self.solvers.forward,
            &mut *self.linear.forward,
            &mut self.solvers.checkpoints,
            &mut self.steps_at_checkpoint,
            &self.u,
        );
    }

    /// Make sure the recorded trajectory extends to the current forward time.
    pub(super) fn close_trajectory(&mut self) {
        let steps = self.solvers.forward.statistics().number_of_steps;
        if self.solvers.checkpoints.is_empty() || steps != self.steps_at_checkpoint {
            self.record_checkpoint();
        }
    }

    pub(super) fn check_len(
        name: &'static str,
        expected: usize,
        v: &DVector<f64>,
    ) -> Result<(), DaeError> {
        if v.len() != expected {
            return Err(config_error!(DimensionMismatch {
                name,
                expected,
                found: v.len(),
            }));
        }
        Ok(())
    }
}

pub(super) fn record_checkpoint(
    solver: &mut Bdf,
    strategy: &mut dyn LinearStrategy,
    checkpoints: &mut Vec<Checkpoint>,
    steps_at_checkpoint: &mut usize,
    u: &DVector<f64>,
) {
    let steps = solver.statistics().number_of_steps;
    match checkpoints.last_mut() {
        Some(last) if steps == *steps_at_checkpoint => last.u.copy_from(u),
        _ => {
            checkpoints.push(Checkpoint::new(solver.checkpoint(strategy), u.clone()));
            *steps_at_checkpoint = steps;
            debug!(
                "checkpoint {} recorded at t = {}",
                checkpoints.len() - 1,
                solver.state().t()
            );
        }
    }
}

impl<M: DaeModel> Drop for IntegratorMemory<M> {
    fn drop(&mut self) {
        self.quadratures.q = DVector::zeros(0);
        self.quadratures.ruq.clear();
        debug!("released quadrature buffers");
        self.derivatives.xzdot = DVector::zeros(0);
        self.derivatives.rxzdot.clear();
        debug!("released derivative vectors");
        self.solvers.backward.clear();
        self.solvers.checkpoints.clear();
        debug!("released solver handles");
        self.linear.backward.clear();
        debug!("released linear solver handles");
    }
}

/// Error control and limits of the forward integration.
pub(super) fn forward_options(config: &DaeConfig, dims: &Dimensions) -> BdfOptions {
    let nxz = dims.nxz();
    let mut options = BdfOptions::new(
        config.reltol,
        DVector::from_vec(config.abstol_vector(nxz)),
    );
    options.quad_atol = config.abstol;
    options.quad_err_con = config.quad_err_con;
    options.constraints = config.constraints.clone();
    options.max_order = config.max_multistep_order;
    options.max_step_size = config.max_step_size;
    options.nonlin_conv_coeff = config.nonlin_conv_coeff;
    if config.suppress_algebraic {
        options.error_mask = Some((0..nxz).map(|i| i < dims.nx).collect());
    }
    options
}

/// Error control and limits of a backward integration.
///
/// The backward states use the scalar `abstol`. `abstolv` applies to the forward problem only.
pub(super) fn backward_options(config: &DaeConfig, dims: &Dimensions) -> BdfOptions {
    let nrxz = dims.nrxz();
    let mut options = BdfOptions::new(config.reltol, DVector::from_element(nrxz, config.abstol));
    options.quad_atol = config.abstol;
    options.quad_err_con = config.quad_err_con;
    options.max_order = config.max_multistep_order;
    options.max_step_size = config.max_step_size;
    options.nonlin_conv_coeff = config.nonlin_conv_coeff;
    if config.suppress_algebraic {
        options.error_mask = Some((0..nrxz).map(|i| i < dims.nrx).collect());
    }
    options
}

/// Entries of a state of length `n` that are differential.
pub(super) fn differential_mask(n: usize, n_diff: usize) -> Vec<bool> {
    (0..n).map(|i| i < n_diff).collect()
}

/// Translate a failure inside `operation` into the error reported to the caller.
///
/// Failures of the integration core become [DaeSolverError::SolverFailure] carrying the
/// symbolic flag of the failure; configuration and usage errors pass through unchanged.
pub(super) fn solver_failure(operation: &'static str, time: f64, error: DaeError) -> DaeError {
    if let DaeError::DaeSolverError(DaeSolverError::SolverFailure {
        flag, time, detail, ..
    }) = error
    {
        return DaeError::from(DaeSolverError::SolverFailure {
            operation,
            flag,
            time,
            detail,
        });
    }
    let flag = match &error {
        DaeError::Callback {
            operation: op,
            source,
        } => Some(if op.contains("jacobian_vector_product") {
            SolverFlag::LsolveFail
        } else if op.contains("jacobian") {
            SolverFlag::LsetupFail
        } else if source.is_recoverable() {
            SolverFlag::RepResErr
        } else {
            SolverFlag::ResFail
        }),
        DaeError::LinearSolverError(LinearSolverError::FactorisationFailed(_)) => {
            Some(SolverFlag::LsetupFail)
        }
        DaeError::LinearSolverError(_) => Some(SolverFlag::LsolveFail),
        DaeError::NonLinearSolverError(_) => Some(SolverFlag::ConvFail),
        DaeError::DaeSolverError(
            DaeSolverError::TooManyErrorTestFailures { .. } | DaeSolverError::StepSizeTooSmall { .. },
        ) => Some(SolverFlag::ErrFail),
        DaeError::DaeSolverError(
            DaeSolverError::StopTimeBeforeCurrentTime { .. } | DaeSolverError::StopTimeAtCurrentTime,
        ) => Some(SolverFlag::BadT),
        DaeError::DaeSolverError(DaeSolverError::InterpolationOutOfRange { .. }) => {
            Some(SolverFlag::GetyBadT)
        }
        _ => None,
    };
    match flag {
        Some(flag) => DaeError::from(DaeSolverError::SolverFailure {
            operation,
            flag,
            time,
            detail: error.to_string(),
        }),
        None => error,
    }
}
