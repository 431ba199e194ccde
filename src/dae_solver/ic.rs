use log::debug;
use nalgebra::DVector;

use crate::{
    error::{DaeError, NonLinearSolverError},
    non_linear_solver_error,
    nonlinear_solver::{wrms_norm, LinearStrategy, NewtonPoint, NewtonSystem},
};

const MAX_ATTEMPTS: usize = 4;
const MAX_ITERATIONS: usize = 10;

/// Make `(y, ydot)` consistent at `t`, holding the differential states fixed.
///
/// The unknowns are the algebraic states and the derivatives of the differential states.
/// Each attempt runs a modified Newton iteration on the Newton matrix evaluated with
/// `cj = 1 / hic`, where `hic` starts at a thousandth of the distance to `tout1` and is
/// reduced tenfold after every failed attempt.
pub fn calc_ic(
    system: &mut dyn NewtonSystem,
    strategy: &mut dyn LinearStrategy,
    t: f64,
    tout1: f64,
    y: &mut DVector<f64>,
    ydot: &mut DVector<f64>,
    weight: &DVector<f64>,
    tol: f64,
) -> Result<(), DaeError> {
    let nx = system.layout().nx();
    let n = y.len();
    let mut hic = 0.001 * (tout1 - t).abs();
    if hic == 0.0 {
        hic = 1e-6 * (1.0 + t.abs());
    }
    let mut delta = DVector::zeros(n);
    let mut last_error = non_linear_solver_error!(NewtonDidNotConverge);

    for attempt in 0..MAX_ATTEMPTS {
        let cj = 1.0 / hic;
        match correct(system, strategy, t, cj, y, ydot, weight, tol, &mut delta, nx) {
            Ok(niter) => {
                debug!(
                    "consistent initial conditions at t = {} after {} iterations (attempt {})",
                    t,
                    niter,
                    attempt + 1
                );
                strategy.invalidate();
                return Ok(());
            }
            Err(e) if e.is_recoverable() => last_error = e,
            Err(e) => return Err(e),
        }
        hic *= 0.1;
    }
    strategy.invalidate();
    Err(last_error)
}

#[allow(clippy::too_many_arguments)]
fn correct(
    system: &mut dyn NewtonSystem,
    strategy: &mut dyn LinearStrategy,
    t: f64,
    cj: f64,
    y: &mut DVector<f64>,
    ydot: &mut DVector<f64>,
    weight: &DVector<f64>,
    tol: f64,
    delta: &mut DVector<f64>,
    nx: usize,
) -> Result<usize, DaeError> {
    let point = NewtonPoint { t, y: &*y, cj };
    strategy.setup(system, &point)?;
    for niter in 1..=MAX_ITERATIONS {
        system.residual(t, y, ydot, delta)?;
        let point = NewtonPoint { t, y: &*y, cj };
        strategy.solve(system, &point, delta, weight)?;
        for i in 0..nx {
            ydot[i] -= cj * delta[i];
        }
        for i in nx..y.len() {
            y[i] -= delta[i];
        }
        if !y.iter().chain(ydot.iter()).all(|v| v.is_finite()) {
            return Err(non_linear_solver_error!(NewtonDiverged));
        }
        if wrms_norm(delta, weight, None) <= tol {
            return Ok(niter);
        }
    }
    Err(non_linear_solver_error!(NewtonDidNotConverge))
}

/// Size of the first step towards `tout1`, bounded so that the derivative changes the
/// state by at most half the error tolerance.
pub fn initial_step(
    t0: f64,
    tout1: f64,
    ydot: &DVector<f64>,
    weight: &DVector<f64>,
    differential: Option<&[bool]>,
    max_step_size: f64,
) -> f64 {
    let mut h = 0.001 * (tout1 - t0).abs();
    if h == 0.0 {
        h = 1e-6 * (1.0 + t0.abs());
    }
    let ypnorm = wrms_norm(ydot, weight, differential);
    if ypnorm * h > 0.5 {
        h = 0.5 / ypnorm;
    }
    if max_step_size > 0.0 {
        h = h.min(max_step_size);
    }
    if tout1 < t0 {
        -h
    } else {
        h
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::DVector;

    use super::*;
    use crate::{
        dae::{
            test_models::{
                decay_with_algebraic::DecayWithAlgebraic, exponential_decay::ExponentialDecay,
            },
            DaeModel,
        },
        dae_solver::{
            config::DaeConfig,
            system::{build_strategy, CallbackCounters, ForwardSystem},
        },
    };

    #[test]
    fn corrects_algebraic_state_and_derivative() {
        let model = DecayWithAlgebraic;
        let p = DVector::from_element(1, 2.0);
        let u = DVector::zeros(0);
        let mut counters = CallbackCounters::default();
        let mut system = ForwardSystem {
            model: &model,
            dims: model.dimensions(),
            p: &p,
            u: &u,
            counters: &mut counters,
        };
        let mut strategy = build_strategy(&DaeConfig::default(), &system, true).unwrap();
        let mut y = DVector::from_vec(vec![1.5, 0.3]);
        let mut ydot = DVector::zeros(2);
        let weight = DVector::from_element(2, 1e6);
        calc_ic(&mut system, &mut *strategy, 0.0, 1.0, &mut y, &mut ydot, &weight, 0.0033)
            .unwrap();
        approx::assert_relative_eq!(y[0], 1.5);
        approx::assert_relative_eq!(y[1], 1.5, epsilon = 1e-8);
        approx::assert_relative_eq!(ydot[0], -3.0, epsilon = 1e-6);
        let mut r = DVector::zeros(2);
        system.residual(0.0, &y, &ydot, &mut r).unwrap();
        assert!(r.amax() < 1e-6);
    }

    #[test]
    fn derivative_of_pure_ode() {
        let model = ExponentialDecay::new();
        let p = DVector::from_element(1, 1.0);
        let u = DVector::from_element(1, 0.5);
        let mut counters = CallbackCounters::default();
        let mut system = ForwardSystem {
            model: &model,
            dims: model.dimensions(),
            p: &p,
            u: &u,
            counters: &mut counters,
        };
        let mut strategy = build_strategy(&DaeConfig::default(), &system, true).unwrap();
        let mut y = DVector::from_element(1, 2.0);
        let mut ydot = DVector::zeros(1);
        let weight = DVector::from_element(1, 1e6);
        calc_ic(&mut system, &mut *strategy, 0.0, 1.0, &mut y, &mut ydot, &weight, 0.0033)
            .unwrap();
        approx::assert_relative_eq!(ydot[0], -1.5, epsilon = 1e-6);
        assert!(!strategy.is_setup());
    }

    #[test]
    fn first_step_bounded_by_derivative() {
        let weight = DVector::from_element(1, 1e4);
        let slow = DVector::from_element(1, 1e-3);
        approx::assert_relative_eq!(initial_step(0.0, 10.0, &slow, &weight, None, 0.0), 0.01);
        let fast = DVector::from_element(1, 10.0);
        approx::assert_relative_eq!(initial_step(0.0, 10.0, &fast, &weight, None, 0.0), 5e-6);
        approx::assert_relative_eq!(initial_step(0.0, 10.0, &slow, &weight, None, 1e-3), 1e-3);
        approx::assert_relative_eq!(initial_step(10.0, 0.0, &slow, &weight, None, 0.0), -0.01);
    }
}
