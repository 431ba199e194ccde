/// Outcome of the last attempt, used to decide whether the Newton matrix is re-evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverState {
    StepSuccess,
    FirstConvergenceFail,
    SecondConvergenceFail,
    ErrorTestFail,
    Checkpoint,
}

/// Tracks the age of the Newton matrix setup.
///
/// A setup goes stale after `update_after_steps` steps, or when `cj` has moved by more than
/// `threshold` relative to its value at the last setup.
#[derive(Debug, Clone)]
pub struct JacobianUpdate {
    steps_since_setup: usize,
    cj_at_last_setup: f64,
    threshold: f64,
    update_after_steps: usize,
}

impl JacobianUpdate {
    pub fn new() -> Self {
        Self {
            steps_since_setup: 0,
            cj_at_last_setup: 0.0,
            threshold: 0.3,
            update_after_steps: 20,
        }
    }

    pub fn update_jacobian(&mut self, cj: f64) {
        self.steps_since_setup = 0;
        self.cj_at_last_setup = cj;
    }

    pub fn step(&mut self) {
        self.steps_since_setup += 1;
    }

    pub fn check_jacobian_update(&self, cj: f64, state: SolverState) -> bool {
        match state {
            SolverState::StepSuccess => {
                self.cj_at_last_setup == 0.0
                    || self.steps_since_setup >= self.update_after_steps
                    || (cj / self.cj_at_last_setup - 1.0).abs() > self.threshold
            }
            SolverState::FirstConvergenceFail
            | SolverState::SecondConvergenceFail
            | SolverState::ErrorTestFail
            | SolverState::Checkpoint => true,
        }
    }
}

impl Default for JacobianUpdate {
    fn default() -> Self {
        Self::new()
    }
}
