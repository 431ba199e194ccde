/// Convergence test of the Newton iteration on weighted RMS norms of the corrections.
///
/// The convergence rate estimate `eta` survives between calls to [Convergence::reset], so the
/// first iteration of a new step can be accepted using the rate observed on the previous
/// one. It is reset to a conservative value whenever the Newton matrix is re-evaluated.
#[derive(Debug, Clone)]
pub struct Convergence {
    tol: f64,
    max_iter: usize,
    niter: usize,
    old_norm: Option<f64>,
    eta: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    Converged,
    Diverged,
    Continue,
    MaximumIterations,
}

impl Convergence {
    const INITIAL_ETA: f64 = 20.0;

    pub fn new(tol: f64, max_iter: usize) -> Self {
        Self {
            tol,
            max_iter,
            niter: 0,
            old_norm: None,
            eta: Self::INITIAL_ETA,
        }
    }
    pub fn max_iter(&self) -> usize {
        self.max_iter
    }
    pub fn niter(&self) -> usize {
        self.niter
    }
    pub fn eta(&self) -> f64 {
        self.eta
    }
    pub fn tol(&self) -> f64 {
        self.tol
    }
    pub fn reset_eta(&mut self) {
        self.eta = Self::INITIAL_ETA;
    }
    pub fn reset(&mut self) {
        self.niter = 0;
        self.old_norm = None;
    }

    pub fn check_new_iteration(&mut self, norm: f64) -> ConvergenceStatus {
        self.niter += 1;
        // if norm is zero then we are done
        if norm <= f64::EPSILON {
            return ConvergenceStatus::Converged;
        }
        if let Some(old_norm) = self.old_norm {
            let rate = (norm / old_norm).powf(1.0 / (self.niter - 1) as f64);

            // check if iteration is diverging
            if rate > 0.9 {
                return ConvergenceStatus::Diverged;
            }

            // if iteration is not going to converge in max_iter
            // (assuming the current rate), then abort
            let remaining = self.max_iter.saturating_sub(self.niter) as i32;
            if rate.powi(remaining) / (1.0 - rate) * norm > self.tol {
                return ConvergenceStatus::Diverged;
            }
            self.eta = rate / (1.0 - rate);
        } else {
            self.old_norm = Some(norm);
        }

        if self.eta * norm < self.tol {
            return ConvergenceStatus::Converged;
        }
        if self.niter >= self.max_iter {
            return ConvergenceStatus::MaximumIterations;
        }
        ConvergenceStatus::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_on_fast_contraction() {
        let mut c = Convergence::new(0.33, 4);
        // eta = 20 on the first iteration
        assert_eq!(c.check_new_iteration(1e-1), ConvergenceStatus::Continue);
        // rate 1e-3
        assert_eq!(c.check_new_iteration(1e-4), ConvergenceStatus::Converged);
        approx::assert_relative_eq!(c.eta(), 1e-3 / (1.0 - 1e-3), epsilon = 1e-12);
        // the rate estimate is kept for the next step
        c.reset();
        assert_eq!(c.check_new_iteration(1e-2), ConvergenceStatus::Converged);
        c.reset_eta();
        c.reset();
        assert_eq!(c.check_new_iteration(1e-1), ConvergenceStatus::Continue);
    }

    #[test]
    fn detects_divergence() {
        let mut c = Convergence::new(0.33, 4);
        assert_eq!(c.check_new_iteration(1.0), ConvergenceStatus::Continue);
        assert_eq!(c.check_new_iteration(2.0), ConvergenceStatus::Diverged);
    }

    #[test]
    fn stops_at_max_iter() {
        let mut c = Convergence::new(1e-12, 1);
        assert_eq!(c.check_new_iteration(1.0), ConvergenceStatus::MaximumIterations);
        assert_eq!(c.niter(), 1);
    }
}
