use log::trace;
use nalgebra::DVector;

use crate::{
    dae::{DaeModel, Dimensions},
    error::{DaeError, DaeSolverError},
    nonlinear_solver::LinearStrategy,
};

use super::{
    bdf::{interpolate_from_diff, Bdf, StopReason},
    bdf_state::BdfState,
    config::Interpolation,
    system::{CallbackCounters, ForwardSystem},
};

/// Snapshot of the forward integrator, and the control applied from here to the next
/// checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub(crate) state: BdfState,
    pub(crate) u: DVector<f64>,
}

impl Checkpoint {
    pub fn new(state: BdfState, u: DVector<f64>) -> Self {
        Self { state, u }
    }

    pub fn t(&self) -> f64 {
        self.state.t
    }
}

/// Dense representation of the forward trajectory between two adjacent checkpoints.
enum SegmentPoints {
    Hermite {
        ts: Vec<f64>,
        ys: Vec<DVector<f64>>,
        ydots: Vec<DVector<f64>>,
    },
    Polynomial(Vec<BdfState>),
}

struct Segment {
    index: usize,
    points: SegmentPoints,
}

impl Segment {
    fn new(index: usize, interpolation: Interpolation) -> Self {
        let points = match interpolation {
            Interpolation::Hermite => SegmentPoints::Hermite {
                ts: Vec::new(),
                ys: Vec::new(),
                ydots: Vec::new(),
            },
            Interpolation::Polynomial => SegmentPoints::Polynomial(Vec::new()),
        };
        Self { index, points }
    }

    fn push(&mut self, state: &BdfState) {
        match &mut self.points {
            SegmentPoints::Hermite { ts, ys, ydots } => {
                ts.push(state.t);
                ys.push(state.y.clone());
                ydots.push(state.dy.clone());
            }
            SegmentPoints::Polynomial(states) => states.push(state.without_quadratures()),
        }
    }

    fn interpolate(&self, t: f64, y: &mut DVector<f64>) {
        match &self.points {
            SegmentPoints::Hermite { ts, ys, ydots } => {
                let idx = ts.partition_point(|&tk| tk < t);
                if idx == 0 {
                    y.copy_from(&ys[0]);
                    return;
                }
                if idx == ts.len() {
                    y.copy_from(&ys[idx - 1]);
                    return;
                }
                let (t0, t1) = (ts[idx - 1], ts[idx]);
                let h = t1 - t0;
                let s = (t - t0) / h;
                let s2 = s * s;
                let s3 = s2 * s;
                let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
                let h10 = s3 - 2.0 * s2 + s;
                let h01 = -2.0 * s3 + 3.0 * s2;
                let h11 = s3 - s2;
                y.copy_from(&ys[idx - 1]);
                *y *= h00;
                y.axpy(h10 * h, &ydots[idx - 1], 1.0);
                y.axpy(h01, &ys[idx], 1.0);
                y.axpy(h11 * h, &ydots[idx], 1.0);
            }
            SegmentPoints::Polynomial(states) => {
                let idx = states.partition_point(|s| s.t < t);
                if idx == 0 {
                    y.copy_from(&states[0].y);
                    return;
                }
                let s = &states[idx.min(states.len() - 1)];
                interpolate_from_diff(t, &s.diff, s.t, s.h, s.order, y);
            }
        }
    }
}

/// Read cursor of one backward problem over the checkpointed forward trajectory.
///
/// A query in a segment that is not cached re-integrates the forward problem from the
/// checkpoint that opens the segment, storing every step. The two most recently used
/// segments are kept, so that the backward Newton iterations straddling a checkpoint do
/// not replay the same segment repeatedly.
pub struct TrajectoryCursor {
    interpolation: Interpolation,
    solver: Bdf,
    strategy: Box<dyn LinearStrategy>,
    segment: Option<Segment>,
    previous: Option<Segment>,
    y: DVector<f64>,
    counters: CallbackCounters,
    n_replays: usize,
}

impl TrajectoryCursor {
    /// `solver` and `strategy` replay the forward problem, `solver` integrates no quadratures.
    pub fn new(
        interpolation: Interpolation,
        solver: Bdf,
        strategy: Box<dyn LinearStrategy>,
        n: usize,
    ) -> Self {
        Self {
            interpolation,
            solver,
            strategy,
            segment: None,
            previous: None,
            y: DVector::zeros(n),
            counters: CallbackCounters::default(),
            n_replays: 0,
        }
    }

    /// Forward state `[x; z]` at the last time passed to [Self::seek].
    pub fn y(&self) -> &DVector<f64> {
        &self.y
    }

    pub fn n_replays(&self) -> usize {
        self.n_replays
    }

    /// Forget the cached segments, needed whenever the checkpoints are rewritten.
    pub fn invalidate(&mut self) {
        self.segment = None;
        self.previous = None;
    }

    /// Recover the forward state at time `t`.
    pub fn seek<M: DaeModel + ?Sized>(
        &mut self,
        model: &M,
        dims: Dimensions,
        p: &DVector<f64>,
        checkpoints: &[Checkpoint],
        t: f64,
    ) -> Result<(), DaeError> {
        let (t_min, t_max) = match (checkpoints.first(), checkpoints.last()) {
            (Some(first), Some(last)) => (first.t(), last.t()),
            _ => {
                return Err(DaeError::from(DaeSolverError::InterpolationOutOfRange {
                    t,
                    t_min: f64::NAN,
                    t_max: f64::NAN,
                }))
            }
        };
        let troundoff = 1000.0 * f64::EPSILON * (1.0 + t_min.abs() + t_max.abs());
        if t < t_min - troundoff || t > t_max + troundoff {
            return Err(DaeError::from(DaeSolverError::InterpolationOutOfRange {
                t,
                t_min,
                t_max,
            }));
        }
        let t = t.clamp(t_min, t_max);
        if checkpoints.len() == 1 {
            self.y.copy_from(&checkpoints[0].state.y);
            return Ok(());
        }

        let index = checkpoints
            .partition_point(|c| c.t() <= t)
            .saturating_sub(1)
            .min(checkpoints.len() - 2);
        if self.segment.as_ref().map(|s| s.index) != Some(index) {
            if self.previous.as_ref().map(|s| s.index) == Some(index) {
                std::mem::swap(&mut self.segment, &mut self.previous);
            } else {
                let segment = self.replay(model, dims, p, checkpoints, index)?;
                self.previous = self.segment.replace(segment);
            }
        }
        if let Some(segment) = &self.segment {
            segment.interpolate(t, &mut self.y);
        }
        Ok(())
    }

    fn replay<M: DaeModel + ?Sized>(
        &mut self,
        model: &M,
        dims: Dimensions,
        p: &DVector<f64>,
        checkpoints: &[Checkpoint],
        index: usize,
    ) -> Result<Segment, DaeError> {
        let start = &checkpoints[index];
        let t_end = checkpoints[index + 1].t();
        let mut segment = Segment::new(index, self.interpolation);
        segment.push(&start.state);
        self.n_replays += 1;

        let troundoff = 100.0 * f64::EPSILON * (start.t().abs() + t_end.abs());
        if (t_end - start.t()).abs() <= troundoff {
            return Ok(segment);
        }
        trace!(
            "replaying forward segment {} on [{}, {}]",
            index,
            start.t(),
            t_end
        );
        self.solver
            .set_state(start.state.without_quadratures(), &mut *self.strategy);
        let mut system = ForwardSystem {
            model,
            dims,
            p,
            u: &start.u,
            counters: &mut self.counters,
        };
        self.solver.set_stop_time(t_end)?;
        loop {
            let reason = self.solver.step(&mut system, &mut *self.strategy)?;
            segment.push(self.solver.state());
            if reason == StopReason::TstopReached {
                break;
            }
        }
        Ok(segment)
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::DVector;

    use super::*;
    use crate::{
        dae::test_models::exponential_decay::ExponentialDecay,
        dae_solver::{
            bdf::BdfOptions,
            config::{BdfConfig, DaeConfig},
            system::build_strategy,
        },
    };

    // x' = -x + u on [0, 1] with u = 0 on [0, 0.5) and u = 1 after, checkpointed every 5 steps
    fn forward_checkpoints(model: &ExponentialDecay, p: &DVector<f64>) -> Vec<Checkpoint> {
        let dims = model.dimensions();
        let config = DaeConfig::default();
        let mut counters = CallbackCounters::default();
        let mut checkpoints = Vec::new();
        let mut options = BdfOptions::new(1e-8, DVector::from_element(1, 1e-10));
        options.quad_atol = 1e-10;
        let mut bdf = Bdf::new(1, 1, options, BdfConfig::default());

        let u0 = DVector::zeros(1);
        let mut system = ForwardSystem {
            model,
            dims,
            p,
            u: &u0,
            counters: &mut counters,
        };
        let mut strategy = build_strategy(&config, &system, true).unwrap();
        let y0 = DVector::from_element(1, 1.0);
        let dy0 = DVector::from_element(1, -1.0);
        bdf.reinit(&mut system, &mut *strategy, 0.0, &y0, &dy0, &DVector::zeros(1), 1e-4)
            .unwrap();
        for (u, t_stop) in [(0.0, 0.5), (1.0, 1.0)] {
            let u = DVector::from_element(1, u);
            let mut system = ForwardSystem {
                model,
                dims,
                p,
                u: &u,
                counters: &mut counters,
            };
            checkpoints.push(Checkpoint::new(bdf.checkpoint(&mut *strategy), u.clone()));
            bdf.set_stop_time(t_stop).unwrap();
            let mut n = 0;
            while bdf.step(&mut system, &mut *strategy).unwrap() != StopReason::TstopReached {
                n += 1;
                if n % 5 == 0 {
                    checkpoints.push(Checkpoint::new(bdf.checkpoint(&mut *strategy), u.clone()));
                }
            }
        }
        checkpoints.push(Checkpoint::new(
            bdf.checkpoint(&mut *strategy),
            DVector::from_element(1, 1.0),
        ));
        checkpoints
    }

    fn exact(t: f64) -> f64 {
        if t <= 0.5 {
            (-t).exp()
        } else {
            let x_half = (-0.5f64).exp();
            1.0 + (x_half - 1.0) * (-(t - 0.5)).exp()
        }
    }

    fn replay_cursor(
        model: &ExponentialDecay,
        p: &DVector<f64>,
        interpolation: Interpolation,
    ) -> TrajectoryCursor {
        let config = DaeConfig::default();
        let u = DVector::zeros(1);
        let mut counters = CallbackCounters::default();
        let system = ForwardSystem {
            model,
            dims: model.dimensions(),
            p,
            u: &u,
            counters: &mut counters,
        };
        let strategy = build_strategy(&config, &system, true).unwrap();
        let bdf = Bdf::new(
            1,
            0,
            BdfOptions::new(1e-8, DVector::from_element(1, 1e-10)),
            BdfConfig::default(),
        );
        TrajectoryCursor::new(interpolation, bdf, strategy, 1)
    }

    #[test]
    fn recovers_trajectory_between_checkpoints() {
        let model = ExponentialDecay::new();
        let p = DVector::from_element(1, 1.0);
        let checkpoints = forward_checkpoints(&model, &p);
        assert!(checkpoints.len() > 3);
        for interpolation in [Interpolation::Hermite, Interpolation::Polynomial] {
            let mut cursor = replay_cursor(&model, &p, interpolation);
            // backward order, as during a retreat
            for i in (0..=40).rev() {
                let t = i as f64 / 40.0;
                cursor
                    .seek(&model, model.dimensions(), &p, &checkpoints, t)
                    .unwrap();
                approx::assert_relative_eq!(cursor.y()[0], exact(t), epsilon = 1e-6);
            }
            // each segment is replayed once
            assert!(cursor.n_replays() <= checkpoints.len() - 1);
        }
    }

    #[test]
    fn rejects_times_outside_trajectory() {
        let model = ExponentialDecay::new();
        let p = DVector::from_element(1, 1.0);
        let checkpoints = forward_checkpoints(&model, &p);
        let mut cursor = replay_cursor(&model, &p, Interpolation::Hermite);
        let err = cursor
            .seek(&model, model.dimensions(), &p, &checkpoints, 1.5)
            .unwrap_err();
        assert!(matches!(
            err,
            DaeError::DaeSolverError(DaeSolverError::InterpolationOutOfRange { .. })
        ));
        assert!(cursor
            .seek(&model, model.dimensions(), &p, &[], 0.5)
            .is_err());
    }
}
