use nalgebra::{DMatrix, DVector};

/// Complete state of the BDF integrator between steps.
///
/// `diff` holds the modified divided differences of the state, scaled by powers of `h`, and
/// `qdiff` the same for the quadratures. Cloning a state is enough to restart the integration
/// from it, which is what the checkpoints of the backward pass rely on.
#[derive(Debug, Clone, PartialEq)]
pub struct BdfState {
    pub(crate) order: usize,
    pub(crate) diff: DMatrix<f64>,
    pub(crate) qdiff: DMatrix<f64>,
    pub(crate) y: DVector<f64>,
    pub(crate) dy: DVector<f64>,
    pub(crate) q: DVector<f64>,
    pub(crate) dq: DVector<f64>,
    pub(crate) t: f64,
    pub(crate) h: f64,
}

impl BdfState {
    pub(crate) const MAX_ORDER: usize = 5;

    pub fn new(n: usize, nq: usize) -> Self {
        Self {
            order: 1,
            diff: DMatrix::zeros(n, Self::MAX_ORDER + 3),
            qdiff: DMatrix::zeros(nq, Self::MAX_ORDER + 3),
            y: DVector::zeros(n),
            dy: DVector::zeros(n),
            q: DVector::zeros(nq),
            dq: DVector::zeros(nq),
            t: 0.0,
            h: 0.0,
        }
    }

    pub fn t(&self) -> f64 {
        self.t
    }

    pub fn h(&self) -> f64 {
        self.h
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn y(&self) -> &DVector<f64> {
        &self.y
    }

    pub fn dy(&self) -> &DVector<f64> {
        &self.dy
    }

    pub fn q(&self) -> &DVector<f64> {
        &self.q
    }

    /// Copy of the state without its quadratures.
    pub fn without_quadratures(&self) -> Self {
        Self {
            order: self.order,
            diff: self.diff.clone(),
            qdiff: DMatrix::zeros(0, Self::MAX_ORDER + 3),
            y: self.y.clone(),
            dy: self.dy.clone(),
            q: DVector::zeros(0),
            dq: DVector::zeros(0),
            t: self.t,
            h: self.h,
        }
    }

    pub fn initialise_diff_to_first_order(&mut self) {
        self.order = 1;
        self.diff.fill(0.0);
        self.diff.column_mut(0).copy_from(&self.y);
        self.diff.column_mut(1).copy_from(&self.dy);
        self.diff.column_mut(1).scale_mut(self.h);
    }

    pub fn initialise_qdiff_to_first_order(&mut self) {
        self.qdiff.fill(0.0);
        self.qdiff.column_mut(0).copy_from(&self.q);
        self.qdiff.column_mut(1).copy_from(&self.dq);
        self.qdiff.column_mut(1).scale_mut(self.h);
    }
}
