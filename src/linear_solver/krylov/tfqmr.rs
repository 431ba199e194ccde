use log::trace;
use nalgebra::DVector;

use crate::error::DaeError;

use super::{true_residual, KrylovConfig, KrylovResult, LinearOperator};

/// Transpose-free QMR on `A P^-1`, at most `max_krylov` iterations of two half-steps each.
///
/// The quasi-residual bound `tau * sqrt(m + 1)` is used as a cheap stopping test, which is
/// then confirmed against the true residual.
pub fn tfqmr(
    op: &mut impl LinearOperator,
    b: &DVector<f64>,
    config: &KrylovConfig,
) -> Result<(DVector<f64>, KrylovResult), DaeError> {
    let n = op.nrows();
    let mut x = DVector::<f64>::zeros(n);
    let mut residual = b.norm();
    if residual <= config.tol {
        return Ok((
            x,
            KrylovResult {
                iterations: 0,
                residual,
                converged: true,
            },
        ));
    }

    // iterate in the preconditioned variable y, x = P^-1 y
    let mut y = DVector::<f64>::zeros(n);
    let mut tmp = DVector::<f64>::zeros(n);
    let mut r = DVector::<f64>::zeros(n);

    let r_star = b.clone();
    let mut w = b.clone();
    let mut u = b.clone();
    let mut au = DVector::<f64>::zeros(n);
    apply_preconditioned(op, &u, &mut tmp, &mut au)?;
    let mut v = au.clone();
    let mut u_next = DVector::<f64>::zeros(n);
    let mut d = DVector::<f64>::zeros(n);

    let mut tau = residual;
    let mut theta = 0.0;
    let mut eta = 0.0;
    let mut rho = r_star.dot(&b);
    let mut alpha = 0.0;

    let max_half_steps = 2 * config.max_krylov.max(1);
    for m in 0..max_half_steps {
        let even = m % 2 == 0;
        if even {
            let sigma = r_star.dot(&v);
            if sigma == 0.0 {
                trace!("tfqmr breakdown (sigma = 0) at half-step {m}");
                break;
            }
            alpha = rho / sigma;
            u_next.copy_from(&u);
            u_next.axpy(-alpha, &v, 1.0);
        }
        w.axpy(-alpha, &au, 1.0);
        // d = u + (theta^2 eta / alpha) d
        d.axpy(1.0, &u, theta * theta * eta / alpha);
        theta = w.norm() / tau;
        let c = 1.0 / (1.0 + theta * theta).sqrt();
        tau *= theta * c;
        eta = c * c * alpha;
        y.axpy(eta, &d, 1.0);

        if tau * ((m + 2) as f64).sqrt() <= config.tol {
            op.precondition(&y, &mut x)?;
            residual = true_residual(op, b, &x, &mut r)?;
            if residual <= config.tol {
                return Ok((
                    x,
                    KrylovResult {
                        iterations: m / 2 + 1,
                        residual,
                        converged: true,
                    },
                ));
            }
        }

        if even {
            std::mem::swap(&mut u, &mut u_next);
            apply_preconditioned(op, &u, &mut tmp, &mut au)?;
        } else {
            let rho_new = r_star.dot(&w);
            if rho == 0.0 {
                trace!("tfqmr breakdown (rho = 0) at half-step {m}");
                break;
            }
            let beta = rho_new / rho;
            rho = rho_new;
            // v = A u_new + beta (A u + beta v)
            v.axpy(1.0, &au, beta);
            u.axpy(1.0, &w, beta);
            apply_preconditioned(op, &u, &mut tmp, &mut au)?;
            v.axpy(1.0, &au, beta);
        }
    }

    op.precondition(&y, &mut x)?;
    residual = true_residual(op, b, &x, &mut r)?;
    let converged = residual <= config.tol;
    Ok((
        x,
        KrylovResult {
            iterations: config.max_krylov,
            residual,
            converged,
        },
    ))
}

/// `out = A P^-1 v`
fn apply_preconditioned(
    op: &mut impl LinearOperator,
    v: &DVector<f64>,
    tmp: &mut DVector<f64>,
    out: &mut DVector<f64>,
) -> Result<(), DaeError> {
    op.precondition(v, tmp)?;
    op.apply(tmp, out)
}

#[cfg(test)]
mod tests {
    use super::super::{tests::*, KrylovMethod};

    #[test]
    fn solves_small_system() {
        check_method(KrylovMethod::Tfqmr, false);
        check_method(KrylovMethod::Tfqmr, true);
    }
}
