use log::trace;
use nalgebra::DVector;

use crate::error::DaeError;

use super::{KrylovConfig, KrylovResult, LinearOperator};

/// Right-preconditioned BiCGSTAB, at most `max_krylov` iterations.
pub fn bicgstab(
    op: &mut impl LinearOperator,
    b: &DVector<f64>,
    config: &KrylovConfig,
) -> Result<(DVector<f64>, KrylovResult), DaeError> {
    let n = op.nrows();
    let mut x = DVector::<f64>::zeros(n);
    let mut r = b.clone();
    let mut residual = r.norm();
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

    let r_hat = r.clone();
    let (mut rho, mut alpha, mut omega) = (1.0, 1.0, 1.0);
    let mut p = DVector::<f64>::zeros(n);
    let mut v = DVector::<f64>::zeros(n);
    let mut p_hat = DVector::<f64>::zeros(n);
    let mut s_hat = DVector::<f64>::zeros(n);
    let mut t = DVector::<f64>::zeros(n);

    for i in 1..=config.max_krylov.max(1) {
        let rho_new = r_hat.dot(&r);
        if rho_new == 0.0 {
            trace!("bicgstab breakdown (rho = 0) at iteration {i}");
            break;
        }
        let beta = (rho_new / rho) * (alpha / omega);
        // p = r + beta (p - omega v)
        p.axpy(-omega, &v, 1.0);
        p.axpy(1.0, &r, beta);

        op.precondition(&p, &mut p_hat)?;
        op.apply(&p_hat, &mut v)?;
        let r_hat_v = r_hat.dot(&v);
        if r_hat_v == 0.0 {
            trace!("bicgstab breakdown (r_hat . v = 0) at iteration {i}");
            break;
        }
        alpha = rho_new / r_hat_v;

        // s is stored in r
        r.axpy(-alpha, &v, 1.0);
        let s_norm = r.norm();
        if s_norm <= config.tol {
            x.axpy(alpha, &p_hat, 1.0);
            return Ok((
                x,
                KrylovResult {
                    iterations: i,
                    residual: s_norm,
                    converged: true,
                },
            ));
        }

        op.precondition(&r, &mut s_hat)?;
        op.apply(&s_hat, &mut t)?;
        let tt = t.dot(&t);
        if tt == 0.0 {
            trace!("bicgstab breakdown (t = 0) at iteration {i}");
            break;
        }
        omega = t.dot(&r) / tt;
        x.axpy(alpha, &p_hat, 1.0);
        x.axpy(omega, &s_hat, 1.0);
        r.axpy(-omega, &t, 1.0);
        residual = r.norm();
        if residual <= config.tol {
            return Ok((
                x,
                KrylovResult {
                    iterations: i,
                    residual,
                    converged: true,
                },
            ));
        }
        if omega == 0.0 {
            break;
        }
        rho = rho_new;
    }
    Ok((
        x,
        KrylovResult {
            iterations: config.max_krylov,
            residual,
            converged: false,
        },
    ))
}
