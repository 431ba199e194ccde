use log::trace;
use nalgebra::{DMatrix, DVector};

use crate::error::DaeError;

use super::{true_residual, KrylovConfig, KrylovResult, LinearOperator};

/// Restarted GMRES with modified Gram-Schmidt and Givens rotations.
///
/// Each cycle builds a Krylov basis of `A P^-1` of size at most `max_krylov`, at most
/// `1 + max_restarts` cycles are run.
pub fn gmres(
    op: &mut impl LinearOperator,
    b: &DVector<f64>,
    config: &KrylovConfig,
) -> Result<(DVector<f64>, KrylovResult), DaeError> {
    let n = op.nrows();
    let m = config.max_krylov.max(1);
    let mut x = DVector::zeros(n);
    let mut r = b.clone();
    let mut beta = r.norm();
    let mut iterations = 0;
    if beta <= config.tol {
        return Ok((
            x,
            KrylovResult {
                iterations,
                residual: beta,
                converged: true,
            },
        ));
    }

    let mut basis: Vec<DVector<f64>> = Vec::with_capacity(m + 1);
    let mut h = DMatrix::<f64>::zeros(m + 1, m);
    let mut cs = vec![0.0; m];
    let mut sn = vec![0.0; m];
    let mut g = DVector::<f64>::zeros(m + 1);
    let mut z = DVector::<f64>::zeros(n);
    let mut w = DVector::<f64>::zeros(n);

    for cycle in 0..=config.max_restarts {
        basis.clear();
        basis.push(&r / beta);
        h.fill(0.0);
        g.fill(0.0);
        g[0] = beta;

        let mut k = 0;
        let mut residual = beta;
        for j in 0..m {
            op.precondition(&basis[j], &mut z)?;
            op.apply(&z, &mut w)?;
            for (i, v) in basis.iter().enumerate() {
                let hij = w.dot(v);
                h[(i, j)] = hij;
                w.axpy(-hij, v, 1.0);
            }
            let h_next = w.norm();
            h[(j + 1, j)] = h_next;

            for i in 0..j {
                let temp = cs[i] * h[(i, j)] + sn[i] * h[(i + 1, j)];
                h[(i + 1, j)] = -sn[i] * h[(i, j)] + cs[i] * h[(i + 1, j)];
                h[(i, j)] = temp;
            }
            let denom = h[(j, j)].hypot(h[(j + 1, j)]);
            if denom == 0.0 {
                break;
            }
            cs[j] = h[(j, j)] / denom;
            sn[j] = h[(j + 1, j)] / denom;
            h[(j, j)] = denom;
            h[(j + 1, j)] = 0.0;
            g[j + 1] = -sn[j] * g[j];
            g[j] *= cs[j];

            iterations += 1;
            k = j + 1;
            residual = g[j + 1].abs();
            if residual <= config.tol || h_next == 0.0 {
                break;
            }
            basis.push(&w / h_next);
        }

        // back substitution on the triangular part of h
        let mut y = DVector::<f64>::zeros(k);
        for i in (0..k).rev() {
            let mut s = g[i];
            for l in (i + 1)..k {
                s -= h[(i, l)] * y[l];
            }
            y[i] = s / h[(i, i)];
        }
        w.fill(0.0);
        for (i, yi) in y.iter().enumerate() {
            w.axpy(*yi, &basis[i], 1.0);
        }
        op.precondition(&w, &mut z)?;
        x += &z;

        trace!("gmres cycle {cycle}: {iterations} iterations, estimated residual {residual:e}");
        beta = true_residual(op, b, &x, &mut r)?;
        if beta <= config.tol {
            return Ok((
                x,
                KrylovResult {
                    iterations,
                    residual: beta,
                    converged: true,
                },
            ));
        }
        if k == 0 {
            break;
        }
    }
    Ok((
        x,
        KrylovResult {
            iterations,
            residual: beta,
            converged: false,
        },
    ))
}

#[cfg(test)]
mod tests {
    use nalgebra::DVector;

    use super::super::{tests::*, KrylovMethod};
    use super::*;

    #[test]
    fn solves_small_system() {
        check_method(KrylovMethod::Gmres, false);
        check_method(KrylovMethod::Gmres, true);
    }

    #[test]
    fn restarts_with_small_subspace() {
        let (a, b, x_exact) = test_system();
        let mut op = DenseOperator::new(a, false);
        let config = KrylovConfig {
            tol: 1e-10,
            max_krylov: 2,
            max_restarts: 500,
        };
        let (x, result) = gmres(&mut op, &b, &config).unwrap();
        assert!(result.converged);
        assert!(result.iterations > 2);
        approx::assert_relative_eq!(x, x_exact, epsilon = 1e-8);
    }

    #[test]
    fn reports_failure_when_budget_is_exhausted() {
        let (a, b, _) = test_system();
        let mut op = DenseOperator::new(a, false);
        let config = KrylovConfig {
            tol: 1e-14,
            max_krylov: 1,
            max_restarts: 0,
        };
        let (x, result) = gmres(&mut op, &b, &config).unwrap();
        assert!(!result.converged);
        assert_eq!(result.iterations, 1);
        assert_eq!(x.len(), 5);
        assert!(result.residual < DVector::norm(&b));
    }
}
