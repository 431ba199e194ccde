use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use daesol::{
    dae::test_models::{
        decay_with_algebraic::DecayWithAlgebraic, exponential_decay::ExponentialDecay,
        exponential_decay_sens::DecaySensitivities,
    },
    DaeConfig, DaeIntegrator, DaeModel,
};
use nalgebra::DVector;

fn config(scheme: &str) -> DaeConfig {
    let mut config = DaeConfig::default();
    config.grid = (1..=10).map(|i| f64::from(i) * 0.5).collect();
    config.set_option("newton_scheme", scheme).unwrap();
    config
}

fn forward<M: DaeModel>(integrator: &DaeIntegrator<M>) -> f64 {
    let dims = integrator.dimensions();
    let mut memory = integrator.create_memory().unwrap();
    memory
        .reset(
            &DVector::from_element(dims.nx, 1.0),
            &DVector::from_element(dims.nz, 1.0),
            &DVector::from_element(dims.np, 0.5),
        )
        .unwrap();
    let u = DVector::zeros(dims.nu);
    let mut x = 0.0;
    for &t in &integrator.config().grid {
        x = memory.advance(&u, t).unwrap().x[0];
    }
    x
}

fn forward_and_adjoint<M: DaeModel>(integrator: &DaeIntegrator<M>) -> f64 {
    let dims = integrator.dimensions();
    let mut memory = integrator.create_memory().unwrap();
    memory
        .reset(
            &DVector::from_element(dims.nx, 1.0),
            &DVector::from_element(dims.nz, 1.0),
            &DVector::from_element(dims.np, 0.5),
        )
        .unwrap();
    let u = DVector::zeros(dims.nu);
    let grid = integrator.config().grid.clone();
    for &t in &grid {
        memory.advance(&u, t).unwrap();
    }
    memory
        .reset_backward(
            0,
            &DVector::from_element(dims.nrx, 1.0),
            &DVector::zeros(dims.nrz),
            &DVector::zeros(dims.nrp),
        )
        .unwrap();
    let mut rq = 0.0;
    for &t in grid.iter().rev().skip(1).chain(std::iter::once(&0.0)) {
        rq = memory.retreat(0, &u, t).unwrap().rq[0];
    }
    rq
}

fn criterion_benchmark(c: &mut Criterion) {
    macro_rules! bench {
        ($name:ident, $run:ident, $model:expr, $scheme:literal) => {
            c.bench_function(stringify!($name), |b| {
                let integrator = DaeIntegrator::new(Arc::new($model), config($scheme)).unwrap();
                b.iter(|| $run(&integrator))
            });
        };
    }

    bench!(direct_exponential_decay, forward, ExponentialDecay::new(), "direct");
    bench!(gmres_exponential_decay, forward, ExponentialDecay::new(), "gmres");
    bench!(direct_decay_with_algebraic, forward, DecayWithAlgebraic, "direct");
    bench!(tfqmr_decay_with_algebraic, forward, DecayWithAlgebraic, "tfqmr");
    bench!(
        direct_decay_sensitivities,
        forward,
        DecaySensitivities { dp: vec![1.0, 0.5, 0.25] },
        "direct"
    );
    bench!(
        direct_adjoint_exponential_decay,
        forward_and_adjoint,
        ExponentialDecay::with_adjoint(),
        "direct"
    );
    bench!(
        bcgstab_adjoint_decay_with_algebraic,
        forward_and_adjoint,
        DecayWithAlgebraic,
        "bcgstab"
    );
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
