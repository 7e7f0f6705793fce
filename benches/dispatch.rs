use criterion::{black_box, criterion_group, criterion_main, Criterion};

use he_dispatch::{align_mod_n_scale, AlignMode, Context, ContextParams, SimEngine};

fn bfv_ctx() -> Context<SimEngine> {
    let params = ContextParams::bfv(4096, 40961, vec![50, 50, 50]);
    Context::new(SimEngine::new(params).unwrap().with_seed(0).with_relin_keys().with_rotation_keys())
}

fn ckks_ctx() -> Context<SimEngine> {
    let params = ContextParams::ckks(4096, 2f64.powi(40), vec![60, 40, 40, 60]);
    Context::new(SimEngine::new(params).unwrap().with_seed(0).with_relin_keys().with_rotation_keys())
}

fn bfv_dispatch(c: &mut Criterion) {
    let ctx = bfv_ctx();
    let values: Vec<i64> = (0..4096).collect();
    let x = ctx.encrypt_batch(&values).unwrap();
    let y = ctx.encrypt_batch(&values).unwrap();

    c.bench_function("bfv_add_ct", |b| b.iter(|| black_box(&x).add(black_box(&y)).unwrap()));
    c.bench_function("bfv_add_scalar", |b| b.iter(|| black_box(&x).add(black_box(7i64)).unwrap()));
    c.bench_function("bfv_mul_relin", |b| {
        b.iter(|| black_box(&x).mul(black_box(&y)).unwrap().relinearized().unwrap())
    });
    c.bench_function("bfv_cumulative_add", |b| b.iter(|| black_box(&x).cumulative_add().unwrap()));
}

fn ckks_dispatch(c: &mut Criterion) {
    let ctx = ckks_ctx();
    let values: Vec<f64> = (0..2048).map(|i| i as f64 / 2048.0).collect();
    let x = ctx.encrypt_frac(&values).unwrap();
    let mut sq = x.mul(&x).unwrap().relinearized().unwrap();
    sq.rescale_to_next().unwrap();

    c.bench_function("ckks_add_aligned", |b| b.iter(|| black_box(&x).add(black_box(&x)).unwrap()));
    c.bench_function("ckks_add_after_rescale", |b| {
        b.iter(|| black_box(&sq).add(black_box(&x)).unwrap())
    });
    c.bench_function("ckks_align_plan_and_execute", |b| {
        b.iter(|| {
            let (mut l, mut r) = (sq.clone(), x.clone());
            align_mod_n_scale(&mut l, &mut r, AlignMode::Full).unwrap()
        })
    });
}

criterion_group!(benches, bfv_dispatch, ckks_dispatch);
criterion_main!(benches);
