use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use strata::{
    chain_rule, AxisBuilder, Derivative, Participant, Tensor, ValueMap, VectorAssembler,
};

fn dense_pair(nb: usize, n: usize) -> (Derivative<f64, 1>, Derivative<f64, 1>) {
    let values = |len: usize| (0..len).map(|i| 1.0 + 0.001 * i as f64).collect::<Vec<_>>();
    let mut dy_du =
        Derivative::new(0, Participant::base("y", &[n]), [Participant::base("u", &[n])]).unwrap();
    dy_du
        .assign(Tensor::from_shape_vec(&[nb], &[], &[n, n], values(nb * n * n)).unwrap())
        .unwrap();
    let mut du_dx =
        Derivative::new(0, Participant::base("u", &[n]), [Participant::base("x", &[n])]).unwrap();
    du_dx
        .assign(Tensor::from_shape_vec(&[nb], &[], &[n, n], values(nb * n * n)).unwrap())
        .unwrap();
    (dy_du, du_dx)
}

fn bench_chain_rule(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_rule");
    for nb in [1, 100, 10_000] {
        let (dy_du, du_dx) = dense_pair(nb, 6);
        group.bench_with_input(BenchmarkId::new("sym_r2_batch", nb), &nb, |b, _| {
            b.iter(|| black_box(chain_rule(black_box(&dy_du), black_box(&du_dx)).unwrap()))
        });
    }
    group.finish();
}

fn bench_assembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("assembly");
    let mut builder = AxisBuilder::new();
    for i in 0..8 {
        builder.add_variable(format!("state/v{i}"), &[], &[6]).unwrap();
    }
    let axis = builder.build();
    let assembler = VectorAssembler::new(&axis);
    for nb in [1, 1000] {
        let values: ValueMap<f64> = axis
            .variable_names()
            .into_iter()
            .step_by(2)
            .map(|name| (name, Tensor::ones(&[nb], &[], &[6])))
            .collect();
        group.bench_with_input(BenchmarkId::new("vector_partial", nb), &values, |b, v| {
            b.iter(|| black_box(assembler.assemble_by_variable(black_box(v)).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_chain_rule, bench_assembly);
criterion_main!(benches);
