use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tallynet::sharing::{add_mod, reconstruct, split};

fn bench_split(c: &mut Criterion) {
    c.bench_function("split", |b| {
        b.iter(|| split(black_box(1_234_567_890)))
    });
}

fn bench_reconstruct(c: &mut Criterion) {
    c.bench_function("reconstruct", |b| {
        let shares = split(1_234_567_890).unwrap();
        b.iter(|| reconstruct(black_box(&shares)))
    });
}

fn bench_column_sum(c: &mut Criterion) {
    c.bench_function("column_sum_1000", |b| {
        let column: Vec<u64> = (0..1000u64)
            .map(|v| split(v).unwrap()[0])
            .collect();
        b.iter(|| {
            column
                .iter()
                .fold(0u64, |acc, &s| add_mod(acc, black_box(s)))
        })
    });
}

criterion_group!(benches, bench_split, bench_reconstruct, bench_column_sum);
criterion_main!(benches);
