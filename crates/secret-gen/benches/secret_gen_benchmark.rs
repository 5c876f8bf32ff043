use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use keyvault_secret_gen::generate_secret;
use std::hint::black_box;

fn bench_generate_secret(c: &mut Criterion) {
    let mut group = c.benchmark_group("generate_secret");

    for &length in &[16usize, 32, 64, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, &length| {
            b.iter(|| black_box(generate_secret(length).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_generate_secret);
criterion_main!(benches);
