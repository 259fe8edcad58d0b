use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;

pub mod remset;

pub fn bench_main(c: &mut Criterion) {
    alloc::bench(c);
    remset::bench(c);
}

criterion_group!(benches, bench_main);
criterion_main!(benches);
