use criterion::{criterion_group, criterion_main};

mod fast_finder;
use fast_finder::bench_fast_finder;

use minimize::bench_minimize;

criterion_group!(benches_fast_finder, bench_fast_finder);
criterion_group!(benches_minimize, bench_minimize);
criterion_main!(benches_fast_finder, benches_minimize);
