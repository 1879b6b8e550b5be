use criterion::Criterion;
use jointcal::{FastFinder, Point, list_match_collect};
use rand::prelude::*;
use std::hint::black_box;

fn random_points(rng: &mut StdRng, n: usize) -> Vec<Point> {
    (0..n)
        .map(|_| Point::new(rng.random_range(0.0..1000.0), rng.random_range(0.0..1000.0)))
        .collect()
}

pub fn bench_fast_finder(c: &mut Criterion) {
    const COUNTS: [usize; 3] = [100, 1000, 10000];

    let mut rng = StdRng::seed_from_u64(0);
    for &n in COUNTS.iter() {
        let stars = random_points(&mut rng, n);
        let queries = random_points(&mut rng, 100);

        c.bench_function(format!("FastFinder build {n}").as_str(), |b| {
            b.iter(|| FastFinder::new(black_box(&stars), FastFinder::<Point>::default_nslice()))
        });

        let finder = FastFinder::new(&stars, FastFinder::<Point>::default_nslice());
        c.bench_function(format!("FastFinder find_closest {n}").as_str(), |b| {
            b.iter(|| {
                for &query in queries.iter() {
                    black_box(finder.find_closest(black_box(query), 10.0, None));
                }
            })
        });

        let shifted: Vec<_> = stars
            .iter()
            .map(|p| Point::new(p.x + 0.1, p.y - 0.1))
            .collect();
        c.bench_function(format!("list_match_collect {n}").as_str(), |b| {
            b.iter(|| list_match_collect(black_box(&stars), black_box(&shifted), None, 1.0))
        });
    }
}
