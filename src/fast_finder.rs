//! Spatial index for nearest-neighbour queries on a static list of stars
//!
//! The stars are sorted by `x` and split into slices of roughly equal `x` extent, every slice is
//! then sorted by `y`. A query with radius `r` visits only the slices overlapping
//! `[x - r, x + r]` and, within each of them, only the `y`-band `[y - r, y + r]` located by
//! binary search.

use crate::star::{Point, StarPosition};

use std::ops::Range;

/// Candidate returned by [FastFinder] queries
#[derive(Debug)]
pub struct Neighbor<'a, S> {
    /// Position of the star in the list the finder was built from
    pub index: usize,
    pub star: &'a S,
    pub dist2: f64,
}

impl<S> Clone for Neighbor<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for Neighbor<'_, S> {}

impl<S> Neighbor<'_, S> {
    pub fn dist(&self) -> f64 {
        self.dist2.sqrt()
    }
}

/// Result of [FastFinder::second_closest]
#[derive(Debug)]
pub struct ClosestPair<'a, S> {
    pub closest: Option<Neighbor<'a, S>>,
    pub second: Option<Neighbor<'a, S>>,
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    index: usize,
    x: f64,
    y: f64,
}

/// Immutable slice-based spatial index
///
/// The finder borrows the star list; it stores only indices and cached coordinates.
#[derive(Clone, Debug)]
pub struct FastFinder<'a, S> {
    stars: &'a [S],
    entries: Vec<Entry>,
    // slice_starts[i]..slice_starts[i + 1] is the i-th slice, len is nslice + 1
    slice_starts: Vec<usize>,
    xmin: f64,
    xstep: f64,
}

impl<'a, S> FastFinder<'a, S>
where
    S: StarPosition,
{
    #[inline]
    pub fn default_nslice() -> usize {
        100
    }

    pub fn new(stars: &'a [S], nslice: usize) -> Self {
        let mut entries: Vec<_> = stars
            .iter()
            .enumerate()
            .map(|(index, star)| Entry {
                index,
                x: star.x(),
                y: star.y(),
            })
            .collect();
        if entries.is_empty() {
            return Self {
                stars,
                entries,
                slice_starts: vec![0],
                xmin: 0.0,
                xstep: 0.0,
            };
        }
        entries.sort_by(|a, b| a.x.total_cmp(&b.x));

        let count = entries.len();
        let xmin = entries[0].x;
        let xmax = entries[count - 1].x;
        let nslice = if xmin == xmax {
            1
        } else {
            nslice.clamp(1, count)
        };
        let xstep = (xmax - xmin) / nslice as f64;

        // Linear bucketing of the x range, the boundary is the first star at or beyond the limit
        let mut slice_starts = Vec::with_capacity(nslice + 1);
        slice_starts.push(0);
        let mut istar = 0;
        for islice in 1..nslice {
            let xend = xmin + islice as f64 * xstep;
            while istar < count && entries[istar].x < xend {
                istar += 1;
            }
            slice_starts.push(istar);
        }
        slice_starts.push(count);

        for window in slice_starts.windows(2) {
            entries[window[0]..window[1]].sort_by(|a, b| a.y.total_cmp(&b.y));
        }

        Self {
            stars,
            entries,
            slice_starts,
            xmin,
            xstep,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of x-slices actually used
    #[inline]
    pub fn nslice(&self) -> usize {
        self.slice_starts.len() - 1
    }

    /// Slices which may hold a star closer than `max_dist` to `x`
    pub fn slice_band(&self, x: f64, max_dist: f64) -> Range<usize> {
        let nslice = self.nslice();
        if self.is_empty() {
            return 0..0;
        }
        if self.xstep == 0.0 {
            return 0..1;
        }
        let start = ((x - max_dist - self.xmin) / self.xstep).floor();
        let end = ((x + max_dist - self.xmin) / self.xstep).floor() + 1.0;
        if start >= nslice as f64 || end <= 0.0 {
            return 0..0;
        }
        let start = start.max(0.0) as usize;
        let end = end.min(nslice as f64) as usize;
        start..end
    }

    /// Lazy scan over every star of the x-band ∩ y-band around `at`
    ///
    /// Candidates are produced slice by slice, in increasing `y` order within a slice. The scan
    /// is a superset of the stars within `max_dist`: callers must check the distance.
    pub fn begin_scan(&self, at: Point, max_dist: f64) -> Scan<'_, 'a, S> {
        let slices = self.slice_band(at.x, max_dist);
        Scan {
            finder: self,
            current: 0,
            end: 0,
            next_slice: slices.start,
            end_slice: slices.end,
            y_start: at.y - max_dist,
            y_end: at.y + max_dist,
        }
    }

    /// Closest star strictly within `max_dist`, first encountered wins on ties
    pub fn find_closest(
        &self,
        at: Point,
        max_dist: f64,
        skip: Option<&dyn Fn(&S) -> bool>,
    ) -> Option<Neighbor<'a, S>> {
        let mut best = None;
        let mut min_dist2 = max_dist * max_dist;
        for candidate in self.candidates(at, max_dist, skip) {
            if candidate.dist2 < min_dist2 {
                min_dist2 = candidate.dist2;
                best = Some(candidate);
            }
        }
        best
    }

    /// Closest and second closest stars strictly within `max_dist`
    pub fn second_closest(
        &self,
        at: Point,
        max_dist: f64,
        skip: Option<&dyn Fn(&S) -> bool>,
    ) -> ClosestPair<'a, S> {
        let mut closest: Option<Neighbor<'a, S>> = None;
        let mut second: Option<Neighbor<'a, S>> = None;
        let mut min_dist1 = max_dist * max_dist;
        let mut min_dist2 = max_dist * max_dist;
        for candidate in self.candidates(at, max_dist, skip) {
            if candidate.dist2 < min_dist1 {
                second = closest;
                min_dist2 = min_dist1;
                closest = Some(candidate);
                min_dist1 = candidate.dist2;
            } else if candidate.dist2 < min_dist2 {
                second = Some(candidate);
                min_dist2 = candidate.dist2;
            }
        }
        ClosestPair { closest, second }
    }

    fn candidates<'f>(
        &'f self,
        at: Point,
        max_dist: f64,
        skip: Option<&'f dyn Fn(&S) -> bool>,
    ) -> impl Iterator<Item = Neighbor<'a, S>> + 'f {
        self.begin_scan(at, max_dist)
            .filter(move |neighbor| !skip.is_some_and(|skip| skip(neighbor.star)))
            .map(move |mut neighbor| {
                neighbor.dist2 = at.dist2(neighbor.star);
                neighbor
            })
    }

    fn y_range_in_slice(&self, islice: usize, y_start: f64, y_end: f64) -> Range<usize> {
        let begin = self.slice_starts[islice];
        let slice = &self.entries[begin..self.slice_starts[islice + 1]];
        let start = slice.partition_point(|entry| entry.y < y_start);
        let end = start + slice[start..].partition_point(|entry| entry.y <= y_end);
        begin + start..begin + end
    }
}

/// Cursor over the candidates of a [FastFinder] query, see [FastFinder::begin_scan]
///
/// `dist2` of the produced [Neighbor]s is not computed and set to NaN.
#[derive(Debug)]
pub struct Scan<'f, 'a, S> {
    finder: &'f FastFinder<'a, S>,
    current: usize,
    end: usize,
    next_slice: usize,
    end_slice: usize,
    y_start: f64,
    y_end: f64,
}

impl<S> Scan<'_, '_, S>
where
    S: StarPosition,
{
    /// Slices not visited yet, including the current one if it is not exhausted
    pub fn remaining_slices(&self) -> Range<usize> {
        if self.current < self.end {
            self.next_slice - 1..self.end_slice
        } else {
            self.next_slice..self.end_slice.max(self.next_slice)
        }
    }

    fn check(&self) {
        if self.current >= self.finder.entries.len() {
            log::error!(
                "FastFinder scan cursor {} is out of the index of {} stars",
                self.current,
                self.finder.entries.len()
            );
        }
    }
}

impl<'a, S> Iterator for Scan<'_, 'a, S>
where
    S: StarPosition,
{
    type Item = Neighbor<'a, S>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.current >= self.end {
            if self.next_slice >= self.end_slice {
                return None;
            }
            let range = self
                .finder
                .y_range_in_slice(self.next_slice, self.y_start, self.y_end);
            self.current = range.start;
            self.end = range.end;
            self.next_slice += 1;
        }
        self.check();
        let entry = self.finder.entries.get(self.current)?;
        self.current += 1;
        let stars: &'a [S] = self.finder.stars;
        Some(Neighbor {
            index: entry.index,
            star: &stars[entry.index],
            dist2: f64::NAN,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::prelude::*;
    use std::collections::BTreeSet;

    fn uniform_points(rng: &mut StdRng, n: usize) -> Vec<Point> {
        (0..n)
            .map(|_| Point::new(rng.random_range(0.0..100.0), rng.random_range(0.0..100.0)))
            .collect()
    }

    fn brute_force(points: &[Point], at: Point, max_dist: f64) -> BTreeSet<usize> {
        points
            .iter()
            .enumerate()
            .filter(|(_, p)| at.dist2(*p) < max_dist * max_dist)
            .map(|(i, _)| i)
            .collect()
    }

    fn scan_within(
        finder: &FastFinder<Point>,
        points: &[Point],
        at: Point,
        max_dist: f64,
    ) -> BTreeSet<usize> {
        finder
            .begin_scan(at, max_dist)
            .map(|neighbor| neighbor.index)
            .filter(|&i| at.dist2(&points[i]) < max_dist * max_dist)
            .collect()
    }

    #[test]
    fn empty_finder_finds_nothing() {
        let points: Vec<Point> = vec![];
        let finder = FastFinder::new(&points, 10);
        assert!(finder.is_empty());
        assert!(finder.find_closest(Point::new(0.0, 0.0), 1e10, None).is_none());
        let pair = finder.second_closest(Point::new(0.0, 0.0), 1e10, None);
        assert!(pair.closest.is_none());
        assert!(pair.second.is_none());
        assert_eq!(finder.begin_scan(Point::new(0.0, 0.0), 1.0).count(), 0);
    }

    #[test]
    fn same_x_collapses_to_single_slice() {
        let points: Vec<_> = (0..20).map(|i| Point::new(5.0, i as f64)).collect();
        let finder = FastFinder::new(&points, 10);
        assert_eq!(finder.nslice(), 1);
        let found = finder.find_closest(Point::new(5.1, 7.2), 1.0, None).unwrap();
        assert_eq!(found.index, 7);
    }

    #[test]
    fn slice_count_is_bounded_by_star_count() {
        let points = [Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(2.0, 0.0)];
        let finder = FastFinder::new(&points, 10);
        assert_eq!(finder.nslice(), 3);
    }

    #[test]
    fn slices_are_sorted_by_y() {
        let mut rng = StdRng::seed_from_u64(0);
        let points = uniform_points(&mut rng, 500);
        let finder = FastFinder::new(&points, 7);
        for window in finder.slice_starts.windows(2) {
            let slice = &finder.entries[window[0]..window[1]];
            assert!(slice.is_sorted_by(|a, b| a.y <= b.y));
        }
        for window in finder.slice_starts.windows(3) {
            let max_x = finder.entries[window[0]..window[1]]
                .iter()
                .map(|e| e.x)
                .fold(f64::NEG_INFINITY, f64::max);
            let min_x = finder.entries[window[1]..window[2]]
                .iter()
                .map(|e| e.x)
                .fold(f64::INFINITY, f64::min);
            assert!(max_x <= min_x);
        }
    }

    #[test]
    fn single_slice_scan_is_brute_force() {
        let mut rng = StdRng::seed_from_u64(1);
        let points = uniform_points(&mut rng, 300);
        let finder = FastFinder::new(&points, 1);
        for _ in 0..100 {
            let at = Point::new(rng.random_range(-10.0..110.0), rng.random_range(-10.0..110.0));
            let max_dist = rng.random_range(0.5..20.0);
            assert_eq!(
                scan_within(&finder, &points, at, max_dist),
                brute_force(&points, at, max_dist)
            );
        }
    }

    #[test]
    fn many_slices_scan_is_brute_force() {
        let mut rng = StdRng::seed_from_u64(2);
        let points = uniform_points(&mut rng, 1000);
        let finder = FastFinder::new(&points, 10);
        for _ in 0..200 {
            let at = Point::new(rng.random_range(-10.0..110.0), rng.random_range(-10.0..110.0));
            let max_dist = rng.random_range(0.5..20.0);
            assert_eq!(
                scan_within(&finder, &points, at, max_dist),
                brute_force(&points, at, max_dist)
            );
        }
    }

    #[test]
    fn find_closest_respects_radius() {
        let mut rng = StdRng::seed_from_u64(3);
        let points = uniform_points(&mut rng, 200);
        let finder = FastFinder::new(&points, 10);
        for _ in 0..200 {
            let at = Point::new(rng.random_range(0.0..100.0), rng.random_range(0.0..100.0));
            let max_dist = rng.random_range(0.1..5.0);
            let expected = brute_force(&points, at, max_dist);
            match finder.find_closest(at, max_dist, None) {
                Some(found) => {
                    assert!(found.dist() < max_dist);
                    assert!(expected.contains(&found.index));
                    let best = expected
                        .iter()
                        .map(|&i| at.dist2(&points[i]))
                        .fold(f64::INFINITY, f64::min);
                    assert_eq!(found.dist2, best);
                }
                None => assert!(expected.is_empty()),
            }
        }
    }

    #[test]
    fn second_closest_agrees_with_find_closest() {
        let mut rng = StdRng::seed_from_u64(4);
        let points = uniform_points(&mut rng, 300);
        let finder = FastFinder::new(&points, 10);
        for _ in 0..200 {
            let at = Point::new(rng.random_range(0.0..100.0), rng.random_range(0.0..100.0));
            let max_dist = rng.random_range(0.5..10.0);
            let closest = finder.find_closest(at, max_dist, None);
            let pair = finder.second_closest(at, max_dist, None);
            assert_eq!(
                closest.map(|n| n.index),
                pair.closest.map(|n| n.index),
            );
            if let (Some(first), Some(second)) = (pair.closest, pair.second) {
                assert!(first.dist2 <= second.dist2);
                assert_ne!(first.index, second.index);
                assert!(second.dist() < max_dist);
            }
            if pair.closest.is_none() {
                assert!(pair.second.is_none());
            }
        }
    }

    #[test]
    fn skip_predicate_excludes_candidates() {
        let points = [
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(3.0, 0.0),
        ];
        let finder = FastFinder::new(&points, 2);
        let skip_origin = |p: &Point| p.x == 0.0;
        let found = finder
            .find_closest(Point::new(0.1, 0.0), 5.0, Some(&skip_origin))
            .unwrap();
        assert_eq!(found.index, 1);
        let pair = finder.second_closest(Point::new(0.1, 0.0), 5.0, Some(&skip_origin));
        assert_eq!(pair.closest.unwrap().index, 1);
        assert_eq!(pair.second.unwrap().index, 2);
    }

    #[test]
    fn small_radius_finds_few_candidates() {
        let mut rng = StdRng::seed_from_u64(5);
        let points = uniform_points(&mut rng, 100);
        let finder = FastFinder::new(&points, 10);
        // pi * r^2 is about 5% of the 100x100 area
        let max_dist = (0.05 * 100.0 * 100.0 / std::f64::consts::PI).sqrt();
        let n_queries = 500;
        let total: usize = (0..n_queries)
            .map(|_| {
                let at = Point::new(rng.random_range(0.0..100.0), rng.random_range(0.0..100.0));
                scan_within(&finder, &points, at, max_dist).len()
            })
            .sum();
        let mean = total as f64 / n_queries as f64;
        assert!(mean > 0.5, "mean candidate count {mean}");
        assert!(mean < 10.0, "mean candidate count {mean}");
    }

    #[test]
    fn far_away_query_visits_no_slice() {
        let mut rng = StdRng::seed_from_u64(6);
        let points = uniform_points(&mut rng, 100);
        let finder = FastFinder::new(&points, 10);
        for at in [Point::new(-1000.0, 50.0), Point::new(1000.0, 50.0)] {
            assert!(finder.slice_band(at.x, 10.0).is_empty());
            let scan = finder.begin_scan(at, 10.0);
            assert!(scan.remaining_slices().is_empty());
            assert!(finder.find_closest(at, 10.0, None).is_none());
        }
        // Inside in x, outside in y: slices are visited but no candidate is produced
        let at = Point::new(50.0, 1000.0);
        assert!(!finder.slice_band(at.x, 10.0).is_empty());
        assert_eq!(finder.begin_scan(at, 10.0).count(), 0);
    }

    #[test]
    fn scan_advances_through_slices() {
        let points: Vec<_> = (0..10).map(|i| Point::new(i as f64, 0.0)).collect();
        let finder = FastFinder::new(&points, 10);
        let mut scan = finder.begin_scan(Point::new(4.5, 0.0), 1.0);
        // slice width is 0.9, so [3.5, 5.5] overlaps slices 3 to 6
        assert_eq!(scan.remaining_slices(), 3..7);
        let visited: Vec<_> = scan.by_ref().map(|n| n.index).collect();
        assert_eq!(visited, vec![3, 4, 5, 6]);
        assert!(scan.remaining_slices().is_empty());
        assert!(scan.next().is_none());
    }
}
