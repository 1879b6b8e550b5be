use crate::fast_finder::FastFinder;
use crate::star::{Point, StarPosition};

use conv::prelude::*;

/// Pair of stars from two lists
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StarMatch {
    /// Index in the first list
    pub index1: usize,
    /// Index in the second list
    pub index2: usize,
    /// Distance between the transformed first star and the second star
    pub distance: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StarMatchList(Vec<StarMatch>);

impl StarMatchList {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StarMatch> {
        self.0.iter()
    }

    /// Root mean square of the match distances, `None` for an empty list
    pub fn residual_rms(&self) -> Option<f64> {
        if self.0.is_empty() {
            return None;
        }
        let n: f64 = self.0.len().approx().ok()?;
        let sum2: f64 = self.0.iter().map(|m| m.distance.powi(2)).sum();
        Some((sum2 / n).sqrt())
    }
}

impl<'a> IntoIterator for &'a StarMatchList {
    type Item = &'a StarMatch;
    type IntoIter = std::slice::Iter<'a, StarMatch>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Matches every star of `list1`, mapped through `guess`, with the closest star of `list2`
/// within `max_dist`
///
/// Stars of `list1` without a counterpart are left out. Several stars of `list1` may match the
/// same star of `list2`.
pub fn list_match_collect<S1, S2>(
    list1: &[S1],
    list2: &[S2],
    guess: Option<&dyn Fn(Point) -> Point>,
    max_dist: f64,
) -> StarMatchList
where
    S1: StarPosition,
    S2: StarPosition,
{
    let finder = FastFinder::new(list2, FastFinder::<S2>::default_nslice());
    let matches = list1
        .iter()
        .enumerate()
        .filter_map(|(index1, star)| {
            let position = match guess {
                Some(guess) => guess(star.position()),
                None => star.position(),
            };
            finder
                .find_closest(position, max_dist, None)
                .map(|neighbor| StarMatch {
                    index1,
                    index2: neighbor.index,
                    distance: neighbor.dist(),
                })
        })
        .collect();
    StarMatchList(matches)
}
