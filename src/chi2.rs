use crate::star::{FittedStarId, MeasuredStarId};

use conv::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// Origin of a chi2 term
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chi2Star {
    /// Residual of a measurement with respect to its fitted star
    Measurement(MeasuredStarId),
    /// Residual of a fitted star with respect to its reference star
    Reference(FittedStarId),
}

/// Sink of chi2 contributions
pub trait Chi2Accumulator {
    fn add_entry(&mut self, chi2: f64, ndof: usize, star: Chi2Star);
}

/// Total chi2 and number of degrees of freedom
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Chi2Statistic {
    pub chi2: f64,
    /// Number of squares, minus the number of parameters once finalised
    pub ndof: i64,
}

impl Chi2Statistic {
    pub fn reduced(&self) -> f64 {
        self.chi2 / self.ndof as f64
    }
}

impl Chi2Accumulator for Chi2Statistic {
    fn add_entry(&mut self, chi2: f64, ndof: usize, _star: Chi2Star) {
        self.chi2 += chi2;
        self.ndof += ndof as i64;
    }
}

impl fmt::Display for Chi2Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chi2/ndof : {}/{}={}",
            self.chi2,
            self.ndof,
            self.reduced()
        )
    }
}

/// Single chi2 contribution
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chi2Term {
    pub chi2: f64,
    pub star: Chi2Star,
}

/// Summary of a [Chi2List]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Chi2Stats {
    pub mean: f64,
    pub median: f64,
    pub sigma: f64,
}

/// Collection of individual chi2 contributions, used to find outliers
#[derive(Clone, Debug, Default)]
pub struct Chi2List(Vec<Chi2Term>);

impl Chi2List {
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    /// Ascending order of chi2
    pub fn sort(&mut self) {
        self.0.sort_by(|a, b| a.chi2.total_cmp(&b.chi2));
    }

    /// Mean and standard deviation, `None` for an empty list
    pub fn average_and_sigma(&self) -> Option<(f64, f64)> {
        if self.0.is_empty() {
            return None;
        }
        let n: f64 = self.0.len().approx().ok()?;
        let (sum, sum2) = self
            .0
            .iter()
            .fold((0.0, 0.0), |(sum, sum2), term| {
                (sum + term.chi2, sum2 + term.chi2.powi(2))
            });
        let average = sum / n;
        let sigma = (sum2 / n - average.powi(2)).max(0.0).sqrt();
        Some((average, sigma))
    }

    /// Median of an already sorted list
    pub fn median_sorted(&self) -> Option<f64> {
        let n = self.0.len();
        if n == 0 {
            return None;
        }
        let median = if n % 2 == 1 {
            self.0[n / 2].chi2
        } else {
            0.5 * (self.0[n / 2 - 1].chi2 + self.0[n / 2].chi2)
        };
        Some(median)
    }

    /// Sorts the list and computes its statistics
    pub fn stats(&mut self) -> Option<Chi2Stats> {
        self.sort();
        let median = self.median_sorted()?;
        let (mean, sigma) = self.average_and_sigma()?;
        Some(Chi2Stats {
            mean,
            median,
            sigma,
        })
    }
}

impl Chi2Accumulator for Chi2List {
    fn add_entry(&mut self, chi2: f64, _ndof: usize, star: Chi2Star) {
        self.0.push(Chi2Term { chi2, star });
    }
}

impl Deref for Chi2List {
    type Target = [Chi2Term];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
