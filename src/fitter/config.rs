use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How the factorization follows the removal of outliers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum FactorizationUpdate {
    /// Downdate the existing factorization with the contributions of the removed terms
    ///
    /// The leftover gradient is the negated gradient of the removed terms, which is only true
    /// when the full gradient vanishes, i.e. right after a Newton step of a linear problem.
    #[default]
    RankUpdate,
    /// Rebuild the normal equations from the remaining terms and factorize them again
    Rebuild,
}

/// Parameters of [Fitter::iterate](crate::Fitter::iterate)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename = "FitterConfig")]
pub struct FitterConfig {
    /// Whitespace separated parameter sets to fit, e.g. "Model Fluxes"
    pub what_to_fit: String,
    /// Parameter sets fitted in turn without outlier rejection before the main fit, e.g.
    /// "Distortions" then "Positions", which brings a poor starting point close to the minimum
    #[serde(default)]
    pub initial_fits: Vec<String>,
    /// Outlier threshold in standard deviations of the chi2 distribution, zero disables
    /// outlier rejection
    #[serde(default = "FitterConfig::default_n_sigma_cut")]
    pub n_sigma_cut: f64,
    #[serde(default)]
    pub factorization_update: FactorizationUpdate,
    /// Maximum number of `minimize` calls before giving up on a diverging fit
    #[serde(default = "FitterConfig::default_max_outlier_iterations")]
    pub max_outlier_iterations: usize,
    /// Triplet buffer capacity of the very first derivative pass
    #[serde(default = "FitterConfig::default_initial_triplet_capacity")]
    pub initial_triplet_capacity: usize,
}

impl FitterConfig {
    pub fn new(what_to_fit: impl Into<String>) -> Self {
        Self {
            what_to_fit: what_to_fit.into(),
            initial_fits: vec![],
            n_sigma_cut: Self::default_n_sigma_cut(),
            factorization_update: FactorizationUpdate::default(),
            max_outlier_iterations: Self::default_max_outlier_iterations(),
            initial_triplet_capacity: Self::default_initial_triplet_capacity(),
        }
    }

    #[inline]
    pub fn default_n_sigma_cut() -> f64 {
        5.0
    }

    #[inline]
    pub fn default_max_outlier_iterations() -> usize {
        20
    }

    #[inline]
    pub fn default_initial_triplet_capacity() -> usize {
        1_000_000
    }

    pub fn with_initial_fits<I, S>(mut self, initial_fits: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.initial_fits = initial_fits.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_n_sigma_cut(mut self, n_sigma_cut: f64) -> Self {
        self.n_sigma_cut = n_sigma_cut;
        self
    }

    pub fn with_factorization_update(mut self, factorization_update: FactorizationUpdate) -> Self {
        self.factorization_update = factorization_update;
        self
    }
}
