#![doc = include_str!("../README.md")]

mod associations;
pub use associations::{Associations, CatalogAssociation, CcdImage};

mod chi2;
pub use chi2::{Chi2Accumulator, Chi2List, Chi2Star, Chi2Statistic, Chi2Stats, Chi2Term};

pub mod diagnostics;
pub use diagnostics::{DiagnosticsSink, LogSink, RecordingSink};

mod error;
pub use error::{Chi2DumpError, FactorizationError, FitterError};

mod fast_finder;
pub use fast_finder::{ClosestPair, FastFinder, Neighbor, Scan};

mod fitter;
pub use fitter::{
    AstrometryFit, FactorizationUpdate, FitProblem, Fitter, FitterConfig, MinimizeReport,
    MinimizeResult, Outliers, PhotometryFit, chi2_contribution_file_names,
};

mod list_match;
pub use list_match::{StarMatch, StarMatchList, list_match_collect};

pub mod model;
pub use model::{AstrometryModel, PhotometryModel, ShiftAstrometryModel, SimplePhotometryModel};

pub mod sparse;
pub use sparse::{SimplicialLdlt, SparseSymmetric};

mod star;
pub use star::{
    CcdImageId, Detection, FittedStar, FittedStarId, MeasuredStar, MeasuredStarId, Point,
    RefStar, RefStarId, StarPosition,
};

mod triplet_list;
pub use triplet_list::{Triplet, TripletList};

pub use ndarray;
