//! Per-image models adjusted by the fitters
//!
//! A model owns the parameters of every image and is told, by the fitter, which global
//! parameter index each of them takes in the normal equations.

mod astrometry_model;
pub use astrometry_model::{AstrometryModel, ShiftAstrometryModel};

mod photometry_model;
pub use photometry_model::{PhotometryModel, SimplePhotometryModel};
