use serde::{Deserialize, Serialize};
use std::fmt;

/// A position in the common (tangent-plane) frame
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance
    #[inline]
    pub fn dist2(&self, other: &impl StarPosition) -> f64 {
        (self.x - other.x()).powi(2) + (self.y - other.y()).powi(2)
    }

    #[inline]
    pub fn dist(&self, other: &impl StarPosition) -> f64 {
        self.dist2(other).sqrt()
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Anything which can be placed on the sky plane
pub trait StarPosition {
    fn x(&self) -> f64;

    fn y(&self) -> f64;

    fn position(&self) -> Point {
        Point::new(self.x(), self.y())
    }
}

impl StarPosition for Point {
    #[inline]
    fn x(&self) -> f64 {
        self.x
    }

    #[inline]
    fn y(&self) -> f64 {
        self.y
    }
}

macro_rules! star_position_impl {
    ($t: ty) => {
        impl StarPosition for $t {
            #[inline]
            fn x(&self) -> f64 {
                self.x
            }

            #[inline]
            fn y(&self) -> f64 {
                self.y
            }
        }
    };
}

macro_rules! handle {
    ($(#[$meta: meta])* $name: ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub usize);

        impl $name {
            #[inline]
            pub fn index(self) -> usize {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

handle!(
    /// Stable handle of a [crate::CcdImage] inside [crate::Associations]
    CcdImageId
);
handle!(
    /// Stable handle of a [FittedStar] inside [crate::Associations]
    FittedStarId
);
handle!(
    /// Stable handle of a [RefStar] inside [crate::Associations]
    RefStarId
);

/// Stable handle of a [MeasuredStar]: its image and its slot in the image
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MeasuredStarId {
    pub ccd: CcdImageId,
    pub slot: usize,
}

impl fmt::Display for MeasuredStarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MeasuredStar#{}.{}", self.ccd.0, self.slot)
    }
}

/// A single detection of a star on a single image
///
/// Position is expressed in the common frame the fitted stars live in, `vx`, `vy` and `vxy` is
/// its covariance. `inst_flux` is the instrumental flux with its error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasuredStar {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub vxy: f64,
    pub inst_flux: f64,
    pub inst_flux_err: f64,
    fitted_star: FittedStarId,
    valid: bool,
}

impl MeasuredStar {
    pub fn new(detection: Detection, fitted_star: FittedStarId) -> Self {
        let Detection {
            x,
            y,
            vx,
            vy,
            vxy,
            inst_flux,
            inst_flux_err,
        } = detection;
        Self {
            x,
            y,
            vx,
            vy,
            vxy,
            inst_flux,
            inst_flux_err,
            fitted_star,
            valid: true,
        }
    }

    #[inline]
    pub fn fitted_star(&self) -> FittedStarId {
        self.fitted_star
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub(crate) fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }
}

star_position_impl!(MeasuredStar);

/// Raw detection, not yet associated with a fitted star
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub vxy: f64,
    pub inst_flux: f64,
    pub inst_flux_err: f64,
}

star_position_impl!(Detection);

/// Shared unknown position and flux of a physical source
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FittedStar {
    pub x: f64,
    pub y: f64,
    pub flux: f64,
    measurement_count: usize,
    index_in_matrix: Option<usize>,
    ref_star: Option<RefStarId>,
}

impl FittedStar {
    pub fn new(x: f64, y: f64, flux: f64) -> Self {
        Self {
            x,
            y,
            flux,
            measurement_count: 0,
            index_in_matrix: None,
            ref_star: None,
        }
    }

    #[inline]
    pub fn measurement_count(&self) -> usize {
        self.measurement_count
    }

    /// First column of this star's block in the normal equations, if it is fitted
    #[inline]
    pub fn index_in_matrix(&self) -> Option<usize> {
        self.index_in_matrix
    }

    #[inline]
    pub fn ref_star(&self) -> Option<RefStarId> {
        self.ref_star
    }

    /// A star with neither measurements nor reference constrains nothing
    pub fn is_constrained(&self) -> bool {
        self.measurement_count > 0 || self.ref_star.is_some()
    }

    pub(crate) fn set_index_in_matrix(&mut self, index: Option<usize>) {
        self.index_in_matrix = index;
    }

    pub(crate) fn set_ref_star(&mut self, ref_star: Option<RefStarId>) {
        self.ref_star = ref_star;
    }

    pub(crate) fn increment_measurement_count(&mut self) {
        self.measurement_count += 1;
    }

    pub(crate) fn decrement_measurement_count(&mut self) {
        debug_assert!(self.measurement_count > 0);
        self.measurement_count = self.measurement_count.saturating_sub(1);
    }
}

impl fmt::Display for FittedStar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x: {} y: {} flux: {} nmeas: {} ref: {}",
            self.x,
            self.y,
            self.flux,
            self.measurement_count,
            self.ref_star.is_some(),
        )
    }
}

star_position_impl!(FittedStar);

/// External catalog entry with independently known position and flux
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefStar {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub vxy: f64,
    pub flux: f64,
    pub flux_err: f64,
}

impl RefStar {
    /// Reference star with uncorrelated position errors
    pub fn new(x: f64, y: f64, pos_err: f64, flux: f64, flux_err: f64) -> Self {
        Self {
            x,
            y,
            vx: pos_err.powi(2),
            vy: pos_err.powi(2),
            vxy: 0.0,
            flux,
            flux_err,
        }
    }
}

star_position_impl!(RefStar);
