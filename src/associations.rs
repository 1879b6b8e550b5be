use crate::fast_finder::FastFinder;
use crate::star::{
    CcdImageId, Detection, FittedStar, FittedStarId, MeasuredStar, MeasuredStarId, RefStar,
    RefStarId, StarPosition,
};

use std::collections::{HashMap, HashSet};

/// Image and its list of measurements
#[derive(Clone, Debug)]
pub struct CcdImage {
    name: String,
    measured_stars: Vec<MeasuredStar>,
}

impl CcdImage {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn measured_stars(&self) -> &[MeasuredStar] {
        &self.measured_stars
    }

    /// Measurements still taking part in the fit, with their handles
    pub fn valid_measured_stars(
        &self,
        ccd: CcdImageId,
    ) -> impl Iterator<Item = (MeasuredStarId, &MeasuredStar)> {
        self.measured_stars
            .iter()
            .enumerate()
            .filter(|(_, ms)| ms.is_valid())
            .map(move |(slot, ms)| (MeasuredStarId { ccd, slot }, ms))
    }
}

/// Outcome of [Associations::associate_catalog]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CatalogAssociation {
    /// Detections matched to an existing fitted star
    pub matched: usize,
    /// Detections which created a new fitted star
    pub created: usize,
    /// Detections of a fitted star already measured on the same image
    pub discarded: usize,
}

/// Owner of images, measurements, fitted stars and reference stars
///
/// Stars are never removed: measurements are invalidated and reference links are severed, so
/// every handle stays valid for the lifetime of the associations.
#[derive(Clone, Debug, Default)]
pub struct Associations {
    ccd_images: Vec<CcdImage>,
    fitted_stars: Vec<FittedStar>,
    ref_stars: Vec<RefStar>,
}

impl Associations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ccd_image(&mut self, name: impl Into<String>) -> CcdImageId {
        self.ccd_images.push(CcdImage {
            name: name.into(),
            measured_stars: vec![],
        });
        CcdImageId(self.ccd_images.len() - 1)
    }

    pub fn add_fitted_star(&mut self, fitted_star: FittedStar) -> FittedStarId {
        self.fitted_stars.push(fitted_star);
        FittedStarId(self.fitted_stars.len() - 1)
    }

    pub fn add_ref_star(&mut self, ref_star: RefStar) -> RefStarId {
        self.ref_stars.push(ref_star);
        RefStarId(self.ref_stars.len() - 1)
    }

    /// Adds a measurement of `fitted_star` on image `ccd`
    pub fn add_measured_star(
        &mut self,
        ccd: CcdImageId,
        detection: Detection,
        fitted_star: FittedStarId,
    ) -> MeasuredStarId {
        self.fitted_stars[fitted_star.0].increment_measurement_count();
        let measured_stars = &mut self.ccd_images[ccd.0].measured_stars;
        measured_stars.push(MeasuredStar::new(detection, fitted_star));
        MeasuredStarId {
            ccd,
            slot: measured_stars.len() - 1,
        }
    }

    pub fn link_ref_star(&mut self, fitted_star: FittedStarId, ref_star: RefStarId) {
        self.fitted_stars[fitted_star.0].set_ref_star(Some(ref_star));
    }

    /// Associates a catalog of detections with the fitted stars
    ///
    /// Each detection is attached to the closest fitted star within `match_cut`, or creates a new
    /// fitted star when there is none. A fitted star gets at most one measurement per image,
    /// further matching detections are discarded.
    pub fn associate_catalog(
        &mut self,
        ccd: CcdImageId,
        detections: &[Detection],
        match_cut: f64,
    ) -> CatalogAssociation {
        let matches: Vec<Option<FittedStarId>> = {
            let finder = FastFinder::new(&self.fitted_stars, FastFinder::<FittedStar>::default_nslice());
            detections
                .iter()
                .map(|detection| {
                    finder
                        .find_closest(detection.position(), match_cut, None)
                        .map(|neighbor| FittedStarId(neighbor.index))
                })
                .collect()
        };

        let mut summary = CatalogAssociation::default();
        let mut already_measured: HashSet<FittedStarId> = self.ccd_images[ccd.0]
            .measured_stars
            .iter()
            .map(MeasuredStar::fitted_star)
            .collect();
        for (detection, fitted_star) in detections.iter().zip(matches) {
            let fitted_star = match fitted_star {
                Some(fitted_star) if already_measured.contains(&fitted_star) => {
                    summary.discarded += 1;
                    continue;
                }
                Some(fitted_star) => {
                    summary.matched += 1;
                    fitted_star
                }
                None => {
                    summary.created += 1;
                    self.add_fitted_star(FittedStar::new(
                        detection.x,
                        detection.y,
                        detection.inst_flux,
                    ))
                }
            };
            already_measured.insert(fitted_star);
            self.add_measured_star(ccd, *detection, fitted_star);
        }
        summary
    }

    /// Adds the reference stars and links them with the closest fitted stars within `match_cut`
    ///
    /// Fitted stars which already have a reference star are skipped. When two reference stars
    /// claim the same fitted star, the closer one wins. Returns the number of links made.
    pub fn collect_ref_stars(&mut self, ref_stars: Vec<RefStar>, match_cut: f64) -> usize {
        let first = self.ref_stars.len();
        self.ref_stars.extend(ref_stars);

        let mut best: HashMap<FittedStarId, (RefStarId, f64)> = HashMap::new();
        {
            let finder = FastFinder::new(&self.fitted_stars, FastFinder::<FittedStar>::default_nslice());
            let has_ref = |fs: &FittedStar| fs.ref_star().is_some();
            for (i, ref_star) in self.ref_stars.iter().enumerate().skip(first) {
                let Some(neighbor) =
                    finder.find_closest(ref_star.position(), match_cut, Some(&has_ref))
                else {
                    continue;
                };
                let candidate = (RefStarId(i), neighbor.dist2);
                best.entry(FittedStarId(neighbor.index))
                    .and_modify(|current| {
                        if candidate.1 < current.1 {
                            *current = candidate;
                        }
                    })
                    .or_insert(candidate);
            }
        }
        for (fitted_star, (ref_star, _)) in &best {
            self.link_ref_star(*fitted_star, *ref_star);
        }
        best.len()
    }

    pub fn ccd_images(&self) -> &[CcdImage] {
        &self.ccd_images
    }

    pub fn ccd_image(&self, ccd: CcdImageId) -> &CcdImage {
        &self.ccd_images[ccd.0]
    }

    pub fn ccd_image_ids(&self) -> impl Iterator<Item = CcdImageId> + use<> {
        (0..self.ccd_images.len()).map(CcdImageId)
    }

    pub fn fitted_stars(&self) -> &[FittedStar] {
        &self.fitted_stars
    }

    pub fn fitted_star(&self, id: FittedStarId) -> &FittedStar {
        &self.fitted_stars[id.0]
    }

    pub fn fitted_star_mut(&mut self, id: FittedStarId) -> &mut FittedStar {
        &mut self.fitted_stars[id.0]
    }

    pub fn fitted_star_ids(&self) -> impl Iterator<Item = FittedStarId> + use<> {
        (0..self.fitted_stars.len()).map(FittedStarId)
    }

    pub(crate) fn fitted_stars_mut(&mut self) -> &mut [FittedStar] {
        &mut self.fitted_stars
    }

    pub fn ref_stars(&self) -> &[RefStar] {
        &self.ref_stars
    }

    pub fn ref_star(&self, id: RefStarId) -> &RefStar {
        &self.ref_stars[id.0]
    }

    pub fn measured_star(&self, id: MeasuredStarId) -> &MeasuredStar {
        &self.ccd_images[id.ccd.0].measured_stars[id.slot]
    }

    /// Fitted star of the measurement
    pub fn fitted_star_of(&self, id: MeasuredStarId) -> &FittedStar {
        self.fitted_star(self.measured_star(id).fitted_star())
    }

    /// Total number of measurements, valid or not
    pub fn n_measured_stars(&self) -> usize {
        self.ccd_images
            .iter()
            .map(|ccd| ccd.measured_stars.len())
            .sum()
    }

    pub fn n_valid_measured_stars(&self) -> usize {
        self.ccd_images
            .iter()
            .flat_map(|ccd| ccd.measured_stars.iter())
            .filter(|ms| ms.is_valid())
            .count()
    }

    /// Invalidates the measurement and updates its fitted star's count
    pub fn invalidate_measured_star(&mut self, id: MeasuredStarId) {
        let measured_star = &mut self.ccd_images[id.ccd.0].measured_stars[id.slot];
        if !measured_star.is_valid() {
            return;
        }
        measured_star.set_valid(false);
        let fitted_star = measured_star.fitted_star();
        self.fitted_stars[fitted_star.0].decrement_measurement_count();
    }

    /// Severs the reference link, the fitted star stays as a pure internal unknown
    pub fn sever_ref_star(&mut self, id: FittedStarId) {
        self.fitted_stars[id.0].set_ref_star(None);
    }
}
