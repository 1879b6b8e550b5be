use crate::associations::Associations;
use crate::chi2::{Chi2Accumulator, Chi2Star};
use crate::error::{Chi2DumpError, FitterError};
use crate::fitter::{FitProblem, selected_measurements};
use crate::model::PhotometryModel;
use crate::star::{CcdImageId, FittedStarId, MeasuredStar, MeasuredStarId};
use crate::triplet_list::TripletList;

use ndarray::{Array1, ArrayView1};
use serde::Serialize;
use std::io;

#[derive(Clone, Copy, Debug)]
struct Term {
    flux: f64,
    residual: f64,
    sigma: f64,
}

impl Term {
    fn chi2(&self) -> f64 {
        (self.residual / self.sigma).powi(2)
    }
}

#[derive(Serialize)]
struct MeasurementRecord {
    ccd: usize,
    slot: usize,
    fitted_star: usize,
    inst_flux: f64,
    flux: f64,
    fitted_flux: f64,
    sigma: f64,
    chi2: f64,
}

#[derive(Serialize)]
struct ReferenceRecord {
    fitted_star: usize,
    ref_star: usize,
    fitted_flux: f64,
    ref_flux: f64,
    sigma: f64,
    chi2: f64,
}

/// Fit of the image flux scales and the fitted star fluxes
///
/// Parameter sets: `Model` for the photometric model, `Fluxes` for the fitted stars.
///
/// The error of a measurement is evaluated with the model as it is when the measurement first
/// enters a fit, and kept from then on. The weights therefore do not move with the parameters
/// and the problem stays linear, as [FactorizationUpdate::RankUpdate] requires.
/// [PhotometryFit::refresh_errors] evaluates them again with the current model.
///
/// [FactorizationUpdate::RankUpdate]: crate::FactorizationUpdate::RankUpdate
#[derive(Clone, Debug)]
pub struct PhotometryFit<M> {
    model: M,
    flux_error: f64,
    /// Frozen measurement errors, by image and slot
    sigmas: Vec<Vec<f64>>,
    fitting_model: bool,
    fitting_fluxes: bool,
    n_par_model: usize,
    n_par_fluxes: usize,
}

impl<M> PhotometryFit<M>
where
    M: PhotometryModel,
{
    /// `flux_error` is the fraction of the predicted flux added in quadrature to the error of
    /// every measurement
    pub fn new(model: M, flux_error: f64) -> Self {
        Self {
            model,
            flux_error,
            sigmas: vec![],
            fitting_model: false,
            fitting_fluxes: false,
            n_par_model: 0,
            n_par_fluxes: 0,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn n_par_model(&self) -> usize {
        self.n_par_model
    }

    pub fn n_par_fluxes(&self) -> usize {
        self.n_par_fluxes
    }

    /// Evaluates the measurement errors again with the current model
    pub fn refresh_errors(&mut self, associations: &Associations) {
        self.sigmas.clear();
        self.freeze_errors(associations);
    }

    /// Evaluates the errors of the measurements seen for the first time
    fn freeze_errors(&mut self, associations: &Associations) {
        let mut sigmas = std::mem::take(&mut self.sigmas);
        sigmas.resize(associations.ccd_images().len(), vec![]);
        for (ccd, image_sigmas) in associations.ccd_image_ids().zip(sigmas.iter_mut()) {
            let measured_stars = associations.ccd_image(ccd).measured_stars();
            for measured_star in &measured_stars[image_sigmas.len().min(measured_stars.len())..] {
                image_sigmas.push(self.current_sigma(ccd, measured_star));
            }
        }
        self.sigmas = sigmas;
    }

    fn current_sigma(&self, ccd: CcdImageId, measured_star: &MeasuredStar) -> f64 {
        let flux = self.model.transform(ccd, measured_star.inst_flux);
        self.model
            .transform_error(ccd, measured_star.inst_flux, measured_star.inst_flux_err)
            .hypot(self.flux_error * flux)
    }

    fn measurement_term(
        &self,
        associations: &Associations,
        id: MeasuredStarId,
        measured_star: &MeasuredStar,
    ) -> Option<Term> {
        let flux = self.model.transform(id.ccd, measured_star.inst_flux);
        let sigma = self
            .sigmas
            .get(id.ccd.index())
            .and_then(|image_sigmas| image_sigmas.get(id.slot).copied())
            .unwrap_or_else(|| self.current_sigma(id.ccd, measured_star));
        if !(sigma > 0.0) {
            return None;
        }
        let fitted_star = associations.fitted_star(measured_star.fitted_star());
        Some(Term {
            flux,
            residual: flux - fitted_star.flux,
            sigma,
        })
    }

    fn reference_term(&self, associations: &Associations, id: FittedStarId) -> Option<Term> {
        let fitted_star = associations.fitted_star(id);
        let ref_star = associations.ref_star(fitted_star.ref_star()?);
        if !(ref_star.flux_err > 0.0) {
            return None;
        }
        Some(Term {
            flux: fitted_star.flux,
            residual: fitted_star.flux - ref_star.flux,
            sigma: ref_star.flux_err,
        })
    }
}

impl<M> FitProblem for PhotometryFit<M>
where
    M: PhotometryModel,
{
    fn name(&self) -> &'static str {
        "jointcal::PhotometryFit"
    }

    fn assign_indices(
        &mut self,
        associations: &mut Associations,
        what_to_fit: &str,
    ) -> Result<usize, FitterError> {
        self.freeze_errors(associations);
        self.fitting_model = what_to_fit.contains("Model");
        self.fitting_fluxes = what_to_fit.contains("Fluxes");
        if !(self.fitting_model || self.fitting_fluxes) {
            return Err(FitterError::NothingToFit {
                what_to_fit: what_to_fit.to_string(),
            });
        }

        self.n_par_model = if self.fitting_model {
            self.model.assign_indices(what_to_fit, 0)
        } else {
            0
        };
        let mut ipar = self.n_par_model;
        for fitted_star in associations.fitted_stars_mut() {
            if self.fitting_fluxes && fitted_star.is_constrained() {
                fitted_star.set_index_in_matrix(Some(ipar));
                ipar += 1;
            } else {
                fitted_star.set_index_in_matrix(None);
            }
        }
        self.n_par_fluxes = ipar - self.n_par_model;
        Ok(ipar)
    }

    fn offset_params(&mut self, associations: &mut Associations, delta: ArrayView1<f64>) {
        if self.fitting_model {
            self.model.offset_params(delta);
        }
        if self.fitting_fluxes {
            for fitted_star in associations.fitted_stars_mut() {
                if let Some(index) = fitted_star.index_in_matrix() {
                    fitted_star.flux += delta[index];
                }
            }
        }
    }

    fn accumulate_stat_image_list(
        &self,
        associations: &Associations,
        accum: &mut dyn Chi2Accumulator,
    ) {
        for ccd in associations.ccd_image_ids() {
            for (id, measured_star) in associations.ccd_image(ccd).valid_measured_stars(ccd) {
                if let Some(term) = self.measurement_term(associations, id, measured_star) {
                    accum.add_entry(term.chi2(), 1, Chi2Star::Measurement(id));
                }
            }
        }
    }

    fn accumulate_stat_ref_stars(&self, associations: &Associations, accum: &mut dyn Chi2Accumulator) {
        for id in associations.fitted_star_ids() {
            if let Some(term) = self.reference_term(associations, id) {
                accum.add_entry(term.chi2(), 1, Chi2Star::Reference(id));
            }
        }
    }

    fn indices_of_measured_star(
        &self,
        associations: &Associations,
        id: MeasuredStarId,
        indices: &mut Vec<usize>,
    ) {
        if self.fitting_model {
            indices.extend_from_slice(self.model.indices(id.ccd));
        }
        if self.fitting_fluxes {
            indices.extend(associations.fitted_star_of(id).index_in_matrix());
        }
    }

    fn least_square_derivatives_measurement(
        &self,
        associations: &Associations,
        ccd: CcdImageId,
        subset: Option<&[MeasuredStarId]>,
        triplets: &mut TripletList,
        grad: &mut Array1<f64>,
    ) {
        let mut model_derivatives = vec![];
        for (id, measured_star) in selected_measurements(associations, ccd, subset) {
            let Some(term) = self.measurement_term(associations, id, measured_star) else {
                continue;
            };
            let flux_index = associations
                .fitted_star(measured_star.fitted_star())
                .index_in_matrix()
                .filter(|_| self.fitting_fluxes);
            if !self.fitting_model && flux_index.is_none() {
                continue;
            }

            let col = triplets.allocate_columns(1);
            let weighted_residual = term.residual / term.sigma.powi(2);
            if self.fitting_model {
                self.model.compute_parameter_derivatives(
                    ccd,
                    measured_star.inst_flux,
                    &mut model_derivatives,
                );
                for (&index, &h) in self.model.indices(ccd).iter().zip(&model_derivatives) {
                    triplets.add_triplet(index, col, h / term.sigma);
                    grad[index] -= h * weighted_residual;
                }
            }
            if let Some(index) = flux_index {
                triplets.add_triplet(index, col, -1.0 / term.sigma);
                grad[index] += weighted_residual;
            }
        }
    }

    fn least_square_derivatives_reference(
        &self,
        associations: &Associations,
        fitted_stars: &[FittedStarId],
        triplets: &mut TripletList,
        grad: &mut Array1<f64>,
    ) {
        if !self.fitting_fluxes {
            return;
        }
        for &id in fitted_stars {
            let Some(term) = self.reference_term(associations, id) else {
                continue;
            };
            let Some(index) = associations.fitted_star(id).index_in_matrix() else {
                continue;
            };
            let col = triplets.allocate_columns(1);
            triplets.add_triplet(index, col, 1.0 / term.sigma);
            grad[index] -= term.residual / term.sigma.powi(2);
        }
    }

    fn write_chi2_meas_contributions(
        &self,
        associations: &Associations,
        writer: &mut dyn io::Write,
    ) -> Result<(), Chi2DumpError> {
        let mut writer = csv::Writer::from_writer(writer);
        for ccd in associations.ccd_image_ids() {
            for (id, measured_star) in associations.ccd_image(ccd).valid_measured_stars(ccd) {
                let Some(term) = self.measurement_term(associations, id, measured_star) else {
                    continue;
                };
                let fitted_star = measured_star.fitted_star();
                writer.serialize(MeasurementRecord {
                    ccd: id.ccd.index(),
                    slot: id.slot,
                    fitted_star: fitted_star.index(),
                    inst_flux: measured_star.inst_flux,
                    flux: term.flux,
                    fitted_flux: associations.fitted_star(fitted_star).flux,
                    sigma: term.sigma,
                    chi2: term.chi2(),
                })?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    fn write_chi2_ref_contributions(
        &self,
        associations: &Associations,
        writer: &mut dyn io::Write,
    ) -> Result<(), Chi2DumpError> {
        let mut writer = csv::Writer::from_writer(writer);
        for id in associations.fitted_star_ids() {
            let Some(term) = self.reference_term(associations, id) else {
                continue;
            };
            let Some(ref_star) = associations.fitted_star(id).ref_star() else {
                continue;
            };
            writer.serialize(ReferenceRecord {
                fitted_star: id.index(),
                ref_star: ref_star.index(),
                fitted_flux: term.flux,
                ref_flux: associations.ref_star(ref_star).flux,
                sigma: term.sigma,
                chi2: term.chi2(),
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::chi2::Chi2Statistic;
    use crate::model::SimplePhotometryModel;
    use crate::star::{Detection, FittedStar, RefStar};

    use approx::assert_relative_eq;

    fn associations() -> Associations {
        let mut associations = Associations::new();
        let ccd0 = associations.add_ccd_image("ccd0");
        let ccd1 = associations.add_ccd_image("ccd1");
        let fs0 = associations.add_fitted_star(FittedStar::new(0.0, 0.0, 100.0));
        let fs1 = associations.add_fitted_star(FittedStar::new(5.0, 0.0, 50.0));
        // never measured, gets no index
        associations.add_fitted_star(FittedStar::new(9.0, 9.0, 10.0));
        for (ccd, fs, inst_flux) in [
            (ccd0, fs0, 98.0),
            (ccd0, fs1, 51.0),
            (ccd1, fs0, 203.0),
            (ccd1, fs1, 99.0),
        ] {
            associations.add_measured_star(
                ccd,
                Detection {
                    x: 0.0,
                    y: 0.0,
                    vx: 1e-4,
                    vy: 1e-4,
                    vxy: 0.0,
                    inst_flux,
                    inst_flux_err: 0.02 * inst_flux,
                },
                fs,
            );
        }
        let ref_star = associations.add_ref_star(RefStar::new(0.0, 0.0, 0.01, 101.0, 2.0));
        associations.link_ref_star(fs0, ref_star);
        associations
    }

    #[test]
    fn indices_skip_unconstrained_stars() {
        let mut associations = associations();
        let mut fit = PhotometryFit::new(SimplePhotometryModel::new(2), 0.0);
        assert_eq!(fit.assign_indices(&mut associations, "Model Fluxes"), Ok(4));
        assert_eq!(fit.n_par_model(), 2);
        assert_eq!(fit.n_par_fluxes(), 2);
        let indices: Vec<_> = associations
            .fitted_stars()
            .iter()
            .map(|fs| fs.index_in_matrix())
            .collect();
        assert_eq!(indices, vec![Some(2), Some(3), None]);

        assert_eq!(fit.assign_indices(&mut associations, "Fluxes"), Ok(2));
        assert_eq!(associations.fitted_stars()[1].index_in_matrix(), Some(1));
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let mut associations = associations();
        let mut fit = PhotometryFit::new(SimplePhotometryModel::new(2), 0.0);
        let n_par = fit.assign_indices(&mut associations, "Fluxes").unwrap();
        let mut triplets = TripletList::new(16);
        let mut grad = Array1::zeros(n_par);
        for ccd in associations.ccd_image_ids() {
            fit.least_square_derivatives_measurement(
                &associations,
                ccd,
                None,
                &mut triplets,
                &mut grad,
            );
        }
        let ids: Vec<_> = associations.fitted_star_ids().collect();
        fit.least_square_derivatives_reference(&associations, &ids, &mut triplets, &mut grad);
        // 4 measurements and 1 reference term
        assert_eq!(triplets.next_free_index(), 5);

        let chi2 = |associations: &Associations| {
            let mut stat = Chi2Statistic::default();
            fit.accumulate_stat_image_list(associations, &mut stat);
            fit.accumulate_stat_ref_stars(associations, &mut stat);
            stat.chi2
        };
        let h = 1e-4;
        for i in 0..n_par {
            let mut plus = associations.clone();
            let mut minus = associations.clone();
            for fs in plus.fitted_stars_mut() {
                if fs.index_in_matrix() == Some(i) {
                    fs.flux += h;
                }
            }
            for fs in minus.fitted_stars_mut() {
                if fs.index_in_matrix() == Some(i) {
                    fs.flux -= h;
                }
            }
            let derivative = (chi2(&plus) - chi2(&minus)) / (2.0 * h);
            assert_relative_eq!(-0.5 * derivative, grad[i], max_relative = 1e-6);
        }
    }

    #[test]
    fn errors_are_frozen_until_refreshed() {
        let mut associations = associations();
        let mut fit = PhotometryFit::new(SimplePhotometryModel::new(2), 0.0);
        fit.assign_indices(&mut associations, "Model Fluxes").unwrap();
        let id = MeasuredStarId {
            ccd: CcdImageId(1),
            slot: 0,
        };
        let sigma = |fit: &PhotometryFit<SimplePhotometryModel>, associations: &Associations| {
            fit.measurement_term(associations, id, associations.measured_star(id))
                .unwrap()
                .sigma
        };
        assert_relative_eq!(sigma(&fit, &associations), 0.02 * 203.0, max_relative = 1e-12);

        fit.model_mut().set_factor(CcdImageId(1), 2.0);
        assert_relative_eq!(sigma(&fit, &associations), 0.02 * 203.0, max_relative = 1e-12);
        // a new assignment keeps the errors of known measurements
        fit.assign_indices(&mut associations, "Model Fluxes").unwrap();
        assert_relative_eq!(sigma(&fit, &associations), 0.02 * 203.0, max_relative = 1e-12);

        // measurements added later are evaluated with the model of their first fit
        let fs = associations.fitted_star_ids().next().unwrap();
        let late = associations.add_measured_star(
            CcdImageId(1),
            Detection {
                x: 0.0,
                y: 0.0,
                vx: 1e-4,
                vy: 1e-4,
                vxy: 0.0,
                inst_flux: 50.0,
                inst_flux_err: 1.0,
            },
            fs,
        );
        fit.assign_indices(&mut associations, "Model Fluxes").unwrap();
        let late_sigma = fit
            .measurement_term(&associations, late, associations.measured_star(late))
            .unwrap()
            .sigma;
        assert_relative_eq!(late_sigma, 2.0, max_relative = 1e-12);

        fit.refresh_errors(&associations);
        assert_relative_eq!(sigma(&fit, &associations), 0.04 * 203.0, max_relative = 1e-12);
    }

    #[test]
    fn subset_only_adds_selected_terms() {
        let mut associations = associations();
        let mut fit = PhotometryFit::new(SimplePhotometryModel::new(2), 0.01);
        let n_par = fit.assign_indices(&mut associations, "Model Fluxes").unwrap();
        let mut triplets = TripletList::new(16);
        let mut grad = Array1::zeros(n_par);
        let id = MeasuredStarId {
            ccd: CcdImageId(1),
            slot: 1,
        };
        fit.least_square_derivatives_measurement(
            &associations,
            CcdImageId(1),
            Some(&[id]),
            &mut triplets,
            &mut grad,
        );
        assert_eq!(triplets.len(), 2);
        assert_eq!(triplets.next_free_index(), 1);
        // image 1 factor and star 1 flux
        let rows: Vec<_> = triplets.iter().map(|t| t.row).collect();
        assert_eq!(rows, vec![1, 3]);
        assert_eq!(grad[0], 0.0);
        assert_eq!(grad[2], 0.0);

        let mut indices = vec![];
        fit.indices_of_measured_star(&associations, id, &mut indices);
        assert_eq!(indices, vec![1, 3]);
    }

    #[test]
    fn reference_dump() {
        let associations = associations();
        let fit = PhotometryFit::new(SimplePhotometryModel::new(2), 0.0);
        let mut buffer = vec![];
        fit.write_chi2_ref_contributions(&associations, &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "fitted_star,ref_star,fitted_flux,ref_flux,sigma,chi2",
                "0,0,100.0,101.0,2.0,0.25"
            ]
        );
    }
}
