use crate::associations::Associations;
use crate::chi2::{Chi2Accumulator, Chi2Star};
use crate::error::{Chi2DumpError, FitterError};
use crate::fitter::{FitProblem, selected_measurements};
use crate::model::AstrometryModel;
use crate::star::{CcdImageId, FittedStarId, MeasuredStar, MeasuredStarId, Point};
use crate::triplet_list::TripletList;

use ndarray::{Array1, ArrayView1};
use serde::Serialize;
use std::io;

/// Inverse of a 2×2 position covariance
#[derive(Clone, Copy, Debug)]
struct Weight {
    xx: f64,
    yy: f64,
    xy: f64,
}

impl Weight {
    /// `None` for a covariance which is not positive definite
    fn from_covariance(vx: f64, vy: f64, vxy: f64) -> Option<Self> {
        let det = vx * vy - vxy * vxy;
        if !(det > 0.0 && vx > 0.0) {
            return None;
        }
        Some(Self {
            xx: vy / det,
            yy: vx / det,
            xy: -vxy / det,
        })
    }

    fn chi2(&self, r: [f64; 2]) -> f64 {
        self.xx * r[0] * r[0] + 2.0 * self.xy * r[0] * r[1] + self.yy * r[1] * r[1]
    }

    fn apply(&self, r: [f64; 2]) -> [f64; 2] {
        [
            self.xx * r[0] + self.xy * r[1],
            self.xy * r[0] + self.yy * r[1],
        ]
    }

    /// Rows of `Aᵀ` with `W = A·Aᵀ`, `A` lower triangular
    fn whitening(&self) -> [[f64; 2]; 2] {
        let a11 = self.xx.sqrt();
        let a21 = self.xy / a11;
        let a22 = (self.yy - a21 * a21).max(0.0).sqrt();
        [[a11, a21], [0.0, a22]]
    }
}

/// Residual of a single measurement or reference term
#[derive(Clone, Copy, Debug)]
struct Term {
    position: Point,
    residual: [f64; 2],
    weight: Weight,
}

impl Term {
    fn chi2(&self) -> f64 {
        self.weight.chi2(self.residual)
    }
}

#[derive(Serialize)]
struct MeasurementRecord {
    ccd: usize,
    slot: usize,
    fitted_star: usize,
    x: f64,
    y: f64,
    residual_x: f64,
    residual_y: f64,
    chi2: f64,
}

#[derive(Serialize)]
struct ReferenceRecord {
    fitted_star: usize,
    ref_star: usize,
    x: f64,
    y: f64,
    residual_x: f64,
    residual_y: f64,
    chi2: f64,
}

/// Fit of the image mappings and the fitted star positions
///
/// Parameter sets: `Distortions` for the model, `Positions` for the fitted stars. Measured
/// positions are mapped through the model and compared with the position of their fitted
/// star; fitted stars linked to a reference star are compared with it.
#[derive(Clone, Debug)]
pub struct AstrometryFit<M> {
    model: M,
    pos_error: f64,
    fitting_distortions: bool,
    fitting_positions: bool,
    n_par_distortions: usize,
    n_par_positions: usize,
}

impl<M> AstrometryFit<M>
where
    M: AstrometryModel,
{
    /// `pos_error` is added in quadrature to both coordinates of every measurement error
    pub fn new(model: M, pos_error: f64) -> Self {
        Self {
            model,
            pos_error,
            fitting_distortions: false,
            fitting_positions: false,
            n_par_distortions: 0,
            n_par_positions: 0,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn n_par_distortions(&self) -> usize {
        self.n_par_distortions
    }

    pub fn n_par_positions(&self) -> usize {
        self.n_par_positions
    }

    fn measurement_term(
        &self,
        associations: &Associations,
        ccd: CcdImageId,
        measured_star: &MeasuredStar,
    ) -> Option<Term> {
        let pe2 = self.pos_error.powi(2);
        let weight = Weight::from_covariance(
            measured_star.vx + pe2,
            measured_star.vy + pe2,
            measured_star.vxy,
        )?;
        let position = self
            .model
            .transform(ccd, Point::new(measured_star.x, measured_star.y));
        let fitted_star = associations.fitted_star(measured_star.fitted_star());
        Some(Term {
            position,
            residual: [position.x - fitted_star.x, position.y - fitted_star.y],
            weight,
        })
    }

    fn reference_term(&self, associations: &Associations, id: FittedStarId) -> Option<Term> {
        let fitted_star = associations.fitted_star(id);
        let ref_star = associations.ref_star(fitted_star.ref_star()?);
        let weight = Weight::from_covariance(ref_star.vx, ref_star.vy, ref_star.vxy)?;
        Some(Term {
            position: Point::new(fitted_star.x, fitted_star.y),
            residual: [fitted_star.x - ref_star.x, fitted_star.y - ref_star.y],
            weight,
        })
    }
}

/// Adds the whitened derivative columns of a term and its gradient contribution
fn add_term_derivatives(
    term: &Term,
    derivatives: &[(usize, [f64; 2])],
    triplets: &mut TripletList,
    grad: &mut Array1<f64>,
) {
    if derivatives.is_empty() {
        return;
    }
    let [[a11, a21], [_, a22]] = term.weight.whitening();
    let wr = term.weight.apply(term.residual);
    let col = triplets.allocate_columns(2);
    for &(index, [hx, hy]) in derivatives {
        let first = a11 * hx + a21 * hy;
        let second = a22 * hy;
        if first != 0.0 {
            triplets.add_triplet(index, col, first);
        }
        if second != 0.0 {
            triplets.add_triplet(index, col + 1, second);
        }
        grad[index] -= hx * wr[0] + hy * wr[1];
    }
}

impl<M> FitProblem for AstrometryFit<M>
where
    M: AstrometryModel,
{
    fn name(&self) -> &'static str {
        "jointcal::AstrometryFit"
    }

    fn assign_indices(
        &mut self,
        associations: &mut Associations,
        what_to_fit: &str,
    ) -> Result<usize, FitterError> {
        self.fitting_distortions = what_to_fit.contains("Distortions");
        self.fitting_positions = what_to_fit.contains("Positions");
        if !(self.fitting_distortions || self.fitting_positions) {
            return Err(FitterError::NothingToFit {
                what_to_fit: what_to_fit.to_string(),
            });
        }

        self.n_par_distortions = if self.fitting_distortions {
            self.model.assign_indices(what_to_fit, 0)
        } else {
            0
        };
        let mut ipar = self.n_par_distortions;
        for fitted_star in associations.fitted_stars_mut() {
            if self.fitting_positions && fitted_star.is_constrained() {
                fitted_star.set_index_in_matrix(Some(ipar));
                ipar += 2;
            } else {
                fitted_star.set_index_in_matrix(None);
            }
        }
        self.n_par_positions = ipar - self.n_par_distortions;
        Ok(ipar)
    }

    fn offset_params(&mut self, associations: &mut Associations, delta: ArrayView1<f64>) {
        if self.fitting_distortions {
            self.model.offset_params(delta);
        }
        if self.fitting_positions {
            for fitted_star in associations.fitted_stars_mut() {
                if let Some(index) = fitted_star.index_in_matrix() {
                    fitted_star.x += delta[index];
                    fitted_star.y += delta[index + 1];
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
                if let Some(term) = self.measurement_term(associations, ccd, measured_star) {
                    accum.add_entry(term.chi2(), 2, Chi2Star::Measurement(id));
                }
            }
        }
    }

    fn accumulate_stat_ref_stars(&self, associations: &Associations, accum: &mut dyn Chi2Accumulator) {
        for id in associations.fitted_star_ids() {
            if let Some(term) = self.reference_term(associations, id) {
                accum.add_entry(term.chi2(), 2, Chi2Star::Reference(id));
            }
        }
    }

    fn indices_of_measured_star(
        &self,
        associations: &Associations,
        id: MeasuredStarId,
        indices: &mut Vec<usize>,
    ) {
        if self.fitting_distortions {
            indices.extend_from_slice(self.model.indices(id.ccd));
        }
        if self.fitting_positions {
            if let Some(index) = associations.fitted_star_of(id).index_in_matrix() {
                indices.extend([index, index + 1]);
            }
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
        let mut derivatives = vec![];
        for (_, measured_star) in selected_measurements(associations, ccd, subset) {
            let Some(term) = self.measurement_term(associations, ccd, measured_star) else {
                continue;
            };
            derivatives.clear();
            if self.fitting_distortions {
                self.model.compute_derivatives(
                    ccd,
                    Point::new(measured_star.x, measured_star.y),
                    &mut model_derivatives,
                );
                derivatives.extend(
                    self.model
                        .indices(ccd)
                        .iter()
                        .copied()
                        .zip(model_derivatives.iter().copied()),
                );
            }
            if self.fitting_positions {
                let fitted_star = associations.fitted_star(measured_star.fitted_star());
                if let Some(index) = fitted_star.index_in_matrix() {
                    derivatives.extend([(index, [-1.0, 0.0]), (index + 1, [0.0, -1.0])]);
                }
            }
            add_term_derivatives(&term, &derivatives, triplets, grad);
        }
    }

    fn least_square_derivatives_reference(
        &self,
        associations: &Associations,
        fitted_stars: &[FittedStarId],
        triplets: &mut TripletList,
        grad: &mut Array1<f64>,
    ) {
        if !self.fitting_positions {
            return;
        }
        for &id in fitted_stars {
            let Some(term) = self.reference_term(associations, id) else {
                continue;
            };
            let Some(index) = associations.fitted_star(id).index_in_matrix() else {
                continue;
            };
            add_term_derivatives(
                &term,
                &[(index, [1.0, 0.0]), (index + 1, [0.0, 1.0])],
                triplets,
                grad,
            );
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
                let Some(term) = self.measurement_term(associations, ccd, measured_star) else {
                    continue;
                };
                writer.serialize(MeasurementRecord {
                    ccd: id.ccd.index(),
                    slot: id.slot,
                    fitted_star: measured_star.fitted_star().index(),
                    x: term.position.x,
                    y: term.position.y,
                    residual_x: term.residual[0],
                    residual_y: term.residual[1],
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
                x: term.position.x,
                y: term.position.y,
                residual_x: term.residual[0],
                residual_y: term.residual[1],
                chi2: term.chi2(),
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}
