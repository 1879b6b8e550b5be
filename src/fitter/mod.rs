//! Least-squares fit of the models and the fitted stars, with outlier rejection

use crate::associations::Associations;
use crate::chi2::{Chi2Accumulator, Chi2List, Chi2Star, Chi2Statistic};
use crate::diagnostics::{DiagnosticsSink, LogSink, diag};
use crate::error::{Chi2DumpError, FactorizationError, FitterError};
use crate::sparse::{SimplicialLdlt, SparseSymmetric};
use crate::star::{CcdImageId, FittedStarId, MeasuredStar, MeasuredStarId};
use crate::triplet_list::TripletList;

use itertools::Itertools;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;

mod astrometry;
pub use astrometry::AstrometryFit;

mod config;
pub use config::{FactorizationUpdate, FitterConfig};

mod photometry;
pub use photometry::PhotometryFit;

/// Residuals and derivatives of a concrete least-squares problem
///
/// [Fitter] drives the minimisation, the implementor knows which parameters exist and how every
/// measurement and reference term depends on them.
///
/// Derivatives are reported as triplets of the Jacobian `J` whose rows are global parameter
/// indices and whose columns are whitened residuals, each column allocated from the
/// [TripletList]. The gradient receives `-Jᵀ·W·r`, the right-hand side of the normal
/// equations.
pub trait FitProblem {
    /// Target of the default [LogSink]
    fn name(&self) -> &'static str;

    /// Assigns global indices to the parameters selected by `what_to_fit`, returns their total
    /// number
    fn assign_indices(
        &mut self,
        associations: &mut Associations,
        what_to_fit: &str,
    ) -> Result<usize, FitterError>;

    /// Adds `delta` to every fitted parameter
    fn offset_params(&mut self, associations: &mut Associations, delta: ArrayView1<f64>);

    /// Adds the chi2 of every valid measurement
    fn accumulate_stat_image_list(
        &self,
        associations: &Associations,
        accum: &mut dyn Chi2Accumulator,
    );

    /// Adds the chi2 of every fitted star linked to a reference star
    fn accumulate_stat_ref_stars(&self, associations: &Associations, accum: &mut dyn Chi2Accumulator);

    /// Global indices of the parameters constrained by the measurement
    fn indices_of_measured_star(
        &self,
        associations: &Associations,
        id: MeasuredStarId,
        indices: &mut Vec<usize>,
    );

    /// Derivatives of the measurements of an image, either all the valid ones or only the
    /// `subset`
    fn least_square_derivatives_measurement(
        &self,
        associations: &Associations,
        ccd: CcdImageId,
        subset: Option<&[MeasuredStarId]>,
        triplets: &mut TripletList,
        grad: &mut Array1<f64>,
    );

    /// Derivatives of the reference terms of the given fitted stars
    fn least_square_derivatives_reference(
        &self,
        associations: &Associations,
        fitted_stars: &[FittedStarId],
        triplets: &mut TripletList,
        grad: &mut Array1<f64>,
    );

    fn write_chi2_meas_contributions(
        &self,
        associations: &Associations,
        writer: &mut dyn io::Write,
    ) -> Result<(), Chi2DumpError>;

    fn write_chi2_ref_contributions(
        &self,
        associations: &Associations,
        writer: &mut dyn io::Write,
    ) -> Result<(), Chi2DumpError>;
}

/// Outcome of [Fitter::minimize]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MinimizeResult {
    /// No more outliers, the last step did not increase chi2
    Converged,
    /// Chi2 increased after outliers had been removed, the fit stopped early
    Chi2Increased,
    /// The normal equations could not be factorized
    Failed,
}

/// Summary of a [Fitter::minimize] call
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MinimizeReport {
    pub result: MinimizeResult,
    pub newton_steps: usize,
    /// Number of outlier detection passes, zero if rejection is disabled
    pub outlier_passes: usize,
    pub measurement_outliers: usize,
    pub reference_outliers: usize,
    /// Chi2 at return
    pub chi2: Chi2Statistic,
}

impl MinimizeReport {
    fn new() -> Self {
        Self {
            result: MinimizeResult::Converged,
            newton_steps: 0,
            outlier_passes: 0,
            measurement_outliers: 0,
            reference_outliers: 0,
            chi2: Chi2Statistic::default(),
        }
    }

    pub fn total_outliers(&self) -> usize {
        self.measurement_outliers + self.reference_outliers
    }
}

/// Terms accepted for removal by one outlier pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outliers {
    pub measurements: Vec<MeasuredStarId>,
    /// Fitted stars whose reference link goes away
    pub references: Vec<FittedStarId>,
}

impl Outliers {
    pub fn len(&self) -> usize {
        self.measurements.len() + self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty() && self.references.is_empty()
    }
}

/// Names of the measurement and reference chi2 dumps derived from `base_name`
///
/// The suffix goes before the extension, a dot in a directory name is not an extension:
/// `"chi2.csv"` gives `"chi2-meas.csv"`, `"out.d/chi2"` gives `"out.d/chi2-meas"`.
pub fn chi2_contribution_file_names(base_name: &str) -> (String, String) {
    let insert_at = match (base_name.rfind('.'), base_name.rfind('/')) {
        (Some(dot), Some(slash)) if slash > dot => base_name.len(),
        (Some(dot), _) => dot,
        (None, _) => base_name.len(),
    };
    let (stem, extension) = base_name.split_at(insert_at);
    (
        format!("{stem}-meas{extension}"),
        format!("{stem}-ref{extension}"),
    )
}

/// Newton minimiser of a [FitProblem]
pub struct Fitter<P> {
    problem: P,
    sink: Box<dyn DiagnosticsSink>,
    n_par_tot: usize,
    last_n_trip: usize,
    initial_triplet_capacity: usize,
}

impl<P> Fitter<P>
where
    P: FitProblem,
{
    /// Fitter reporting to the [log] facade
    pub fn new(problem: P) -> Self {
        let sink = Box::new(LogSink::new(problem.name()));
        Self::with_sink(problem, sink)
    }

    pub fn with_sink(problem: P, sink: Box<dyn DiagnosticsSink>) -> Self {
        Self {
            problem,
            sink,
            n_par_tot: 0,
            last_n_trip: 0,
            initial_triplet_capacity: FitterConfig::default_initial_triplet_capacity(),
        }
    }

    pub fn problem(&self) -> &P {
        &self.problem
    }

    pub fn problem_mut(&mut self) -> &mut P {
        &mut self.problem
    }

    pub fn into_problem(self) -> P {
        self.problem
    }

    /// Number of parameters of the last [Fitter::minimize] call
    pub fn n_par_tot(&self) -> usize {
        self.n_par_tot
    }

    pub fn set_initial_triplet_capacity(&mut self, capacity: usize) {
        self.initial_triplet_capacity = capacity;
    }

    /// Total chi2 of the valid measurements and the reference terms
    ///
    /// The number of degrees of freedom is the number of squares minus the number of parameters
    /// of the last [Fitter::minimize] call.
    pub fn compute_chi2(&self, associations: &Associations) -> Chi2Statistic {
        let mut chi2 = Chi2Statistic::default();
        self.problem.accumulate_stat_image_list(associations, &mut chi2);
        self.problem.accumulate_stat_ref_stars(associations, &mut chi2);
        chi2.ndof -= self.n_par_tot as i64;
        chi2
    }

    /// Does a full fit of the parameters selected by `what_to_fit`
    ///
    /// Newton steps alternate with outlier passes until a pass finds no outlier. With a zero
    /// `n_sigma_cut` a single Newton step is made. Factorization failures are reported as
    /// [MinimizeResult::Failed], only a malformed `what_to_fit` is an error.
    ///
    /// [FactorizationUpdate::RankUpdate] assumes the problem is linear in its parameters, so
    /// that the gradient vanishes after every Newton step.
    pub fn minimize(
        &mut self,
        associations: &mut Associations,
        what_to_fit: &str,
        n_sigma_cut: f64,
        factorization_update: FactorizationUpdate,
    ) -> Result<MinimizeReport, FitterError> {
        self.n_par_tot = self.problem.assign_indices(associations, what_to_fit)?;
        diag!(
            self.sink,
            Debug,
            "fitting \"{what_to_fit}\": {} parameters",
            self.n_par_tot
        );

        let mut report = MinimizeReport::new();
        let mut grad = Array1::zeros(self.n_par_tot);
        let mut ldlt = match self.factorize(associations, &mut grad) {
            Ok(ldlt) => ldlt,
            Err(error) => return Ok(self.failed(associations, report, error)),
        };
        let mut old_chi2 = self.compute_chi2(associations).chi2;

        loop {
            let delta = match ldlt.solve(grad.view()) {
                Ok(delta) => delta,
                Err(error) => return Ok(self.failed(associations, report, error)),
            };
            self.problem.offset_params(associations, delta.view());
            report.newton_steps += 1;

            let current_chi2 = self.compute_chi2(associations);
            diag!(self.sink, Debug, "{current_chi2}");
            if current_chi2.chi2 > old_chi2 && report.total_outliers() != 0 {
                diag!(
                    self.sink,
                    Warn,
                    "chi2 went up, skipping outlier rejection loop"
                );
                report.result = MinimizeResult::Chi2Increased;
                break;
            }
            old_chi2 = current_chi2.chi2;

            if n_sigma_cut == 0.0 {
                break;
            }

            let outliers = self.find_outliers(associations, n_sigma_cut);
            report.outlier_passes += 1;
            report.measurement_outliers += outliers.measurements.len();
            report.reference_outliers += outliers.references.len();
            diag!(
                self.sink,
                Debug,
                "found {} outliers ({} measured, {} reference)",
                outliers.len(),
                outliers.measurements.len(),
                outliers.references.len()
            );
            if outliers.is_empty() {
                break;
            }

            grad.fill(0.0);
            let mut outlier_triplets = TripletList::new(8 * outliers.len());
            self.outliers_contributions(associations, &outliers, &mut outlier_triplets, &mut grad);
            remove_outliers(associations, &outliers);

            match factorization_update {
                FactorizationUpdate::RankUpdate => {
                    if let Err(error) = ldlt.downdate(&outlier_triplets) {
                        return Ok(self.failed(associations, report, error));
                    }
                    // the remaining terms balance the removed ones
                    grad *= -1.0;
                }
                FactorizationUpdate::Rebuild => {
                    grad.fill(0.0);
                    ldlt = match self.factorize(associations, &mut grad) {
                        Ok(ldlt) => ldlt,
                        Err(error) => return Ok(self.failed(associations, report, error)),
                    };
                }
            }
        }

        if n_sigma_cut != 0.0 {
            diag!(
                self.sink,
                Info,
                "number of outliers (measured + reference = total): {} + {} = {}",
                report.measurement_outliers,
                report.reference_outliers,
                report.total_outliers()
            );
        }
        report.chi2 = self.compute_chi2(associations);
        Ok(report)
    }

    /// Runs [Fitter::minimize] until it converges, fails or the iteration budget is exhausted
    ///
    /// The [FitterConfig::initial_fits] go first, each with a single Newton step and no outlier
    /// rejection. A converged fit is minimised once more from scratch, which recovers the
    /// accuracy lost in the rank updates. Returns the reports of every call.
    pub fn iterate(
        &mut self,
        associations: &mut Associations,
        config: &FitterConfig,
    ) -> Result<Vec<MinimizeReport>, FitterError> {
        self.initial_triplet_capacity = config.initial_triplet_capacity;
        let mut reports = vec![];
        for what_to_fit in &config.initial_fits {
            let report =
                self.minimize(associations, what_to_fit, 0.0, config.factorization_update)?;
            reports.push(report);
            diag!(self.sink, Info, "initial fit of \"{what_to_fit}\": {}", report.chi2);
            if report.result == MinimizeResult::Failed {
                diag!(self.sink, Error, "initial fit failed, giving up");
                return Ok(reports);
            }
        }
        for _ in 0..config.max_outlier_iterations.max(1) {
            let report = self.minimize(
                associations,
                &config.what_to_fit,
                config.n_sigma_cut,
                config.factorization_update,
            )?;
            reports.push(report);
            match report.result {
                MinimizeResult::Converged => {
                    diag!(
                        self.sink,
                        Debug,
                        "fit has converged, redoing minimization one more time"
                    );
                    let report = self.minimize(
                        associations,
                        &config.what_to_fit,
                        config.n_sigma_cut,
                        config.factorization_update,
                    )?;
                    reports.push(report);
                    return Ok(reports);
                }
                MinimizeResult::Chi2Increased => {
                    diag!(
                        self.sink,
                        Warn,
                        "still some outliers but chi2 increases, retrying"
                    );
                }
                MinimizeResult::Failed => {
                    diag!(self.sink, Error, "fit failed, giving up");
                    return Ok(reports);
                }
            }
        }
        diag!(
            self.sink,
            Warn,
            "fit did not converge after {} iterations",
            config.max_outlier_iterations.max(1)
        );
        Ok(reports)
    }

    /// Finds the terms above `mean + n_sigma_cut * sigma` of the chi2 distribution
    ///
    /// Terms are examined from the largest chi2 down. A term is skipped when its removal would
    /// leave a fitted star unconstrained, or when it constrains a parameter already constrained
    /// by an outlier accepted in this pass; the latter is reconsidered by the next pass.
    pub fn find_outliers(&self, associations: &Associations, n_sigma_cut: f64) -> Outliers {
        let mut chi2_list = Chi2List::with_capacity(associations.n_measured_stars());
        self.problem
            .accumulate_stat_image_list(associations, &mut chi2_list);
        self.problem
            .accumulate_stat_ref_stars(associations, &mut chi2_list);
        let mut outliers = Outliers::default();
        let Some(stats) = chi2_list.stats() else {
            return outliers;
        };
        let cut = stats.mean + n_sigma_cut * stats.sigma;
        diag!(
            self.sink,
            Debug,
            "chi2 per term: mean {}, median {}, sigma {}, cut {cut}",
            stats.mean,
            stats.median,
            stats.sigma
        );

        let mut affected = vec![false; self.n_par_tot];
        let mut removed_measurements: HashMap<FittedStarId, usize> = HashMap::new();
        let mut removed_references: HashSet<FittedStarId> = HashSet::new();
        let mut indices = vec![];
        for term in chi2_list.iter().rev() {
            if term.chi2 < cut {
                break;
            }
            indices.clear();
            match term.star {
                Chi2Star::Reference(id) => {
                    let fitted_star = associations.fitted_star(id);
                    let remaining = fitted_star
                        .measurement_count()
                        .saturating_sub(removed_measurements.get(&id).copied().unwrap_or(0));
                    if remaining == 0 {
                        diag!(
                            self.sink,
                            Warn,
                            "reference term of a fitted star without measurements found as an \
                            outlier, keeping it: {fitted_star}"
                        );
                        continue;
                    }
                    indices.extend(fitted_star.index_in_matrix());
                }
                Chi2Star::Measurement(id) => {
                    let fitted_star_id = associations.measured_star(id).fitted_star();
                    let fitted_star = associations.fitted_star(fitted_star_id);
                    let remaining = fitted_star.measurement_count().saturating_sub(
                        removed_measurements
                            .get(&fitted_star_id)
                            .copied()
                            .unwrap_or(0),
                    );
                    let has_ref = fitted_star.ref_star().is_some()
                        && !removed_references.contains(&fitted_star_id);
                    if remaining <= 1 && !has_ref {
                        diag!(
                            self.sink,
                            Warn,
                            "last measurement of an unreferenced fitted star found as an \
                            outlier, keeping it: {fitted_star}"
                        );
                        continue;
                    }
                    self.problem
                        .indices_of_measured_star(associations, id, &mut indices);
                }
            }

            if indices
                .iter()
                .any(|&i| affected.get(i).copied().unwrap_or(false))
            {
                continue;
            }
            for &i in &indices {
                if let Some(flag) = affected.get_mut(i) {
                    *flag = true;
                }
            }
            match term.star {
                Chi2Star::Reference(id) => {
                    removed_references.insert(id);
                    outliers.references.push(id);
                }
                Chi2Star::Measurement(id) => {
                    let fitted_star_id = associations.measured_star(id).fitted_star();
                    *removed_measurements.entry(fitted_star_id).or_insert(0) += 1;
                    outliers.measurements.push(id);
                }
            }
        }
        outliers
    }

    /// Writes the chi2 of every term into `<base>-meas<ext>` and `<base>-ref<ext>`, see
    /// [chi2_contribution_file_names]
    pub fn save_chi2_contributions(
        &self,
        associations: &Associations,
        base_name: &str,
    ) -> Result<(), Chi2DumpError> {
        let (meas_name, ref_name) = chi2_contribution_file_names(base_name);
        let mut meas_file = File::create(&meas_name)?;
        self.problem
            .write_chi2_meas_contributions(associations, &mut meas_file)?;
        let mut ref_file = File::create(&ref_name)?;
        self.problem
            .write_chi2_ref_contributions(associations, &mut ref_file)?;
        diag!(
            self.sink,
            Info,
            "chi2 contributions written to {meas_name} and {ref_name}"
        );
        Ok(())
    }

    fn least_square_derivatives(
        &self,
        associations: &Associations,
        triplets: &mut TripletList,
        grad: &mut Array1<f64>,
    ) {
        for ccd in associations.ccd_image_ids() {
            self.problem
                .least_square_derivatives_measurement(associations, ccd, None, triplets, grad);
        }
        let fitted_stars = associations.fitted_star_ids().collect_vec();
        self.problem
            .least_square_derivatives_reference(associations, &fitted_stars, triplets, grad);
    }

    /// Derivatives of the outliers only, to be taken out of the normal equations
    fn outliers_contributions(
        &self,
        associations: &Associations,
        outliers: &Outliers,
        triplets: &mut TripletList,
        grad: &mut Array1<f64>,
    ) {
        let by_ccd = outliers
            .measurements
            .iter()
            .copied()
            .into_group_map_by(|id| id.ccd);
        for ccd in by_ccd.keys().copied().sorted() {
            self.problem.least_square_derivatives_measurement(
                associations,
                ccd,
                Some(by_ccd[&ccd].as_slice()),
                triplets,
                grad,
            );
        }
        self.problem.least_square_derivatives_reference(
            associations,
            &outliers.references,
            triplets,
            grad,
        );
    }

    fn factorize(
        &mut self,
        associations: &Associations,
        grad: &mut Array1<f64>,
    ) -> Result<SimplicialLdlt, FactorizationError> {
        let capacity = if self.last_n_trip > 0 {
            self.last_n_trip
        } else {
            self.initial_triplet_capacity
        };
        let mut triplets = TripletList::new(capacity);
        self.least_square_derivatives(associations, &mut triplets, grad);
        self.last_n_trip = triplets.len();
        diag!(
            self.sink,
            Debug,
            "end of triplet filling, ntrip = {}",
            triplets.len()
        );

        let hessian = SparseSymmetric::from_jacobian(self.n_par_tot, &triplets);
        drop(triplets);
        diag!(
            self.sink,
            Debug,
            "starting factorization, hessian: dim = {}, non-zeros = {}, filling-frac = {}",
            hessian.dim(),
            hessian.nnz_full(),
            hessian.filling_fraction()
        );
        SimplicialLdlt::factorize(&hessian)
    }

    fn failed(
        &self,
        associations: &Associations,
        mut report: MinimizeReport,
        error: FactorizationError,
    ) -> MinimizeReport {
        diag!(self.sink, Error, "factorization failed: {error}");
        report.result = MinimizeResult::Failed;
        report.chi2 = self.compute_chi2(associations);
        report
    }
}

/// Valid measurements of the image, or the `subset` of them
pub(crate) fn selected_measurements<'a>(
    associations: &'a Associations,
    ccd: CcdImageId,
    subset: Option<&'a [MeasuredStarId]>,
) -> Box<dyn Iterator<Item = (MeasuredStarId, &'a MeasuredStar)> + 'a> {
    match subset {
        Some(ids) => Box::new(
            ids.iter()
                .map(move |&id| (id, associations.measured_star(id))),
        ),
        None => Box::new(associations.ccd_image(ccd).valid_measured_stars(ccd)),
    }
}

fn remove_outliers(associations: &mut Associations, outliers: &Outliers) {
    for &id in &outliers.measurements {
        associations.invalidate_measured_star(id);
    }
    for &id in &outliers.references {
        associations.sever_ref_star(id);
    }
}
