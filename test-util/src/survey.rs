use jointcal::{
    Associations, CcdImageId, Detection, FittedStarId, MeasuredStarId, RefStar,
    ShiftAstrometryModel, SimplePhotometryModel,
};
use rand::prelude::*;

/// Builder of a survey of overlapping images of the same star field
///
/// Stars lie on a jittered 10-unit grid, so that catalogs associate without ambiguity. Every
/// image sees every star with its own flux scale and position shift. Noise is bounded and
/// balanced: each star gets `+a` on one image, `-a` on another and nothing on the others, `a`
/// uniform in `[0, noise]` errors, which keeps every term of the converged fit well within the
/// usual outlier cuts.
#[derive(Clone, Debug)]
pub struct SyntheticSurvey {
    pub n_ccd: usize,
    pub n_stars: usize,
    /// The first `n_ref` stars have a reference star
    pub n_ref: usize,
    /// Relative instrumental flux error
    pub flux_rel_error: f64,
    /// Coordinate error of the measurements
    pub pos_error: f64,
    /// Errors of the reference stars relative to the measurement errors
    pub ref_error_factor: f64,
    /// Noise amplitude, in errors
    pub noise: f64,
    pub seed: u64,
    flux_outliers: Vec<(usize, usize, f64)>,
    position_outliers: Vec<(usize, usize, f64)>,
}

/// Associations built by [SyntheticSurvey::build] with the true parameters
#[derive(Clone, Debug)]
pub struct Survey {
    pub associations: Associations,
    pub ccds: Vec<CcdImageId>,
    pub true_fluxes: Vec<f64>,
    pub true_positions: Vec<[f64; 2]>,
    /// Factor mapping instrumental fluxes of every image onto true fluxes
    pub scales: Vec<f64>,
    /// Shift mapping measured positions of every image onto true positions
    pub shifts: Vec<[f64; 2]>,
}

impl SyntheticSurvey {
    pub fn new(n_ccd: usize, n_stars: usize) -> Self {
        Self {
            n_ccd,
            n_stars,
            n_ref: 1,
            flux_rel_error: 0.01,
            pos_error: 0.01,
            ref_error_factor: 0.5,
            noise: 2.0,
            seed: 0,
            flux_outliers: vec![],
            position_outliers: vec![],
        }
    }

    pub fn with_ref_stars(mut self, n_ref: usize) -> Self {
        self.n_ref = n_ref;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    /// Multiplies the instrumental flux of `star` on image `ccd` by `1 + n_sigma * error`
    pub fn with_flux_outlier(mut self, ccd: usize, star: usize, n_sigma: f64) -> Self {
        self.flux_outliers.push((ccd, star, n_sigma));
        self
    }

    /// Moves `star` on image `ccd` by `n_sigma` position errors along x
    pub fn with_position_outlier(mut self, ccd: usize, star: usize, n_sigma: f64) -> Self {
        self.position_outliers.push((ccd, star, n_sigma));
        self
    }

    pub fn build(&self) -> Survey {
        let mut rng = StdRng::seed_from_u64(self.seed);

        let true_positions: Vec<[f64; 2]> = (0..self.n_stars)
            .map(|k| {
                [
                    10.0 * (k % 10) as f64 + rng.random_range(-2.0..2.0),
                    10.0 * (k / 10) as f64 + rng.random_range(-2.0..2.0),
                ]
            })
            .collect();
        let true_fluxes: Vec<f64> = (0..self.n_stars)
            .map(|_| rng.random_range(100.0..1000.0))
            .collect();
        let scales: Vec<f64> = (0..self.n_ccd).map(|i| 1.0 + 0.01 * i as f64).collect();
        let shifts: Vec<[f64; 2]> = (0..self.n_ccd)
            .map(|i| [0.01 * i as f64, -0.005 * i as f64])
            .collect();

        // noise[ccd][star] in errors, positions get the same noise along both axes
        let mut flux_noise = vec![vec![0.0; self.n_stars]; self.n_ccd];
        let mut position_noise = vec![vec![0.0; self.n_stars]; self.n_ccd];
        for noise in [&mut flux_noise, &mut position_noise] {
            for k in 0..self.n_stars {
                self.balanced_noise(&mut rng, noise, k);
            }
        }

        let mut associations = Associations::new();
        let mut ccds = vec![];
        for i in 0..self.n_ccd {
            let ccd = associations.add_ccd_image(format!("ccd{i}"));
            let detections: Vec<Detection> = (0..self.n_stars)
                .map(|k| {
                    let mut inst_flux = true_fluxes[k] / scales[i];
                    inst_flux *= 1.0 + self.flux_rel_error * flux_noise[i][k];
                    let offset = self.pos_error * position_noise[i][k];
                    let mut x = true_positions[k][0] - shifts[i][0] + offset;
                    let y = true_positions[k][1] - shifts[i][1] + offset;
                    for &(ccd, star, n_sigma) in &self.flux_outliers {
                        if (ccd, star) == (i, k) {
                            inst_flux *= 1.0 + n_sigma * self.flux_rel_error;
                        }
                    }
                    for &(ccd, star, n_sigma) in &self.position_outliers {
                        if (ccd, star) == (i, k) {
                            x += n_sigma * self.pos_error;
                        }
                    }
                    Detection {
                        x,
                        y,
                        vx: self.pos_error.powi(2),
                        vy: self.pos_error.powi(2),
                        vxy: 0.0,
                        inst_flux,
                        inst_flux_err: self.flux_rel_error * true_fluxes[k] / scales[i],
                    }
                })
                .collect();
            associations.associate_catalog(ccd, &detections, 1.0);
            ccds.push(ccd);
        }

        let ref_stars = (0..self.n_ref.min(self.n_stars))
            .map(|k| {
                RefStar::new(
                    true_positions[k][0],
                    true_positions[k][1],
                    self.ref_error_factor * self.pos_error,
                    true_fluxes[k],
                    self.ref_error_factor * self.flux_rel_error * true_fluxes[k],
                )
            })
            .collect();
        associations.collect_ref_stars(ref_stars, 1.0);

        Survey {
            associations,
            ccds,
            true_fluxes,
            true_positions,
            scales,
            shifts,
        }
    }

    fn balanced_noise(&self, rng: &mut StdRng, noise: &mut [Vec<f64>], star: usize) {
        if self.n_ccd < 2 {
            return;
        }
        let amplitude = rng.random_range(0.0..=self.noise);
        let images = rand::seq::index::sample(rng, self.n_ccd, 2);
        noise[images.index(0)][star] = amplitude;
        noise[images.index(1)][star] = -amplitude;
    }
}

impl Survey {
    /// Measurement of the `star`-th star on the `ccd`-th image
    pub fn measurement(&self, ccd: usize, star: usize) -> MeasuredStarId {
        MeasuredStarId {
            ccd: self.ccds[ccd],
            slot: star,
        }
    }

    /// Fitted star of the `star`-th star, the first image creates them in order
    pub fn fitted_star(&self, star: usize) -> FittedStarId {
        FittedStarId(star)
    }

    pub fn shift_model(&self) -> ShiftAstrometryModel {
        ShiftAstrometryModel::new(self.ccds.len())
    }

    pub fn photometry_model(&self) -> SimplePhotometryModel {
        SimplePhotometryModel::new(self.ccds.len())
    }
}
