use crate::star::CcdImageId;

use ndarray::ArrayView1;

/// Mapping of the instrumental fluxes of every image onto the common flux scale
pub trait PhotometryModel {
    /// Assigns consecutive global indices, starting from `first_index`, to the parameters
    /// selected by `what_to_fit` and returns their number
    fn assign_indices(&mut self, what_to_fit: &str, first_index: usize) -> usize;

    /// Adds the model's part of `delta` to its parameters
    fn offset_params(&mut self, delta: ArrayView1<f64>);

    /// Global indices of the fitted parameters of the image
    fn indices(&self, ccd: CcdImageId) -> &[usize];

    fn transform(&self, ccd: CcdImageId, inst_flux: f64) -> f64;

    fn transform_error(&self, ccd: CcdImageId, inst_flux: f64, inst_flux_err: f64) -> f64;

    /// Derivatives of the transformed flux with respect to the parameters of the image, in the
    /// order of [PhotometryModel::indices]
    fn compute_parameter_derivatives(
        &self,
        ccd: CcdImageId,
        inst_flux: f64,
        derivatives: &mut Vec<f64>,
    );
}

/// Single multiplicative factor per image
#[derive(Clone, Debug)]
pub struct SimplePhotometryModel {
    factors: Vec<f64>,
    indices: Vec<usize>,
}

impl SimplePhotometryModel {
    /// Unit factors for `n_ccd` images
    pub fn new(n_ccd: usize) -> Self {
        Self {
            factors: vec![1.0; n_ccd],
            indices: vec![0; n_ccd],
        }
    }

    pub fn factor(&self, ccd: CcdImageId) -> f64 {
        self.factors[ccd.0]
    }

    pub fn set_factor(&mut self, ccd: CcdImageId, factor: f64) {
        self.factors[ccd.0] = factor;
    }
}

impl PhotometryModel for SimplePhotometryModel {
    fn assign_indices(&mut self, _what_to_fit: &str, first_index: usize) -> usize {
        for (i, index) in self.indices.iter_mut().enumerate() {
            *index = first_index + i;
        }
        self.indices.len()
    }

    fn offset_params(&mut self, delta: ArrayView1<f64>) {
        for (factor, &index) in self.factors.iter_mut().zip(&self.indices) {
            *factor += delta[index];
        }
    }

    fn indices(&self, ccd: CcdImageId) -> &[usize] {
        std::slice::from_ref(&self.indices[ccd.0])
    }

    fn transform(&self, ccd: CcdImageId, inst_flux: f64) -> f64 {
        self.factors[ccd.0] * inst_flux
    }

    fn transform_error(&self, ccd: CcdImageId, _inst_flux: f64, inst_flux_err: f64) -> f64 {
        self.factors[ccd.0] * inst_flux_err
    }

    fn compute_parameter_derivatives(
        &self,
        _ccd: CcdImageId,
        inst_flux: f64,
        derivatives: &mut Vec<f64>,
    ) {
        derivatives.clear();
        derivatives.push(inst_flux);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::Array1;

    #[test]
    fn factor_scales_flux_and_error() {
        let mut model = SimplePhotometryModel::new(3);
        assert_eq!(model.assign_indices("Model", 10), 3);
        assert_eq!(model.indices(CcdImageId(2)), &[12]);
        model.set_factor(CcdImageId(1), 2.0);
        assert_eq!(model.transform(CcdImageId(1), 5.0), 10.0);
        assert_eq!(model.transform_error(CcdImageId(1), 5.0, 0.5), 1.0);

        let mut delta = Array1::zeros(13);
        delta[11] = 0.5;
        model.offset_params(delta.view());
        assert_eq!(model.factor(CcdImageId(1)), 2.5);
        assert_eq!(model.factor(CcdImageId(0)), 1.0);
    }
}
