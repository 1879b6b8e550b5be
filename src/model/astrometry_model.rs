use crate::star::{CcdImageId, Point};

use ndarray::ArrayView1;

/// Mapping of the measured positions of every image onto the common frame
pub trait AstrometryModel {
    /// Assigns consecutive global indices, starting from `first_index`, to the parameters
    /// selected by `what_to_fit` and returns their number
    fn assign_indices(&mut self, what_to_fit: &str, first_index: usize) -> usize;

    /// Adds the model's part of `delta` to its parameters
    fn offset_params(&mut self, delta: ArrayView1<f64>);

    /// Global indices of the fitted parameters of the image
    fn indices(&self, ccd: CcdImageId) -> &[usize];

    fn transform(&self, ccd: CcdImageId, point: Point) -> Point;

    /// Derivatives of the transformed position with respect to the parameters of the image,
    /// in the order of [AstrometryModel::indices]
    fn compute_derivatives(
        &self,
        ccd: CcdImageId,
        point: Point,
        derivatives: &mut Vec<[f64; 2]>,
    );
}

/// Constant shift of every image
#[derive(Clone, Debug)]
pub struct ShiftAstrometryModel {
    shifts: Vec<[f64; 2]>,
    indices: Vec<[usize; 2]>,
}

impl ShiftAstrometryModel {
    /// Zero shifts for `n_ccd` images
    pub fn new(n_ccd: usize) -> Self {
        Self {
            shifts: vec![[0.0; 2]; n_ccd],
            indices: vec![[0; 2]; n_ccd],
        }
    }

    pub fn shift(&self, ccd: CcdImageId) -> [f64; 2] {
        self.shifts[ccd.0]
    }

    pub fn set_shift(&mut self, ccd: CcdImageId, shift: [f64; 2]) {
        self.shifts[ccd.0] = shift;
    }
}

impl AstrometryModel for ShiftAstrometryModel {
    fn assign_indices(&mut self, _what_to_fit: &str, first_index: usize) -> usize {
        for (i, indices) in self.indices.iter_mut().enumerate() {
            *indices = [first_index + 2 * i, first_index + 2 * i + 1];
        }
        2 * self.indices.len()
    }

    fn offset_params(&mut self, delta: ArrayView1<f64>) {
        for (shift, indices) in self.shifts.iter_mut().zip(&self.indices) {
            shift[0] += delta[indices[0]];
            shift[1] += delta[indices[1]];
        }
    }

    fn indices(&self, ccd: CcdImageId) -> &[usize] {
        &self.indices[ccd.0]
    }

    fn transform(&self, ccd: CcdImageId, point: Point) -> Point {
        let [dx, dy] = self.shifts[ccd.0];
        Point::new(point.x + dx, point.y + dy)
    }

    fn compute_derivatives(
        &self,
        _ccd: CcdImageId,
        _point: Point,
        derivatives: &mut Vec<[f64; 2]>,
    ) {
        derivatives.clear();
        derivatives.extend([[1.0, 0.0], [0.0, 1.0]]);
    }
}
