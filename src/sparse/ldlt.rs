use crate::error::FactorizationError;
use crate::sparse::SparseSymmetric;
use crate::triplet_list::TripletList;

use itertools::Itertools;
use ndarray::{Array1, ArrayView1};
use std::collections::BTreeMap;

/// Pivots smaller than this fraction of the original diagonal are treated as zero
const PIVOT_TOLERANCE: f64 = 1e-12;

/// Sparse `L·D·Lᵀ` factorization of a symmetric positive definite matrix
///
/// Rows and columns are symmetrically permuted by ascending degree before factorization, which
/// puts fitted stars (few couplings) before the image models (many couplings) and limits the
/// fill-in to the model block. `L` is unit lower triangular and is stored by columns.
///
/// The factorization can be modified in place by symmetric rank-1 updates, see
/// [SimplicialLdlt::downdate].
#[derive(Clone, Debug)]
pub struct SimplicialLdlt {
    // perm[new] = old
    perm: Vec<usize>,
    // inv_perm[old] = new
    inv_perm: Vec<usize>,
    // strictly lower part of the columns of L, rows ascending, permuted numbering
    l: Vec<Vec<(usize, f64)>>,
    d: Vec<f64>,
}

impl SimplicialLdlt {
    pub fn factorize(matrix: &SparseSymmetric) -> Result<Self, FactorizationError> {
        let n = matrix.dim();
        let perm = ascending_degree_ordering(matrix);
        let mut inv_perm = vec![0; n];
        for (new, &old) in perm.iter().enumerate() {
            inv_perm[old] = new;
        }

        // Upper triangle of the permuted matrix, by columns
        let mut upper: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
        let mut diag_scale = vec![0.0; n];
        for col in 0..n {
            for (row, value) in matrix.column(col) {
                let (i, j) = (inv_perm[row], inv_perm[col]);
                if i <= j {
                    upper[j].push((i, value));
                } else {
                    upper[i].push((j, value));
                }
                if row == col {
                    diag_scale[j] = value.abs();
                }
            }
        }

        let parent = elimination_tree(&upper);

        let mut l: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
        let mut d = vec![0.0; n];
        let mut y = vec![0.0; n];
        let mut flag = vec![usize::MAX; n];
        let mut pattern = vec![0; n];
        for k in 0..n {
            // Nonzero pattern of the k-th row of L, in topological order in pattern[top..]
            flag[k] = k;
            let mut top = n;
            for &(i, value) in &upper[k] {
                y[i] += value;
                let mut len = 0;
                let mut i = i;
                while flag[i] != k {
                    pattern[len] = i;
                    len += 1;
                    flag[i] = k;
                    match parent[i] {
                        Some(p) => i = p,
                        None => break,
                    }
                }
                while len > 0 {
                    top -= 1;
                    len -= 1;
                    pattern[top] = pattern[len];
                }
            }

            d[k] = y[k];
            y[k] = 0.0;
            for &i in &pattern[top..] {
                let yi = y[i];
                y[i] = 0.0;
                for &(row, l_value) in &l[i] {
                    y[row] -= l_value * yi;
                }
                let l_ki = yi / d[i];
                d[k] -= l_ki * yi;
                l[i].push((k, l_ki));
            }

            if !d[k].is_finite() || d[k] <= PIVOT_TOLERANCE * diag_scale[k] {
                return Err(FactorizationError::NotPositiveDefinite {
                    column: perm[k],
                    pivot: d[k],
                });
            }
        }

        Ok(Self {
            perm,
            inv_perm,
            l,
            d,
        })
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.d.len()
    }

    /// Number of stored off-diagonal entries of `L`
    pub fn nnz_l(&self) -> usize {
        self.l.iter().map(Vec::len).sum()
    }

    /// Solves `A·x = b`
    pub fn solve(&self, b: ArrayView1<f64>) -> Result<Array1<f64>, FactorizationError> {
        let n = self.dim();
        if b.len() != n {
            return Err(FactorizationError::DimensionMismatch {
                expected: n,
                actual: b.len(),
            });
        }
        let mut x: Vec<f64> = self.perm.iter().map(|&old| b[old]).collect();
        for (j, column) in self.l.iter().enumerate() {
            let xj = x[j];
            for &(row, l_value) in column {
                x[row] -= l_value * xj;
            }
        }
        for (xj, dj) in x.iter_mut().zip(&self.d) {
            *xj /= dj;
        }
        for (j, column) in self.l.iter().enumerate().rev() {
            let xj = column
                .iter()
                .fold(x[j], |acc, &(row, l_value)| acc - l_value * x[row]);
            x[j] = xj;
        }
        let mut solution = Array1::zeros(n);
        for (new, &old) in self.perm.iter().enumerate() {
            solution[old] = x[new];
        }
        Ok(solution)
    }

    /// Replaces `A` with `A + J·Jᵀ`, `J` given by its triplets
    pub fn update(&mut self, jacobian: &TripletList) -> Result<(), FactorizationError> {
        self.modify(jacobian, 1.0)
    }

    /// Replaces `A` with `A - J·Jᵀ`, `J` given by its triplets
    ///
    /// Every column of `J` is applied as a rank-1 downdate. The result is exact only if `J·Jᵀ`
    /// was actually a part of `A`: the fitter downdates with the contributions of the terms it
    /// has just discarded. Fails if the downdated matrix is not positive definite, the
    /// factorization is left in an unspecified state then.
    pub fn downdate(&mut self, jacobian: &TripletList) -> Result<(), FactorizationError> {
        self.modify(jacobian, -1.0)
    }

    fn modify(&mut self, jacobian: &TripletList, sigma: f64) -> Result<(), FactorizationError> {
        let n = self.dim();
        if let Some(t) = jacobian.iter().find(|t| t.row >= n) {
            return Err(FactorizationError::DimensionMismatch {
                expected: n,
                actual: t.row + 1,
            });
        }
        let columns = jacobian.iter().into_group_map_by(|t| t.col);
        for col in columns.keys().copied().sorted() {
            let mut w = BTreeMap::new();
            for t in &columns[&col] {
                *w.entry(self.inv_perm[t.row]).or_insert(0.0) += t.value;
            }
            self.rank1(w, sigma)?;
        }
        Ok(())
    }

    /// `L·D·Lᵀ + sigma·w·wᵀ`, method C1 of Gill, Golub, Murray & Saunders (1974)
    fn rank1(&mut self, mut w: BTreeMap<usize, f64>, sigma: f64) -> Result<(), FactorizationError> {
        let mut alpha = sigma;
        while let Some((j, p)) = w.pop_first() {
            if p == 0.0 {
                continue;
            }
            let dj = self.d[j];
            let d_new = dj + alpha * p * p;
            if !d_new.is_finite() || d_new <= 0.0 {
                return Err(FactorizationError::NotPositiveDefinite {
                    column: self.perm[j],
                    pivot: d_new,
                });
            }
            let beta = p * alpha / d_new;
            alpha *= dj / d_new;
            self.d[j] = d_new;

            let column = &mut self.l[j];
            for (row, l_value) in column.iter_mut() {
                let w_row = w.entry(*row).or_insert(0.0);
                *w_row -= p * *l_value;
                *l_value += beta * *w_row;
            }
            // w may be non-zero out of the column pattern, L gets filled there
            let fill: Vec<_> = w
                .iter()
                .filter(|(row, _)| column.binary_search_by_key(*row, |e| e.0).is_err())
                .map(|(&row, &w_row)| (row, beta * w_row))
                .collect();
            for (row, l_value) in fill {
                let position = column.partition_point(|e| e.0 < row);
                column.insert(position, (row, l_value));
            }
        }
        Ok(())
    }
}

/// Permutation (new to old) ordering rows by the number of their off-diagonal entries
fn ascending_degree_ordering(matrix: &SparseSymmetric) -> Vec<usize> {
    let n = matrix.dim();
    let mut degree = vec![0_usize; n];
    for col in 0..n {
        for (row, _) in matrix.column(col) {
            if row != col {
                degree[row] += 1;
                degree[col] += 1;
            }
        }
    }
    (0..n).sorted_by_key(|&i| (degree[i], i)).collect()
}

fn elimination_tree(upper: &[Vec<(usize, f64)>]) -> Vec<Option<usize>> {
    let n = upper.len();
    let mut parent: Vec<Option<usize>> = vec![None; n];
    let mut flag = vec![usize::MAX; n];
    for (k, column) in upper.iter().enumerate() {
        flag[k] = k;
        for &(i, _) in column {
            let mut i = i;
            while i < k && flag[i] != k {
                let p = *parent[i].get_or_insert(k);
                flag[i] = k;
                i = p;
            }
        }
    }
    parent
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::sparse::tests::dense_jjt;
    use approx::assert_abs_diff_eq;
    use rand::prelude::*;

    fn random_jacobian(rng: &mut StdRng, dim: usize, ncol: usize) -> TripletList {
        let mut jacobian = TripletList::new(dim + 3 * ncol);
        // keeps the matrix positive definite
        for row in 0..dim {
            let col = jacobian.allocate_columns(1);
            jacobian.add_triplet(row, col, 1.0);
        }
        for _ in 0..ncol {
            let col = jacobian.allocate_columns(1);
            for row in (0..dim).choose_multiple(rng, 3) {
                jacobian.add_triplet(row, col, rng.random_range(-2.0..2.0));
            }
        }
        jacobian
    }

    fn columns(jacobian: &TripletList, cols: std::ops::Range<usize>) -> TripletList {
        let mut subset = TripletList::new(jacobian.len());
        subset.allocate_columns(jacobian.next_free_index());
        for t in jacobian.iter().filter(|t| cols.contains(&t.col)) {
            subset.add_triplet(t.row, t.col, t.value);
        }
        subset
    }

    #[test]
    fn solve_random_system() {
        let mut rng = StdRng::seed_from_u64(0);
        let dim = 30;
        let jacobian = random_jacobian(&mut rng, dim, 60);
        let h = SparseSymmetric::from_jacobian(dim, &jacobian);
        let ldlt = SimplicialLdlt::factorize(&h).unwrap();
        let b: Array1<f64> = (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect();
        let x = ldlt.solve(b.view()).unwrap();
        assert_abs_diff_eq!(h.dot(x.view()), b, epsilon = 1e-10);

        let dense = dense_jjt(dim, &jacobian);
        assert_abs_diff_eq!(dense.dot(&x), b, epsilon = 1e-10);
    }

    #[test]
    fn arrow_matrix_has_no_fill_outside_model_block() {
        // 20 "stars" coupled to 2 "model" parameters each, 2 model parameters in total
        let n_stars = 20;
        let mut jacobian = TripletList::new(0);
        for star in 0..n_stars {
            for model in [n_stars, n_stars + 1] {
                let col = jacobian.allocate_columns(1);
                jacobian.add_triplet(star, col, 1.0);
                jacobian.add_triplet(model, col, 0.5);
            }
        }
        // without a prior only the difference of the model parameters is constrained
        let col = jacobian.allocate_columns(1);
        jacobian.add_triplet(n_stars, col, 1.0);
        let dim = n_stars + 2;
        let h = SparseSymmetric::from_jacobian(dim, &jacobian);
        let ldlt = SimplicialLdlt::factorize(&h).unwrap();
        // stars are eliminated first: two entries per star column, and a single fill-in
        // between the model parameters
        assert_eq!(ldlt.nnz_l(), 2 * n_stars + 1);

        let b: Array1<f64> = (0..dim).map(|i| i as f64).collect();
        let x = ldlt.solve(b.view()).unwrap();
        assert_abs_diff_eq!(h.dot(x.view()), b, epsilon = 1e-10);
    }

    #[test]
    fn zero_column_is_not_positive_definite() {
        let mut jacobian = TripletList::new(2);
        let col = jacobian.allocate_columns(1);
        jacobian.add_triplet(0, col, 1.0);
        jacobian.add_triplet(2, col, 1.0);
        let col = jacobian.allocate_columns(1);
        jacobian.add_triplet(2, col, 1.0);
        let h = SparseSymmetric::from_jacobian(3, &jacobian);
        assert_eq!(
            SimplicialLdlt::factorize(&h).unwrap_err(),
            FactorizationError::NotPositiveDefinite {
                column: 1,
                pivot: 0.0
            }
        );
    }

    #[test]
    fn rank_deficient_is_not_positive_definite() {
        // x0 - x1 is the only constraint
        let mut jacobian = TripletList::new(2);
        let col = jacobian.allocate_columns(1);
        jacobian.add_triplet(0, col, 1.0);
        jacobian.add_triplet(1, col, -1.0);
        let h = SparseSymmetric::from_jacobian(2, &jacobian);
        assert!(SimplicialLdlt::factorize(&h).is_err());
    }

    #[test]
    fn downdate_matches_refactorization() {
        let mut rng = StdRng::seed_from_u64(1);
        let dim = 25;
        let jacobian = random_jacobian(&mut rng, dim, 80);
        let ncol = jacobian.next_free_index();
        let removed = columns(&jacobian, ncol - 10..ncol);
        let kept = columns(&jacobian, 0..ncol - 10);

        let mut downdated =
            SimplicialLdlt::factorize(&SparseSymmetric::from_jacobian(dim, &jacobian)).unwrap();
        downdated.downdate(&removed).unwrap();
        let h_kept = SparseSymmetric::from_jacobian(dim, &kept);
        let refactorized = SimplicialLdlt::factorize(&h_kept).unwrap();

        let b: Array1<f64> = (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect();
        let x_downdated = downdated.solve(b.view()).unwrap();
        let x_refactorized = refactorized.solve(b.view()).unwrap();
        assert_abs_diff_eq!(x_downdated, x_refactorized, epsilon = 1e-9);
        assert_abs_diff_eq!(h_kept.dot(x_downdated.view()), b, epsilon = 1e-9);
    }

    #[test]
    fn update_then_downdate_is_identity() {
        let mut rng = StdRng::seed_from_u64(2);
        let dim = 15;
        let jacobian = random_jacobian(&mut rng, dim, 20);
        let extra = random_jacobian(&mut rng, dim, 5);
        let h = SparseSymmetric::from_jacobian(dim, &jacobian);
        let original = SimplicialLdlt::factorize(&h).unwrap();
        let mut modified = original.clone();
        modified.update(&extra).unwrap();
        modified.downdate(&extra).unwrap();

        let b: Array1<f64> = (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect();
        assert_abs_diff_eq!(
            modified.solve(b.view()).unwrap(),
            original.solve(b.view()).unwrap(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn downdate_to_singular_fails() {
        let mut jacobian = TripletList::new(2);
        let col = jacobian.allocate_columns(1);
        jacobian.add_triplet(0, col, 2.0);
        let h = SparseSymmetric::from_jacobian(1, &jacobian);
        let mut ldlt = SimplicialLdlt::factorize(&h).unwrap();
        assert!(matches!(
            ldlt.downdate(&jacobian),
            Err(FactorizationError::NotPositiveDefinite { column: 0, .. })
        ));
    }

    #[test]
    fn dimension_mismatch() {
        let mut jacobian = TripletList::new(1);
        let col = jacobian.allocate_columns(1);
        jacobian.add_triplet(0, col, 1.0);
        let h = SparseSymmetric::from_jacobian(1, &jacobian);
        let mut ldlt = SimplicialLdlt::factorize(&h).unwrap();
        assert_eq!(
            ldlt.solve(Array1::zeros(2).view()).unwrap_err(),
            FactorizationError::DimensionMismatch {
                expected: 1,
                actual: 2
            }
        );
        let mut outside = TripletList::new(1);
        let col = outside.allocate_columns(1);
        outside.add_triplet(3, col, 1.0);
        assert_eq!(
            ldlt.update(&outside).unwrap_err(),
            FactorizationError::DimensionMismatch {
                expected: 1,
                actual: 4
            }
        );
    }

    #[test]
    fn empty_system() {
        let h = SparseSymmetric::from_jacobian(0, &TripletList::new(0));
        let ldlt = SimplicialLdlt::factorize(&h).unwrap();
        assert_eq!(ldlt.solve(Array1::zeros(0).view()).unwrap().len(), 0);
    }
}
