//! Sparse symmetric matrices for the normal equations
//!
//! The Jacobian is never stored: it lives in a [TripletList] whose rows are parameters and whose
//! columns are whitened residuals, so the Hessian approximation is `H = J·Jᵀ`. Only the upper
//! triangle of `H` is kept, in compressed-column form.

mod ldlt;
pub use ldlt::SimplicialLdlt;

use crate::triplet_list::{Triplet, TripletList};

use itertools::Itertools;
use ndarray::{Array1, ArrayView1};

/// Upper triangle of a symmetric matrix in compressed-column storage
#[derive(Clone, Debug, PartialEq)]
pub struct SparseSymmetric {
    dim: usize,
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
    values: Vec<f64>,
}

impl SparseSymmetric {
    /// Builds `J·Jᵀ` of size `dim × dim`, `J` given by its triplets
    ///
    /// Duplicated `(row, col)` triplets are summed.
    pub fn from_jacobian(dim: usize, jacobian: &TripletList) -> Self {
        let mut by_column: Vec<Triplet> = jacobian.iter().copied().collect();
        by_column.sort_unstable_by_key(|t| (t.col, t.row));

        let mut upper = Vec::new();
        for (_, column) in &by_column.iter().chunk_by(|t| t.col) {
            let column: Vec<(usize, f64)> = column
                .map(|t| (t.row, t.value))
                .coalesce(|a, b| {
                    if a.0 == b.0 {
                        Ok((a.0, a.1 + b.1))
                    } else {
                        Err((a, b))
                    }
                })
                .collect();
            for (j, &(col, value_col)) in column.iter().enumerate() {
                for &(row, value_row) in &column[..=j] {
                    upper.push((row, col, value_row * value_col));
                }
            }
        }
        Self::from_upper_entries(dim, upper)
    }

    /// Builds the matrix from `(row, col, value)` entries with `row <= col`, summing duplicates
    pub fn from_upper_entries(dim: usize, mut entries: Vec<(usize, usize, f64)>) -> Self {
        debug_assert!(entries.iter().all(|&(row, col, _)| row <= col && col < dim));
        entries.sort_unstable_by_key(|&(row, col, _)| (col, row));

        let mut col_ptr = vec![0; dim + 1];
        let mut row_idx = Vec::with_capacity(entries.len());
        let mut values = Vec::with_capacity(entries.len());
        let merged = entries.into_iter().coalesce(|a, b| {
            if (a.0, a.1) == (b.0, b.1) {
                Ok((a.0, a.1, a.2 + b.2))
            } else {
                Err((a, b))
            }
        });
        for (row, col, value) in merged {
            col_ptr[col + 1] += 1;
            row_idx.push(row);
            values.push(value);
        }
        for col in 0..dim {
            col_ptr[col + 1] += col_ptr[col];
        }
        Self {
            dim,
            col_ptr,
            row_idx,
            values,
        }
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of stored (upper triangle) entries
    #[inline]
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Number of non-zeros of the full symmetric matrix
    pub fn nnz_full(&self) -> usize {
        2 * self.nnz() - (0..self.dim).filter(|&i| self.get(i, i) != 0.0).count()
    }

    /// Fraction of the full matrix which is filled
    pub fn filling_fraction(&self) -> f64 {
        if self.dim == 0 {
            return 0.0;
        }
        self.nnz_full() as f64 / (self.dim as f64).powi(2)
    }

    /// Stored entries of column `col`, rows are ascending and never exceed `col`
    pub fn column(&self, col: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.col_ptr[col]..self.col_ptr[col + 1];
        self.row_idx[range.clone()]
            .iter()
            .copied()
            .zip(self.values[range].iter().copied())
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        let (row, col) = if row <= col { (row, col) } else { (col, row) };
        let range = self.col_ptr[col]..self.col_ptr[col + 1];
        match self.row_idx[range.clone()].binary_search(&row) {
            Ok(i) => self.values[range.start + i],
            Err(_) => 0.0,
        }
    }

    pub fn diagonal(&self) -> Array1<f64> {
        (0..self.dim).map(|i| self.get(i, i)).collect()
    }

    pub fn dot(&self, x: ArrayView1<f64>) -> Array1<f64> {
        let mut y = Array1::zeros(self.dim);
        for col in 0..self.dim {
            for (row, value) in self.column(col) {
                y[row] += value * x[col];
                if row != col {
                    y[col] += value * x[row];
                }
            }
        }
        y
    }
}
