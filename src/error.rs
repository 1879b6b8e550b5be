/// Error returned from [crate::Fitter] when the request itself is malformed
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FitterError {
    #[error("\"{what_to_fit}\" does not name any parameter set this fitter knows about")]
    NothingToFit { what_to_fit: String },
}

/// Error returned from the sparse normal-equations factorization
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FactorizationError {
    #[error("matrix is not positive definite: pivot {pivot:e} at column {column}")]
    NotPositiveDefinite { column: usize, pivot: f64 },

    #[error("dimension mismatch: factorization has size {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Error returned when writing chi2 contributions
#[derive(Debug, thiserror::Error)]
pub enum Chi2DumpError {
    #[error("cannot write chi2 contributions: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot serialize chi2 contributions: {0}")]
    Csv(#[from] csv::Error),
}
