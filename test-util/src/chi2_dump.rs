use serde::Deserialize;
use std::path::Path;

/// Columns shared by every chi2 contribution file, others are ignored
#[derive(Clone, Debug, Deserialize)]
pub struct Chi2Row {
    pub fitted_star: usize,
    pub chi2: f64,
}

pub fn read_chi2_rows(path: impl AsRef<Path>) -> Result<Vec<Chi2Row>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new().from_path(path)?;
    reader.deserialize().collect()
}
