pub use chi2_dump::{Chi2Row, read_chi2_rows};
pub use survey::{Survey, SyntheticSurvey};

mod chi2_dump;
mod survey;
