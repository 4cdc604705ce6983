//! Statistics and modelling over the finished dataset

pub mod attribution;
pub mod stats;
pub mod summary;

// Re-export commonly used types
pub use attribution::{AttributionFitter, AttributionModel, Coefficient, FitError, PREDICTORS};
pub use summary::{DriverSummary, SeasonSummary, TeamSpeed};
