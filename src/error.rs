use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of pipeline failures, shared by every module error
///
/// Per-race failures are counted by kind in a run report; `DuplicateRace`
/// and `Storage` abort the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Race data not published yet or feed unreachable; retried next run
    SourceUnavailable,
    /// Race will never produce data (e.g. cancelled)
    SourceNotApplicable,
    /// Payload not in the session cache
    CacheMiss,
    /// A driver metric lacked enough valid samples
    ExtractionInsufficientData,
    /// Race-level extraction failure (malformed payload, zero qualifying drivers)
    ExtractionFailed,
    /// Race already committed to the master dataset
    DuplicateRace,
    /// Too few rows to fit the attribution model
    InsufficientData,
    /// Predictors are collinear; the fit has no unique solution
    DegenerateFit,
    /// Filesystem or serialization failure while persisting
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SourceUnavailable => "source_unavailable",
            ErrorKind::SourceNotApplicable => "source_not_applicable",
            ErrorKind::CacheMiss => "cache_miss",
            ErrorKind::ExtractionInsufficientData => "extraction_insufficient_data",
            ErrorKind::ExtractionFailed => "extraction_failed",
            ErrorKind::DuplicateRace => "duplicate_race",
            ErrorKind::InsufficientData => "insufficient_data",
            ErrorKind::DegenerateFit => "degenerate_fit",
            ErrorKind::Storage => "storage",
        }
    }

    /// Whether a failure of this kind must stop the current run
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::DuplicateRace | ErrorKind::Storage)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
