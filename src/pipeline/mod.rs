//! Incremental update pipeline

mod updater;

pub use updater::{
    IncrementalUpdater, RaceFailure, RaceStatus, RunReport, UpdateError, UpdateOptions,
};
