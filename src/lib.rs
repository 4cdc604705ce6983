//! F1 Analyzer - Incremental race feature pipeline
//!
//! This library provides:
//! - A session cache for raw race payloads fetched from a telemetry feed
//! - Per-driver race metrics (consistency, tyre degradation, speed trap,
//!   positions gained) with no imputation of missing values
//! - An append-only master dataset with exactly-once, per-race commits
//! - An incremental update run that only touches races not yet processed
//! - A standardized least-squares model attributing points to the metrics
//!
//! # Example
//!
//! ```no_run
//! use f1_analyzer::config::PipelineConfig;
//! use f1_analyzer::data::{DatasetStore, FeatureExtractor, SessionCache};
//! use f1_analyzer::pipeline::IncrementalUpdater;
//! use f1_analyzer::source::DirectorySource;
//! use f1_analyzer::RaceId;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = PipelineConfig::default();
//! let cache = SessionCache::open(&config.cache_dir)?;
//! let store = DatasetStore::open(&config.dataset_dir)?;
//! let extractor = FeatureExtractor::new(config.extraction.clone());
//!
//! let mut updater = IncrementalUpdater::new(DirectorySource::new("feed"), cache, store, extractor);
//! let report = updater.run(&[RaceId::new(2024, 1), RaceId::new(2024, 2)])?;
//! println!("Processed {} races", report.processed.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod data;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod source;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::ErrorKind;
pub use models::{
    ClassificationEntry, FeatureRow, LapRecord, RaceId, RawSessionPayload, TelemetrySample,
};
pub use source::{SourceError, TelemetrySource};
