//! Data loading, caching and feature engineering modules

pub mod cache;
pub mod calendar;
pub mod dataset;
pub mod features;

// Re-export commonly used types
pub use cache::{CacheError, SessionCache};
pub use calendar::{CalendarError, CalendarEvent, RaceCalendar};
pub use dataset::{
    BatchStatus, DatasetError, DatasetFilter, DatasetStore, MasterDataset, RaceBatch, RunLock,
};
pub use features::{DroppedDriver, ExtractionError, FeatureExtractor, Metric, RaceExtraction};
