//! Incremental update run
//!
//! Processes every calendar race not yet in the master dataset, oldest
//! first: cache (fetching on a miss), extract, append. A failing race is
//! recorded and skipped; only integrity and storage errors stop the run.

use crate::data::cache::{CacheError, SessionCache};
use crate::data::dataset::{DatasetError, DatasetStore};
use crate::data::features::FeatureExtractor;
use crate::error::ErrorKind;
use crate::models::{RaceId, RawSessionPayload};
use crate::source::{SourceError, TelemetrySource};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors that abort a run
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Master dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Session cache error: {0}")]
    Cache(#[from] CacheError),
}

impl UpdateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Dataset(e) => e.kind(),
            UpdateError::Cache(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Fetch again even when a race is cached, overwriting the entry
    pub refresh_cache: bool,
}

/// A race that could not be processed in this run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceFailure {
    pub race: RaceId,
    pub kind: ErrorKind,
    pub message: String,
}

/// What happened to one race
#[derive(Debug, Clone, PartialEq)]
pub enum RaceStatus {
    Processed { rows: usize, dropped: usize },
    NotApplicable { reason: String },
    Failed(RaceFailure),
}

/// Per-run counts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    /// Races committed with feature rows
    pub processed: Vec<RaceId>,
    /// Candidates already in the dataset
    pub skipped: usize,
    /// Races recorded as never having data
    pub not_applicable: Vec<RaceId>,
    pub failures: Vec<RaceFailure>,
    pub rows_appended: usize,
    pub drivers_dropped: usize,
}

impl RunReport {
    pub fn failures_by_kind(&self) -> BTreeMap<ErrorKind, usize> {
        let mut counts = BTreeMap::new();
        for f in &self.failures {
            *counts.entry(f.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Per-race result before it is folded into the report
enum RaceError {
    Failed(RaceFailure),
    NotApplicable(String),
    Fatal(UpdateError),
}

impl RaceError {
    fn failed(race: RaceId, kind: ErrorKind, message: impl Into<String>) -> Self {
        RaceError::Failed(RaceFailure {
            race,
            kind,
            message: message.into(),
        })
    }
}

impl From<UpdateError> for RaceError {
    fn from(e: UpdateError) -> Self {
        RaceError::Fatal(e)
    }
}

/// Incremental update orchestrator
///
/// Owns the cache and dataset store for the duration of a run.
pub struct IncrementalUpdater<S: TelemetrySource> {
    source: S,
    cache: SessionCache,
    store: DatasetStore,
    extractor: FeatureExtractor,
    options: UpdateOptions,
}

impl<S: TelemetrySource> IncrementalUpdater<S> {
    pub fn new(
        source: S,
        cache: SessionCache,
        store: DatasetStore,
        extractor: FeatureExtractor,
    ) -> Self {
        Self {
            source,
            cache,
            store,
            extractor,
            options: UpdateOptions::default(),
        }
    }

    pub fn with_options(mut self, options: UpdateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &DatasetStore {
        &self.store
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    /// Release the stores at the end of a run
    pub fn into_parts(self) -> (SessionCache, DatasetStore) {
        (self.cache, self.store)
    }

    /// Candidates not yet in the dataset, chronological and deduplicated
    pub fn pending(&self, candidates: &[RaceId]) -> Vec<RaceId> {
        let processed = self.store.processed_races();
        candidates
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|r| !processed.contains(r))
            .collect()
    }

    pub fn run(&mut self, candidates: &[RaceId]) -> Result<RunReport, UpdateError> {
        self.run_with(candidates, |_, _| {})
    }

    /// Run, calling `on_race` after each pending race is handled
    pub fn run_with<F>(&mut self, candidates: &[RaceId], mut on_race: F) -> Result<RunReport, UpdateError>
    where
        F: FnMut(RaceId, &RaceStatus),
    {
        let unique: BTreeSet<RaceId> = candidates.iter().copied().collect();
        let pending = self.pending(candidates);

        let mut report = RunReport {
            skipped: unique.len() - pending.len(),
            ..RunReport::default()
        };

        tracing::info!(
            "Update run: {} candidates, {} already processed, {} pending",
            unique.len(),
            report.skipped,
            pending.len()
        );

        for race in pending {
            let status = match self.process_race(race) {
                Ok((rows, dropped)) => {
                    report.processed.push(race);
                    report.rows_appended += rows;
                    report.drivers_dropped += dropped;
                    RaceStatus::Processed { rows, dropped }
                }
                Err(RaceError::NotApplicable(reason)) => {
                    self.store.record_not_applicable(race, &reason)?;
                    tracing::info!("{}: no data will ever be available ({})", race, reason);
                    report.not_applicable.push(race);
                    RaceStatus::NotApplicable { reason }
                }
                Err(RaceError::Failed(failure)) => {
                    tracing::warn!("{}: {} ({})", race, failure.message, failure.kind);
                    report.failures.push(failure.clone());
                    RaceStatus::Failed(failure)
                }
                Err(RaceError::Fatal(e)) => {
                    tracing::error!("{}: aborting run: {}", race, e);
                    return Err(e);
                }
            };
            on_race(race, &status);
        }

        Ok(report)
    }

    /// Cache, extract and commit one race; returns (rows, dropped drivers)
    fn process_race(&mut self, race: RaceId) -> Result<(usize, usize), RaceError> {
        let payload = self.load_payload(race)?;

        let extraction = self
            .extractor
            .extract(&payload)
            .map_err(|e| RaceError::failed(race, e.kind(), e.to_string()))?;

        if extraction.rows.is_empty() {
            return Err(RaceError::failed(
                race,
                ErrorKind::ExtractionFailed,
                format!(
                    "no driver qualified ({} dropped for insufficient data)",
                    extraction.dropped.len()
                ),
            ));
        }

        let rows = extraction.rows.len();
        let dropped = extraction.dropped.len();

        match self.store.append_race(race, extraction.rows) {
            Ok(()) => {}
            Err(e) if e.kind().is_fatal() => return Err(UpdateError::from(e).into()),
            Err(e) => return Err(RaceError::failed(race, e.kind(), e.to_string())),
        }

        tracing::info!("{}: appended {} rows ({} drivers dropped)", race, rows, dropped);
        Ok((rows, dropped))
    }

    /// Cached payload, or fetch and cache it
    ///
    /// Only a payload carrying `race` is cached; anything else is a source
    /// failure and the race is fetched again next run.
    fn load_payload(&mut self, race: RaceId) -> Result<RawSessionPayload, RaceError> {
        if !self.options.refresh_cache && self.cache.has(race) {
            match self.cache.get(race) {
                Ok(payload) if payload.race == race => return Ok(payload),
                Ok(payload) => {
                    tracing::warn!("Cached payload for {} carries {}; fetching again", race, payload.race);
                }
                Err(e @ CacheError::Corrupt { .. }) => {
                    tracing::warn!("{}; fetching again", e);
                }
                Err(e) => return Err(UpdateError::from(e).into()),
            }
        }

        let payload = match self.source.fetch(race) {
            Ok(payload) if payload.race == race => payload,
            Ok(payload) => {
                let e = SourceError::Malformed {
                    race,
                    message: format!("payload carries race id {}", payload.race),
                };
                return Err(RaceError::failed(race, e.kind(), e.to_string()));
            }
            Err(SourceError::NotApplicable { reason, .. }) => {
                return Err(RaceError::NotApplicable(reason))
            }
            Err(e) => return Err(RaceError::failed(race, e.kind(), e.to_string())),
        };

        self.cache.put(race, &payload).map_err(UpdateError::from)?;
        Ok(payload)
    }
}
