//! Telemetry source adapters
//!
//! A source turns a race id into a raw session payload, or says why it
//! cannot. "Not published yet" and request failures are transient; a race
//! that will never have data (cancelled) is reported as not applicable.

#[cfg(feature = "http")]
mod client;

#[cfg(feature = "http")]
pub use client::{ClientError, FeedClient};

use crate::error::ErrorKind;
use crate::models::{RaceId, RawSessionPayload};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Data for {0} is not published yet")]
    NotPublished(RaceId),

    #[error("{race} will never have data: {reason}")]
    NotApplicable { race: RaceId, reason: String },

    #[error("Request for {race} failed: {message}")]
    Request { race: RaceId, message: String },

    #[error("Malformed payload for {race}: {message}")]
    Malformed { race: RaceId, message: String },
}

impl SourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::NotApplicable { .. } => ErrorKind::SourceNotApplicable,
            _ => ErrorKind::SourceUnavailable,
        }
    }
}

/// Fetch interface to the external telemetry feed
///
/// Calls block until the source answers or its timeout expires. Sources do
/// not retry.
pub trait TelemetrySource {
    fn fetch(&self, race: RaceId) -> Result<RawSessionPayload, SourceError>;
}

impl<T: TelemetrySource + ?Sized> TelemetrySource for Box<T> {
    fn fetch(&self, race: RaceId) -> Result<RawSessionPayload, SourceError> {
        (**self).fetch(race)
    }
}

/// Cancellation marker a feed may send instead of a session
#[derive(Debug, Default, Deserialize)]
struct CancelMarker {
    #[serde(default)]
    cancelled: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Decode a feed document into a payload for `race`
///
/// A document with `"cancelled": true` is a permanent "no data" answer.
pub(crate) fn decode_payload(race: RaceId, body: &str) -> Result<RawSessionPayload, SourceError> {
    let malformed = |e: serde_json::Error| SourceError::Malformed {
        race,
        message: e.to_string(),
    };

    let marker: CancelMarker = serde_json::from_str(body).map_err(malformed)?;
    if marker.cancelled {
        return Err(SourceError::NotApplicable {
            race,
            reason: marker.reason.unwrap_or_else(|| "cancelled".to_string()),
        });
    }

    serde_json::from_str(body).map_err(malformed)
}

/// Source reading feed documents from a local directory
///
/// Looks for `{root}/{season}/{round:02}.json`, then `{root}/{season}_{round:02}.json`.
/// A missing file means the race is not published yet.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn candidates(&self, race: RaceId) -> [PathBuf; 2] {
        [
            self.root
                .join(race.season.to_string())
                .join(format!("{:02}.json", race.round)),
            self.root.join(format!("{}.json", race.file_stem())),
        ]
    }
}

impl TelemetrySource for DirectorySource {
    fn fetch(&self, race: RaceId) -> Result<RawSessionPayload, SourceError> {
        let Some(path) = self.candidates(race).into_iter().find(|p| p.is_file()) else {
            return Err(SourceError::NotPublished(race));
        };

        tracing::debug!("Reading {} from {:?}", race, path);
        let body = fs::read_to_string(&path).map_err(|e| SourceError::Request {
            race,
            message: format!("{:?}: {}", path, e),
        })?;
        decode_payload(race, &body)
    }
}
