//! HTTP client with rate limiting for the telemetry feed

use super::{decode_payload, SourceError, TelemetrySource};
use crate::config::SourceConfig;
use crate::data::calendar::CalendarEvent;
use crate::models::{RaceId, RawSessionPayload};
use chrono::Utc;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to create HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to start client runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Feed client with rate limiting
///
/// Exposes the blocking [`TelemetrySource`] interface; requests run on a
/// private single-threaded runtime, one at a time, spaced by `delay_ms`.
pub struct FeedClient {
    client: reqwest::Client,
    config: SourceConfig,
    last_request: Arc<Mutex<Instant>>,
    runtime: Runtime,
}

impl FeedClient {
    pub fn new(config: SourceConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(&config.user_agent)
            .build()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let earlier = Instant::now()
            .checked_sub(Duration::from_secs(10))
            .unwrap_or_else(Instant::now);

        Ok(Self {
            client,
            config,
            last_request: Arc::new(Mutex::new(earlier)),
            runtime,
        })
    }

    /// Wait for rate limit
    async fn wait_for_rate_limit(&self) {
        let mut last = self.last_request.lock().await;
        let elapsed = last.elapsed();
        let delay = Duration::from_millis(self.config.delay_ms);

        if elapsed < delay {
            tokio::time::sleep(delay - elapsed).await;
        }

        *last = Instant::now();
    }

    /// URL of a race session document
    fn session_url(&self, race: RaceId) -> String {
        format!(
            "{}/{}/{:02}/session.json",
            self.config.base_url.trim_end_matches('/'),
            race.season,
            race.round
        )
    }

    /// URL of a season schedule document
    fn schedule_url(&self, season: u16) -> String {
        format!(
            "{}/{}/schedule.json",
            self.config.base_url.trim_end_matches('/'),
            season
        )
    }

    /// Single GET; no retries. Status mapping is the caller's.
    async fn get_text(&self, url: &str) -> Result<(StatusCode, String), reqwest::Error> {
        self.wait_for_rate_limit().await;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }

    async fn fetch_session(&self, race: RaceId) -> Result<RawSessionPayload, SourceError> {
        let url = self.session_url(race);
        tracing::info!("Fetching session: {}", url);

        let request_failed = |message: String| SourceError::Request { race, message };

        let (status, body) = self
            .get_text(&url)
            .await
            .map_err(|e| request_failed(e.to_string()))?;

        match status {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => return Err(SourceError::NotPublished(race)),
            StatusCode::GONE => {
                return Err(SourceError::NotApplicable {
                    race,
                    reason: "feed reports the session as gone".to_string(),
                })
            }
            s => {
                tracing::warn!("Request for {} failed with status {}", race, s);
                return Err(request_failed(format!("HTTP {}", s)));
            }
        }

        let mut payload = decode_payload(race, &body)?;
        if payload.fetched_at.is_none() {
            payload.fetched_at = Some(Utc::now().to_rfc3339());
        }
        Ok(payload)
    }

    /// Fetch the published schedule of a season
    pub fn fetch_schedule(&self, season: u16) -> Result<Vec<CalendarEvent>, SourceError> {
        let url = self.schedule_url(season);
        tracing::info!("Fetching schedule: {}", url);

        // Schedule errors are reported against round 0 of the season
        let race = RaceId::new(season, 0);
        self.runtime.block_on(async {
            let (status, body) = self.get_text(&url).await.map_err(|e| SourceError::Request {
                race,
                message: e.to_string(),
            })?;
            if status == StatusCode::NOT_FOUND {
                return Err(SourceError::NotPublished(race));
            }
            if !status.is_success() {
                return Err(SourceError::Request {
                    race,
                    message: format!("HTTP {}", status),
                });
            }
            serde_json::from_str(&body).map_err(|e| SourceError::Malformed {
                race,
                message: e.to_string(),
            })
        })
    }
}

impl TelemetrySource for FeedClient {
    fn fetch(&self, race: RaceId) -> Result<RawSessionPayload, SourceError> {
        self.runtime.block_on(self.fetch_session(race))
    }
}
