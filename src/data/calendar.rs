//! Race calendar
//!
//! The calendar is the list of races known for the tracked seasons. It is
//! kept as a CSV (`season,round,event_name,circuit,event_date,event_format`)
//! and read with polars.

use crate::data::cache::write_atomic;
use crate::error::ErrorKind;
use crate::models::RaceId;
use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const TESTING_FORMAT: &str = "testing";

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("Failed to read calendar: {0}")]
    Load(#[from] PolarsError),

    #[error("Invalid calendar row {row}: {message}")]
    InvalidRow { row: usize, message: String },

    #[error("Failed to write calendar {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl CalendarError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Storage
    }
}

/// One scheduled event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub season: u16,
    pub round: u8,
    pub event_name: String,
    #[serde(default)]
    pub circuit: String,
    pub event_date: NaiveDate,
    /// e.g. "conventional", "sprint", "testing"
    #[serde(default)]
    pub event_format: String,
}

impl CalendarEvent {
    pub fn race(&self) -> RaceId {
        RaceId::new(self.season, self.round)
    }

    /// Pre-season testing has no race to analyse
    pub fn is_testing(&self) -> bool {
        self.round == 0 || self.event_format.eq_ignore_ascii_case(TESTING_FORMAT)
    }
}

/// Known races across the tracked seasons, in chronological order
#[derive(Debug, Clone, Default)]
pub struct RaceCalendar {
    events: Vec<CalendarEvent>,
}

impl RaceCalendar {
    pub fn from_events(mut events: Vec<CalendarEvent>) -> Self {
        events.sort_by_key(|e| e.race());
        events.dedup_by_key(|e| e.race());
        Self { events }
    }

    /// Load the calendar CSV
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CalendarError> {
        let df = CsvReadOptions::default()
            .with_has_header(true)
            .try_into_reader_with_file_path(Some(path.as_ref().to_path_buf()))?
            .finish()?;

        if df.height() == 0 {
            return Ok(Self::default());
        }

        let seasons = df.column("season")?.cast(&DataType::Int64)?;
        let rounds = df.column("round")?.cast(&DataType::Int64)?;
        let names = df.column("event_name")?.cast(&DataType::String)?;
        let circuits = df.column("circuit")?.cast(&DataType::String)?;
        let dates = df.column("event_date")?.cast(&DataType::String)?;
        let formats = df.column("event_format")?.cast(&DataType::String)?;

        let seasons = seasons.i64()?;
        let rounds = rounds.i64()?;
        let names = names.str()?;
        let circuits = circuits.str()?;
        let dates = dates.str()?;
        let formats = formats.str()?;

        let mut events = Vec::with_capacity(df.height());
        for i in 0..df.height() {
            let invalid = |message: String| CalendarError::InvalidRow { row: i + 1, message };

            let season = seasons
                .get(i)
                .and_then(|s| u16::try_from(s).ok())
                .ok_or_else(|| invalid("missing or out-of-range season".to_string()))?;
            let round = rounds
                .get(i)
                .and_then(|r| u8::try_from(r).ok())
                .ok_or_else(|| invalid("missing or out-of-range round".to_string()))?;
            let raw_date = dates
                .get(i)
                .ok_or_else(|| invalid("missing event_date".to_string()))?;
            let event_date = NaiveDate::parse_from_str(raw_date.trim(), "%Y-%m-%d")
                .map_err(|e| invalid(format!("bad event_date '{}': {}", raw_date, e)))?;

            events.push(CalendarEvent {
                season,
                round,
                event_name: names.get(i).unwrap_or("").to_string(),
                circuit: circuits.get(i).unwrap_or("").to_string(),
                event_date,
                event_format: formats.get(i).unwrap_or("").to_string(),
            });
        }

        let calendar = Self::from_events(events);
        tracing::debug!("Loaded calendar with {} events", calendar.events.len());
        Ok(calendar)
    }

    pub fn events(&self) -> &[CalendarEvent] {
        &self.events
    }

    pub fn get(&self, race: RaceId) -> Option<&CalendarEvent> {
        self.events.iter().find(|e| e.race() == race)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Races that have already taken place: not testing, dated before `today`
    pub fn due(&self, today: NaiveDate) -> Vec<RaceId> {
        self.events
            .iter()
            .filter(|e| !e.is_testing() && e.event_date < today)
            .map(CalendarEvent::race)
            .collect()
    }

    /// Replace every event of `season` with `events`
    pub fn replace_season(&mut self, season: u16, events: Vec<CalendarEvent>) {
        self.events.retain(|e| e.season != season);
        self.events
            .extend(events.into_iter().filter(|e| e.season == season));
        self.events.sort_by_key(|e| e.race());
        self.events.dedup_by_key(|e| e.race());
    }

    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let e = &self.events;
        df!(
            "season" => e.iter().map(|e| e.season as i64).collect::<Vec<_>>(),
            "round" => e.iter().map(|e| e.round as i64).collect::<Vec<_>>(),
            "event_name" => e.iter().map(|e| e.event_name.as_str()).collect::<Vec<_>>(),
            "circuit" => e.iter().map(|e| e.circuit.as_str()).collect::<Vec<_>>(),
            "event_date" => e.iter().map(|e| e.event_date.format("%Y-%m-%d").to_string()).collect::<Vec<_>>(),
            "event_format" => e.iter().map(|e| e.event_format.as_str()).collect::<Vec<_>>()
        )
    }

    /// Write the calendar CSV, replacing `path` atomically
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), CalendarError> {
        let path = path.as_ref();
        let mut df = self.to_dataframe()?;
        let mut buf = Vec::new();
        CsvWriter::new(&mut buf).include_header(true).finish(&mut df)?;
        write_atomic(path, &buf).map_err(|source| CalendarError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}
