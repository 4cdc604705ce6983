//! Master dataset of feature rows
//!
//! Stored as an append-only ledger (`ledger.jsonl`): one line per committed
//! race batch. A line is written and fsynced before `append_race` returns, so
//! the ledger always ends on a race boundary. A torn trailing line left by a
//! crash is discarded by the next writer; readers skip it and never write.

use crate::data::cache::write_atomic;
use crate::error::ErrorKind;
use crate::models::{FeatureRow, RaceId};
use chrono::Utc;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const LEDGER_FILE: &str = "ledger.jsonl";
const LOCK_FILE: &str = ".run.lock";

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Race {0} is already in the master dataset")]
    DuplicateRace(RaceId),

    #[error("Rejected batch for {race}: {reason}")]
    InvalidBatch { race: RaceId, reason: String },

    #[error("Corrupt ledger line {line}: {message}")]
    Corrupt { line: usize, message: String },

    #[error("Dataset I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to export dataset: {0}")]
    Export(#[from] PolarsError),

    #[error("Dataset at {0:?} is locked by another run")]
    Locked(PathBuf),
}

impl DatasetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DatasetError::DuplicateRace(_) => ErrorKind::DuplicateRace,
            // Nothing was written; the race stays pending
            DatasetError::InvalidBatch { .. } => ErrorKind::ExtractionFailed,
            _ => ErrorKind::Storage,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        DatasetError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// How a race entered the dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Feature rows extracted from the race
    Scored,
    /// Race confirmed to have no data (e.g. cancelled); no rows
    NotApplicable,
}

/// All rows of one race, committed as a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceBatch {
    pub race: RaceId,
    pub status: BatchStatus,
    pub committed_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default)]
    pub rows: Vec<FeatureRow>,
}

/// Subset selection over the dataset
#[derive(Debug, Clone, Default)]
pub struct DatasetFilter {
    pub season: Option<u16>,
    pub team: Option<String>,
}

impl DatasetFilter {
    pub fn matches(&self, row: &FeatureRow) -> bool {
        if let Some(season) = self.season {
            if row.race.season != season {
                return false;
            }
        }
        if let Some(ref team) = self.team {
            if row.team.as_deref() != Some(team.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Read-only view of the master dataset
#[derive(Debug, Clone, Default)]
pub struct MasterDataset {
    batches: Vec<RaceBatch>,
}

impl MasterDataset {
    pub fn from_batches(batches: Vec<RaceBatch>) -> Self {
        Self { batches }
    }

    /// Batches in commit order
    pub fn batches(&self) -> &[RaceBatch] {
        &self.batches
    }

    /// Rows in commit order, then extraction order within a race
    pub fn rows(&self) -> impl Iterator<Item = &FeatureRow> {
        self.batches.iter().flat_map(|b| b.rows.iter())
    }

    pub fn filtered<'a>(&'a self, filter: &'a DatasetFilter) -> impl Iterator<Item = &'a FeatureRow> {
        self.rows().filter(move |r| filter.matches(r))
    }

    pub fn races(&self) -> BTreeSet<RaceId> {
        self.batches.iter().map(|b| b.race).collect()
    }

    pub fn seasons(&self) -> BTreeSet<u16> {
        self.rows().map(|r| r.race.season).collect()
    }

    /// Number of feature rows
    pub fn len(&self) -> usize {
        self.batches.iter().map(|b| b.rows.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tabular form for downstream consumers
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let rows: Vec<&FeatureRow> = self.rows().collect();
        df!(
            "Season" => rows.iter().map(|r| r.race.season as i32).collect::<Vec<_>>(),
            "Round" => rows.iter().map(|r| r.race.round as i32).collect::<Vec<_>>(),
            "Driver" => rows.iter().map(|r| r.driver.as_str()).collect::<Vec<_>>(),
            "TeamName" => rows.iter().map(|r| r.team.as_deref()).collect::<Vec<_>>(),
            "AvgConsistency" => rows.iter().map(|r| r.avg_consistency).collect::<Vec<_>>(),
            "AvgDegradation" => rows.iter().map(|r| r.avg_degradation).collect::<Vec<_>>(),
            "TopSpeedST" => rows.iter().map(|r| r.top_speed_st).collect::<Vec<_>>(),
            "PositionsGained" => rows.iter().map(|r| r.positions_gained).collect::<Vec<_>>(),
            "Points" => rows.iter().map(|r| r.final_points).collect::<Vec<_>>(),
            "ValidLaps" => rows.iter().map(|r| r.valid_laps as i64).collect::<Vec<_>>()
        )
    }

    /// Write the dataset as CSV, replacing `path` atomically
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<usize, DatasetError> {
        let path = path.as_ref();
        let mut df = self.to_dataframe()?;
        let mut buf = Vec::new();
        CsvWriter::new(&mut buf).include_header(true).finish(&mut df)?;
        write_atomic(path, &buf).map_err(|e| DatasetError::io(path, e))?;
        Ok(df.height())
    }
}

/// Append-only store behind the master dataset
///
/// The single writer: holds the dataset's [`RunLock`] for as long as it is
/// open. Readers use [`DatasetStore::read_snapshot`].
pub struct DatasetStore {
    dir: PathBuf,
    ledger_path: PathBuf,
    ledger_len: u64,
    batches: Vec<RaceBatch>,
    index: BTreeSet<RaceId>,
    _lock: RunLock,
}

impl DatasetStore {
    /// Open (creating if needed) the dataset in `dir` for writing
    ///
    /// Fails with `Locked` while another run holds the dataset.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, DatasetError> {
        let dir = dir.as_ref();
        let lock = RunLock::acquire(dir)?;
        Self::open_locked(dir.to_path_buf(), lock)
    }

    /// Delete the dataset and start empty. The only operation that removes rows.
    pub fn rebuild<P: AsRef<Path>>(dir: P) -> Result<Self, DatasetError> {
        let dir = dir.as_ref();
        let lock = RunLock::acquire(dir)?;
        let ledger_path = dir.join(LEDGER_FILE);
        match fs::remove_file(&ledger_path) {
            Ok(()) => tracing::warn!("Removed master dataset ledger {:?}", ledger_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(DatasetError::io(&ledger_path, e)),
        }
        Self::open_locked(dir.to_path_buf(), lock)
    }

    /// Committed contents of the dataset in `dir`, without taking the lock
    ///
    /// Never writes. An incomplete trailing line (a batch still being
    /// appended, or a torn write awaiting the next run) is left out.
    pub fn read_snapshot<P: AsRef<Path>>(dir: P) -> Result<MasterDataset, DatasetError> {
        let ledger_path = dir.as_ref().join(LEDGER_FILE);
        let content = read_ledger(&ledger_path)?;
        let (batches, good_len) = parse_ledger(&content)?;
        if good_len < content.len() {
            tracing::debug!(
                "Ignoring {} bytes of incomplete batch at end of {:?}",
                content.len() - good_len,
                ledger_path
            );
        }
        check_unique(&ledger_path, &batches)?;
        Ok(MasterDataset::from_batches(batches))
    }

    fn open_locked(dir: PathBuf, lock: RunLock) -> Result<Self, DatasetError> {
        let ledger_path = dir.join(LEDGER_FILE);
        let content = read_ledger(&ledger_path)?;
        let (batches, good_len) = parse_ledger(&content)?;

        if good_len < content.len() {
            tracing::warn!(
                "Discarding {} bytes of incomplete batch at end of {:?}",
                content.len() - good_len,
                ledger_path
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&ledger_path)
                .map_err(|e| DatasetError::io(&ledger_path, e))?;
            file.set_len(good_len as u64)
                .and_then(|_| file.sync_all())
                .map_err(|e| DatasetError::io(&ledger_path, e))?;
        }

        let index = check_unique(&ledger_path, &batches)?;

        let mut store = Self {
            dir,
            ledger_path,
            ledger_len: good_len as u64,
            batches,
            index,
            _lock: lock,
        };

        // A complete final record missing only its newline
        if content.get(good_len.wrapping_sub(1)).is_some_and(|b| *b != b'\n') {
            store.write_line(b"")?;
        }

        tracing::debug!(
            "Master dataset at {:?}: {} races, {} rows",
            store.dir,
            store.index.len(),
            store.row_count()
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Races already present (processed race index)
    pub fn processed_races(&self) -> &BTreeSet<RaceId> {
        &self.index
    }

    pub fn contains(&self, race: RaceId) -> bool {
        self.index.contains(&race)
    }

    pub fn row_count(&self) -> usize {
        self.batches.iter().map(|b| b.rows.len()).sum()
    }

    /// Commit all feature rows of a race as one unit
    pub fn append_race(&mut self, race: RaceId, rows: Vec<FeatureRow>) -> Result<(), DatasetError> {
        validate_rows(race, &rows)?;
        self.commit(RaceBatch {
            race,
            status: BatchStatus::Scored,
            committed_at: Utc::now().to_rfc3339(),
            note: None,
            rows,
        })
    }

    /// Record a race that will never produce data, so it is not retried
    pub fn record_not_applicable(&mut self, race: RaceId, note: &str) -> Result<(), DatasetError> {
        self.commit(RaceBatch {
            race,
            status: BatchStatus::NotApplicable,
            committed_at: Utc::now().to_rfc3339(),
            note: Some(note.to_string()),
            rows: Vec::new(),
        })
    }

    /// Read-only copy of the current contents
    pub fn snapshot(&self) -> MasterDataset {
        MasterDataset::from_batches(self.batches.clone())
    }

    fn commit(&mut self, batch: RaceBatch) -> Result<(), DatasetError> {
        if self.index.contains(&batch.race) {
            tracing::error!("Refusing duplicate append for {}", batch.race);
            return Err(DatasetError::DuplicateRace(batch.race));
        }

        let line = serde_json::to_vec(&batch)?;
        self.write_line(&line)?;

        self.index.insert(batch.race);
        self.batches.push(batch);
        Ok(())
    }

    /// Append `line` plus a newline and fsync; on failure cut the file back
    fn write_line(&mut self, line: &[u8]) -> Result<(), DatasetError> {
        let path = self.ledger_path.clone();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| DatasetError::io(&path, e))?;

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line);
        buf.push(b'\n');

        let written = file.write_all(&buf).and_then(|_| file.sync_all());
        if let Err(e) = written {
            if let Err(trunc) = file.set_len(self.ledger_len) {
                tracing::error!("Failed to roll back partial write to {:?}: {}", path, trunc);
            }
            return Err(DatasetError::io(&path, e));
        }

        self.ledger_len += buf.len() as u64;
        Ok(())
    }
}

/// Ledger bytes; a missing ledger reads as empty
fn read_ledger(path: &Path) -> Result<Vec<u8>, DatasetError> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(DatasetError::io(path, e)),
    }
}

/// Processed race index; a race listed twice means the ledger has drifted
fn check_unique(path: &Path, batches: &[RaceBatch]) -> Result<BTreeSet<RaceId>, DatasetError> {
    let mut index = BTreeSet::new();
    for batch in batches {
        if !index.insert(batch.race) {
            tracing::error!("Ledger {:?} lists {} twice", path, batch.race);
            return Err(DatasetError::DuplicateRace(batch.race));
        }
    }
    Ok(index)
}

/// Parse ledger bytes into batches; returns the length of the valid prefix
fn parse_ledger(content: &[u8]) -> Result<(Vec<RaceBatch>, usize), DatasetError> {
    let mut batches = Vec::new();
    let mut offset = 0;
    let mut line_no = 0;

    while offset < content.len() {
        line_no += 1;
        let rest = &content[offset..];
        let (line, terminated) = match rest.iter().position(|b| *b == b'\n') {
            Some(pos) => (&rest[..pos], true),
            None => (rest, false),
        };
        let next = offset + line.len() + usize::from(terminated);

        if line.iter().all(|b| b.is_ascii_whitespace()) {
            offset = next;
            continue;
        }

        match serde_json::from_slice::<RaceBatch>(line) {
            Ok(batch) => {
                batches.push(batch);
                offset = next;
            }
            // Only an unterminated final line can be a torn write
            Err(_) if !terminated => break,
            Err(e) => {
                return Err(DatasetError::Corrupt {
                    line: line_no,
                    message: e.to_string(),
                })
            }
        }
    }

    Ok((batches, offset))
}

fn validate_rows(race: RaceId, rows: &[FeatureRow]) -> Result<(), DatasetError> {
    let invalid = |reason: String| DatasetError::InvalidBatch { race, reason };

    if rows.is_empty() {
        return Err(invalid("a scored race needs at least one row".to_string()));
    }

    let mut drivers = HashSet::new();
    for row in rows {
        if row.race != race {
            return Err(invalid(format!("row for {} belongs to {}", row.driver, row.race)));
        }
        if !drivers.insert(row.driver.as_str()) {
            return Err(invalid(format!("driver {} appears twice", row.driver)));
        }
        let values = [
            row.avg_consistency,
            row.avg_degradation,
            row.top_speed_st,
            row.final_points,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(invalid(format!("non-finite metric for {}", row.driver)));
        }
    }
    Ok(())
}

/// Exclusive lock on a dataset directory for the duration of a run
///
/// The lock file holds the owner's process id. Removed on drop; a lock left
/// behind by a process that no longer exists is reclaimed.
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire<P: AsRef<Path>>(dir: P) -> Result<Self, DatasetError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| DatasetError::io(dir, e))?;
        let path = dir.join(LOCK_FILE);

        match Self::create(&path) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(DatasetError::io(&path, e)),
        }

        let holder = fs::read_to_string(&path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok());
        let Some(pid) = holder.filter(|pid| !process_alive(*pid)) else {
            return Err(DatasetError::Locked(dir.to_path_buf()));
        };

        tracing::warn!("Reclaiming run lock {:?} left by exited process {}", path, pid);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(DatasetError::io(&path, e)),
        }
        Self::create(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                DatasetError::Locked(dir.to_path_buf())
            } else {
                DatasetError::io(&path, e)
            }
        })
    }

    fn create(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let lock = Self {
            path: path.to_path_buf(),
        };
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(lock)
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

// No portable liveness check; a lock is only reclaimed where procfs exists
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}
