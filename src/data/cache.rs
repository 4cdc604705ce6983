//! Session cache for raw race payloads
//!
//! One JSON file per race (`2024_05.json`). Payloads are written to a temp
//! file, synced and renamed into place, so a key is either fully present or
//! absent after a crash.

use crate::error::ErrorKind;
use crate::models::{RaceId, RawSessionPayload};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("No cached payload for {0}")]
    Miss(RaceId),

    #[error("Cache I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Corrupt cached payload for {race}: {source}")]
    Corrupt {
        race: RaceId,
        source: serde_json::Error,
    },

    #[error("Failed to encode payload for {race}: {source}")]
    Encode {
        race: RaceId,
        source: serde_json::Error,
    },
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::Miss(_) => ErrorKind::CacheMiss,
            _ => ErrorKind::Storage,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// On-disk cache of raw session payloads keyed by race
pub struct SessionCache {
    dir: PathBuf,
    /// Keys present on disk, for O(1) `has`
    index: HashSet<RaceId>,
}

impl SessionCache {
    /// Open (creating if needed) a cache directory and index its contents
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;

        let mut index = HashSet::new();
        for entry in fs::read_dir(&dir).map_err(|e| CacheError::io(&dir, e))? {
            let path = entry.map_err(|e| CacheError::io(&dir, e))?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(race) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(RaceId::from_file_stem)
                {
                    index.insert(race);
                }
            }
        }

        tracing::debug!("Session cache at {:?}: {} races", dir, index.len());
        Ok(Self { dir, index })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, race: RaceId) -> PathBuf {
        self.dir.join(format!("{}.json", race.file_stem()))
    }

    pub fn has(&self, race: RaceId) -> bool {
        self.index.contains(&race)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Cached races in chronological order
    pub fn races(&self) -> Vec<RaceId> {
        let mut races: Vec<RaceId> = self.index.iter().copied().collect();
        races.sort();
        races
    }

    /// Read a cached payload
    pub fn get(&self, race: RaceId) -> Result<RawSessionPayload, CacheError> {
        if !self.has(race) {
            return Err(CacheError::Miss(race));
        }
        let path = self.path_for(race);
        let content = fs::read_to_string(&path).map_err(|e| CacheError::io(&path, e))?;
        serde_json::from_str(&content).map_err(|source| CacheError::Corrupt { race, source })
    }

    /// Store a payload; overwrites an existing entry for the same race
    pub fn put(&mut self, race: RaceId, payload: &RawSessionPayload) -> Result<(), CacheError> {
        let bytes =
            serde_json::to_vec(payload).map_err(|source| CacheError::Encode { race, source })?;
        let path = self.path_for(race);
        write_atomic(&path, &bytes).map_err(|e| CacheError::io(&path, e))?;
        self.index.insert(race);
        Ok(())
    }
}

/// Write via temp file + fsync + rename, then sync the parent directory
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|s| s.to_str()).unwrap_or("file"),
        std::process::id()
    ));
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}
