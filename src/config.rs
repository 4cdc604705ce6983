//! Pipeline configuration
//!
//! Loaded from a TOML file; every field has a default so a partial file
//! (or no file at all) is valid.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory holding cached raw session payloads
    pub cache_dir: PathBuf,
    /// Directory holding the master dataset ledger
    pub dataset_dir: PathBuf,
    pub extraction: ExtractionConfig,
    pub source: SourceConfig,
    pub fit: FitConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("data/cache"),
            dataset_dir: PathBuf::from("data/dataset"),
            extraction: ExtractionConfig::default(),
            source: SourceConfig::default(),
            fit: FitConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a TOML config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.extraction.validate()?;
        if self.fit.min_rows < 2 {
            return Err(ConfigError::Invalid(format!(
                "fit.min_rows must be at least 2, got {}",
                self.fit.min_rows
            )));
        }
        Ok(())
    }
}

/// Thresholds and circuit constants used by the feature extractor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Minimum valid laps a driver needs to produce a row
    pub min_valid_laps: usize,
    /// Minimum clean laps for a stint to contribute consistency and degradation
    pub min_stint_laps: usize,
    /// Laps slower than the stint mean plus this margin (seconds) are dropped
    pub outlier_margin_secs: Option<f64>,
    pub speed_trap: SpeedTrapConfig,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_valid_laps: 3,
            min_stint_laps: 3,
            outlier_margin_secs: Some(5.0),
            speed_trap: SpeedTrapConfig::default(),
        }
    }
}

impl ExtractionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Dispersion and slope both need two points
        if self.min_valid_laps < 2 {
            return Err(ConfigError::Invalid(format!(
                "extraction.min_valid_laps must be at least 2, got {}",
                self.min_valid_laps
            )));
        }
        if self.min_stint_laps < 2 {
            return Err(ConfigError::Invalid(format!(
                "extraction.min_stint_laps must be at least 2, got {}",
                self.min_stint_laps
            )));
        }
        if let Some(margin) = self.outlier_margin_secs {
            if margin <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "extraction.outlier_margin_secs must be positive, got {}",
                    margin
                )));
            }
        }
        self.speed_trap.validate()
    }
}

/// Distance window (meters from the start line) of a speed trap
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedTrapWindow {
    pub start_m: f64,
    pub end_m: f64,
}

impl SpeedTrapWindow {
    pub fn new(start_m: f64, end_m: f64) -> Self {
        Self { start_m, end_m }
    }

    /// Inclusive on both ends
    pub fn contains(&self, distance_m: f64) -> bool {
        distance_m >= self.start_m && distance_m <= self.end_m
    }
}

/// Speed trap windows per circuit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedTrapConfig {
    /// Used for circuits without their own entry
    pub default_window: Option<SpeedTrapWindow>,
    /// Circuit key (lowercase) -> window
    pub circuits: HashMap<String, SpeedTrapWindow>,
}

impl SpeedTrapConfig {
    /// Window for a circuit; circuit keys are matched case-insensitively
    pub fn window_for(&self, circuit: &str) -> Option<SpeedTrapWindow> {
        let key = circuit.trim().to_lowercase();
        self.circuits
            .iter()
            .find(|(name, _)| name.to_lowercase() == key)
            .map(|(_, w)| *w)
            .or(self.default_window)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let named = self.circuits.iter().map(|(k, w)| (k.as_str(), w));
        let all = named.chain(self.default_window.iter().map(|w| ("default", w)));
        for (name, window) in all {
            if !(window.start_m < window.end_m) || window.start_m < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "speed trap window for {} must satisfy 0 <= start_m < end_m, got {}..{}",
                    name, window.start_m, window.end_m
                )));
            }
        }
        Ok(())
    }
}

/// Telemetry feed client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    /// Delay between requests in milliseconds
    pub delay_ms: u64,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/feed".to_string(),
            delay_ms: 2000,
            timeout_secs: 30,
            user_agent: concat!("f1-analyzer/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Attribution fit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Minimum rows required before a fit is attempted
    pub min_rows: usize,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self { min_rows: 6 }
    }
}
