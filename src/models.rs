use serde::{Deserialize, Serialize};
use std::fmt;

/// Race key: season year and round number within the season
///
/// Ordering is chronological (season first, then round).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RaceId {
    pub season: u16,
    pub round: u8,
}

impl RaceId {
    pub fn new(season: u16, round: u8) -> Self {
        Self { season, round }
    }

    /// File stem used by on-disk stores, e.g. `2024_05`
    pub fn file_stem(&self) -> String {
        format!("{}_{:02}", self.season, self.round)
    }

    /// Parse a file stem produced by [`RaceId::file_stem`]
    pub fn from_file_stem(stem: &str) -> Option<Self> {
        let (season, round) = stem.split_once('_')?;
        Some(Self {
            season: season.parse().ok()?,
            round: round.parse().ok()?,
        })
    }
}

impl fmt::Display for RaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} R{:02}", self.season, self.round)
    }
}

/// One telemetry sample inside a lap
///
/// Every channel is optional: the feed leaves holes instead of failing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Distance along the lap in meters
    #[serde(default)]
    pub distance_m: Option<f64>,
    #[serde(default)]
    pub speed_kph: Option<f64>,
    /// Throttle application, 0-100
    #[serde(default)]
    pub throttle: Option<f64>,
    #[serde(default)]
    pub brake: Option<bool>,
    /// Seconds since the start of the lap
    #[serde(default)]
    pub time_secs: Option<f64>,
}

/// One lap of one driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapRecord {
    /// Three-letter driver code (e.g. "VER")
    pub driver: String,
    pub lap_number: u32,
    #[serde(default)]
    pub lap_time_secs: Option<f64>,
    /// Running position at the end of the lap
    #[serde(default)]
    pub position: Option<u32>,
    /// Stint counter (1 = first set of tyres)
    #[serde(default)]
    pub stint: Option<u32>,
    /// Laps run on the current set of tyres
    #[serde(default)]
    pub tyre_life: Option<u32>,
    #[serde(default)]
    pub compound: Option<String>,
    #[serde(default)]
    pub pit_in: bool,
    #[serde(default)]
    pub pit_out: bool,
    /// Lap time deleted by race control (track limits etc.)
    #[serde(default)]
    pub deleted: bool,
    /// Timing marked as inaccurate or otherwise unusable by the feed
    #[serde(default)]
    pub invalid: bool,
    /// Lap run entirely under green flag conditions
    #[serde(default = "default_true")]
    pub green_flag: bool,
    #[serde(default)]
    pub telemetry: Vec<TelemetrySample>,
}

fn default_true() -> bool {
    true
}

impl Default for LapRecord {
    fn default() -> Self {
        Self {
            driver: String::new(),
            lap_number: 0,
            lap_time_secs: None,
            position: None,
            stint: None,
            tyre_life: None,
            compound: None,
            pit_in: false,
            pit_out: false,
            deleted: false,
            invalid: false,
            green_flag: true,
            telemetry: Vec::new(),
        }
    }
}

impl LapRecord {
    /// A lap counts towards pace metrics only when it has a time and was a
    /// clean, green-flag, non-pit lap.
    pub fn is_valid(&self) -> bool {
        self.lap_time_secs.is_some_and(|t| t.is_finite() && t > 0.0)
            && !self.deleted
            && !self.invalid
            && !self.pit_in
            && !self.pit_out
            && self.green_flag
    }
}

/// Official classification line for one driver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationEntry {
    pub driver: String,
    #[serde(default)]
    pub team: Option<String>,
    /// Starting grid slot; 0 means pit-lane start
    #[serde(default)]
    pub grid_position: Option<u32>,
    /// Classified finishing position; `None` when not classified
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(default)]
    pub points: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Raw race session as delivered by the telemetry feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSessionPayload {
    pub race: RaceId,
    #[serde(default)]
    pub event_name: String,
    /// Circuit key used to look up the speed trap window
    #[serde(default)]
    pub circuit: String,
    #[serde(default)]
    pub laps: Vec<LapRecord>,
    #[serde(default)]
    pub classification: Vec<ClassificationEntry>,
    #[serde(default)]
    pub fetched_at: Option<String>,
}

impl RawSessionPayload {
    /// Driver codes in classification order, followed by drivers that only
    /// appear in lap data (first-seen order).
    pub fn drivers(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut drivers = Vec::new();
        let names = self
            .classification
            .iter()
            .map(|c| c.driver.as_str())
            .chain(self.laps.iter().map(|l| l.driver.as_str()));
        for name in names {
            if seen.insert(name) {
                drivers.push(name.to_string());
            }
        }
        drivers
    }

    pub fn laps_for<'a>(&'a self, driver: &'a str) -> impl Iterator<Item = &'a LapRecord> + 'a {
        self.laps.iter().filter(move |l| l.driver == driver)
    }

    pub fn classification_for(&self, driver: &str) -> Option<&ClassificationEntry> {
        self.classification.iter().find(|c| c.driver == driver)
    }
}

/// Derived per-driver metrics for one race
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub race: RaceId,
    pub driver: String,
    #[serde(default)]
    pub team: Option<String>,
    /// Mean per-stint standard deviation of valid lap times (seconds)
    pub avg_consistency: f64,
    /// Mean per-stint slope of lap time against tyre age (seconds per lap)
    pub avg_degradation: f64,
    /// Highest speed inside the circuit's speed trap window (km/h)
    pub top_speed_st: f64,
    /// Grid position minus classified position
    pub positions_gained: i32,
    pub final_points: f64,
    /// Valid laps the pace metrics were computed from
    pub valid_laps: usize,
}

impl FeatureRow {
    pub fn key(&self) -> (RaceId, &str) {
        (self.race, self.driver.as_str())
    }
}
