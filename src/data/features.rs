//! Feature Engineering
//!
//! Turn one race's raw laps, telemetry and classification into one
//! fixed-width feature row per qualifying driver.
//!
//! A driver whose metric cannot be computed from enough valid samples is
//! left out of the race entirely. Nothing is zero-filled or mean-filled.

use crate::config::{ExtractionConfig, SpeedTrapWindow};
use crate::core::stats::{linear_slope, mean, sample_std};
use crate::error::ErrorKind;
use crate::models::{ClassificationEntry, FeatureRow, LapRecord, RaceId, RawSessionPayload};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Derived metric names
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Metric {
    Consistency,
    Degradation,
    TopSpeed,
    PositionsGained,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Metric::Consistency => "AvgConsistency",
            Metric::Degradation => "AvgDegradation",
            Metric::TopSpeed => "TopSpeedST",
            Metric::PositionsGained => "PositionsGained",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Driver {driver}: not enough valid data for {metric}")]
    InsufficientData { driver: String, metric: Metric },

    #[error("Payload for {0} contains no lap data")]
    NoLaps(RaceId),

    #[error("No speed trap window configured for circuit '{0}'")]
    NoSpeedTrapWindow(String),
}

impl ExtractionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractionError::InsufficientData { .. } => ErrorKind::ExtractionInsufficientData,
            _ => ErrorKind::ExtractionFailed,
        }
    }
}

/// A driver left out of a race and the first metric that could not be computed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedDriver {
    pub driver: String,
    pub metric: Metric,
}

/// Output of extracting one race
#[derive(Debug, Clone)]
pub struct RaceExtraction {
    pub race: RaceId,
    /// One row per qualifying driver, in classification order
    pub rows: Vec<FeatureRow>,
    pub dropped: Vec<DroppedDriver>,
}

impl RaceExtraction {
    /// Dropped driver count per metric
    pub fn dropped_by_metric(&self) -> BTreeMap<Metric, usize> {
        let mut counts = BTreeMap::new();
        for d in &self.dropped {
            *counts.entry(d.metric).or_insert(0) += 1;
        }
        counts
    }
}

/// Consistency and degradation aggregated over a driver's clean stints
#[derive(Debug, Clone, PartialEq)]
pub struct StintPerformance {
    pub avg_consistency: f64,
    pub avg_degradation: f64,
    /// Laps used across the stints that qualified
    pub laps_used: usize,
    pub stints_used: usize,
}

/// Feature extractor for race sessions
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    config: ExtractionConfig,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(ExtractionConfig::default())
    }
}

impl FeatureExtractor {
    pub fn new(config: ExtractionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Extract feature rows for every qualifying driver of a race
    ///
    /// Per-driver gaps only drop that driver. Errors are race-level: a payload
    /// without laps, or a circuit without a speed trap window.
    pub fn extract(&self, payload: &RawSessionPayload) -> Result<RaceExtraction, ExtractionError> {
        if payload.laps.is_empty() {
            return Err(ExtractionError::NoLaps(payload.race));
        }

        let window = self
            .config
            .speed_trap
            .window_for(&payload.circuit)
            .ok_or_else(|| ExtractionError::NoSpeedTrapWindow(payload.circuit.clone()))?;

        let mut rows = Vec::new();
        let mut dropped = Vec::new();

        for driver in payload.drivers() {
            match self.extract_driver(payload, &driver, window) {
                Ok(row) => rows.push(row),
                Err(ExtractionError::InsufficientData { driver, metric }) => {
                    dropped.push(DroppedDriver { driver, metric });
                }
                Err(e) => return Err(e),
            }
        }

        if !dropped.is_empty() {
            tracing::debug!(
                "{}: {} drivers kept, {} dropped for insufficient data",
                payload.race,
                rows.len(),
                dropped.len()
            );
        }

        Ok(RaceExtraction {
            race: payload.race,
            rows,
            dropped,
        })
    }

    /// Build the feature row of a single driver
    pub fn extract_driver(
        &self,
        payload: &RawSessionPayload,
        driver: &str,
        window: SpeedTrapWindow,
    ) -> Result<FeatureRow, ExtractionError> {
        let insufficient = |metric| ExtractionError::InsufficientData {
            driver: driver.to_string(),
            metric,
        };

        let laps: Vec<&LapRecord> = payload.laps_for(driver).collect();
        let stints = self.stint_performance(&laps).map_err(insufficient)?;
        let top_speed = top_speed_in_window(&laps, window).ok_or_else(|| insufficient(Metric::TopSpeed))?;

        let entry = payload.classification_for(driver);
        let positions_gained =
            positions_gained(entry).ok_or_else(|| insufficient(Metric::PositionsGained))?;

        Ok(FeatureRow {
            race: payload.race,
            driver: driver.to_string(),
            team: entry.and_then(|e| e.team.clone()),
            avg_consistency: stints.avg_consistency,
            avg_degradation: stints.avg_degradation,
            top_speed_st: top_speed,
            positions_gained,
            final_points: final_points(entry),
            valid_laps: stints.laps_used,
        })
    }

    /// Consistency and degradation over a driver's laps
    ///
    /// Laps are grouped by stint. Within a stint only valid laps count, and
    /// laps slower than the stint mean plus the outlier margin are removed.
    /// A stint contributes when it keeps at least `min_stint_laps` laps.
    pub fn stint_performance(&self, laps: &[&LapRecord]) -> Result<StintPerformance, Metric> {
        let valid_total = laps.iter().filter(|l| l.is_valid()).count();
        if valid_total < self.config.min_valid_laps {
            return Err(Metric::Consistency);
        }

        let mut by_stint: BTreeMap<u32, Vec<&LapRecord>> = BTreeMap::new();
        for &lap in laps {
            by_stint.entry(lap.stint.unwrap_or(0)).or_default().push(lap);
        }

        let mut consistencies = Vec::new();
        let mut slopes = Vec::new();
        let mut laps_used = 0;

        for stint_laps in by_stint.values() {
            let first_lap = stint_laps.iter().map(|l| l.lap_number).min().unwrap_or(1);

            // (tyre age, lap time) of valid laps
            let mut points: Vec<(f64, f64)> = stint_laps
                .iter()
                .filter(|l| l.is_valid())
                .filter_map(|l| {
                    let time = l.lap_time_secs?;
                    let age = l
                        .tyre_life
                        .unwrap_or(l.lap_number.saturating_sub(first_lap) + 1);
                    Some((age as f64, time))
                })
                .collect();

            if let Some(margin) = self.config.outlier_margin_secs {
                let times: Vec<f64> = points.iter().map(|p| p.1).collect();
                if let Some(m) = mean(&times) {
                    points.retain(|p| p.1 < m + margin);
                }
            }

            if points.len() < self.config.min_stint_laps {
                continue;
            }

            let ages: Vec<f64> = points.iter().map(|p| p.0).collect();
            let times: Vec<f64> = points.iter().map(|p| p.1).collect();

            if let (Some(std), Some(slope)) = (sample_std(&times), linear_slope(&ages, &times)) {
                consistencies.push(std);
                slopes.push(slope);
                laps_used += points.len();
            }
        }

        let avg_degradation = mean(&slopes).ok_or(Metric::Degradation)?;
        let avg_consistency = mean(&consistencies).ok_or(Metric::Consistency)?;

        if laps_used < self.config.min_valid_laps {
            return Err(Metric::Consistency);
        }

        Ok(StintPerformance {
            avg_consistency,
            avg_degradation,
            laps_used,
            stints_used: slopes.len(),
        })
    }
}

/// Highest speed among telemetry samples inside the speed trap window
///
/// Samples missing distance or speed are ignored; `None` when no sample
/// falls inside the window.
pub fn top_speed_in_window(laps: &[&LapRecord], window: SpeedTrapWindow) -> Option<f64> {
    laps.iter()
        .flat_map(|l| l.telemetry.iter())
        .filter_map(|s| match (s.distance_m, s.speed_kph) {
            (Some(d), Some(v)) if window.contains(d) && v.is_finite() => Some(v),
            _ => None,
        })
        .fold(None, |best: Option<f64>, v| Some(best.map_or(v, |b| b.max(v))))
}

/// Grid position minus classified finishing position
///
/// `None` for drivers that did not start from the grid or were not classified.
pub fn positions_gained(entry: Option<&ClassificationEntry>) -> Option<i32> {
    let entry = entry?;
    let grid = entry.grid_position.filter(|g| *g >= 1)?;
    let finish = entry.position.filter(|p| *p >= 1)?;
    let gained = i64::from(grid) - i64::from(finish);
    i32::try_from(gained).ok()
}

/// Points scored; unclassified drivers score zero
pub fn final_points(entry: Option<&ClassificationEntry>) -> f64 {
    match entry {
        Some(e) if e.position.is_some() => e.points.unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpeedTrapConfig;
    use crate::models::TelemetrySample;
    use std::collections::HashMap;

    const TRAP: SpeedTrapWindow = SpeedTrapWindow {
        start_m: 1000.0,
        end_m: 1200.0,
    };

    fn extractor() -> FeatureExtractor {
        let mut circuits = HashMap::new();
        circuits.insert("testring".to_string(), TRAP);
        FeatureExtractor::new(ExtractionConfig {
            speed_trap: SpeedTrapConfig {
                default_window: None,
                circuits,
            },
            ..Default::default()
        })
    }

    fn lap(driver: &str, n: u32, time: f64) -> LapRecord {
        LapRecord {
            driver: driver.to_string(),
            lap_number: n,
            lap_time_secs: Some(time),
            stint: Some(1),
            telemetry: vec![TelemetrySample {
                distance_m: Some(1100.0),
                speed_kph: Some(300.0 + n as f64),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn classified(driver: &str, grid: u32, pos: u32, points: f64) -> ClassificationEntry {
        ClassificationEntry {
            driver: driver.to_string(),
            team: Some("Team".to_string()),
            grid_position: Some(grid),
            position: Some(pos),
            points: Some(points),
            status: Some("Finished".to_string()),
        }
    }

    fn payload(laps: Vec<LapRecord>, classification: Vec<ClassificationEntry>) -> RawSessionPayload {
        RawSessionPayload {
            race: RaceId::new(2024, 1),
            event_name: "Test GP".to_string(),
            circuit: "testring".to_string(),
            laps,
            classification,
            fetched_at: None,
        }
    }

    #[test]
    fn test_consistency_ignores_invalid_laps() {
        let mut laps = vec![
            lap("VER", 1, 90.1),
            lap("VER", 2, 90.3),
            lap("VER", 3, 90.2),
            lap("VER", 4, 200.0),
        ];
        laps[3].invalid = true;
        let p = payload(laps, vec![classified("VER", 2, 1, 25.0)]);

        let result = extractor().extract(&p).unwrap();
        assert_eq!(result.rows.len(), 1);
        let row = &result.rows[0];
        assert!((row.avg_consistency - 0.1).abs() < 1e-9);
        assert_eq!(row.valid_laps, 3);
    }

    #[test]
    fn test_driver_below_lap_threshold_is_dropped() {
        let p = payload(
            vec![lap("HAM", 1, 91.0), lap("HAM", 2, 91.2)],
            vec![classified("HAM", 3, 2, 18.0)],
        );

        let result = extractor().extract(&p).unwrap();
        assert!(result.rows.is_empty());
        assert_eq!(
            result.dropped,
            vec![DroppedDriver {
                driver: "HAM".to_string(),
                metric: Metric::Consistency,
            }]
        );
    }

    #[test]
    fn test_top_speed_only_inside_window() {
        let mut laps = vec![lap("LEC", 1, 90.0), lap("LEC", 2, 90.2), lap("LEC", 3, 90.4)];
        laps[0].telemetry = vec![
            TelemetrySample {
                distance_m: Some(1010.0),
                speed_kph: Some(310.0),
                ..Default::default()
            },
            TelemetrySample {
                distance_m: Some(1100.0),
                speed_kph: Some(315.0),
                ..Default::default()
            },
            TelemetrySample {
                distance_m: Some(1190.0),
                speed_kph: Some(298.0),
                ..Default::default()
            },
            TelemetrySample {
                distance_m: Some(3000.0),
                speed_kph: Some(340.0),
                ..Default::default()
            },
        ];
        laps[1].telemetry.clear();
        laps[2].telemetry.clear();

        let refs: Vec<&LapRecord> = laps.iter().collect();
        assert_eq!(top_speed_in_window(&refs, TRAP), Some(315.0));
    }

    #[test]
    fn test_no_sample_in_window_drops_driver() {
        let mut laps = vec![lap("NOR", 1, 90.0), lap("NOR", 2, 90.2), lap("NOR", 3, 90.4)];
        for l in &mut laps {
            l.telemetry = vec![TelemetrySample {
                distance_m: None,
                speed_kph: Some(330.0),
                ..Default::default()
            }];
        }
        let p = payload(laps, vec![classified("NOR", 4, 3, 15.0)]);

        let result = extractor().extract(&p).unwrap();
        assert!(result.rows.is_empty());
        assert_eq!(result.dropped[0].metric, Metric::TopSpeed);
    }

    #[test]
    fn test_degradation_slope_per_stint() {
        let mut laps = Vec::new();
        // Stint 1: +0.1s per lap, stint 2: +0.3s per lap
        for n in 1..=4 {
            laps.push(LapRecord {
                stint: Some(1),
                ..lap("SAI", n, 90.0 + 0.1 * n as f64)
            });
        }
        laps.push(LapRecord {
            stint: Some(2),
            pit_out: true,
            ..lap("SAI", 5, 110.0)
        });
        for n in 6..=9 {
            laps.push(LapRecord {
                stint: Some(2),
                ..lap("SAI", n, 89.0 + 0.3 * (n - 5) as f64)
            });
        }
        let refs: Vec<&LapRecord> = laps.iter().collect();

        let perf = extractor().stint_performance(&refs).unwrap();
        assert_eq!(perf.stints_used, 2);
        assert_eq!(perf.laps_used, 8);
        assert!((perf.avg_degradation - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_short_stints_excluded_from_degradation() {
        // Four valid laps split 2 + 2 over two stints: no stint is long enough
        let laps = vec![
            LapRecord { stint: Some(1), ..lap("ALO", 1, 90.0) },
            LapRecord { stint: Some(1), ..lap("ALO", 2, 90.1) },
            LapRecord { stint: Some(2), ..lap("ALO", 3, 90.2) },
            LapRecord { stint: Some(2), ..lap("ALO", 4, 90.3) },
        ];
        let refs: Vec<&LapRecord> = laps.iter().collect();
        assert_eq!(extractor().stint_performance(&refs), Err(Metric::Degradation));
    }

    #[test]
    fn test_outlier_laps_removed() {
        let laps = vec![
            lap("PIA", 1, 90.0),
            lap("PIA", 2, 90.2),
            lap("PIA", 3, 90.4),
            lap("PIA", 4, 90.6),
            lap("PIA", 5, 120.0),
        ];
        let refs: Vec<&LapRecord> = laps.iter().collect();
        let perf = extractor().stint_performance(&refs).unwrap();
        assert_eq!(perf.laps_used, 4);
        assert!((perf.avg_degradation - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_positions_gained_and_points() {
        assert_eq!(positions_gained(Some(&classified("VER", 5, 1, 25.0))), Some(4));
        assert_eq!(positions_gained(Some(&classified("VER", 1, 3, 15.0))), Some(-2));

        let pit_lane = classified("PER", 0, 8, 4.0);
        assert_eq!(positions_gained(Some(&pit_lane)), None);

        let dnf = ClassificationEntry {
            position: None,
            points: Some(0.0),
            ..classified("STR", 10, 1, 0.0)
        };
        assert_eq!(positions_gained(Some(&dnf)), None);
        assert_eq!(final_points(Some(&dnf)), 0.0);
        assert_eq!(final_points(None), 0.0);
        assert_eq!(final_points(Some(&classified("VER", 5, 1, 25.0))), 25.0);
    }

    #[test]
    fn test_out_of_range_positions_dropped() {
        assert_eq!(positions_gained(Some(&classified("VER", u32::MAX, 1, 25.0))), None);
        assert_eq!(positions_gained(Some(&classified("VER", 20, u32::MAX, 0.0))), None);
    }

    #[test]
    fn test_unclassified_driver_dropped_on_positions() {
        let laps = vec![lap("OCO", 1, 90.0), lap("OCO", 2, 90.1), lap("OCO", 3, 90.2)];
        let p = payload(laps, vec![]);
        let result = extractor().extract(&p).unwrap();
        assert!(result.rows.is_empty());
        assert_eq!(result.dropped[0].metric, Metric::PositionsGained);
    }

    #[test]
    fn test_missing_window_is_race_level_error() {
        let mut p = payload(vec![lap("VER", 1, 90.0)], vec![]);
        p.circuit = "unknown".to_string();
        let err = extractor().extract(&p).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExtractionFailed);
    }

    #[test]
    fn test_empty_payload_is_race_level_error() {
        let p = payload(vec![], vec![classified("VER", 1, 1, 25.0)]);
        assert!(matches!(extractor().extract(&p), Err(ExtractionError::NoLaps(_))));
    }

    #[test]
    fn test_rows_follow_classification_order() {
        let mut laps = Vec::new();
        for d in ["AAA", "BBB", "CCC"] {
            for n in 1..=3 {
                laps.push(lap(d, n, 90.0 + 0.1 * n as f64));
            }
        }
        let p = payload(
            laps,
            vec![
                classified("CCC", 3, 1, 25.0),
                classified("AAA", 1, 2, 18.0),
                classified("BBB", 2, 3, 15.0),
            ],
        );
        let result = extractor().extract(&p).unwrap();
        let order: Vec<&str> = result.rows.iter().map(|r| r.driver.as_str()).collect();
        assert_eq!(order, vec!["CCC", "AAA", "BBB"]);
        assert_eq!(result.rows[0].positions_gained, 2);
        assert_eq!(result.rows[0].team.as_deref(), Some("Team"));
    }
}
