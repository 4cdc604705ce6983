//! Season snapshot
//!
//! Aggregates per driver and per team over a filtered dataset view, for
//! reporting. Ties resolve to the alphabetically first name.

use crate::models::FeatureRow;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregates of one driver over the selected rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSummary {
    pub driver: String,
    pub races: usize,
    pub total_points: f64,
    pub avg_consistency: f64,
    pub avg_positions_gained: f64,
}

/// Mean speed trap reading of one team
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamSpeed {
    pub team: String,
    pub avg_top_speed: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeasonSummary {
    /// Sorted by driver code
    pub drivers: Vec<DriverSummary>,
    /// Sorted fastest first
    pub team_top_speed: Vec<TeamSpeed>,
}

#[derive(Default)]
struct Accumulator {
    races: usize,
    points: f64,
    consistency: f64,
    gained: f64,
}

impl SeasonSummary {
    pub fn from_rows<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = &'a FeatureRow>,
    {
        let mut by_driver: BTreeMap<&str, Accumulator> = BTreeMap::new();
        let mut by_team: BTreeMap<&str, (f64, usize)> = BTreeMap::new();

        for row in rows {
            let acc = by_driver.entry(row.driver.as_str()).or_default();
            acc.races += 1;
            acc.points += row.final_points;
            acc.consistency += row.avg_consistency;
            acc.gained += row.positions_gained as f64;

            if let Some(team) = row.team.as_deref() {
                let entry = by_team.entry(team).or_insert((0.0, 0));
                entry.0 += row.top_speed_st;
                entry.1 += 1;
            }
        }

        let drivers = by_driver
            .into_iter()
            .map(|(driver, acc)| DriverSummary {
                driver: driver.to_string(),
                races: acc.races,
                total_points: acc.points,
                avg_consistency: acc.consistency / acc.races as f64,
                avg_positions_gained: acc.gained / acc.races as f64,
            })
            .collect();

        let mut team_top_speed: Vec<TeamSpeed> = by_team
            .into_iter()
            .map(|(team, (sum, count))| TeamSpeed {
                team: team.to_string(),
                avg_top_speed: sum / count as f64,
            })
            .collect();
        // Stable sort keeps name order among equal speeds
        team_top_speed.sort_by(|a, b| b.avg_top_speed.total_cmp(&a.avg_top_speed));

        Self {
            drivers,
            team_top_speed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Most total points
    pub fn points_leader(&self) -> Option<&DriverSummary> {
        first_best(&self.drivers, |d| d.total_points)
    }

    /// Lowest mean lap time dispersion
    pub fn most_consistent(&self) -> Option<&DriverSummary> {
        first_best(&self.drivers, |d| -d.avg_consistency)
    }

    /// Most positions gained on average
    pub fn best_starter(&self) -> Option<&DriverSummary> {
        first_best(&self.drivers, |d| d.avg_positions_gained)
    }
}

/// First element with the largest key
fn first_best<F>(drivers: &[DriverSummary], key: F) -> Option<&DriverSummary>
where
    F: Fn(&DriverSummary) -> f64,
{
    let mut best: Option<&DriverSummary> = None;
    for d in drivers {
        if best.map_or(true, |b| key(d) > key(b)) {
            best = Some(d);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RaceId;

    fn row(round: u8, driver: &str, team: &str, points: f64, cons: f64, gained: i32, speed: f64) -> FeatureRow {
        FeatureRow {
            race: RaceId::new(2024, round),
            driver: driver.to_string(),
            team: Some(team.to_string()),
            avg_consistency: cons,
            avg_degradation: 0.03,
            top_speed_st: speed,
            positions_gained: gained,
            final_points: points,
            valid_laps: 40,
        }
    }

    #[test]
    fn test_season_summary() {
        let rows = vec![
            row(1, "VER", "Red Bull Racing", 25.0, 0.40, 0, 320.0),
            row(1, "LEC", "Ferrari", 18.0, 0.30, 2, 322.0),
            row(1, "HAM", "Mercedes", 0.0, 0.60, 5, 318.0),
            row(2, "VER", "Red Bull Racing", 18.0, 0.50, 1, 324.0),
            row(2, "LEC", "Ferrari", 25.0, 0.35, 1, 322.0),
            row(2, "HAM", "Mercedes", 4.0, 0.55, 3, 316.0),
        ];
        let summary = SeasonSummary::from_rows(&rows);

        // VER and LEC tie on 43 points; name order decides
        assert_eq!(summary.points_leader().unwrap().driver, "LEC");
        assert_eq!(summary.most_consistent().unwrap().driver, "LEC");
        assert_eq!(summary.best_starter().unwrap().driver, "HAM");
        assert!((summary.best_starter().unwrap().avg_positions_gained - 4.0).abs() < 1e-12);

        let teams: Vec<&str> = summary.team_top_speed.iter().map(|t| t.team.as_str()).collect();
        assert_eq!(teams, vec!["Ferrari", "Red Bull Racing", "Mercedes"]);
    }

    #[test]
    fn test_empty_summary() {
        let summary = SeasonSummary::from_rows(std::iter::empty());
        assert!(summary.is_empty());
        assert!(summary.points_leader().is_none());
    }
}
