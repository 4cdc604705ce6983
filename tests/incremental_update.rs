//! End-to-end runs of the incremental updater against an in-memory feed

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::rc::Rc;

use f1_analyzer::config::{ExtractionConfig, FitConfig, SpeedTrapConfig, SpeedTrapWindow};
use f1_analyzer::core::AttributionFitter;
use f1_analyzer::data::{
    BatchStatus, DatasetError, DatasetFilter, DatasetStore, FeatureExtractor, MasterDataset,
    SessionCache,
};
use f1_analyzer::pipeline::{IncrementalUpdater, RunReport, UpdateOptions};
use f1_analyzer::{
    ClassificationEntry, ErrorKind, LapRecord, RaceId, RawSessionPayload, SourceError,
    TelemetrySample, TelemetrySource,
};
use tempfile::TempDir;

const CIRCUIT: &str = "testring";

enum Answer {
    Session(RawSessionPayload),
    Cancelled,
}

#[derive(Default)]
struct FeedState {
    answers: HashMap<RaceId, Answer>,
    calls: Vec<RaceId>,
}

/// Feed handle; clones share state so tests can inspect calls after a run
#[derive(Clone, Default)]
struct FakeFeed {
    state: Rc<RefCell<FeedState>>,
}

impl FakeFeed {
    fn publish(&self, payload: RawSessionPayload) {
        let race = payload.race;
        self.state
            .borrow_mut()
            .answers
            .insert(race, Answer::Session(payload));
    }

    fn cancel(&self, race: RaceId) {
        self.state.borrow_mut().answers.insert(race, Answer::Cancelled);
    }

    fn calls(&self) -> Vec<RaceId> {
        self.state.borrow().calls.clone()
    }
}

impl TelemetrySource for FakeFeed {
    fn fetch(&self, race: RaceId) -> Result<RawSessionPayload, SourceError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(race);
        match state.answers.get(&race) {
            Some(Answer::Session(p)) => Ok(p.clone()),
            Some(Answer::Cancelled) => Err(SourceError::NotApplicable {
                race,
                reason: "cancelled".to_string(),
            }),
            None => Err(SourceError::NotPublished(race)),
        }
    }
}

struct Driver {
    code: &'static str,
    team: &'static str,
    grid: u32,
    finish: Option<u32>,
    points: f64,
    base: f64,
    deg: f64,
    jitter: f64,
    speed: f64,
}

const JITTER: [f64; 6] = [0.0, 1.0, -0.5, 0.8, -0.2, 0.4];

fn driver_laps(d: &Driver) -> Vec<LapRecord> {
    let mut laps = Vec::new();
    for stint in 1..=2u32 {
        for i in 0..6u32 {
            let lap_number = (stint - 1) * 6 + i + 1;
            let age = i + 1;
            laps.push(LapRecord {
                driver: d.code.to_string(),
                lap_number,
                lap_time_secs: Some(d.base + d.deg * age as f64 + d.jitter * JITTER[i as usize]),
                position: d.finish,
                stint: Some(stint),
                tyre_life: Some(age),
                compound: Some(if stint == 1 { "MEDIUM" } else { "HARD" }.to_string()),
                pit_out: stint == 2 && i == 0,
                telemetry: vec![
                    TelemetrySample {
                        distance_m: Some(1000.0),
                        speed_kph: Some(d.speed - (lap_number % 3) as f64),
                        ..Default::default()
                    },
                    // Outside the trap window; must never be picked
                    TelemetrySample {
                        distance_m: Some(2500.0),
                        speed_kph: Some(350.0),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            });
        }
    }
    laps
}

fn session(race: RaceId, drivers: &[Driver]) -> RawSessionPayload {
    RawSessionPayload {
        race,
        event_name: format!("Test Grand Prix {}", race.round),
        circuit: CIRCUIT.to_string(),
        laps: drivers.iter().flat_map(driver_laps).collect(),
        classification: drivers
            .iter()
            .map(|d| ClassificationEntry {
                driver: d.code.to_string(),
                team: Some(d.team.to_string()),
                grid_position: Some(d.grid),
                position: d.finish,
                points: d.finish.map(|_| d.points),
                status: Some(if d.finish.is_some() { "Finished" } else { "Retired" }.to_string()),
            })
            .collect(),
        fetched_at: None,
    }
}

/// Four drivers; `shift` varies the metrics between races
fn grid(race: RaceId, shift: f64) -> RawSessionPayload {
    session(
        race,
        &[
            Driver { code: "VER", team: "Red Bull Racing", grid: 1, finish: Some(1), points: 25.0, base: 90.0, deg: 0.05 + shift, jitter: 0.10, speed: 318.0 + shift * 40.0 },
            Driver { code: "LEC", team: "Ferrari", grid: 4, finish: Some(2), points: 18.0, base: 90.3, deg: 0.08, jitter: 0.15 + shift, speed: 322.0 },
            Driver { code: "NOR", team: "McLaren", grid: 2, finish: Some(5), points: 10.0, base: 90.2, deg: 0.03 - shift, jitter: 0.25, speed: 316.0 - shift * 20.0 },
            Driver { code: "HAM", team: "Mercedes", grid: 9, finish: Some(4), points: 12.0, base: 90.6, deg: 0.11, jitter: 0.20 + shift * 2.0, speed: 314.0 },
        ],
    )
}

fn extraction_config() -> ExtractionConfig {
    let mut speed_trap = SpeedTrapConfig::default();
    speed_trap
        .circuits
        .insert(CIRCUIT.to_string(), SpeedTrapWindow::new(900.0, 1100.0));
    ExtractionConfig {
        speed_trap,
        ..ExtractionConfig::default()
    }
}

fn run(root: &Path, feed: &FakeFeed, candidates: &[RaceId]) -> RunReport {
    run_with_options(root, feed, candidates, UpdateOptions::default())
}

fn run_with_options(
    root: &Path,
    feed: &FakeFeed,
    candidates: &[RaceId],
    options: UpdateOptions,
) -> RunReport {
    let cache = SessionCache::open(root.join("cache")).unwrap();
    let store = DatasetStore::open(root.join("dataset")).unwrap();
    let mut updater = IncrementalUpdater::new(
        feed.clone(),
        cache,
        store,
        FeatureExtractor::new(extraction_config()),
    )
    .with_options(options);
    updater.run(candidates).unwrap()
}

fn open_store(root: &Path) -> DatasetStore {
    DatasetStore::open(root.join("dataset")).unwrap()
}

fn snapshot(root: &Path) -> MasterDataset {
    DatasetStore::read_snapshot(root.join("dataset")).unwrap()
}

fn r(round: u8) -> RaceId {
    RaceId::new(2024, round)
}

fn workspace() -> TempDir {
    tempfile::tempdir().unwrap()
}

#[test]
fn test_second_run_is_a_no_op() {
    let dir = workspace();
    let feed = FakeFeed::default();
    feed.publish(grid(r(1), 0.0));
    feed.publish(grid(r(2), 0.01));

    let first = run(dir.path(), &feed, &[r(1), r(2)]);
    assert_eq!(first.processed, vec![r(1), r(2)]);
    assert_eq!(first.rows_appended, 8);
    let before = snapshot(dir.path());

    let second = run(dir.path(), &feed, &[r(1), r(2)]);
    assert!(second.processed.is_empty());
    assert_eq!(second.skipped, 2);

    let after = snapshot(dir.path());
    assert_eq!(after.batches(), before.batches());
    assert_eq!(after.len(), 8);
    // No fetch on the second run
    assert_eq!(feed.calls(), vec![r(1), r(2)]);
}

#[test]
fn test_rows_follow_race_then_classification_order() {
    let dir = workspace();
    let feed = FakeFeed::default();
    feed.publish(grid(r(1), 0.0));
    feed.publish(grid(r(2), 0.01));

    run(dir.path(), &feed, &[r(2), r(1)]);

    let snapshot = snapshot(dir.path());
    let keys: Vec<(u8, &str)> = snapshot
        .rows()
        .map(|row| (row.race.round, row.driver.as_str()))
        .collect();
    assert_eq!(
        keys,
        vec![
            (1, "VER"), (1, "LEC"), (1, "NOR"), (1, "HAM"),
            (2, "VER"), (2, "LEC"), (2, "NOR"), (2, "HAM"),
        ]
    );
}

#[test]
fn test_row_values() {
    let dir = workspace();
    let feed = FakeFeed::default();
    feed.publish(grid(r(1), 0.0));
    run(dir.path(), &feed, &[r(1)]);

    let snapshot = snapshot(dir.path());
    let lec = snapshot.rows().find(|row| row.driver == "LEC").unwrap();
    assert_eq!(lec.positions_gained, 2);
    assert_eq!(lec.final_points, 18.0);
    assert_eq!(lec.team.as_deref(), Some("Ferrari"));
    // Speed varies by lap; the max inside the window wins, 350 outside never does
    assert_eq!(lec.top_speed_st, 322.0);
    // Pit-out lap of the second stint is excluded
    assert_eq!(lec.valid_laps, 11);
    assert!(lec.avg_degradation > 0.0);
}

#[test]
fn test_failed_extraction_is_not_committed() {
    let dir = workspace();
    let feed = FakeFeed::default();
    feed.publish(grid(r(1), 0.0));

    // No speed trap window for this circuit
    let mut unknown = grid(r(2), 0.0);
    unknown.circuit = "nowhere".to_string();
    feed.publish(unknown);

    // Every driver below the valid lap threshold
    let mut sparse = grid(r(3), 0.0);
    sparse.laps.retain(|lap| lap.lap_number <= 2);
    feed.publish(sparse);

    let report = run(dir.path(), &feed, &[r(1), r(2), r(3)]);
    assert_eq!(report.processed, vec![r(1)]);
    assert_eq!(report.failures.len(), 2);
    assert_eq!(
        report.failures_by_kind().get(&ErrorKind::ExtractionFailed),
        Some(&2)
    );

    let store = open_store(dir.path());
    assert_eq!(store.processed_races(), &BTreeSet::from([r(1)]));
    assert_eq!(store.row_count(), 4);
}

#[test]
fn test_driver_without_enough_laps_is_left_out() {
    let dir = workspace();
    let feed = FakeFeed::default();
    let mut payload = grid(r(1), 0.0);
    payload
        .laps
        .retain(|lap| lap.driver != "HAM" || lap.lap_number <= 2);
    feed.publish(payload);

    let report = run(dir.path(), &feed, &[r(1)]);
    assert_eq!(report.rows_appended, 3);
    assert_eq!(report.drivers_dropped, 1);

    let snapshot = snapshot(dir.path());
    assert!(snapshot.rows().all(|row| row.driver != "HAM"));
    assert!(snapshot.rows().all(|row| row.valid_laps >= 3));
}

#[test]
fn test_out_of_order_rounds() {
    let dir = workspace();
    let feed = FakeFeed::default();
    feed.publish(grid(r(3), 0.02));

    let first = run(dir.path(), &feed, &[r(2), r(3)]);
    assert_eq!(first.processed, vec![r(3)]);
    assert_eq!(first.failures_by_kind().get(&ErrorKind::SourceUnavailable), Some(&1));

    // Round 2 published late
    feed.publish(grid(r(2), 0.01));
    let second = run(dir.path(), &feed, &[r(2), r(3)]);
    assert_eq!(second.processed, vec![r(2)]);
    assert_eq!(second.skipped, 1);

    let snapshot = snapshot(dir.path());
    assert_eq!(snapshot.races(), BTreeSet::from([r(2), r(3)]));
    for race in [r(2), r(3)] {
        assert_eq!(snapshot.rows().filter(|row| row.race == race).count(), 4);
    }
}

#[test]
fn test_cancelled_race_is_recorded_once() {
    let dir = workspace();
    let feed = FakeFeed::default();
    feed.cancel(r(6));

    let first = run(dir.path(), &feed, &[r(6)]);
    assert_eq!(first.not_applicable, vec![r(6)]);
    assert!(first.is_clean());

    let second = run(dir.path(), &feed, &[r(6)]);
    assert_eq!(second.skipped, 1);
    assert_eq!(feed.calls(), vec![r(6)]);

    let snapshot = snapshot(dir.path());
    assert_eq!(snapshot.batches()[0].status, BatchStatus::NotApplicable);
    assert!(snapshot.is_empty());
}

#[test]
fn test_cached_race_is_not_fetched() {
    let dir = workspace();
    {
        let mut cache = SessionCache::open(dir.path().join("cache")).unwrap();
        cache.put(r(1), &grid(r(1), 0.0)).unwrap();
    }
    let feed = FakeFeed::default();

    let report = run(dir.path(), &feed, &[r(1)]);
    assert_eq!(report.processed, vec![r(1)]);
    assert!(feed.calls().is_empty());
}

#[test]
fn test_refresh_cache_fetches_again() {
    let dir = workspace();
    {
        let mut cache = SessionCache::open(dir.path().join("cache")).unwrap();
        let mut stale = grid(r(1), 0.0);
        stale.circuit = "nowhere".to_string();
        cache.put(r(1), &stale).unwrap();
    }
    let feed = FakeFeed::default();
    feed.publish(grid(r(1), 0.0));

    let report = run_with_options(
        dir.path(),
        &feed,
        &[r(1)],
        UpdateOptions {
            refresh_cache: true,
        },
    );
    assert_eq!(report.processed, vec![r(1)]);
    assert_eq!(feed.calls(), vec![r(1)]);

    let cache = SessionCache::open(dir.path().join("cache")).unwrap();
    assert_eq!(cache.get(r(1)).unwrap().circuit, CIRCUIT);
}

#[test]
fn test_payload_for_wrong_race_is_rejected() {
    let dir = workspace();
    let feed = FakeFeed::default();
    let mut payload = grid(r(4), 0.0);
    payload.race = r(5);
    feed.state
        .borrow_mut()
        .answers
        .insert(r(4), Answer::Session(payload));

    let report = run(dir.path(), &feed, &[r(4)]);
    assert!(report.processed.is_empty());
    assert_eq!(report.failures[0].kind, ErrorKind::SourceUnavailable);
    assert!(snapshot(dir.path()).races().is_empty());
    let cache = SessionCache::open(dir.path().join("cache")).unwrap();
    assert!(!cache.has(r(4)));

    // Feed corrected before the next run
    feed.publish(grid(r(4), 0.0));
    let second = run(dir.path(), &feed, &[r(4)]);
    assert_eq!(second.processed, vec![r(4)]);
    assert!(second.is_clean());
    assert_eq!(feed.calls(), vec![r(4), r(4)]);
}

#[test]
fn test_index_drift_is_fatal() {
    let dir = workspace();
    let race = r(1);
    let rows = {
        let feed = FakeFeed::default();
        feed.publish(grid(race, 0.0));
        run(dir.path(), &feed, &[race]);
        snapshot(dir.path()).rows().cloned().collect::<Vec<_>>()
    };

    let mut store = open_store(dir.path());
    let err = store.append_race(race, rows).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DuplicateRace);

    // A second writer is stopped by the lock
    let dataset = dir.path().join("dataset");
    assert!(matches!(
        DatasetStore::open(&dataset),
        Err(DatasetError::Locked(_))
    ));
    drop(store);

    // A duplicate that reaches the ledger anyway is refused on open
    let ledger = std::fs::read_to_string(dataset.join("ledger.jsonl")).unwrap();
    std::fs::write(dataset.join("ledger.jsonl"), format!("{}{}", ledger, ledger)).unwrap();
    assert!(matches!(
        DatasetStore::open(&dataset),
        Err(DatasetError::DuplicateRace(dup)) if dup == race
    ));
    assert!(matches!(
        DatasetStore::read_snapshot(&dataset),
        Err(DatasetError::DuplicateRace(_))
    ));
}

#[test]
fn test_readers_do_not_block_or_touch_a_run() {
    let dir = workspace();
    let feed = FakeFeed::default();
    feed.publish(grid(r(1), 0.0));
    run(dir.path(), &feed, &[r(1)]);

    let ledger = dir.path().join("dataset").join("ledger.jsonl");
    let writer = open_store(dir.path());
    let before = std::fs::read(&ledger).unwrap();

    let view = snapshot(dir.path());
    assert_eq!(view.races(), BTreeSet::from([r(1)]));
    assert_eq!(std::fs::read(&ledger).unwrap(), before);
    drop(writer);
}

#[cfg(target_os = "linux")]
#[test]
fn test_interrupted_run_leaves_resumable_state() {
    let dir = workspace();
    let feed = FakeFeed::default();
    feed.publish(grid(r(1), 0.0));
    feed.publish(grid(r(2), 0.01));
    run(dir.path(), &feed, &[r(1)]);

    // Lock left by a run that was killed; no such process exists
    let lock = dir.path().join("dataset").join(".run.lock");
    std::fs::write(&lock, "4294967295\n").unwrap();

    let report = run(dir.path(), &feed, &[r(1), r(2)]);
    assert_eq!(report.processed, vec![r(2)]);
    assert_eq!(report.skipped, 1);
    assert!(!lock.exists());
}

#[test]
fn test_fit_on_snapshot_is_deterministic() {
    let dir = workspace();
    let feed = FakeFeed::default();
    feed.publish(grid(r(1), 0.0));
    feed.publish(grid(r(2), 0.015));
    run(dir.path(), &feed, &[r(1), r(2)]);

    let snapshot = snapshot(dir.path());
    let fitter = AttributionFitter::new(FitConfig::default());
    let filter = DatasetFilter::default();

    let a = fitter.fit(&snapshot, &filter).unwrap();
    let b = fitter.fit(&snapshot, &filter).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.n_rows, 8);

    // One team has only two rows
    let team = DatasetFilter {
        season: Some(2024),
        team: Some("Ferrari".to_string()),
    };
    let err = fitter.fit(&snapshot, &team).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientData);
}
