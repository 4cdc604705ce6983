//! F1 Analyzer CLI - Command-line interface for the race feature pipeline

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use f1_analyzer::config::PipelineConfig;
use f1_analyzer::core::{AttributionFitter, SeasonSummary};
use f1_analyzer::data::{
    BatchStatus, DatasetFilter, DatasetStore, FeatureExtractor, MasterDataset, RaceCalendar,
    SessionCache,
};
use f1_analyzer::pipeline::{IncrementalUpdater, RaceStatus, RunReport, UpdateOptions};
use f1_analyzer::source::{DirectorySource, TelemetrySource};

#[cfg(feature = "http")]
use f1_analyzer::source::FeedClient;

const DEFAULT_CALENDAR: &str = "data/calendar.csv";

#[derive(Parser)]
#[command(name = "f1-analyzer")]
#[command(author, version, about = "F1 race feature pipeline CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Pipeline config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the session cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Override the master dataset directory
    #[arg(long)]
    dataset_dir: Option<PathBuf>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every finished race not yet in the dataset
    Update {
        /// Race calendar CSV
        #[arg(long, default_value = DEFAULT_CALENDAR)]
        calendar: PathBuf,

        /// Read feed documents from a directory instead of the HTTP feed
        #[arg(long)]
        feed_dir: Option<PathBuf>,

        /// Fetch races again even when cached
        #[arg(long)]
        refresh_cache: bool,

        /// Treat this date as today (YYYY-MM-DD)
        #[arg(long)]
        today: Option<NaiveDate>,
    },

    /// Show processed races and cache contents
    Status,

    /// Fit the points attribution model
    Fit {
        /// Only rows of this season
        #[arg(long)]
        season: Option<u16>,

        /// Only rows of this team
        #[arg(long)]
        team: Option<String>,
    },

    /// Season snapshot: leaders and team speed ranking
    Summary {
        #[arg(long)]
        season: u16,

        #[arg(long)]
        team: Option<String>,
    },

    /// Export the master dataset as CSV
    Export {
        #[arg(short, long)]
        output: PathBuf,

        /// Only races of this season
        #[arg(long)]
        season: Option<u16>,
    },

    /// Race calendar maintenance
    Calendar {
        #[command(subcommand)]
        action: CalendarAction,
    },

    /// Delete the master dataset and rebuild it from cached sessions
    Rebuild {
        #[arg(long, default_value = DEFAULT_CALENDAR)]
        calendar: PathBuf,

        /// Read missing sessions from a directory instead of the HTTP feed
        #[arg(long)]
        feed_dir: Option<PathBuf>,

        #[arg(long)]
        today: Option<NaiveDate>,

        /// Confirm deletion of the current dataset
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum CalendarAction {
    /// Download a season schedule into the calendar CSV (requires http feature)
    Pull {
        #[arg(long)]
        season: u16,

        #[arg(short, long, default_value = DEFAULT_CALENDAR)]
        output: PathBuf,
    },

    /// List the races due for processing
    Show {
        #[arg(long, default_value = DEFAULT_CALENDAR)]
        calendar: PathBuf,

        #[arg(long)]
        today: Option<NaiveDate>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = load_config(&cli)?;

    println!("{}", format!("F1 Analyzer v{}", env!("CARGO_PKG_VERSION")).cyan().bold());
    println!();

    match cli.command {
        Commands::Update {
            calendar,
            feed_dir,
            refresh_cache,
            today,
        } => {
            run_update(&config, &calendar, feed_dir.as_deref(), refresh_cache, today, false)?;
        }
        Commands::Status => show_status(&config)?,
        Commands::Fit { season, team } => run_fit(&config, DatasetFilter { season, team })?,
        Commands::Summary { season, team } => show_summary(
            &config,
            DatasetFilter {
                season: Some(season),
                team,
            },
        )?,
        Commands::Export { output, season } => run_export(&config, &output, season)?,
        Commands::Calendar { action } => match action {
            CalendarAction::Pull { season, output } => pull_calendar(&config, season, &output)?,
            CalendarAction::Show { calendar, today } => show_calendar(&config, &calendar, today)?,
        },
        Commands::Rebuild {
            calendar,
            feed_dir,
            today,
            yes,
        } => {
            if !yes {
                anyhow::bail!(
                    "Rebuild deletes the master dataset in {:?}; pass --yes to confirm",
                    config.dataset_dir
                );
            }
            run_update(&config, &calendar, feed_dir.as_deref(), false, today, true)?;
        }
    }

    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &cli.cache_dir {
        config.cache_dir = dir.clone();
    }
    if let Some(dir) = &cli.dataset_dir {
        config.dataset_dir = dir.clone();
    }
    Ok(config)
}

fn build_source(config: &PipelineConfig, feed_dir: Option<&Path>) -> Result<Box<dyn TelemetrySource>> {
    if let Some(dir) = feed_dir {
        return Ok(Box::new(DirectorySource::new(dir)));
    }

    #[cfg(feature = "http")]
    {
        let client = FeedClient::new(config.source.clone()).context("Failed to create feed client")?;
        Ok(Box::new(client))
    }

    #[cfg(not(feature = "http"))]
    {
        let _ = config;
        anyhow::bail!("Built without the http feature; pass --feed-dir")
    }
}

fn run_update(
    config: &PipelineConfig,
    calendar_path: &Path,
    feed_dir: Option<&Path>,
    refresh_cache: bool,
    today: Option<NaiveDate>,
    rebuild: bool,
) -> Result<()> {
    let calendar = RaceCalendar::load(calendar_path)
        .with_context(|| format!("Failed to load calendar {:?}", calendar_path))?;
    let today = today.unwrap_or_else(|| Local::now().date_naive());
    let candidates = calendar.due(today);

    let store = if rebuild {
        println!("{}: {:?}", "Rebuilding".yellow(), config.dataset_dir);
        DatasetStore::rebuild(&config.dataset_dir)
    } else {
        DatasetStore::open(&config.dataset_dir)
    }
    .with_context(|| format!("Failed to open dataset {:?}", config.dataset_dir))?;

    let cache = SessionCache::open(&config.cache_dir)
        .with_context(|| format!("Failed to open cache {:?}", config.cache_dir))?;
    let source = build_source(config, feed_dir)?;

    let mut updater = IncrementalUpdater::new(
        source,
        cache,
        store,
        FeatureExtractor::new(config.extraction.clone()),
    )
    .with_options(UpdateOptions { refresh_cache });

    let pending = updater.pending(&candidates);
    println!(
        "{}: {} races due, {} pending",
        "Updating".green(),
        candidates.len(),
        pending.len()
    );

    let pb = ProgressBar::new(pending.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("Invalid progress template")?
            .progress_chars("#>-"),
    );

    let report = updater.run_with(&candidates, |race, status| {
        match status {
            RaceStatus::Processed { rows, .. } => {
                pb.set_message(format!("{}: {} rows", race, rows));
            }
            RaceStatus::NotApplicable { reason } => {
                pb.println(format!("{} {}: {}", "Skipped".yellow(), race, reason));
            }
            RaceStatus::Failed(failure) => {
                pb.println(format!(
                    "{} {} [{}]: {}",
                    "Warning".yellow(),
                    race,
                    failure.kind,
                    failure.message
                ));
            }
        }
        pb.inc(1);
    });
    pb.finish_and_clear();

    let report = report.context("Update run aborted")?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    println!();
    println!("{}", "Run Report".yellow().bold());
    println!("{}", "-".repeat(40));
    println!("  Newly processed:  {}", report.processed.len());
    println!("  Rows appended:    {}", report.rows_appended);
    println!("  Drivers dropped:  {}", report.drivers_dropped);
    println!("  Already present:  {}", report.skipped);
    println!("  Not applicable:   {}", report.not_applicable.len());
    println!("  Failed:           {}", report.failures.len());
    for (kind, count) in report.failures_by_kind() {
        println!("    {:<30} {}", kind.to_string(), count);
    }

    if report.is_clean() {
        println!("\n{}", "Complete".green());
    } else {
        println!("\n{}: failed races will be retried next run", "Complete".yellow());
    }
}

fn open_snapshot(config: &PipelineConfig) -> Result<MasterDataset> {
    DatasetStore::read_snapshot(&config.dataset_dir)
        .with_context(|| format!("Failed to read dataset {:?}", config.dataset_dir))
}

fn show_status(config: &PipelineConfig) -> Result<()> {
    let snapshot = open_snapshot(config)?;
    let cache = SessionCache::open(&config.cache_dir)
        .with_context(|| format!("Failed to open cache {:?}", config.cache_dir))?;

    println!("{}", "Master Dataset".yellow().bold());
    println!("{}", "-".repeat(40));
    println!("  Directory:  {:?}", config.dataset_dir);
    println!("  Races:      {}", snapshot.races().len());
    println!("  Rows:       {}", snapshot.len());
    println!("  Cached:     {}", cache.len());
    println!();

    let mut by_season: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    for batch in snapshot.batches() {
        let label = match batch.status {
            BatchStatus::Scored => format!("R{:02}", batch.race.round),
            BatchStatus::NotApplicable => format!("R{:02}*", batch.race.round),
        };
        by_season.entry(batch.race.season).or_default().push(label);
    }

    for (season, mut rounds) in by_season {
        rounds.sort();
        println!("  {}: {}", season.to_string().cyan(), rounds.join(" "));
    }
    if snapshot
        .batches()
        .iter()
        .any(|b| b.status == BatchStatus::NotApplicable)
    {
        println!("\n  * recorded with no data");
    }

    Ok(())
}

fn run_fit(config: &PipelineConfig, filter: DatasetFilter) -> Result<()> {
    let snapshot = open_snapshot(config)?;
    let model = AttributionFitter::new(config.fit.clone())
        .fit(&snapshot, &filter)
        .context("Attribution fit failed")?;

    println!("{}", "Points Attribution".yellow().bold());
    if let Some(season) = filter.season {
        println!("  Season: {}", season);
    }
    if let Some(team) = &filter.team {
        println!("  Team:   {}", team);
    }
    println!("{}", "-".repeat(56));
    println!(
        "  {:<18} {:>12} {:>12} {:>10}",
        "Predictor", "Std. coef", "Per unit", "Std dev"
    );

    for c in model.ranked() {
        let coef = format!("{:>12.3}", c.standardized);
        let coef = if c.standardized >= 0.0 {
            coef.green()
        } else {
            coef.red()
        };
        println!(
            "  {:<18} {} {:>12.4} {:>10.4}",
            c.predictor,
            coef,
            c.raw(),
            c.std
        );
    }

    println!("{}", "-".repeat(56));
    println!("  Intercept:  {:.3}", model.intercept);
    match model.r_squared {
        Some(r2) => println!("  R²:         {:.3}", r2),
        None => println!("  R²:         n/a (constant points)"),
    }
    println!("  Rows:       {}", model.n_rows);

    Ok(())
}

fn show_summary(config: &PipelineConfig, filter: DatasetFilter) -> Result<()> {
    let snapshot = open_snapshot(config)?;
    let summary = SeasonSummary::from_rows(snapshot.filtered(&filter));

    let season = filter.season.unwrap_or_default();
    if summary.is_empty() {
        println!("No rows for season {}", season);
        return Ok(());
    }

    println!("{}", format!("Season {} Summary", season).yellow().bold());
    println!("{}", "-".repeat(40));
    if let Some(d) = summary.points_leader() {
        println!("  Points leader:    {} ({:.0} pts)", d.driver.green(), d.total_points);
    }
    if let Some(d) = summary.most_consistent() {
        println!("  Most consistent:  {} ({:.3}s std)", d.driver.green(), d.avg_consistency);
    }
    if let Some(d) = summary.best_starter() {
        println!(
            "  Best starter:     {} ({:+.1} positions avg)",
            d.driver.green(),
            d.avg_positions_gained
        );
    }

    if !summary.team_top_speed.is_empty() {
        println!();
        println!("{}", "Team Speed Trap (avg km/h)".yellow().bold());
        for (i, t) in summary.team_top_speed.iter().enumerate() {
            println!("  {:2}. {:<24} {:.1}", i + 1, t.team, t.avg_top_speed);
        }
    }

    Ok(())
}

fn run_export(config: &PipelineConfig, output: &Path, season: Option<u16>) -> Result<()> {
    let snapshot = open_snapshot(config)?;
    let dataset = match season {
        Some(s) => MasterDataset::from_batches(
            snapshot
                .batches()
                .iter()
                .filter(|b| b.race.season == s)
                .cloned()
                .collect(),
        ),
        None => snapshot,
    };

    let rows = dataset
        .write_csv(output)
        .with_context(|| format!("Failed to export to {:?}", output))?;
    println!("{}: {} rows to {:?}", "Exported".green(), rows, output);
    Ok(())
}

#[cfg(feature = "http")]
fn pull_calendar(config: &PipelineConfig, season: u16, output: &Path) -> Result<()> {
    println!("{}: {} schedule", "Pulling".green(), season);

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .context("Invalid progress template")?,
    );
    pb.set_message(format!("Fetching {} schedule...", season));

    let client = FeedClient::new(config.source.clone()).context("Failed to create feed client")?;
    let events = client.fetch_schedule(season);
    pb.finish_and_clear();
    let events = events.with_context(|| format!("Failed to fetch {} schedule", season))?;

    let mut calendar = if output.exists() {
        RaceCalendar::load(output).with_context(|| format!("Failed to load {:?}", output))?
    } else {
        RaceCalendar::default()
    };
    let count = events.len();
    calendar.replace_season(season, events);
    calendar
        .write_csv(output)
        .with_context(|| format!("Failed to write {:?}", output))?;

    println!("{}: {} events for {} in {:?}", "Saved".green(), count, season, output);
    Ok(())
}

#[cfg(not(feature = "http"))]
fn pull_calendar(_config: &PipelineConfig, _season: u16, _output: &Path) -> Result<()> {
    anyhow::bail!("Calendar pull requires the http feature")
}

fn show_calendar(config: &PipelineConfig, calendar_path: &Path, today: Option<NaiveDate>) -> Result<()> {
    let calendar = RaceCalendar::load(calendar_path)
        .with_context(|| format!("Failed to load calendar {:?}", calendar_path))?;
    let processed = open_snapshot(config)?.races();
    let today = today.unwrap_or_else(|| Local::now().date_naive());
    let due = calendar.due(today);

    println!("{}", "Races Due".yellow().bold());
    println!("{}", "-".repeat(56));
    for race in due {
        let Some(event) = calendar.get(race) else {
            continue;
        };
        let mark = if processed.contains(&race) {
            "done".green()
        } else {
            "pending".yellow()
        };
        println!(
            "  {}  {}  {:<30} {}",
            race,
            event.event_date,
            truncate_name(&event.event_name, 30),
            mark
        );
    }
    Ok(())
}

fn truncate_name(name: &str, max_len: usize) -> String {
    if name.chars().count() <= max_len {
        name.to_string()
    } else {
        let cut: String = name.chars().take(max_len.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
