//! Operator command surface for A/B test statistics.
//!
//! - [`run_cli`] for full parsed CLI execution against the `--db` path.
//! - [`run_command`] for direct command execution against an existing
//!   [`SqliteStatsStore`], for embedding and tests.

use std::path::PathBuf;

use abtrack_core::export::{export_csv, export_filename, export_json};
use abtrack_core::{
    conversion_rate, format_rfc3339, now_utc, rate_style, summarize_by_test, EventKind, RateStyle,
    TestVariantCounter, TrackingEvent,
};
use abtrack_store_sqlite::SqliteStatsStore;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use time::OffsetDateTime;

#[derive(Debug, Parser)]
#[command(name = "abt")]
#[command(about = "A/B test tracking and statistics CLI")]
pub struct Cli {
    #[arg(long, default_value = "./abtrack.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Track {
        #[command(subcommand)]
        command: Box<TrackCommand>,
    },
    Stats {
        #[command(subcommand)]
        command: Box<StatsCommand>,
    },
    Export {
        #[command(subcommand)]
        command: Box<ExportCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum TrackCommand {
    View(TrackArgs),
    Conversion(TrackArgs),
}

#[derive(Debug, Args)]
pub struct TrackArgs {
    #[arg(long)]
    test_name: String,
    #[arg(long)]
    variant: String,
}

#[derive(Debug, Subcommand)]
pub enum StatsCommand {
    List(StatsListArgs),
}

#[derive(Debug, Args)]
pub struct StatsListArgs {
    #[arg(long)]
    test_name: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ExportCommand {
    Csv(ExportArgs),
    Json(ExportArgs),
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long)]
    output: Option<PathBuf>,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let store = SqliteStatsStore::open(&cli.db)?;
    store.migrate()?;
    run_command(cli.command, &store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when validation, persistence, or filesystem operations
/// fail.
pub fn run_command(command: Command, store: &SqliteStatsStore) -> Result<()> {
    match command {
        Command::Track { command } => run_track(*command, store),
        Command::Stats { command } => run_stats(*command, store),
        Command::Export { command } => run_export(*command, store),
    }
}

fn run_track(command: TrackCommand, store: &SqliteStatsStore) -> Result<()> {
    let (args, kind) = match command {
        TrackCommand::View(args) => (args, EventKind::View),
        TrackCommand::Conversion(args) => (args, EventKind::Conversion),
    };

    let event = TrackingEvent {
        test_name: args.test_name,
        variant: args.variant,
        kind,
    }
    .normalized()?;

    store.record(&event)?;
    println!("{}", serde_json::to_string_pretty(&event)?);
    Ok(())
}

fn run_stats(command: StatsCommand, store: &SqliteStatsStore) -> Result<()> {
    match command {
        StatsCommand::List(args) => {
            let counters = match args.test_name.as_deref() {
                Some(test_name) => store.list_for_test(test_name)?,
                None => store.list_all()?,
            };

            if args.json {
                let document = export_json(&counters, now_utc())?;
                println!("{}", serde_json::to_string_pretty(&document)?);
            } else {
                print_stats_table(&counters)?;
            }
            Ok(())
        }
    }
}

fn run_export(command: ExportCommand, store: &SqliteStatsStore) -> Result<()> {
    let counters = store.list_all()?;
    let exported_at = now_utc();

    let (bytes, path) = match command {
        ExportCommand::Csv(args) => {
            let bytes = export_csv(&counters)?;
            (bytes, output_path(args.output, "csv", exported_at)?)
        }
        ExportCommand::Json(args) => {
            let document = export_json(&counters, exported_at)?;
            let mut bytes = serde_json::to_vec_pretty(&document)?;
            bytes.push(b'\n');
            (bytes, output_path(args.output, "json", exported_at)?)
        }
    };

    std::fs::write(&path, bytes)
        .with_context(|| format!("failed writing export to {}", path.display()))?;
    println!("{}", path.display());
    Ok(())
}

fn output_path(
    output: Option<PathBuf>,
    extension: &str,
    at: OffsetDateTime,
) -> Result<PathBuf> {
    match output {
        Some(path) => Ok(path),
        None => Ok(PathBuf::from(export_filename(extension, at)?)),
    }
}

fn print_stats_table(counters: &[TestVariantCounter]) -> Result<()> {
    if counters.is_empty() {
        println!("No A/B test data recorded yet.");
        return Ok(());
    }

    let summaries = summarize_by_test(counters);
    let mut grand_views = 0_u64;
    let mut grand_conversions = 0_u64;

    for summary in &summaries {
        println!("{}", summary.test_name);
        println!(
            "{:<20} {:>10} {:>12} {:>10} {}",
            "variant", "views", "conversions", "rate", "updated_at"
        );
        println!("{}", "-".repeat(80));

        for counter in &summary.counters {
            println!(
                "{:<20} {:>10} {:>12} {:>10} {}",
                counter.variant,
                counter.views,
                counter.conversions,
                rate_cell(counter.conversion_rate()),
                format_rfc3339(counter.updated_at)?,
            );
        }

        println!(
            "{:<20} {:>10} {:>12} {:>10}",
            "total",
            summary.totals.views,
            summary.totals.conversions,
            rate_cell(summary.totals.conversion_rate)
        );
        println!();

        grand_views += summary.totals.views;
        grand_conversions += summary.totals.conversions;
    }

    println!(
        "{:<20} {:>10} {:>12} {:>10}",
        "all tests",
        grand_views,
        grand_conversions,
        rate_cell(conversion_rate(grand_conversions, grand_views))
    );
    Ok(())
}

/// Rate cell text: zero rates stay neutral, positive rates get highlighted.
fn rate_cell(rate: f64) -> String {
    match rate_style(rate) {
        RateStyle::Neutral => format!("{rate}%"),
        RateStyle::Positive => format!("\x1b[32m{rate}%\x1b[0m"),
    }
}
