#![forbid(unsafe_code)]

//! Runs a single materialization batch. Meant to be driven by cron; the
//! caller must not start overlapping runs against the same database.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ytsearch_tools::config::{SettingsOverrides, resolve_settings};
use ytsearch_tools::pipeline::{Pipeline, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "materialize", about = "Materialize one batch of search blocks into records")]
struct MaterializeArgs {
    /// Database file
    #[arg(long)]
    db: Option<PathBuf>,

    /// Thumbnail directory
    #[arg(long)]
    thumbnails: Option<PathBuf>,

    /// Source records handled per run
    #[arg(long)]
    batch_size: Option<u64>,

    /// Alternative .env file
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Print the batch report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = MaterializeArgs::parse();

    let settings = resolve_settings(SettingsOverrides {
        db_path: args.db,
        thumbnails_dir: args.thumbnails,
        batch_size: args.batch_size,
        env_path: args.env_file,
        ..SettingsOverrides::default()
    })?;
    let pipeline = Pipeline::open(&settings).await?;
    let report = pipeline
        .job
        .run_batch()
        .await
        .context("running materialization batch")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "Visited {} of {} eligible source record(s) from offset {}.",
        report.visited.len(),
        report.eligible,
        report.cursor
    );
    println!(
        "Created {}, kept {}, deleted {} record(s); {} thumbnail(s) saved.",
        report.created, report.kept, report.deleted, report.thumbnails
    );
    if report.failed_specs > 0 || report.failed_sources > 0 {
        println!(
            "{} search block(s) and {} source record(s) failed; see the log for details.",
            report.failed_specs, report.failed_sources
        );
    }
    Ok(())
}
