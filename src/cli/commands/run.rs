//! Run and crawl commands: harvest details into the checkpoint.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use console::style;
use tokio::sync::mpsc;

use super::{checkpoint_path, discover, EXIT_CANCELLED, EXIT_INCOMPLETE};
use crate::checkpoint::CheckpointStore;
use crate::cli::helpers::{cancel_on_ctrl_c, cli_path, spawn_event_handler};
use crate::cli::progress::WorkerProgress;
use crate::config::HarvestConfig;
use crate::pipeline::{read_candidates, HarvestOptions, HarvestPipeline, HarvestReport};
use crate::source::factory::SourceFactory;

/// Harvest every candidate listed in `input`.
pub async fn cmd_run(
    config: &HarvestConfig,
    input: &Path,
    checkpoint: Option<&Path>,
    options: HarvestOptions,
    show_progress: bool,
) -> anyhow::Result<i32> {
    let input = cli_path(input);
    let candidates = read_candidates(&input)
        .with_context(|| format!("Failed to read candidates from {}", input.display()))?;
    harvest(config, &candidates, checkpoint, options, show_progress).await
}

/// Discover listings, then harvest what was found.
pub async fn cmd_crawl(
    config: &HarvestConfig,
    listings: Vec<String>,
    output: Option<&Path>,
    checkpoint: Option<&Path>,
    options: HarvestOptions,
    show_progress: bool,
) -> anyhow::Result<i32> {
    let (report, _) = discover::discover(config, listings, output, show_progress).await?;
    if report.cancelled {
        return Ok(EXIT_CANCELLED);
    }
    let candidates: Vec<String> = report.items.into_iter().map(|item| item.payload).collect();
    if candidates.is_empty() {
        println!("{} Nothing to harvest", style("!").yellow());
        return Ok(EXIT_INCOMPLETE);
    }
    harvest(config, &candidates, checkpoint, options, show_progress).await
}

async fn harvest(
    config: &HarvestConfig,
    candidates: &[String],
    checkpoint: Option<&Path>,
    options: HarvestOptions,
    show_progress: bool,
) -> anyhow::Result<i32> {
    let path = checkpoint_path(config, checkpoint);
    let store = Arc::new(
        CheckpointStore::open(&path, config.schema())
            .with_context(|| format!("Failed to open checkpoint {}", path.display()))?,
    );

    println!(
        "{} Harvesting {} candidates with {} workers (checkpoint: {})",
        style("→").cyan(),
        candidates.len(),
        config.pool.workers,
        path.display()
    );

    let cancel = cancel_on_ctrl_c();
    let (tx, rx) = mpsc::channel(100);
    let progress = show_progress.then(|| {
        Arc::new(WorkerProgress::new(
            config.pool.workers,
            candidates.len() as u64,
            "Items",
        ))
    });
    let handler = spawn_event_handler(progress, rx);

    let factory = Arc::new(SourceFactory::from_config(config));
    let pipeline = HarvestPipeline::new(factory, config, cancel)?.with_events(tx);
    let result = pipeline.harvest(store, candidates, options).await;
    drop(pipeline);
    let _ = handler.await;
    let report = result?;

    print_report(&report);
    Ok(exit_code(&report))
}

fn exit_code(report: &HarvestReport) -> i32 {
    if report.cancelled {
        EXIT_CANCELLED
    } else if report.is_success() {
        0
    } else {
        EXIT_INCOMPLETE
    }
}

fn print_report(report: &HarvestReport) {
    println!(
        "{} {} candidates: {} already complete, {} completed, {} failed",
        if report.is_success() {
            style("✓").green()
        } else {
            style("!").yellow()
        },
        report.total,
        report.already_complete,
        report.completed,
        report.failed.len()
    );
    for failure in &report.failed {
        println!(
            "  {} {} [{}] after {} attempts: {}",
            style("✗").red(),
            failure.id,
            failure.kind.as_str(),
            failure.attempts,
            failure.reason
        );
    }
    if report.cancelled {
        println!(
            "  {} Interrupted; {} candidates not processed. Run again to resume.",
            style("!").yellow(),
            report.not_processed
        );
    }
}
