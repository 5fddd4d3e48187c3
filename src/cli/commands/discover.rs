//! Discover command: converge listings and write candidate addresses.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use console::style;
use tokio::sync::mpsc;

use super::EXIT_CANCELLED;
use crate::cli::helpers::{cancel_on_ctrl_c, cli_path, spawn_event_handler};
use crate::cli::progress::WorkerProgress;
use crate::config::HarvestConfig;
use crate::pipeline::{write_candidates, DiscoveryReport, HarvestPipeline};
use crate::source::factory::SourceFactory;

pub async fn cmd_discover(
    config: &HarvestConfig,
    listings: Vec<String>,
    output: Option<&Path>,
    show_progress: bool,
) -> anyhow::Result<i32> {
    let (report, output) = discover(config, listings, output, show_progress).await?;
    if report.cancelled {
        return Ok(EXIT_CANCELLED);
    }
    if report.items.is_empty() {
        println!("{} No items discovered", style("!").yellow());
        return Ok(super::EXIT_INCOMPLETE);
    }
    println!(
        "{} Wrote {} candidates to {}",
        style("✓").green(),
        report.items.len(),
        output.display()
    );
    Ok(0)
}

/// Run discovery and write the candidate file. Shared with `crawl`.
pub(super) async fn discover(
    config: &HarvestConfig,
    listings: Vec<String>,
    output: Option<&Path>,
    show_progress: bool,
) -> anyhow::Result<(DiscoveryReport, PathBuf)> {
    let listings = if listings.is_empty() {
        config.discovery.expanded_listings()
    } else {
        let mut discovery = config.discovery.clone();
        discovery.listings = listings;
        discovery.expanded_listings()
    };
    if listings.is_empty() {
        anyhow::bail!("No listings given. Pass addresses or set discovery.listings in the config.");
    }
    let output = match output {
        Some(path) => cli_path(path),
        None => config.resolve_path(&config.discovery.output),
    };

    println!(
        "{} Discovering items from {} listings with {} workers",
        style("→").cyan(),
        listings.len(),
        config.pool.workers
    );

    let cancel = cancel_on_ctrl_c();
    let (tx, rx) = mpsc::channel(100);
    let progress = show_progress.then(|| {
        Arc::new(WorkerProgress::new(
            config.pool.workers,
            listings.len() as u64,
            "Listings",
        ))
    });
    let handler = spawn_event_handler(progress, rx);

    let factory = Arc::new(SourceFactory::from_config(config));
    let pipeline = HarvestPipeline::new(factory, config, cancel)?.with_events(tx);
    let result = pipeline.discover(listings).await;
    drop(pipeline);
    let _ = handler.await;
    let report = result?;

    print_report(&report);

    if !report.items.is_empty() || report.failed.is_empty() {
        write_candidates(&output, &report.items)
            .with_context(|| format!("Failed to write {}", output.display()))?;
    }
    Ok((report, output))
}

fn print_report(report: &DiscoveryReport) {
    println!(
        "{} {} listings: {} items, {} converged, {} timed out, {} hit the iteration cap",
        style("✓").green(),
        report.listings,
        report.items.len(),
        report.converged,
        report.timed_out,
        report.capped
    );
    if report.probe_misses > 0 {
        println!(
            "  {} progress signal missing {} times; convergence relied on stalls",
            style("!").yellow(),
            report.probe_misses
        );
    }
    if report.empty_extractions > 0 {
        println!(
            "  {} {} listings yielded no items; check discovery.item_selector",
            style("!").yellow(),
            report.empty_extractions
        );
    }
    for failure in &report.failed {
        println!(
            "  {} {} ({} attempts): {}",
            style("✗").red(),
            failure.address,
            failure.attempts,
            failure.error
        );
    }
    if report.cancelled {
        println!(
            "  {} Interrupted; {} listings not processed",
            style("!").yellow(),
            report.not_processed
        );
    }
}
