//! Assets command: download list-field assets for complete records.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use console::style;
use tokio::sync::mpsc;

use super::{checkpoint_path, EXIT_CANCELLED, EXIT_INCOMPLETE};
use crate::assets::{AssetFetcher, HttpSessionFactory};
use crate::checkpoint::CheckpointStore;
use crate::cli::helpers::{cancel_on_ctrl_c, spawn_event_handler};
use crate::cli::progress::WorkerProgress;
use crate::config::HarvestConfig;

pub async fn cmd_assets(
    config: &HarvestConfig,
    checkpoint: Option<&Path>,
    show_progress: bool,
) -> anyhow::Result<i32> {
    let path = checkpoint_path(config, checkpoint);
    if !path.exists() {
        anyhow::bail!("Checkpoint {} does not exist. Run 'harvest run' first.", path.display());
    }
    let store = Arc::new(
        CheckpointStore::open(&path, config.schema())
            .with_context(|| format!("Failed to open checkpoint {}", path.display()))?,
    );
    let records = store
        .complete_records()
        .iter()
        .filter(|record| record.get(&config.assets.field).is_some())
        .count();
    if records == 0 {
        println!(
            "{} No complete records with '{}' in {}",
            style("!").yellow(),
            config.assets.field,
            path.display()
        );
        return Ok(0);
    }

    let cancel = cancel_on_ctrl_c();
    let (tx, rx) = mpsc::channel(100);
    let progress = show_progress
        .then(|| Arc::new(WorkerProgress::new(config.assets.workers, records as u64, "Records")));
    let handler = spawn_event_handler(progress, rx);

    let factory = Arc::new(HttpSessionFactory::new(config.http.clone()));
    let fetcher = AssetFetcher::new(factory, config, cancel).with_events(tx);
    println!(
        "{} Downloading assets for {} records into {}",
        style("→").cyan(),
        records,
        fetcher.dir().display()
    );
    let result = fetcher.run(store).await;
    drop(fetcher);
    let _ = handler.await;
    let report = result?;

    println!(
        "{} {} records: {} downloaded, {} already on disk, {} failed",
        if report.is_success() {
            style("✓").green()
        } else {
            style("!").yellow()
        },
        report.records,
        report.downloaded,
        report.existing,
        report.failed.len()
    );
    for failure in &report.failed {
        println!(
            "  {} {} {}: {}",
            style("✗").red(),
            failure.id,
            failure.url,
            failure.error
        );
    }

    Ok(if report.cancelled {
        EXIT_CANCELLED
    } else if report.is_success() {
        0
    } else {
        EXIT_INCOMPLETE
    })
}
