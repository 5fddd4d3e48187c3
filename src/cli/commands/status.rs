//! Status command: summarize a checkpoint.

use std::path::Path;

use anyhow::Context;
use console::style;

use super::checkpoint_path;
use crate::checkpoint::CheckpointStore;
use crate::config::HarvestConfig;

/// How many incomplete items to list unless `--all` is given.
const SHOWN_INCOMPLETE: usize = 20;

pub async fn cmd_status(
    config: &HarvestConfig,
    checkpoint: Option<&Path>,
    all: bool,
) -> anyhow::Result<i32> {
    let path = checkpoint_path(config, checkpoint);
    if !path.exists() {
        anyhow::bail!("Checkpoint {} does not exist", path.display());
    }
    let store = CheckpointStore::open(&path, config.schema())
        .with_context(|| format!("Failed to open checkpoint {}", path.display()))?;
    let summary = store.summary();

    let separator = "─".repeat(60);
    println!();
    println!("{}", style("harvest status").bold());
    println!("{}", separator);
    println!("Checkpoint: {}", path.display());
    println!();
    println!("  {:<20} {:>10}", "Total:", summary.total);
    println!("  {:<20} {:>10}", "Complete:", style(summary.complete).green());
    println!("  {:<20} {:>10}", "Incomplete:", summary.incomplete);
    println!("  {:<20} {:>10}", "Failed:", style(summary.failed).red());

    let mut incomplete: Vec<_> = store
        .load()
        .into_values()
        .filter(|entry| !entry.record.is_complete(store.schema()))
        .collect();
    incomplete.sort_by(|a, b| a.id().cmp(b.id()));

    if !incomplete.is_empty() {
        println!();
        println!("{}", style("INCOMPLETE").cyan().bold());
        let limit = if all { incomplete.len() } else { SHOWN_INCOMPLETE };
        for entry in incomplete.iter().take(limit) {
            let missing = entry.record.missing(store.schema()).join(", ");
            match &entry.last_error {
                Some(error) => println!(
                    "  {} {} ({} attempts): {}",
                    style("✗").red(),
                    entry.id(),
                    entry.attempts,
                    error
                ),
                None => println!(
                    "  {} {} missing: {}",
                    style("-").dim(),
                    entry.id(),
                    missing
                ),
            }
        }
        if incomplete.len() > limit {
            println!(
                "  {} and {} more (use --all to list them)",
                style("…").dim(),
                incomplete.len() - limit
            );
        }
    }
    println!();

    Ok(0)
}
