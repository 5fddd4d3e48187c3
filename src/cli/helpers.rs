//! Shared helpers for CLI commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use console::style;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::progress::WorkerProgress;
use crate::pipeline::HarvestEvent;

/// Cancellation token tripped by Ctrl-C. In-flight items still finish.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trip = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\n{} Interrupted; finishing in-flight items (checkpoint stays valid)",
                style("!").yellow()
            );
            trip.cancel();
        }
    });
    token
}

/// Resolve a CLI path against the working directory.
pub fn cli_path(path: &Path) -> PathBuf {
    let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
    let path = PathBuf::from(expanded);
    if path.is_absolute() {
        return path;
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(&path))
        .unwrap_or(path)
}

/// Consume pipeline events, driving the progress display if there is one.
pub fn spawn_event_handler(
    progress: Option<Arc<WorkerProgress>>,
    mut rx: mpsc::Receiver<HarvestEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut done = 0usize;
        let mut failed = 0usize;

        while let Some(event) = rx.recv().await {
            let Some(ref progress) = progress else {
                continue;
            };
            match event {
                HarvestEvent::ListingStarted { worker_id, address } => {
                    progress.start_item(worker_id, &address).await;
                }
                HarvestEvent::ListingProgress {
                    worker_id,
                    observed,
                    total,
                } => {
                    progress.update_count(worker_id, observed, total).await;
                }
                HarvestEvent::ListingFinished { worker_id, .. } => {
                    done += 1;
                    progress.set_summary(done, failed);
                    progress.finish_item(worker_id).await;
                }
                HarvestEvent::ListingFailed {
                    worker_id,
                    address,
                    error,
                } => {
                    failed += 1;
                    progress.println(&format!("  {} {}: {}", style("✗").red(), address, error));
                    progress.set_summary(done, failed);
                    progress.finish_item(worker_id).await;
                }
                HarvestEvent::Skipped { count } => progress.skip(count),
                HarvestEvent::ItemStarted { worker_id, id } => {
                    progress.start_item(worker_id, &id).await;
                }
                HarvestEvent::ItemCompleted { worker_id, .. } => {
                    done += 1;
                    progress.set_summary(done, failed);
                    progress.finish_item(worker_id).await;
                }
                HarvestEvent::ItemFailed {
                    worker_id,
                    id,
                    error,
                    ..
                } => {
                    failed += 1;
                    progress.println(&format!("  {} {}: {}", style("✗").red(), id, error));
                    progress.set_summary(done, failed);
                    progress.finish_item(worker_id).await;
                }
            }
        }

        if let Some(ref progress) = progress {
            progress.finish().await;
        }
    })
}
