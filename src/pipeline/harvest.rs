//! Detail harvesting: checkpoint diff, dispatch, persist.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Events, HarvestEvent, HarvestPipeline, Shared};
use crate::checkpoint::CheckpointStore;
use crate::error::{FailureKind, HarvestError};
use crate::models::{Record, RecordSchema, WorkItem};
use crate::pool::{ItemHandler, ResourceFactory, WorkerPool};
use crate::retry::{Attempt, FailureCause, TaskError};
use crate::source::{open_page, wait_for, BoxedSource, PageSource, Snapshot, SourceError};

/// Options for one harvest run.
#[derive(Debug, Clone, Copy)]
pub struct HarvestOptions {
    /// Skip candidates the checkpoint already has complete.
    pub resume: bool,
    /// Let fresh values replace non-empty checkpointed ones.
    pub force: bool,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self {
            resume: true,
            force: false,
        }
    }
}

/// An item that ended the run incomplete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub id: String,
    pub attempts: u32,
    pub reason: String,
    pub kind: FailureKind,
}

/// Result of a harvest run.
#[derive(Debug, Clone, Default)]
pub struct HarvestReport {
    /// Unique candidates, including malformed ones.
    pub total: usize,
    /// Complete in the checkpoint before this run; not visited.
    pub already_complete: usize,
    pub completed: usize,
    pub failed: Vec<ItemFailure>,
    /// Pending items left untouched or interrupted by cancellation.
    pub not_processed: usize,
    pub cancelled: bool,
}

impl HarvestReport {
    /// Every candidate is complete.
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed.is_empty() && self.not_processed == 0
    }
}

enum ItemOutcome {
    Completed,
    Failed(ItemFailure),
    Interrupted,
}

/// Retries one detail page, accumulating the best record seen.
struct DetailAttempt<'a> {
    source: &'a mut dyn PageSource,
    item: &'a WorkItem,
    shared: &'a Shared,
    schema: &'a RecordSchema,
    best: Record,
    force: bool,
    attempts: u32,
}

impl DetailAttempt<'_> {
    /// Wait for the ready selector; extract what is there if it never shows.
    async fn ready_snapshot(&mut self) -> Result<Snapshot, SourceError> {
        let shared = self.shared;
        let Some(ref ready) = shared.ready else {
            return self.source.snapshot().await;
        };
        let poll = shared.limits.poll_interval;
        match wait_for(&mut *self.source, shared.ready_timeout, poll, |s| s.contains(ready)).await {
            Err(SourceError::Timeout(after)) => {
                debug!("{} not ready after {:?}; extracting anyway", self.item.id, after);
                self.source.snapshot().await
            }
            other => other,
        }
    }
}

#[async_trait]
impl<'a> Attempt for DetailAttempt<'a> {
    type Output = ();

    async fn attempt(&mut self, attempt: u32) -> Result<(), TaskError> {
        self.attempts = attempt;
        if attempt > 1 {
            debug!("Retrying {} (attempt {})", self.item.id, attempt);
        }

        open_page(
            &mut *self.source,
            &self.item.payload,
            self.shared.init_script.as_deref(),
            &self.shared.dismiss,
        )
        .await?;
        let snapshot = self.ready_snapshot().await?;

        let extracted = self.shared.details.extract(&self.item.id, &snapshot);
        self.best.merge(&extracted, self.force);

        let missing = self.best.missing(self.schema);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(TaskError::Structural(format!(
                "missing required fields: {}",
                missing.join(", ")
            )))
        }
    }
}

struct DetailHandler {
    shared: Arc<Shared>,
    store: Arc<CheckpointStore>,
    events: Events,
    force: bool,
}

#[async_trait]
impl ItemHandler<BoxedSource> for DetailHandler {
    type Output = ItemOutcome;

    async fn handle(
        &self,
        worker_id: usize,
        source: &mut BoxedSource,
        item: WorkItem,
    ) -> Result<ItemOutcome, HarvestError> {
        self.events
            .emit(HarvestEvent::ItemStarted {
                worker_id,
                id: item.id.clone(),
            })
            .await;

        let seed = self
            .store
            .get(&item.id)
            .map(|entry| entry.record)
            .unwrap_or_else(|| Record::new(&item.id));
        let mut attempt = DetailAttempt {
            source: &mut **source,
            item: &item,
            shared: &self.shared,
            schema: self.store.schema(),
            best: seed,
            force: self.force,
            attempts: 0,
        };
        let result = self.shared.retry.run(&mut attempt).await;
        let DetailAttempt { best, attempts, .. } = attempt;

        match result {
            Ok(()) => {
                self.store.upsert_with(&best, attempts, None, self.force)?;
                self.events
                    .emit(HarvestEvent::ItemCompleted {
                        worker_id,
                        id: item.id,
                        attempts,
                    })
                    .await;
                Ok(ItemOutcome::Completed)
            }
            Err(failure) => {
                // Partial fields are kept so a later run only fills the gaps.
                self.store
                    .upsert_with(&best, failure.attempts, Some(&failure.last_error), self.force)?;

                if failure.cause == FailureCause::Cancelled {
                    debug!("{} interrupted after {} attempts", item.id, failure.attempts);
                    return Ok(ItemOutcome::Interrupted);
                }

                warn!(
                    "{} failed after {} attempts: {}",
                    item.id, failure.attempts, failure.last_error
                );
                self.events
                    .emit(HarvestEvent::ItemFailed {
                        worker_id,
                        id: item.id.clone(),
                        attempts: failure.attempts,
                        error: failure.last_error.clone(),
                    })
                    .await;
                Ok(ItemOutcome::Failed(ItemFailure {
                    id: item.id,
                    attempts: failure.attempts,
                    reason: failure.last_error,
                    kind: failure.kind,
                }))
            }
        }
    }
}

impl<F> HarvestPipeline<F>
where
    F: ResourceFactory<Resource = BoxedSource>,
{
    /// Harvest detail pages for `addresses`.
    ///
    /// Candidates are deduplicated by canonical id and diffed against `store`;
    /// only pending ones are visited. Each item is checkpointed as soon as it
    /// finishes, so a crash loses at most the items in flight. Returns `Err`
    /// only when the run cannot continue (checkpoint unwritable, no worker
    /// could start a session).
    pub async fn harvest(
        &self,
        store: Arc<CheckpointStore>,
        addresses: &[String],
        options: HarvestOptions,
    ) -> Result<HarvestReport, HarvestError> {
        let mut items = BTreeMap::new();
        let mut malformed = BTreeMap::new();
        for address in addresses {
            let trimmed = address.trim();
            if trimmed.is_empty() {
                continue;
            }
            match WorkItem::from_address(trimmed, &self.shared.id_rules) {
                Ok(item) => {
                    items.entry(item.id.clone()).or_insert(item);
                }
                Err(e) => {
                    malformed.insert(trimmed.to_string(), e);
                }
            }
        }

        let mut report = HarvestReport {
            total: items.len() + malformed.len(),
            ..Default::default()
        };

        for (id, error) in malformed {
            warn!("Malformed candidate {:?}: {}", id, error);
            let reason = error.to_string();
            store.upsert(&Record::new(&id), 0, Some(&reason))?;
            report.failed.push(ItemFailure {
                id,
                attempts: 0,
                reason,
                kind: error.kind(),
            });
        }

        let pending = if options.resume {
            store.pending(items.keys())
        } else {
            items.keys().cloned().collect()
        };
        report.already_complete = items.len() - pending.len();
        if report.already_complete > 0 {
            info!(
                "{} of {} candidates already complete; skipping them",
                report.already_complete,
                items.len()
            );
            self.events
                .emit(HarvestEvent::Skipped {
                    count: report.already_complete,
                })
                .await;
        }

        let work: Vec<WorkItem> = items
            .into_values()
            .filter(|item| pending.contains(&item.id))
            .collect();
        info!("Harvesting {} pending items", work.len());

        let pool = WorkerPool::new(self.factory.clone(), self.pool.clone(), self.cancel.clone());
        let handler = Arc::new(DetailHandler {
            shared: self.shared.clone(),
            store,
            events: self.events.clone(),
            force: options.force,
        });
        let summary = pool.run(work, handler).await?;

        for outcome in summary.outputs {
            match outcome {
                ItemOutcome::Completed => report.completed += 1,
                ItemOutcome::Failed(failure) => report.failed.push(failure),
                ItemOutcome::Interrupted => report.not_processed += 1,
            }
        }
        report.not_processed += summary.remaining.len();
        report.cancelled = summary.cancelled;
        report.failed.sort_by(|a, b| a.id.cmp(&b.id));

        info!(
            "Harvest finished: {} completed, {} failed, {} already complete, {} not processed",
            report.completed,
            report.failed.len(),
            report.already_complete,
            report.not_processed
        );
        Ok(report)
    }
}
