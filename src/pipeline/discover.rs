//! Listing discovery: converge, extract, union.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Events, HarvestEvent, HarvestPipeline, Shared};
use crate::convergence::{AbortReason, ConvergenceController, ConvergenceOutcome, ConvergenceStatus, Phase};
use crate::error::HarvestError;
use crate::extract::Extraction;
use crate::models::WorkItem;
use crate::pool::{ItemHandler, ResourceFactory, WorkerPool};
use crate::retry::{Attempt, TaskError};
use crate::source::{open_page, BoxedSource, PageSource};

/// A listing that never loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingFailure {
    pub address: String,
    pub attempts: u32,
    pub error: String,
}

/// Result of a discovery run.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    pub listings: usize,
    /// Union of every listing's items, deduplicated and ordered by id.
    pub items: Vec<WorkItem>,
    pub failed: Vec<ListingFailure>,
    /// Listings whose counter reached its total.
    pub converged: usize,
    /// Listings abandoned after stalling past the hard timeout.
    pub timed_out: usize,
    /// Listings stopped by the iteration cap.
    pub capped: usize,
    /// Convergence readings with no progress signal on the page.
    pub probe_misses: u32,
    /// Listings that loaded but yielded no item links.
    pub empty_extractions: usize,
    /// Listings never dispatched because the run was cancelled.
    pub not_processed: usize,
    pub cancelled: bool,
}

struct ListingScan {
    extraction: Extraction,
    convergence: Option<ConvergenceOutcome>,
}

enum ListingOutcome {
    Scanned(ListingScan),
    Failed(ListingFailure),
}

struct ListingAttempt<'a> {
    worker_id: usize,
    source: &'a mut dyn PageSource,
    address: &'a str,
    shared: &'a Shared,
    events: &'a Events,
}

#[async_trait]
impl<'a> Attempt for ListingAttempt<'a> {
    type Output = ListingScan;

    async fn attempt(&mut self, _attempt: u32) -> Result<ListingScan, TaskError> {
        let shared = self.shared;
        open_page(
            &mut *self.source,
            self.address,
            shared.init_script.as_deref(),
            &shared.dismiss,
        )
        .await?;

        let mut convergence = None;
        if shared.converge && self.source.is_dynamic() {
            let controller = ConvergenceController::new(shared.probe.as_ref(), shared.limits.clone());
            let events = self.events.clone();
            let worker_id = self.worker_id;
            let outcome = controller
                .run_observed(&mut *self.source, &shared.cancel, move |state, phase| {
                    if phase == Phase::Checking {
                        events.try_emit(HarvestEvent::ListingProgress {
                            worker_id,
                            observed: state.observed_count,
                            total: state.total_count,
                        });
                    }
                })
                .await;
            convergence = Some(outcome);
        }

        // Prefer a fresh snapshot; fall back to the last one convergence took.
        let snapshot = match self.source.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => match convergence.as_mut().and_then(|c| c.snapshot.take()) {
                Some(snapshot) => snapshot,
                None => return Err(e.into()),
            },
        };
        if let Some(ref mut outcome) = convergence {
            outcome.snapshot = None;
        }

        Ok(ListingScan {
            extraction: shared.links.extract(&snapshot),
            convergence,
        })
    }
}

struct ListingHandler {
    shared: Arc<Shared>,
    events: Events,
}

#[async_trait]
impl ItemHandler<BoxedSource> for ListingHandler {
    type Output = ListingOutcome;

    async fn handle(
        &self,
        worker_id: usize,
        source: &mut BoxedSource,
        item: WorkItem,
    ) -> Result<ListingOutcome, HarvestError> {
        self.events
            .emit(HarvestEvent::ListingStarted {
                worker_id,
                address: item.payload.clone(),
            })
            .await;

        let mut attempt = ListingAttempt {
            worker_id,
            source: &mut **source,
            address: &item.payload,
            shared: &self.shared,
            events: &self.events,
        };

        match self.shared.retry.run(&mut attempt).await {
            Ok(scan) => {
                self.events
                    .emit(HarvestEvent::ListingFinished {
                        worker_id,
                        address: item.payload.clone(),
                        items: scan.extraction.items.len(),
                        status: scan.convergence.as_ref().map(|c| c.status),
                    })
                    .await;
                Ok(ListingOutcome::Scanned(scan))
            }
            Err(failure) => {
                warn!(
                    "Listing {} failed after {} attempts: {}",
                    item.payload, failure.attempts, failure.last_error
                );
                self.events
                    .emit(HarvestEvent::ListingFailed {
                        worker_id,
                        address: item.payload.clone(),
                        error: failure.last_error.clone(),
                    })
                    .await;
                Ok(ListingOutcome::Failed(ListingFailure {
                    address: item.payload,
                    attempts: failure.attempts,
                    error: failure.last_error,
                }))
            }
        }
    }
}

impl<F> HarvestPipeline<F>
where
    F: ResourceFactory<Resource = BoxedSource>,
{
    /// Converge and extract every listing, returning the deduplicated union
    /// of their items. Listings are dispatched through the worker pool.
    pub async fn discover<I, S>(&self, listings: I) -> Result<DiscoveryReport, HarvestError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique = BTreeMap::new();
        for address in listings {
            let address: String = address.into();
            let address = address.trim().to_string();
            if address.is_empty() {
                continue;
            }
            unique.entry(address.clone()).or_insert(WorkItem {
                id: address.clone(),
                payload: address,
            });
        }

        let mut report = DiscoveryReport {
            listings: unique.len(),
            ..Default::default()
        };
        info!("Discovering items on {} listings", report.listings);

        let pool = WorkerPool::new(self.factory.clone(), self.pool.clone(), self.cancel.clone());
        let handler = Arc::new(ListingHandler {
            shared: self.shared.clone(),
            events: self.events.clone(),
        });
        let summary = pool.run(unique.into_values(), handler).await?;

        let mut items = BTreeMap::new();
        for outcome in summary.outputs {
            let scan = match outcome {
                ListingOutcome::Scanned(scan) => scan,
                ListingOutcome::Failed(failure) => {
                    report.failed.push(failure);
                    continue;
                }
            };
            if let Some(ref convergence) = scan.convergence {
                report.probe_misses += convergence.probe_misses;
                match convergence.status {
                    ConvergenceStatus::Done => report.converged += 1,
                    ConvergenceStatus::Aborted(AbortReason::HardTimeout) => report.timed_out += 1,
                    ConvergenceStatus::Aborted(AbortReason::IterationCap) => report.capped += 1,
                    ConvergenceStatus::Aborted(AbortReason::Cancelled) => {}
                }
            }
            if scan.extraction.is_empty() {
                report.empty_extractions += 1;
            }
            for item in scan.extraction.items {
                items.entry(item.id.clone()).or_insert(item);
            }
        }

        report.items = items.into_values().collect();
        report.not_processed = summary.remaining.len();
        report.cancelled = summary.cancelled;
        report.failed.sort_by(|a, b| a.address.cmp(&b.address));

        info!(
            "Discovered {} unique items on {} listings ({} failed, {} empty)",
            report.items.len(),
            report.listings,
            report.failed.len(),
            report.empty_extractions
        );
        Ok(report)
    }
}
