//! Bounded worker pool with per-worker resources.
//!
//! Workers pull items from one shared queue. Each worker owns a single
//! resource (a rendering session, an HTTP client) that no other worker ever
//! touches, and recreates it after a configurable number of items.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::HarvestError;
use crate::models::WorkItem;

/// Creates and releases the per-worker resource.
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + 'static;

    async fn create(&self, worker_id: usize) -> Result<Self::Resource, HarvestError>;

    /// Dispose of a resource. The default just drops it.
    async fn release(&self, resource: Self::Resource) {
        drop(resource);
    }
}

/// Processes one item with the worker's resource.
///
/// Per-item failures are the handler's business; an `Err` here means the run
/// cannot continue (e.g. the checkpoint cannot be written) and stops the pool.
#[async_trait]
pub trait ItemHandler<R: Send>: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn handle(
        &self,
        worker_id: usize,
        resource: &mut R,
        item: WorkItem,
    ) -> Result<Self::Output, HarvestError>;
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub workers: usize,
    /// Recreate a worker's resource after this many items; 0 disables.
    pub restart_after: usize,
    /// Pause between items on one worker.
    pub item_delay: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            restart_after: 50,
            item_delay: Duration::ZERO,
        }
    }
}

/// Per-worker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub processed: usize,
    pub resources_created: usize,
    pub restarts: usize,
}

/// Result of a pool run.
#[derive(Debug)]
pub struct PoolSummary<O> {
    /// Handler outputs, grouped by worker in the order workers finished.
    pub outputs: Vec<O>,
    pub workers: Vec<WorkerStats>,
    /// Items never dispatched because the run was cancelled.
    pub remaining: Vec<WorkItem>,
    pub cancelled: bool,
}

impl<O> PoolSummary<O> {
    pub fn processed(&self) -> usize {
        self.workers.iter().map(|w| w.processed).sum()
    }
}

struct WorkerOutcome<O> {
    stats: WorkerStats,
    outputs: Vec<O>,
    fatal: Option<HarvestError>,
    create_error: Option<String>,
}

pub struct WorkerPool<F: ResourceFactory> {
    factory: Arc<F>,
    options: PoolOptions,
    cancel: CancellationToken,
}

impl<F: ResourceFactory> WorkerPool<F> {
    pub fn new(factory: Arc<F>, options: PoolOptions, cancel: CancellationToken) -> Self {
        Self {
            factory,
            options,
            cancel,
        }
    }

    /// Process `items` until the queue is drained, the run is cancelled, or a
    /// handler reports a fatal error.
    ///
    /// In-flight items always finish; cancellation only stops new dispatch.
    pub async fn run<H, I>(&self, items: I, handler: Arc<H>) -> Result<PoolSummary<H::Output>, HarvestError>
    where
        H: ItemHandler<F::Resource>,
        I: IntoIterator<Item = WorkItem>,
    {
        let queue: VecDeque<WorkItem> = items.into_iter().collect();
        let total = queue.len();
        let queue = Arc::new(Mutex::new(queue));
        // A fatal handler error stops this pool without cancelling the caller's token.
        let stop = self.cancel.child_token();
        let workers = self.options.workers.max(1).min(total.max(1));

        info!("Starting {} workers for {} items", workers, total);

        let mut tasks = JoinSet::new();
        for worker_id in 0..workers {
            let queue = queue.clone();
            let factory = self.factory.clone();
            let handler = handler.clone();
            let stop = stop.clone();
            let options = self.options.clone();

            tasks.spawn(async move {
                run_worker(worker_id, queue, factory, handler, stop, options).await
            });
        }

        // Every worker is joined before returning, even after one of them dies,
        // so no session outlives the run.
        let mut outputs = Vec::new();
        let mut stats = Vec::with_capacity(workers);
        let mut fatal = None;
        let mut create_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Worker task died: {}", e);
                    stop.cancel();
                    if fatal.is_none() {
                        fatal = Some(HarvestError::Worker(e.to_string()));
                    }
                    continue;
                }
            };
            outputs.extend(outcome.outputs);
            stats.push(outcome.stats);
            if fatal.is_none() {
                fatal = outcome.fatal;
            }
            if outcome.create_error.is_some() {
                create_error = outcome.create_error;
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        stats.sort_by_key(|w: &WorkerStats| w.worker_id);

        let remaining: Vec<WorkItem> = queue.lock().await.drain(..).collect();
        let cancelled = self.cancel.is_cancelled();
        if !remaining.is_empty() && !cancelled {
            // Every worker gave up acquiring a resource with work left.
            return Err(HarvestError::ResourceUnavailable(
                create_error.unwrap_or_else(|| "all workers stopped".to_string()),
            ));
        }

        Ok(PoolSummary {
            outputs,
            workers: stats,
            remaining,
            cancelled,
        })
    }
}

async fn run_worker<F, H>(
    worker_id: usize,
    queue: Arc<Mutex<VecDeque<WorkItem>>>,
    factory: Arc<F>,
    handler: Arc<H>,
    stop: CancellationToken,
    options: PoolOptions,
) -> WorkerOutcome<H::Output>
where
    F: ResourceFactory,
    H: ItemHandler<F::Resource>,
{
    let mut outcome = WorkerOutcome {
        stats: WorkerStats {
            worker_id,
            ..Default::default()
        },
        outputs: Vec::new(),
        fatal: None,
        create_error: None,
    };
    let mut resource: Option<F::Resource> = None;
    let mut since_restart = 0;

    loop {
        if stop.is_cancelled() {
            debug!("Worker {} stopping: cancelled", worker_id);
            break;
        }

        let Some(item) = queue.lock().await.pop_front() else {
            break;
        };

        if resource.is_none() {
            match factory.create(worker_id).await {
                Ok(r) => {
                    outcome.stats.resources_created += 1;
                    resource = Some(r);
                }
                Err(e) => {
                    error!("Worker {} failed to create resource: {}", worker_id, e);
                    queue.lock().await.push_front(item);
                    outcome.create_error = Some(e.to_string());
                    break;
                }
            }
        }
        let Some(active) = resource.as_mut() else {
            break;
        };

        let id = item.id.clone();
        match handler.handle(worker_id, active, item).await {
            Ok(output) => outcome.outputs.push(output),
            Err(e) => {
                error!("Worker {} hit a fatal error on {}: {}", worker_id, id, e);
                stop.cancel();
                outcome.fatal = Some(e);
                break;
            }
        }
        outcome.stats.processed += 1;
        since_restart += 1;

        if options.restart_after > 0
            && since_restart >= options.restart_after
            && !queue.lock().await.is_empty()
        {
            if let Some(old) = resource.take() {
                info!(
                    "Worker {} recycling its session after {} items",
                    worker_id, since_restart
                );
                factory.release(old).await;
                outcome.stats.restarts += 1;
            }
            since_restart = 0;
        }

        if !options.item_delay.is_zero() {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(options.item_delay) => {}
            }
        }
    }

    if let Some(r) = resource.take() {
        factory.release(r).await;
    }
    if outcome.create_error.is_some() && outcome.stats.processed == 0 {
        warn!("Worker {} never acquired a resource", worker_id);
    }
    outcome
}
