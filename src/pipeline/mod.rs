//! End-to-end harvest flow.
//!
//! `discover` converges each listing and extracts item links; `harvest`
//! diffs candidates against the checkpoint and dispatches what is pending
//! to the worker pool, persisting every item as it finishes. Both stages
//! emit [`HarvestEvent`]s for progress display and are otherwise silent
//! apart from logging.

mod candidates;
mod discover;
mod harvest;

use std::sync::Arc;
use std::time::Duration;

use scraper::Selector;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, HarvestConfig};
use crate::convergence::{ConvergenceLimits, ConvergenceStatus};
use crate::extract::{DetailExtractor, ItemExtractor};
use crate::models::IdRules;
use crate::pool::{PoolOptions, ResourceFactory};
use crate::retry::RetryExecutor;
use crate::source::{BoxedSource, ProgressProbe};

pub use candidates::{parse_candidates, read_candidates, write_candidates, CANDIDATE_HEADER};
pub use discover::{DiscoveryReport, ListingFailure};
pub use harvest::{HarvestOptions, HarvestReport, ItemFailure};

/// Events emitted while a stage runs.
#[derive(Debug, Clone)]
pub enum HarvestEvent {
    /// A worker opened a listing
    ListingStarted { worker_id: usize, address: String },
    /// Convergence progress on a listing (best effort, may be dropped)
    ListingProgress {
        worker_id: usize,
        observed: u64,
        total: Option<u64>,
    },
    /// A listing was converged and extracted
    ListingFinished {
        worker_id: usize,
        address: String,
        items: usize,
        status: Option<ConvergenceStatus>,
    },
    /// A listing could not be loaded
    ListingFailed {
        worker_id: usize,
        address: String,
        error: String,
    },
    /// Candidates already complete in the checkpoint
    Skipped { count: usize },
    /// A worker picked up an item
    ItemStarted { worker_id: usize, id: String },
    /// Item complete and checkpointed
    ItemCompleted {
        worker_id: usize,
        id: String,
        attempts: u32,
    },
    /// Item gave up; the partial record and error are checkpointed
    ItemFailed {
        worker_id: usize,
        id: String,
        attempts: u32,
        error: String,
    },
}

/// Optional event sink shared by handlers.
#[derive(Debug, Clone, Default)]
pub(crate) struct Events(Option<mpsc::Sender<HarvestEvent>>);

impl Events {
    pub(crate) fn new(tx: mpsc::Sender<HarvestEvent>) -> Self {
        Self(Some(tx))
    }

    pub(crate) async fn emit(&self, event: HarvestEvent) {
        if let Some(ref tx) = self.0 {
            let _ = tx.send(event).await;
        }
    }

    /// Non-blocking send for callers that cannot await.
    pub(crate) fn try_emit(&self, event: HarvestEvent) {
        if let Some(ref tx) = self.0 {
            let _ = tx.try_send(event);
        }
    }
}

/// Compiled per-run settings shared by every worker.
pub(crate) struct Shared {
    pub init_script: Option<String>,
    pub dismiss: Vec<String>,
    pub ready: Option<Selector>,
    pub ready_timeout: Duration,
    pub converge: bool,
    pub limits: ConvergenceLimits,
    pub probe: Box<dyn ProgressProbe>,
    pub links: ItemExtractor,
    pub details: DetailExtractor,
    pub id_rules: IdRules,
    pub retry: RetryExecutor,
    pub cancel: CancellationToken,
}

impl Shared {
    fn compile(config: &HarvestConfig, cancel: CancellationToken) -> Result<Self, ConfigError> {
        let discovery = &config.discovery;
        let ready = config
            .source
            .ready_selector
            .as_deref()
            .map(|s| {
                Selector::parse(s)
                    .map_err(|e| ConfigError::Invalid(format!("invalid ready selector {:?}: {}", s, e)))
            })
            .transpose()?;

        Ok(Self {
            init_script: config.source.init_script.clone(),
            dismiss: config.source.dismiss.clone(),
            ready,
            ready_timeout: config.source.ready_timeout(),
            converge: config.convergence.enabled,
            limits: config.convergence.limits(),
            probe: config.convergence.probe(&discovery.item_selector)?,
            links: ItemExtractor::new(
                &discovery.item_selector,
                &discovery.item_attribute,
                discovery.link_pattern.as_deref(),
                config.record.id.clone(),
            )
            .map_err(ConfigError::Invalid)?,
            details: DetailExtractor::new(&config.record.fields).map_err(ConfigError::Invalid)?,
            id_rules: config.record.id.clone(),
            retry: RetryExecutor::new(
                config.retry.max_attempts,
                config.retry.policy(),
                cancel.clone(),
            ),
            cancel,
        })
    }
}

/// Runs the discover and harvest stages over a pool of page sources.
pub struct HarvestPipeline<F> {
    factory: Arc<F>,
    shared: Arc<Shared>,
    pool: PoolOptions,
    cancel: CancellationToken,
    events: Events,
}

impl<F> HarvestPipeline<F>
where
    F: ResourceFactory<Resource = BoxedSource>,
{
    pub fn new(
        factory: Arc<F>,
        config: &HarvestConfig,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            factory,
            shared: Arc::new(Shared::compile(config, cancel.clone())?),
            pool: PoolOptions {
                workers: config.pool.workers,
                restart_after: config.pool.restart_after,
                item_delay: config.pool.item_delay(),
            },
            cancel,
            events: Events::default(),
        })
    }

    /// Send progress events to `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<HarvestEvent>) -> Self {
        self.events = Events::new(tx);
        self
    }

    pub fn pool_options(&self) -> &PoolOptions {
        &self.pool
    }
}
