//! harvester - resumable harvesting of paginated and infinite-scroll listings.
//!
//! Core library behind the `harvest` binary: convergence of lazily-loaded
//! listings, link and field extraction, a durable CSV checkpoint, bounded
//! retries and a worker pool with per-worker rendering sessions.

pub mod assets;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod convergence;
pub mod error;
pub mod extract;
pub mod http_client;
pub mod models;
pub mod pipeline;
pub mod pool;
pub mod retry;
pub mod source;

pub use checkpoint::{CheckpointEntry, CheckpointStore, CheckpointSummary};
pub use config::HarvestConfig;
pub use convergence::{ConvergenceController, ConvergenceLimits, ConvergenceOutcome, ConvergenceStatus};
pub use error::{FailureKind, HarvestError, Result};
pub use models::{FieldValue, Record, RecordSchema, WorkItem};
pub use pipeline::{HarvestEvent, HarvestOptions, HarvestPipeline, HarvestReport};
pub use pool::{ItemHandler, PoolOptions, ResourceFactory, WorkerPool};
pub use retry::{BackoffPolicy, RetryExecutor};
pub use source::{Action, PageSource, ProgressProbe, ProgressSignal, Scroll, Snapshot, SourceError};
