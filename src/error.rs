//! Error taxonomy shared by every harvesting stage.
//!
//! Collaborator failures are classified into a [`FailureKind`] as close to
//! where they happen as possible. Only [`FailureKind::Fatal`] is allowed to
//! abort a whole run; everything else is turned into a signal (no progress,
//! empty extraction, failure record) by the component that observed it.

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::config::ConfigError;
use crate::source::SourceError;

/// How a failure should be treated by the layers above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Timeouts, stale renders, rate limiting. Retried within budget.
    Transient,
    /// Selector or signal missing because the markup differs. Degrades to
    /// "no progress" or "nothing extracted", never aborts.
    Structural,
    /// Will not be fixed by retrying (404, malformed identifier).
    Terminal,
    /// Progress guarantees are gone (checkpoint unwritable).
    Fatal,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Transient | FailureKind::Structural)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Structural => "structural",
            FailureKind::Terminal => "terminal",
            FailureKind::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error for a harvest run.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Source error: {0}")]
    Source(#[from] SourceError),
    #[error("No worker could acquire a resource: {0}")]
    ResourceUnavailable(String),
    #[error("Worker task failed: {0}")]
    Worker(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarvestError {
    pub fn kind(&self) -> FailureKind {
        match self {
            HarvestError::Checkpoint(_) => FailureKind::Fatal,
            HarvestError::Config(_) => FailureKind::Fatal,
            HarvestError::Source(e) => e.kind(),
            HarvestError::ResourceUnavailable(_) => FailureKind::Fatal,
            HarvestError::Worker(_) => FailureKind::Fatal,
            HarvestError::Io(_) => FailureKind::Fatal,
        }
    }
}

pub type Result<T, E = HarvestError> = std::result::Result<T, E>;
