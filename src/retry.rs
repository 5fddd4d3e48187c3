//! Bounded retries with backoff and failure classification.

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FailureKind;
use crate::source::SourceError;

/// Delay before the next attempt. Never decreases with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// `base * attempt`.
    Linear { base: Duration },
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
    /// Retry immediately.
    None,
}

impl BackoffPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            BackoffPolicy::Linear { base } => base.saturating_mul(attempt),
            BackoffPolicy::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt - 1);
                base.saturating_mul(factor).min(max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

/// Failure of a single attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// Worth another attempt (timeouts, throttling, dropped connections).
    #[error("{0}")]
    Retryable(String),
    /// The page loaded without what we need (missing elements or fields).
    /// Also worth another attempt.
    #[error("{0}")]
    Structural(String),
    /// Retrying will not help (gone, malformed input).
    #[error("{0}")]
    Terminal(String),
}

impl TaskError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TaskError::Retryable(_) => FailureKind::Transient,
            TaskError::Structural(_) => FailureKind::Structural,
            TaskError::Terminal(_) => FailureKind::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn message(&self) -> &str {
        match self {
            TaskError::Retryable(m) | TaskError::Structural(m) | TaskError::Terminal(m) => m,
        }
    }
}

impl From<SourceError> for TaskError {
    fn from(e: SourceError) -> Self {
        match e.kind() {
            FailureKind::Transient => TaskError::Retryable(e.to_string()),
            FailureKind::Structural => TaskError::Structural(e.to_string()),
            FailureKind::Terminal | FailureKind::Fatal => TaskError::Terminal(e.to_string()),
        }
    }
}

/// Why a task gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// Every attempt failed with a retryable error.
    Exhausted,
    /// An attempt failed terminally; no further attempts were made.
    Terminal,
    /// Cancelled while waiting to retry.
    Cancelled,
}

/// Outcome of a task that did not succeed. Returned, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub attempts: u32,
    pub last_error: String,
    /// Classification of the last error.
    pub kind: FailureKind,
    pub cause: FailureCause,
}

/// A retriable unit of work that owns whatever state it needs across attempts.
#[async_trait]
pub trait Attempt: Send {
    type Output: Send;

    /// Run attempt number `attempt` (1-based).
    async fn attempt(&mut self, attempt: u32) -> Result<Self::Output, TaskError>;
}

/// Closure adapter for [`RetryExecutor::execute`].
struct FnAttempt<F, Fut> {
    task: F,
    _future: PhantomData<Fut>,
}

#[async_trait]
impl<T, F, Fut> Attempt for FnAttempt<F, Fut>
where
    T: Send,
    F: FnMut(u32) -> Fut + Send,
    Fut: Future<Output = Result<T, TaskError>> + Send,
{
    type Output = T;

    async fn attempt(&mut self, attempt: u32) -> Result<T, TaskError> {
        (self.task)(attempt).await
    }
}

/// Runs tasks with a bounded number of attempts.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    max_attempts: u32,
    policy: BackoffPolicy,
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(max_attempts: u32, policy: BackoffPolicy, cancel: CancellationToken) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            policy,
            cancel,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `task` until it succeeds, fails terminally, or runs out of attempts.
    pub async fn run<A: Attempt>(&self, task: &mut A) -> Result<A::Output, FailureRecord> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match task.attempt(attempt).await {
                Ok(output) => return Ok(output),
                Err(e) => e,
            };
            if let Some(failure) = self.after_failure(attempt, error).await {
                return Err(failure);
            }
        }
    }

    /// Closure form of [`run`](Self::run) for tasks that borrow nothing mutably.
    pub async fn execute<T, F, Fut>(&self, task: F) -> Result<T, FailureRecord>
    where
        T: Send,
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T, TaskError>> + Send,
    {
        let mut task = FnAttempt {
            task,
            _future: PhantomData,
        };
        self.run(&mut task).await
    }

    /// Decide whether to stop; sleeps the backoff when another attempt follows.
    async fn after_failure(&self, attempt: u32, error: TaskError) -> Option<FailureRecord> {
        let failure = |cause| FailureRecord {
            attempts: attempt,
            last_error: error.message().to_string(),
            kind: error.kind(),
            cause,
        };

        if !error.is_retryable() {
            debug!("Attempt {} failed terminally: {}", attempt, error);
            return Some(failure(FailureCause::Terminal));
        }
        if attempt >= self.max_attempts {
            warn!("Giving up after {} attempts: {}", attempt, error);
            return Some(failure(FailureCause::Exhausted));
        }

        let delay = self.policy.delay(attempt);
        debug!(
            "Attempt {}/{} failed: {}; retrying in {:?}",
            attempt, self.max_attempts, error, delay
        );
        tokio::select! {
            _ = self.cancel.cancelled() => Some(failure(FailureCause::Cancelled)),
            _ = tokio::time::sleep(delay) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(max_attempts: u32) -> RetryExecutor {
        RetryExecutor::new(max_attempts, BackoffPolicy::None, CancellationToken::new())
    }

    #[test]
    fn linear_backoff_grows_with_attempts() {
        let policy = BackoffPolicy::Linear {
            base: Duration::from_secs(15),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(15));
        assert_eq!(policy.delay(3), Duration::from_secs(45));
    }

    #[test]
    fn exponential_backoff_is_capped_and_non_decreasing() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        let delays: Vec<_> = (1..=10).map(|a| policy.delay(a)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[3], Duration::from_millis(800));
        assert_eq!(delays[9], Duration::from_secs(1));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn always_failing_task_uses_exact_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = executor(4)
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TaskError::Retryable("timeout".into())) }
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(failure.attempts, 4);
        assert_eq!(failure.cause, FailureCause::Exhausted);
        assert_eq!(failure.last_error, "timeout");
    }

    #[tokio::test]
    async fn terminal_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = executor(5)
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TaskError::Terminal("HTTP 404".into())) }
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.cause, FailureCause::Terminal);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let result = executor(3)
            .execute(|attempt| async move {
                if attempt < 3 {
                    Err(TaskError::Retryable(format!("flaky {}", attempt)))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let executor = RetryExecutor::new(
            3,
            BackoffPolicy::Linear {
                base: Duration::from_secs(3600),
            },
            cancel.clone(),
        );
        cancel.cancel();

        let result: Result<(), _> = executor
            .execute(|_| async { Err(TaskError::Retryable("busy".into())) })
            .await;
        let failure = result.unwrap_err();
        assert_eq!(failure.cause, FailureCause::Cancelled);
        assert_eq!(failure.attempts, 1);
    }

    struct Counter {
        seen: Vec<u32>,
    }

    #[async_trait]
    impl Attempt for Counter {
        type Output = usize;

        async fn attempt(&mut self, attempt: u32) -> Result<usize, TaskError> {
            self.seen.push(attempt);
            if attempt == 2 {
                Ok(self.seen.len())
            } else {
                Err(TaskError::Retryable("again".into()))
            }
        }
    }

    #[tokio::test]
    async fn attempt_state_persists_between_attempts() {
        let mut task = Counter { seen: Vec::new() };
        assert_eq!(executor(3).run(&mut task).await, Ok(2));
        assert_eq!(task.seen, vec![1, 2]);
    }

    #[test]
    fn source_errors_map_to_task_errors() {
        let gone: TaskError = SourceError::Http {
            status: 410,
            url: "https://shop.test/p/1".into(),
        }
        .into();
        assert!(!gone.is_retryable());
        let missing: TaskError = SourceError::ElementNotFound("h1".into()).into();
        assert!(missing.is_retryable());
        assert_eq!(missing.kind(), FailureKind::Structural);
    }

    #[tokio::test]
    async fn failure_keeps_the_kind_of_the_last_error() {
        let result: Result<(), _> = executor(3)
            .execute(|attempt| async move {
                if attempt < 3 {
                    Err(TaskError::Retryable("timeout".into()))
                } else {
                    Err(TaskError::Structural("missing required fields: price".into()))
                }
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.cause, FailureCause::Exhausted);
        assert_eq!(failure.kind, FailureKind::Structural);
        assert_eq!(failure.attempts, 3);
    }
}
