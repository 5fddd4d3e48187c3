//! Drives a lazily-loaded listing until everything is rendered.
//!
//! The controller only knows two things about a page: how to advance it
//! (scroll, or click a "load more" control) and how much is loaded (via a
//! [`ProgressProbe`]). Progress is measured after every advance; a run of
//! readings without progress triggers one recovery action, and the loop
//! ends on completion, the iteration cap, cancellation, or a hard timeout
//! once the page has stalled with no advance control left.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::source::{Action, PageSource, ProgressProbe, ProgressSignal, Scroll, Snapshot, SourceError};

/// Limits and advance strategy for one convergence run.
#[derive(Debug, Clone)]
pub struct ConvergenceLimits {
    pub max_iterations: u32,
    pub stall_threshold: u32,
    pub hard_timeout: Duration,
    /// Upper bound for a single advance action.
    pub step_timeout: Duration,
    /// How long to poll for progress after an advance. Zero reads once.
    pub settle_timeout: Duration,
    pub poll_interval: Duration,
    pub scroll_steps: u32,
    pub scroll_fraction: f32,
    pub retreat_fraction: f32,
    /// Primary advance control. Scrolling is used when absent.
    pub load_more: Option<String>,
}

impl Default for ConvergenceLimits {
    fn default() -> Self {
        Self {
            max_iterations: 400,
            stall_threshold: 15,
            hard_timeout: Duration::from_secs(300),
            step_timeout: Duration::from_secs(30),
            settle_timeout: Duration::from_millis(1500),
            poll_interval: Duration::from_millis(250),
            scroll_steps: 10,
            scroll_fraction: 0.8,
            retreat_fraction: 0.5,
            load_more: None,
        }
    }
}

/// Controller state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Loading,
    Checking,
    Advancing,
    Recovering,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    IterationCap,
    /// Stalled past the hard timeout with no advance control on the page.
    HardTimeout,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Observed count reached the reported total.
    Done,
    /// Stopped early; whatever was observed is still returned.
    Aborted(AbortReason),
}

/// Live state of one run, handed to observers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergenceState {
    pub observed_count: u64,
    pub total_count: Option<u64>,
    pub no_progress_streak: u32,
    pub elapsed: Duration,
    pub iteration: u32,
}

impl ConvergenceState {
    fn is_exhausted(&self) -> bool {
        matches!(self.total_count, Some(total) if self.observed_count >= total)
    }
}

/// Result of a convergence run.
#[derive(Debug, Clone)]
pub struct ConvergenceOutcome {
    pub status: ConvergenceStatus,
    pub observed: u64,
    pub total: Option<u64>,
    pub iterations: u32,
    pub recoveries: u32,
    /// Readings where the probe found no signal at all.
    pub probe_misses: u32,
    pub elapsed: Duration,
    /// Last snapshot taken, if any succeeded.
    pub snapshot: Option<Snapshot>,
}

impl ConvergenceOutcome {
    pub fn is_done(&self) -> bool {
        self.status == ConvergenceStatus::Done
    }
}

/// Reading taken after an advance.
enum Reading {
    Signal(ProgressSignal),
    /// The snapshot itself failed; nothing could be read.
    Unreadable,
}

pub struct ConvergenceController<'a> {
    probe: &'a dyn ProgressProbe,
    limits: ConvergenceLimits,
}

impl<'a> ConvergenceController<'a> {
    pub fn new(probe: &'a dyn ProgressProbe, limits: ConvergenceLimits) -> Self {
        Self { probe, limits }
    }

    pub fn limits(&self) -> &ConvergenceLimits {
        &self.limits
    }

    /// Converge the page currently loaded in `source`.
    pub async fn run(
        &self,
        source: &mut dyn PageSource,
        cancel: &CancellationToken,
    ) -> ConvergenceOutcome {
        self.run_observed(source, cancel, |_, _| {}).await
    }

    /// Like [`run`](Self::run), reporting every phase transition to `observe`.
    pub async fn run_observed<F>(
        &self,
        source: &mut dyn PageSource,
        cancel: &CancellationToken,
        mut observe: F,
    ) -> ConvergenceOutcome
    where
        F: FnMut(&ConvergenceState, Phase) + Send,
    {
        let started = Instant::now();
        let mut state = ConvergenceState::default();
        let mut snapshot = None;
        let mut recoveries = 0;
        let mut probe_misses = 0;

        observe(&state, Phase::Loading);
        match self.read(source, &mut snapshot).await {
            Reading::Signal(ProgressSignal::Counted { observed, total }) => {
                state.observed_count = observed;
                state.total_count = total;
            }
            Reading::Signal(ProgressSignal::NotFound) => probe_misses += 1,
            Reading::Unreadable => {}
        }

        let status = loop {
            state.elapsed = started.elapsed();
            observe(&state, Phase::Checking);

            if state.is_exhausted() {
                break ConvergenceStatus::Done;
            }
            if cancel.is_cancelled() {
                break ConvergenceStatus::Aborted(AbortReason::Cancelled);
            }
            if state.iteration >= self.limits.max_iterations {
                warn!(
                    "Convergence hit iteration cap ({}) at {} items",
                    self.limits.max_iterations, state.observed_count
                );
                break ConvergenceStatus::Aborted(AbortReason::IterationCap);
            }

            state.iteration += 1;
            observe(&state, Phase::Advancing);
            let control_present = tokio::select! {
                _ = cancel.cancelled() => break ConvergenceStatus::Aborted(AbortReason::Cancelled),
                present = self.advance_bounded(source) => present,
            };

            let reading = tokio::select! {
                _ = cancel.cancelled() => break ConvergenceStatus::Aborted(AbortReason::Cancelled),
                reading = self.settle(source, state.observed_count, &mut snapshot) => reading,
            };

            match reading {
                Reading::Signal(ProgressSignal::Counted { observed, total }) => {
                    if total.is_some() {
                        state.total_count = total;
                    }
                    if observed > state.observed_count {
                        state.observed_count = observed;
                        state.no_progress_streak = 0;
                    } else {
                        state.no_progress_streak += 1;
                    }
                }
                Reading::Signal(ProgressSignal::NotFound) => {
                    probe_misses += 1;
                    warn!(
                        "Progress signal not found on iteration {}; counting as no progress",
                        state.iteration
                    );
                    state.no_progress_streak += 1;
                }
                Reading::Unreadable => state.no_progress_streak += 1,
            }

            state.elapsed = started.elapsed();
            if state.is_exhausted() {
                continue;
            }

            if state.no_progress_streak >= self.limits.stall_threshold {
                if state.elapsed > self.limits.hard_timeout && !control_present {
                    info!(
                        "Stalled at {} items after {:?} with no advance control; stopping",
                        state.observed_count, state.elapsed
                    );
                    break ConvergenceStatus::Aborted(AbortReason::HardTimeout);
                }

                observe(&state, Phase::Recovering);
                debug!(
                    "No progress for {} readings at {} items; recovering",
                    state.no_progress_streak, state.observed_count
                );
                self.recover(source, control_present).await;
                recoveries += 1;
                state.no_progress_streak = 0;
            }
        };

        state.elapsed = started.elapsed();
        let phase = match status {
            ConvergenceStatus::Done => Phase::Done,
            ConvergenceStatus::Aborted(_) => Phase::Aborted,
        };
        observe(&state, phase);

        info!(
            "Convergence {:?}: {} of {} after {} iterations ({} recoveries, {} probe misses)",
            status,
            state.observed_count,
            state
                .total_count
                .map(|t| t.to_string())
                .unwrap_or_else(|| "?".to_string()),
            state.iteration,
            recoveries,
            probe_misses
        );

        ConvergenceOutcome {
            status,
            observed: state.observed_count,
            total: state.total_count,
            iterations: state.iteration,
            recoveries,
            probe_misses,
            elapsed: state.elapsed,
            snapshot,
        }
    }

    /// Advance within the step timeout. Returns whether the primary advance
    /// control was found.
    async fn advance_bounded(&self, source: &mut dyn PageSource) -> bool {
        match tokio::time::timeout(self.limits.step_timeout, self.advance(source)).await {
            Ok(present) => present,
            Err(_) => {
                debug!("Advance timed out after {:?}", self.limits.step_timeout);
                false
            }
        }
    }

    async fn advance(&self, source: &mut dyn PageSource) -> bool {
        if let Some(ref selector) = self.limits.load_more {
            match source.trigger(&Action::Click(selector.clone())).await {
                Ok(()) => return true,
                Err(SourceError::ElementNotFound(_)) => {}
                Err(e) => debug!("Load-more click failed: {}", e),
            }
        }

        for _ in 0..self.limits.scroll_steps.max(1) {
            let step = Action::Scroll(Scroll::ByViewport(self.limits.scroll_fraction));
            if let Err(e) = source.trigger(&step).await {
                debug!("Scroll failed: {}", e);
                break;
            }
        }
        false
    }

    /// Re-trigger the advance control, or scroll back partway and then to
    /// the end to nudge lazy loaders.
    async fn recover(&self, source: &mut dyn PageSource, control_present: bool) {
        let actions = match (&self.limits.load_more, control_present) {
            (Some(selector), true) => vec![Action::Click(selector.clone())],
            _ => vec![
                Action::Scroll(Scroll::ByViewport(-self.limits.retreat_fraction)),
                Action::Scroll(Scroll::ToEnd),
            ],
        };

        let recovery = async {
            for action in &actions {
                if let Err(e) = source.trigger(action).await {
                    debug!("Recovery action {:?} failed: {}", action, e);
                }
            }
        };
        if tokio::time::timeout(self.limits.step_timeout, recovery)
            .await
            .is_err()
        {
            debug!("Recovery timed out after {:?}", self.limits.step_timeout);
        }
    }

    /// Poll until the probe shows more than `baseline`, or the settle
    /// timeout passes. Returns the last reading.
    async fn settle(
        &self,
        source: &mut dyn PageSource,
        baseline: u64,
        snapshot: &mut Option<Snapshot>,
    ) -> Reading {
        let deadline = Instant::now() + self.limits.settle_timeout;
        loop {
            let reading = self.read(source, snapshot).await;
            if let Reading::Signal(signal) = reading {
                if signal.observed().is_some_and(|n| n > baseline) {
                    return reading;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return reading;
            }
            tokio::time::sleep(self.limits.poll_interval.min(deadline - now)).await;
        }
    }

    async fn read(&self, source: &mut dyn PageSource, last: &mut Option<Snapshot>) -> Reading {
        match source.snapshot().await {
            Ok(snapshot) => {
                let signal = self.probe.read(&snapshot);
                *last = Some(snapshot);
                Reading::Signal(signal)
            }
            Err(e) => {
                debug!("Snapshot failed during convergence: {}", e);
                Reading::Unreadable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Pops one scripted signal per read; repeats the last one when exhausted.
    struct Script(Mutex<VecDeque<ProgressSignal>>);

    impl Script {
        fn counted(readings: &[(u64, Option<u64>)]) -> Self {
            Self(Mutex::new(
                readings
                    .iter()
                    .map(|&(observed, total)| ProgressSignal::Counted { observed, total })
                    .collect(),
            ))
        }
    }

    impl ProgressProbe for Script {
        fn read(&self, _snapshot: &Snapshot) -> ProgressSignal {
            let mut queue = self.0.lock().unwrap();
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().copied().unwrap_or(ProgressSignal::NotFound)
            }
        }
    }

    #[derive(Default)]
    struct Page {
        actions: Vec<Action>,
        load_more_present: bool,
    }

    #[async_trait]
    impl PageSource for Page {
        async fn navigate(&mut self, _address: &str) -> Result<(), SourceError> {
            Ok(())
        }

        async fn snapshot(&mut self) -> Result<Snapshot, SourceError> {
            Ok(Snapshot::new("https://shop.test/c", "<html></html>"))
        }

        async fn trigger(&mut self, action: &Action) -> Result<(), SourceError> {
            self.actions.push(action.clone());
            match action {
                Action::Click(sel) if !self.load_more_present => {
                    Err(SourceError::ElementNotFound(sel.clone()))
                }
                _ => Ok(()),
            }
        }

        async fn current_address(&mut self) -> Result<String, SourceError> {
            Ok("https://shop.test/c".into())
        }
    }

    fn limits(stall_threshold: u32) -> ConvergenceLimits {
        ConvergenceLimits {
            max_iterations: 100,
            stall_threshold,
            hard_timeout: Duration::from_secs(3600),
            settle_timeout: Duration::ZERO,
            scroll_steps: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn reaches_done_when_total_observed() {
        let probe = Script::counted(&[(0, Some(30)), (10, Some(30)), (20, Some(30)), (30, Some(30))]);
        let controller = ConvergenceController::new(&probe, limits(5));
        let mut page = Page::default();

        let outcome = controller.run(&mut page, &CancellationToken::new()).await;

        assert!(outcome.is_done());
        assert_eq!(outcome.observed, 30);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.recoveries, 0);
        assert!(outcome.snapshot.is_some());
    }

    #[tokio::test]
    async fn already_complete_page_needs_no_iterations() {
        let probe = Script::counted(&[(12, Some(12))]);
        let controller = ConvergenceController::new(&probe, limits(5));
        let mut page = Page::default();

        let outcome = controller.run(&mut page, &CancellationToken::new()).await;
        assert!(outcome.is_done());
        assert_eq!(outcome.iterations, 0);
        assert!(page.actions.is_empty());
    }

    #[tokio::test]
    async fn streak_resets_on_progress_before_threshold() {
        // threshold 4: three flat readings, then progress, then done.
        let probe = Script::counted(&[
            (5, Some(9)),
            (5, Some(9)),
            (5, Some(9)),
            (5, Some(9)),
            (7, Some(9)),
            (9, Some(9)),
        ]);
        let controller = ConvergenceController::new(&probe, limits(4));
        let mut page = Page::default();
        let mut streaks = Vec::new();

        let outcome = controller
            .run_observed(&mut page, &CancellationToken::new(), |state, phase| {
                if phase == Phase::Checking {
                    streaks.push(state.no_progress_streak);
                }
            })
            .await;

        assert!(outcome.is_done());
        assert_eq!(outcome.recoveries, 0);
        assert_eq!(streaks, vec![0, 1, 2, 3, 0, 0]);
    }

    #[tokio::test]
    async fn observed_count_never_decreases() {
        let probe = Script::counted(&[(10, None), (25, None), (18, None), (30, Some(30))]);
        let controller = ConvergenceController::new(&probe, limits(5));
        let mut page = Page::default();
        let mut seen = Vec::new();

        controller
            .run_observed(&mut page, &CancellationToken::new(), |state, _| {
                seen.push(state.observed_count)
            })
            .await;

        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn missing_signal_counts_as_no_progress() {
        let probe = Script(Mutex::new(VecDeque::from(vec![
            ProgressSignal::Counted { observed: 4, total: Some(8) },
            ProgressSignal::NotFound,
            ProgressSignal::NotFound,
            ProgressSignal::Counted { observed: 8, total: Some(8) },
        ])));
        let controller = ConvergenceController::new(&probe, limits(5));
        let mut page = Page::default();

        let outcome = controller.run(&mut page, &CancellationToken::new()).await;
        assert!(outcome.is_done());
        assert_eq!(outcome.probe_misses, 2);
    }

    #[tokio::test]
    async fn iteration_cap_aborts_with_last_count() {
        let probe = Script::counted(&[(3, None)]);
        let mut limits = limits(1000);
        limits.max_iterations = 7;
        let controller = ConvergenceController::new(&probe, limits);
        let mut page = Page::default();

        let outcome = controller.run(&mut page, &CancellationToken::new()).await;
        assert_eq!(outcome.status, ConvergenceStatus::Aborted(AbortReason::IterationCap));
        assert_eq!(outcome.iterations, 7);
        assert_eq!(outcome.observed, 3);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_advancing() {
        let probe = Script::counted(&[(1, None)]);
        let controller = ConvergenceController::new(&probe, limits(3));
        let mut page = Page::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = controller.run(&mut page, &cancel).await;
        assert_eq!(outcome.status, ConvergenceStatus::Aborted(AbortReason::Cancelled));
        assert!(page.actions.is_empty());
    }

    #[tokio::test]
    async fn recovery_clicks_load_more_when_present() {
        let probe = Script::counted(&[(5, Some(50)), (5, Some(50)), (5, Some(50)), (50, Some(50))]);
        let mut limits = limits(2);
        limits.load_more = Some("button.more".into());
        let controller = ConvergenceController::new(&probe, limits);
        let mut page = Page {
            load_more_present: true,
            ..Default::default()
        };

        let outcome = controller.run(&mut page, &CancellationToken::new()).await;
        assert!(outcome.is_done());
        assert_eq!(outcome.recoveries, 1);
        assert!(page
            .actions
            .iter()
            .all(|a| *a == Action::Click("button.more".into())));
    }

    #[tokio::test]
    async fn recovery_oscillates_without_control() {
        let probe = Script::counted(&[(5, Some(50)), (5, Some(50)), (5, Some(50)), (50, Some(50))]);
        let controller = ConvergenceController::new(&probe, limits(2));
        let mut page = Page::default();

        let outcome = controller.run(&mut page, &CancellationToken::new()).await;
        assert_eq!(outcome.recoveries, 1);
        let retreat = page
            .actions
            .iter()
            .position(|a| *a == Action::Scroll(Scroll::ByViewport(-0.5)))
            .unwrap();
        assert_eq!(page.actions[retreat + 1], Action::Scroll(Scroll::ToEnd));
    }
}
