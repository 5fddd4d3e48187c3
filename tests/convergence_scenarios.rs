//! Convergence against scripted listings.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use harvester::convergence::{AbortReason, Phase};
use harvester::source::{CounterProbe, FirstOf, ElementCountProbe};
use harvester::{
    Action, ConvergenceController, ConvergenceLimits, ConvergenceStatus, PageSource, ProgressProbe,
    ProgressSignal, Scroll, Snapshot, SourceError,
};

/// Replays readings in order, then repeats the last one.
struct Readings(Mutex<VecDeque<ProgressSignal>>);

impl Readings {
    fn new(readings: impl IntoIterator<Item = ProgressSignal>) -> Self {
        Self(Mutex::new(readings.into_iter().collect()))
    }
}

impl ProgressProbe for Readings {
    fn read(&self, _snapshot: &Snapshot) -> ProgressSignal {
        let mut queue = self.0.lock().unwrap();
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().copied().unwrap_or(ProgressSignal::NotFound)
        }
    }
}

fn counted(observed: u64, total: u64) -> ProgressSignal {
    ProgressSignal::Counted {
        observed,
        total: Some(total),
    }
}

/// A page that accepts every action and renders nothing interesting.
#[derive(Default)]
struct StaticPage {
    actions: Vec<Action>,
    load_more_present: bool,
}

#[async_trait]
impl PageSource for StaticPage {
    async fn navigate(&mut self, _address: &str) -> Result<(), SourceError> {
        Ok(())
    }

    async fn snapshot(&mut self) -> Result<Snapshot, SourceError> {
        Ok(Snapshot::new("https://shop.test/all", "<html><body></body></html>"))
    }

    async fn trigger(&mut self, action: &Action) -> Result<(), SourceError> {
        self.actions.push(action.clone());
        match action {
            Action::Click(selector) if !self.load_more_present => {
                Err(SourceError::ElementNotFound(selector.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn current_address(&mut self) -> Result<String, SourceError> {
        Ok("https://shop.test/all".to_string())
    }
}

/// An infinite-scroll listing that renders `batch` more items per scroll
/// and a "Showing X of Y" counter.
struct ScrollingListing {
    total: usize,
    rendered: usize,
    batch: usize,
}

#[async_trait]
impl PageSource for ScrollingListing {
    async fn navigate(&mut self, _address: &str) -> Result<(), SourceError> {
        self.rendered = self.batch.min(self.total);
        Ok(())
    }

    async fn snapshot(&mut self) -> Result<Snapshot, SourceError> {
        let mut html = format!(
            "<html><body><p class=\"count\">Showing {} of {} products</p><ul>",
            self.rendered, self.total
        );
        for i in 0..self.rendered {
            html.push_str(&format!("<li><a class=\"product\" href=\"/p/{}\">{}</a></li>", i, i));
        }
        html.push_str("</ul></body></html>");
        Ok(Snapshot::new("https://shop.test/all", html))
    }

    async fn trigger(&mut self, action: &Action) -> Result<(), SourceError> {
        if let Action::Scroll(_) = action {
            self.rendered = (self.rendered + self.batch).min(self.total);
        }
        Ok(())
    }

    async fn current_address(&mut self) -> Result<String, SourceError> {
        Ok("https://shop.test/all".to_string())
    }
}

fn limits(stall_threshold: u32) -> ConvergenceLimits {
    ConvergenceLimits {
        max_iterations: 200,
        stall_threshold,
        hard_timeout: Duration::from_secs(3600),
        settle_timeout: Duration::ZERO,
        scroll_steps: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn fifteen_flat_readings_trigger_exactly_one_recovery() {
    let mut readings = vec![counted(10, 40)];
    readings.extend(std::iter::repeat(counted(10, 40)).take(15));
    readings.push(counted(40, 40));
    let probe = Readings::new(readings);
    let controller = ConvergenceController::new(&probe, limits(15));
    let mut page = StaticPage::default();

    let mut recovering_at = Vec::new();
    let outcome = controller
        .run_observed(&mut page, &CancellationToken::new(), |state, phase| {
            if phase == Phase::Recovering {
                recovering_at.push((state.iteration, state.no_progress_streak));
            }
        })
        .await;

    assert!(outcome.is_done());
    assert_eq!(outcome.recoveries, 1);
    assert_eq!(recovering_at, vec![(15, 15)]);
    assert_eq!(outcome.observed, 40);
    assert_eq!(outcome.iterations, 16);

    // Recovery without a load-more control retreats, then jumps to the end.
    let retreat = page
        .actions
        .iter()
        .position(|a| *a == Action::Scroll(Scroll::ByViewport(-0.5)))
        .expect("recovery retreat");
    assert_eq!(page.actions[retreat + 1], Action::Scroll(Scroll::ToEnd));
}

#[tokio::test]
async fn fourteen_flat_readings_do_not_recover() {
    let mut readings = vec![counted(10, 40)];
    readings.extend(std::iter::repeat(counted(10, 40)).take(14));
    readings.push(counted(40, 40));
    let probe = Readings::new(readings);
    let controller = ConvergenceController::new(&probe, limits(15));
    let mut page = StaticPage::default();

    let outcome = controller.run(&mut page, &CancellationToken::new()).await;
    assert!(outcome.is_done());
    assert_eq!(outcome.recoveries, 0);
}

#[tokio::test]
async fn hard_timeout_keeps_the_observed_count() {
    let probe = Readings::new([counted(10, 100), counted(25, 100), counted(40, 100)]);
    let mut limits = limits(3);
    limits.hard_timeout = Duration::ZERO;
    let controller = ConvergenceController::new(&probe, limits);
    let mut page = StaticPage::default();

    let outcome = controller.run(&mut page, &CancellationToken::new()).await;

    assert_eq!(outcome.status, ConvergenceStatus::Aborted(AbortReason::HardTimeout));
    assert_eq!(outcome.observed, 40);
    assert_eq!(outcome.total, Some(100));
    assert_eq!(outcome.recoveries, 0);
    assert!(outcome.snapshot.is_some());
}

#[tokio::test]
async fn present_control_defers_the_hard_timeout_to_the_cap() {
    let probe = Readings::new([counted(10, 100)]);
    let mut limits = limits(3);
    limits.hard_timeout = Duration::ZERO;
    limits.max_iterations = 12;
    limits.load_more = Some("button.load-more".to_string());
    let controller = ConvergenceController::new(&probe, limits);
    let mut page = StaticPage {
        load_more_present: true,
        ..Default::default()
    };

    let outcome = controller.run(&mut page, &CancellationToken::new()).await;

    assert_eq!(outcome.status, ConvergenceStatus::Aborted(AbortReason::IterationCap));
    assert_eq!(outcome.iterations, 12);
    assert_eq!(outcome.recoveries, 4);
    assert_eq!(outcome.observed, 10);
}

#[tokio::test]
async fn missing_signal_still_terminates_within_the_cap() {
    let probe = Readings::new([ProgressSignal::NotFound]);
    let mut limits = limits(5);
    limits.max_iterations = 25;
    let controller = ConvergenceController::new(&probe, limits);
    let mut page = StaticPage::default();

    let outcome = controller.run(&mut page, &CancellationToken::new()).await;

    assert_eq!(outcome.status, ConvergenceStatus::Aborted(AbortReason::IterationCap));
    assert_eq!(outcome.iterations, 25);
    assert_eq!(outcome.observed, 0);
    assert_eq!(outcome.probe_misses, 26);
    assert_eq!(outcome.recoveries, 5);
}

#[tokio::test]
async fn cancellation_mid_run_returns_partial_progress() {
    let probe = Readings::new((1..=50).map(|n| counted(n * 2, 1000)));
    let controller = ConvergenceController::new(&probe, limits(5));
    let mut page = StaticPage::default();
    let cancel = CancellationToken::new();
    let trip = cancel.clone();

    let outcome = controller
        .run_observed(&mut page, &cancel, |state, phase| {
            if phase == Phase::Checking && state.iteration == 6 {
                trip.cancel();
            }
        })
        .await;

    assert_eq!(outcome.status, ConvergenceStatus::Aborted(AbortReason::Cancelled));
    assert_eq!(outcome.iterations, 6);
    assert_eq!(outcome.observed, 14);
}

#[tokio::test]
async fn scrolling_listing_converges_on_its_counter() {
    let probe = FirstOf(vec![
        Box::new(CounterProbe::new(Some("p.count"), None).unwrap()),
        Box::new(ElementCountProbe::new("a.product").unwrap()),
    ]);
    let controller = ConvergenceController::new(&probe, limits(5));
    let mut page = ScrollingListing {
        total: 95,
        rendered: 0,
        batch: 24,
    };
    page.navigate("https://shop.test/all").await.unwrap();

    let outcome = controller.run(&mut page, &CancellationToken::new()).await;

    assert!(outcome.is_done());
    assert_eq!(outcome.observed, 95);
    assert_eq!(outcome.total, Some(95));
    assert_eq!(outcome.iterations, 3);
    let snapshot = outcome.snapshot.unwrap();
    assert!(snapshot.content.contains("/p/94"));
}

#[tokio::test]
async fn element_count_alone_stalls_out_without_a_total() {
    let probe = ElementCountProbe::new("a.product").unwrap();
    let mut limits = limits(3);
    limits.hard_timeout = Duration::ZERO;
    let controller = ConvergenceController::new(&probe, limits);
    let mut page = ScrollingListing {
        total: 30,
        rendered: 0,
        batch: 10,
    };
    page.navigate("https://shop.test/all").await.unwrap();

    let outcome = controller.run(&mut page, &CancellationToken::new()).await;

    // No total is ever reported, so the listing can only stop by stalling.
    assert_eq!(outcome.status, ConvergenceStatus::Aborted(AbortReason::HardTimeout));
    assert_eq!(outcome.observed, 30);
    assert_eq!(outcome.total, None);
}
