//! Page source abstraction.
//!
//! A [`PageSource`] is a renderable surface (a browser tab, or a plain HTTP
//! fetch for static pages). Everything site-specific lives behind it and
//! behind [`ProgressProbe`]; the convergence, retry and pool logic never see
//! selectors directly.

#[cfg(feature = "browser")]
pub mod browser;
pub mod factory;
pub mod http;
pub mod probe;

use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use thiserror::Error;
use tokio::time::Instant;

use crate::error::FailureKind;
use crate::http_client::classify_status;

pub use factory::SourceFactory;
pub use probe::{CounterProbe, ElementCountProbe, FirstOf, ProgressProbe, ProgressSignal};

/// Boxed source as owned by a single worker.
pub type BoxedSource = Box<dyn PageSource>;

/// Rendered page state at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Address the content was rendered from (after redirects).
    pub address: String,
    /// Serialized markup.
    pub content: String,
}

impl Snapshot {
    pub fn new(address: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            content: content.into(),
        }
    }

    /// Parse the markup. `Html` is not `Send`; keep it out of `.await` scopes.
    pub fn document(&self) -> Html {
        Html::parse_document(&self.content)
    }

    /// Whether at least one element matches `selector`.
    pub fn contains(&self, selector: &Selector) -> bool {
        self.document().select(selector).next().is_some()
    }
}

/// Scroll movement, relative to the viewport height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scroll {
    /// Move by a fraction of the viewport; negative values scroll up.
    ByViewport(f32),
    /// Jump to the bottom of the document.
    ToEnd,
}

/// Interaction a source can perform on the current page.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Scroll(Scroll),
    /// Click the first element matching a CSS selector.
    Click(String),
    /// Run a script in the page (e.g. set a localStorage flag).
    Evaluate(String),
}

/// Failures reported by a page source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("navigation to {address} failed: {reason}")]
    Navigation { address: String, reason: String },
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP {status} for {url}")]
    Http { status: u16, url: String },
    #[error("action not supported by this source: {0}")]
    Unsupported(String),
    #[error("render error: {0}")]
    Render(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

impl SourceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SourceError::Navigation { .. } => FailureKind::Transient,
            SourceError::ElementNotFound(_) => FailureKind::Structural,
            SourceError::Timeout(_) => FailureKind::Transient,
            SourceError::Http { status, .. } => classify_status(*status),
            SourceError::Unsupported(_) => FailureKind::Structural,
            SourceError::Render(_) => FailureKind::Transient,
            SourceError::Unavailable(_) => FailureKind::Transient,
        }
    }
}

/// A renderable surface owned by exactly one worker at a time.
#[async_trait]
pub trait PageSource: Send {
    /// Load `address`, replacing the current page.
    async fn navigate(&mut self, address: &str) -> Result<(), SourceError>;

    /// Capture the current rendered state.
    async fn snapshot(&mut self) -> Result<Snapshot, SourceError>;

    /// Perform an interaction. Fails with `ElementNotFound` when a click
    /// target is absent.
    async fn trigger(&mut self, action: &Action) -> Result<(), SourceError>;

    async fn current_address(&mut self) -> Result<String, SourceError>;

    /// Whether content loads client-side (scrolling can reveal more).
    fn is_dynamic(&self) -> bool {
        true
    }

    /// Release underlying resources. Called by the pool before dropping.
    async fn close(&mut self) {}
}

/// Poll snapshots until `ready` accepts one or `timeout` elapses.
///
/// Snapshot failures are returned immediately; an unmet condition after
/// `timeout` yields [`SourceError::Timeout`].
pub async fn wait_for<F>(
    source: &mut dyn PageSource,
    timeout: Duration,
    poll: Duration,
    mut ready: F,
) -> Result<Snapshot, SourceError>
where
    F: FnMut(&Snapshot) -> bool + Send,
{
    let deadline = Instant::now() + timeout;
    loop {
        let snapshot = source.snapshot().await?;
        if ready(&snapshot) {
            return Ok(snapshot);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(SourceError::Timeout(timeout));
        }
        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}

/// Navigate, then run the page-preparation hooks (init script, dismissals).
///
/// Hook failures are logged and ignored: a popup that is not there is fine.
pub async fn open_page(
    source: &mut dyn PageSource,
    address: &str,
    init_script: Option<&str>,
    dismiss: &[String],
) -> Result<(), SourceError> {
    source.navigate(address).await?;

    if let Some(script) = init_script {
        if let Err(e) = source.trigger(&Action::Evaluate(script.to_string())).await {
            tracing::debug!("Init script skipped on {}: {}", address, e);
        }
    }

    for selector in dismiss {
        match source.trigger(&Action::Click(selector.clone())).await {
            Ok(()) => tracing::debug!("Dismissed {} on {}", selector, address),
            Err(SourceError::ElementNotFound(_)) | Err(SourceError::Unsupported(_)) => {}
            Err(e) => tracing::debug!("Dismiss {} failed on {}: {}", selector, address, e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Renders a growing list: each snapshot adds one `<li>`.
    struct Growing {
        items: usize,
        clicks: Vec<String>,
    }

    #[async_trait]
    impl PageSource for Growing {
        async fn navigate(&mut self, _address: &str) -> Result<(), SourceError> {
            self.items = 0;
            Ok(())
        }

        async fn snapshot(&mut self) -> Result<Snapshot, SourceError> {
            self.items += 1;
            let lis = "<li>x</li>".repeat(self.items);
            Ok(Snapshot::new("https://shop.test/list", format!("<ul>{}</ul>", lis)))
        }

        async fn trigger(&mut self, action: &Action) -> Result<(), SourceError> {
            match action {
                Action::Click(sel) if sel == ".close" => {
                    self.clicks.push(sel.clone());
                    Ok(())
                }
                Action::Click(sel) => Err(SourceError::ElementNotFound(sel.clone())),
                _ => Ok(()),
            }
        }

        async fn current_address(&mut self) -> Result<String, SourceError> {
            Ok("https://shop.test/list".to_string())
        }
    }

    #[tokio::test]
    async fn wait_for_returns_first_matching_snapshot() {
        let mut source = Growing { items: 0, clicks: vec![] };
        let third = Selector::parse("li:nth-child(3)").unwrap();
        let snapshot = wait_for(
            &mut source,
            Duration::from_secs(2),
            Duration::from_millis(1),
            |s| s.contains(&third),
        )
        .await
        .unwrap();
        assert_eq!(snapshot.content.matches("<li>").count(), 3);
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let mut source = Growing { items: 0, clicks: vec![] };
        let err = wait_for(
            &mut source,
            Duration::from_millis(20),
            Duration::from_millis(5),
            |_| false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SourceError::Timeout(_)));
        assert_eq!(err.kind(), FailureKind::Transient);
    }

    #[tokio::test]
    async fn open_page_ignores_missing_popups() {
        let mut source = Growing { items: 3, clicks: vec![] };
        open_page(
            &mut source,
            "https://shop.test/list",
            Some("localStorage.setItem('x','1')"),
            &[".close".to_string(), ".newsletter".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(source.items, 0);
        assert_eq!(source.clicks, vec![".close".to_string()]);
    }

    #[test]
    fn http_status_errors_are_classified() {
        let gone = SourceError::Http {
            status: 404,
            url: "https://shop.test/a".into(),
        };
        let limited = SourceError::Http {
            status: 429,
            url: "https://shop.test/a".into(),
        };
        assert_eq!(gone.kind(), FailureKind::Terminal);
        assert_eq!(limited.kind(), FailureKind::Transient);
    }
}
