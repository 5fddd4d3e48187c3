//! HTTP client used for static pages and asset downloads.

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::error::FailureKind;
use crate::source::SourceError;

/// Sent when no user agent is configured.
pub const USER_AGENT: &str = concat!("harvester/", env!("CARGO_PKG_VERSION"));

/// Configured user agent, or [`USER_AGENT`].
pub fn resolve_user_agent(configured: Option<&str>) -> String {
    configured
        .map(str::trim)
        .filter(|ua| !ua.is_empty())
        .unwrap_or(USER_AGENT)
        .to_string()
}

/// Classify an HTTP status code.
///
/// 404/410 mean the resource is gone and retrying will not help; 429 and 5xx
/// are worth another attempt; other client errors are terminal.
pub fn classify_status(status: u16) -> FailureKind {
    match status {
        408 | 425 | 429 => FailureKind::Transient,
        500..=599 => FailureKind::Transient,
        400..=499 => FailureKind::Terminal,
        _ => FailureKind::Transient,
    }
}

/// Body of a successful GET.
#[derive(Debug, Clone)]
pub struct Fetched {
    /// Address after redirects.
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Fetched {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Thin wrapper around a `reqwest::Client` that maps failures to [`SourceError`].
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    timeout: Duration,
    referer: Option<String>,
}

impl HttpClient {
    /// Create a client. `user_agent` follows [`resolve_user_agent`].
    pub fn new(timeout: Duration, user_agent: Option<&str>) -> Result<Self, SourceError> {
        let client = Client::builder()
            .user_agent(resolve_user_agent(user_agent))
            .timeout(timeout)
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| SourceError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            timeout,
            referer: None,
        })
    }

    /// Set the Referer header for requests.
    pub fn with_referer(mut self, referer: Option<String>) -> Self {
        self.referer = referer;
        self
    }

    /// GET `url`; non-success statuses become [`SourceError::Http`].
    pub async fn get(&self, url: &str) -> Result<Fetched, SourceError> {
        let mut request = self.client.get(url);
        if let Some(ref referer) = self.referer {
            request = request.header("Referer", referer);
        }

        let response = request.send().await.map_err(|e| self.map_error(url, e))?;
        let status = response.status();
        debug!("GET {} -> {}", url, status);

        if !status.is_success() {
            return Err(SourceError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_error(url, e))?
            .to_vec();

        Ok(Fetched {
            final_url,
            content_type,
            body,
        })
    }

    fn map_error(&self, url: &str, e: reqwest::Error) -> SourceError {
        if e.is_timeout() {
            SourceError::Timeout(self.timeout)
        } else if let Some(status) = e.status() {
            SourceError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            }
        } else if e.is_builder() {
            SourceError::Navigation {
                address: url.to_string(),
                reason: format!("invalid request: {}", e),
            }
        } else {
            SourceError::Navigation {
                address: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}
