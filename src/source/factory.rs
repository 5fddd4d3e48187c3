//! Builds page sources for pool workers.

use async_trait::async_trait;
use tracing::debug;

use super::http::HttpPageSource;
use super::{BoxedSource, SourceError};
use crate::config::{BrowserConfig, HarvestConfig, HttpConfig, SourceKind};
use crate::error::HarvestError;
use crate::http_client::HttpClient;
use crate::pool::ResourceFactory;

/// Creates one fresh source per call; nothing is shared between sources.
#[derive(Debug, Clone)]
pub struct SourceFactory {
    kind: SourceKind,
    browser: BrowserConfig,
    http: HttpConfig,
}

impl SourceFactory {
    pub fn new(kind: SourceKind, browser: BrowserConfig, http: HttpConfig) -> Self {
        Self {
            kind,
            browser,
            http,
        }
    }

    pub fn from_config(config: &HarvestConfig) -> Self {
        Self::new(
            config.source.kind,
            config.browser.clone(),
            config.http.clone(),
        )
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub async fn create(&self, worker_id: usize) -> Result<BoxedSource, SourceError> {
        debug!("Creating {:?} source for worker {}", self.kind, worker_id);
        match self.kind {
            SourceKind::Http => {
                let client = HttpClient::new(self.http.timeout(), self.http.user_agent.as_deref())?
                    .with_referer(self.http.referer.clone());
                Ok(Box::new(HttpPageSource::new(client)))
            }
            SourceKind::Browser => self.create_browser().await,
        }
    }

    #[cfg(feature = "browser")]
    async fn create_browser(&self) -> Result<BoxedSource, SourceError> {
        let source = super::browser::ChromiumPageSource::start(&self.browser).await?;
        Ok(Box::new(source))
    }

    #[cfg(not(feature = "browser"))]
    async fn create_browser(&self) -> Result<BoxedSource, SourceError> {
        let _ = &self.browser;
        Err(SourceError::Unavailable(
            "browser support not compiled in (enable the 'browser' feature)".to_string(),
        ))
    }
}

#[async_trait]
impl ResourceFactory for SourceFactory {
    type Resource = BoxedSource;

    async fn create(&self, worker_id: usize) -> Result<BoxedSource, HarvestError> {
        SourceFactory::create(self, worker_id)
            .await
            .map_err(|e| HarvestError::ResourceUnavailable(e.to_string()))
    }

    async fn release(&self, mut resource: BoxedSource) {
        resource.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn http_kind_creates_a_static_source() {
        let factory = SourceFactory::new(
            SourceKind::Http,
            BrowserConfig::default(),
            HttpConfig::default(),
        );
        let source = SourceFactory::create(&factory, 0).await.unwrap();
        assert!(!source.is_dynamic());
    }
}
