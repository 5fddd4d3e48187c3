//! Static page source: one GET per navigation, no client-side rendering.

use async_trait::async_trait;
use scraper::Selector;

use super::{Action, PageSource, Snapshot, SourceError};
use crate::http_client::HttpClient;

/// Serves server-rendered pages. Scrolling is a no-op because the whole
/// document is already present; clicks and scripts are unsupported.
pub struct HttpPageSource {
    client: HttpClient,
    current: Option<Snapshot>,
}

impl HttpPageSource {
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            current: None,
        }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn navigate(&mut self, address: &str) -> Result<(), SourceError> {
        self.current = None;
        let fetched = self.client.get(address).await?;
        self.current = Some(Snapshot::new(fetched.final_url.clone(), fetched.text()));
        Ok(())
    }

    async fn snapshot(&mut self) -> Result<Snapshot, SourceError> {
        self.current
            .clone()
            .ok_or_else(|| SourceError::Render("no page loaded".to_string()))
    }

    async fn trigger(&mut self, action: &Action) -> Result<(), SourceError> {
        match action {
            Action::Scroll(_) => Ok(()),
            Action::Click(selector) => {
                let present = match (&self.current, Selector::parse(selector)) {
                    (Some(snapshot), Ok(parsed)) => snapshot.contains(&parsed),
                    _ => false,
                };
                if present {
                    Err(SourceError::Unsupported(format!("click on {}", selector)))
                } else {
                    Err(SourceError::ElementNotFound(selector.clone()))
                }
            }
            Action::Evaluate(_) => Err(SourceError::Unsupported("script evaluation".to_string())),
        }
    }

    async fn current_address(&mut self) -> Result<String, SourceError> {
        self.current
            .as_ref()
            .map(|s| s.address.clone())
            .ok_or_else(|| SourceError::Render("no page loaded".to_string()))
    }

    fn is_dynamic(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Scroll;
    use std::time::Duration;

    fn source() -> HttpPageSource {
        HttpPageSource::new(HttpClient::new(Duration::from_secs(5), None).unwrap())
    }

    #[tokio::test]
    async fn nothing_loaded_is_a_render_error() {
        let mut source = source();
        assert!(matches!(source.snapshot().await, Err(SourceError::Render(_))));
        assert!(matches!(
            source.current_address().await,
            Err(SourceError::Render(_))
        ));
    }

    #[tokio::test]
    async fn clicks_report_missing_or_unsupported() {
        let mut source = source();
        source.current = Some(Snapshot::new(
            "https://shop.test/c",
            "<button class='more'>More</button>",
        ));

        let missing = source
            .trigger(&Action::Click(".next".into()))
            .await
            .unwrap_err();
        assert!(matches!(missing, SourceError::ElementNotFound(_)));

        let present = source
            .trigger(&Action::Click("button.more".into()))
            .await
            .unwrap_err();
        assert!(matches!(present, SourceError::Unsupported(_)));

        source
            .trigger(&Action::Scroll(Scroll::ToEnd))
            .await
            .unwrap();
        assert!(!source.is_dynamic());
    }
}
