//! Chromium page source over the DevTools protocol.
//!
//! Each source owns one browser (launched, or connected to a remote
//! DevTools endpoint) and a single tab. Workers never share a source.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::handler::HandlerConfig;
use chromiumoxide::{Browser, BrowserConfig as LaunchConfig, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Action, PageSource, Scroll, Snapshot, SourceError};
use crate::config::BrowserConfig;

/// Common Chrome executable paths to check.
const CHROME_PATHS: &[&str] = &[
    // Linux
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    // macOS
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/opt/google/chrome/google-chrome",
];

/// Resolves once the document is interactive (or after 10s).
const WAIT_FOR_READY_SCRIPT: &str = r#"
    new Promise((resolve) => {
        if (document.readyState === 'complete' || document.readyState === 'interactive') {
            resolve(document.readyState);
        } else {
            document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
            setTimeout(() => resolve('timeout'), 10000);
        }
    })
"#;

/// A browser tab driven for one worker.
pub struct ChromiumPageSource {
    browser: Browser,
    page: Option<Page>,
    handler: JoinHandle<()>,
    timeout: Duration,
    /// Remote browsers are shared infrastructure; only our tab is closed.
    remote: bool,
    /// Keeps the launched browser's profile directory alive.
    _profile: Option<tempfile::TempDir>,
}

impl ChromiumPageSource {
    /// Launch a browser, or connect to `remote_url` when configured.
    pub async fn start(config: &BrowserConfig) -> Result<Self, SourceError> {
        let timeout = config.timeout();
        let (browser, handler, profile) = match config.remote_url {
            Some(ref url) => {
                let (browser, handler) = connect_remote(url, timeout).await?;
                (browser, handler, None)
            }
            None => {
                let (browser, handler, profile) = launch(config).await?;
                (browser, handler, Some(profile))
            }
        };

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| SourceError::Unavailable(format!("failed to open tab: {}", e)))?;

        if let Some(ref ua) = config.user_agent {
            page.execute(SetUserAgentOverrideParams::new(ua.clone()))
                .await
                .map_err(|e| SourceError::Render(format!("failed to set user agent: {}", e)))?;
        }

        Ok(Self {
            browser,
            page: Some(page),
            handler,
            timeout,
            remote: config.remote_url.is_some(),
            _profile: profile,
        })
    }

    fn page(&self) -> Result<&Page, SourceError> {
        self.page
            .as_ref()
            .ok_or_else(|| SourceError::Unavailable("browser session closed".to_string()))
    }

    async fn evaluate_bool(&self, script: String) -> Result<bool, SourceError> {
        let result = tokio::time::timeout(self.timeout, self.page()?.evaluate(script))
            .await
            .map_err(|_| SourceError::Timeout(self.timeout))?
            .map_err(|e| SourceError::Render(e.to_string()))?;
        Ok(result.into_value::<bool>().unwrap_or(false))
    }

    async fn wait_until_ready(&self) {
        let Ok(page) = self.page() else {
            return;
        };
        match tokio::time::timeout(self.timeout, page.evaluate(WAIT_FOR_READY_SCRIPT.to_string()))
            .await
        {
            Ok(Ok(result)) => {
                let state: String = result
                    .into_value()
                    .unwrap_or_else(|_| "unknown".to_string());
                debug!("Page ready state: {}", state);
            }
            Ok(Err(e)) => debug!("Could not check ready state: {}", e),
            Err(_) => warn!("Timeout waiting for page ready state"),
        }
    }
}

#[async_trait]
impl PageSource for ChromiumPageSource {
    async fn navigate(&mut self, address: &str) -> Result<(), SourceError> {
        debug!("Navigating to {}", address);
        let params = NavigateParams::builder()
            .url(address)
            .build()
            .map_err(|e| SourceError::Navigation {
                address: address.to_string(),
                reason: format!("invalid URL: {}", e),
            })?;

        tokio::time::timeout(self.timeout, self.page()?.execute(params))
            .await
            .map_err(|_| SourceError::Timeout(self.timeout))?
            .map_err(|e| SourceError::Navigation {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        self.wait_until_ready().await;
        Ok(())
    }

    async fn snapshot(&mut self) -> Result<Snapshot, SourceError> {
        let page = self.page()?;
        let content = tokio::time::timeout(self.timeout, page.content())
            .await
            .map_err(|_| SourceError::Timeout(self.timeout))?
            .map_err(|e| SourceError::Render(e.to_string()))?;
        let address = page
            .url()
            .await
            .map_err(|e| SourceError::Render(e.to_string()))?
            .unwrap_or_default();
        Ok(Snapshot::new(address, content))
    }

    async fn trigger(&mut self, action: &Action) -> Result<(), SourceError> {
        match action {
            Action::Scroll(Scroll::ByViewport(fraction)) => {
                self.evaluate_bool(format!(
                    "(() => {{ window.scrollBy(0, window.innerHeight * {}); return true; }})()",
                    fraction
                ))
                .await?;
                Ok(())
            }
            Action::Scroll(Scroll::ToEnd) => {
                self.evaluate_bool(
                    "(() => { window.scrollTo(0, document.documentElement.scrollHeight); return true; })()"
                        .to_string(),
                )
                .await?;
                Ok(())
            }
            Action::Click(selector) => {
                let quoted = serde_json::to_string(selector)
                    .map_err(|e| SourceError::Render(e.to_string()))?;
                let script = format!(
                    "(() => {{ const el = document.querySelector({}); \
                     if (!el) return false; \
                     el.scrollIntoView({{block: 'center'}}); el.click(); return true; }})()",
                    quoted
                );
                if self.evaluate_bool(script).await? {
                    Ok(())
                } else {
                    Err(SourceError::ElementNotFound(selector.clone()))
                }
            }
            Action::Evaluate(script) => {
                tokio::time::timeout(self.timeout, self.page()?.evaluate(script.clone()))
                    .await
                    .map_err(|_| SourceError::Timeout(self.timeout))?
                    .map_err(|e| SourceError::Render(e.to_string()))?;
                Ok(())
            }
        }
    }

    async fn current_address(&mut self) -> Result<String, SourceError> {
        self.page()?
            .url()
            .await
            .map_err(|e| SourceError::Render(e.to_string()))?
            .ok_or_else(|| SourceError::Render("page has no URL".to_string()))
    }

    async fn close(&mut self) {
        if let Some(page) = self.page.take() {
            let _ = page.close().await;
        }
        if !self.remote {
            if let Err(e) = self.browser.close().await {
                debug!("Browser close failed: {}", e);
            }
            let _ = self.browser.wait().await;
        }
        self.handler.abort();
    }
}

/// Find Chrome: configured path, well-known locations, then `PATH`.
fn find_chrome(config: &BrowserConfig) -> Result<PathBuf, SourceError> {
    if let Some(ref explicit) = config.executable {
        let expanded = shellexpand::tilde(explicit);
        return Ok(PathBuf::from(expanded.as_ref()));
    }

    for path in CHROME_PATHS {
        let p = std::path::Path::new(path);
        if p.exists() {
            debug!("Found Chrome at: {}", path);
            return Ok(p.to_path_buf());
        }
    }

    for cmd in &[
        "google-chrome",
        "google-chrome-stable",
        "chromium",
        "chromium-browser",
    ] {
        if let Ok(output) = std::process::Command::new("which").arg(cmd).output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    debug!("Found Chrome in PATH: {}", path);
                    return Ok(PathBuf::from(path));
                }
            }
        }
    }

    Err(SourceError::Unavailable(
        "Chrome/Chromium not found; install it, set browser.executable, \
         or point browser.remote_url at a running instance"
            .to_string(),
    ))
}

async fn launch(
    config: &BrowserConfig,
) -> Result<(Browser, JoinHandle<()>, tempfile::TempDir), SourceError> {
    info!("Launching browser (headless={})", config.headless);
    let chrome = find_chrome(config)?;
    let profile = tempfile::Builder::new()
        .prefix("harvester-profile-")
        .tempdir()
        .map_err(|e| SourceError::Unavailable(format!("failed to create browser profile: {}", e)))?;

    let mut builder = LaunchConfig::builder()
        .chrome_executable(chrome)
        .user_data_dir(profile.path())
        .request_timeout(config.timeout());

    // with_head means NOT headless
    if !config.headless {
        builder = builder.with_head();
    }
    if let Some(ref proxy) = config.proxy {
        builder = builder.arg(format!("--proxy-server={}", proxy));
    }

    builder = builder
        .arg("--disable-dev-shm-usage")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--disable-background-networking")
        .arg("--disable-sync")
        .arg("--no-sandbox")
        .arg("--disable-gpu");
    for arg in &config.chrome_args {
        builder = builder.arg(arg.as_str());
    }

    let launch_config = builder
        .build()
        .map_err(|e| SourceError::Unavailable(format!("invalid browser config: {}", e)))?;

    let (browser, mut handler) = Browser::launch(launch_config)
        .await
        .map_err(|e| SourceError::Unavailable(format!("failed to launch browser: {}", e)))?;

    let handle = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if event.is_err() {
                break;
            }
        }
    });

    Ok((browser, handle, profile))
}

async fn connect_remote(url: &str, timeout: Duration) -> Result<(Browser, JoinHandle<()>), SourceError> {
    info!("Connecting to remote browser at {}", url);

    // The WebSocket URL comes from the /json/version endpoint.
    let http_url = url
        .replace("ws://", "http://")
        .replace("wss://", "https://");
    let version_url = format!("{}/json/version", http_url.trim_end_matches('/'));

    let unavailable = |e: reqwest::Error| SourceError::Unavailable(format!("remote browser: {}", e));
    let version: serde_json::Value = reqwest::Client::new()
        .get(&version_url)
        .timeout(timeout)
        .send()
        .await
        .map_err(unavailable)?
        .json()
        .await
        .map_err(unavailable)?;

    let ws_url = version
        .get("webSocketDebuggerUrl")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SourceError::Unavailable("no webSocketDebuggerUrl in response".to_string()))?;

    let handler_config = HandlerConfig {
        request_timeout: timeout,
        ..Default::default()
    };
    let (browser, mut handler) = Browser::connect_with_config(ws_url, handler_config)
        .await
        .map_err(|e| SourceError::Unavailable(format!("failed to connect to browser: {}", e)))?;

    let handle = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if event.is_err() {
                break;
            }
        }
    });

    Ok((browser, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_executable_wins() {
        let config = BrowserConfig {
            executable: Some("/opt/chrome/chrome".into()),
            ..Default::default()
        };
        assert_eq!(find_chrome(&config).unwrap(), PathBuf::from("/opt/chrome/chrome"));
    }
}
