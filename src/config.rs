//! Configuration for harvest runs.
//!
//! Loaded from a TOML file (every section optional), then overridden by
//! `HARVEST_*` environment variables and finally by CLI flags.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::convergence::ConvergenceLimits;
use crate::extract::FieldRule;
use crate::models::{IdRules, RecordSchema};
use crate::retry::BackoffPolicy;
use crate::source::{CounterProbe, ElementCountProbe, FirstOf, ProgressProbe};

/// Config file looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "harvest.toml";

/// Configuration errors. Always fatal: nothing runs on a bad config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How pages are rendered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Headless Chromium over CDP (needs the `browser` feature).
    #[default]
    Browser,
    /// Plain HTTP GET; no scrolling or clicking.
    Http,
}

/// Page source selection and per-page preparation hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Script evaluated after each navigation (e.g. a localStorage flag that
    /// suppresses a newsletter popup).
    pub init_script: Option<String>,
    /// Selectors clicked after each navigation if present (cookie banners, popups).
    pub dismiss: Vec<String>,
    /// Detail pages are extracted once this selector is present.
    pub ready_selector: Option<String>,
    pub ready_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            init_script: None,
            dismiss: Vec::new(),
            ready_selector: None,
            ready_timeout_secs: 20,
        }
    }
}

impl SourceConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

/// Chromium launch/connect settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Run in headless mode (default: true).
    pub headless: bool,
    /// Proxy server URL (e.g., "socks5://127.0.0.1:1080").
    pub proxy: Option<String>,
    /// Remote Chrome DevTools URL (e.g., "ws://localhost:9222").
    /// If set, connects to an existing browser instead of launching one.
    pub remote_url: Option<String>,
    /// Navigation timeout in seconds.
    pub timeout: u64,
    /// User agent override for the page.
    pub user_agent: Option<String>,
    /// Additional Chrome arguments.
    pub chrome_args: Vec<String>,
    /// Explicit Chrome executable; searched for when unset.
    pub executable: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            proxy: None,
            remote_url: None,
            timeout: 30,
            user_agent: None,
            chrome_args: Vec::new(),
            executable: None,
        }
    }
}

impl BrowserConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Settings for plain HTTP requests (static sources and asset downloads).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Sent verbatim; `None` uses the crate's own agent.
    pub user_agent: Option<String>,
    /// Request timeout in seconds.
    pub timeout: u64,
    pub referer: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            timeout: 30,
            referer: None,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Inclusive page range substituted into `{page}` placeholders.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

/// Listing discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Listing addresses. May contain `{page}`.
    pub listings: Vec<String>,
    pub pages: Option<PageRange>,
    /// Selector for item links on a listing.
    pub item_selector: String,
    pub item_attribute: String,
    /// Only links matching this regex are kept.
    pub link_pattern: Option<String>,
    /// Where discovered ids are written.
    pub output: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            listings: Vec::new(),
            pages: None,
            item_selector: "a[href]".to_string(),
            item_attribute: "href".to_string(),
            link_pattern: None,
            output: "candidates.csv".to_string(),
        }
    }
}

impl DiscoveryConfig {
    /// Listing addresses with `{page}` placeholders expanded.
    ///
    /// Listings without a placeholder are kept as-is. A placeholder with no
    /// page range configured is replaced with `1`.
    pub fn expanded_listings(&self) -> Vec<String> {
        let mut out = Vec::new();
        for listing in &self.listings {
            if !listing.contains("{page}") {
                out.push(listing.clone());
                continue;
            }
            let range = self.pages.unwrap_or(PageRange { start: 1, end: 1 });
            for page in range.start..=range.end {
                out.push(listing.replace("{page}", &page.to_string()));
            }
        }
        out
    }
}

/// Convergence loop limits and the probes it reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Run the loop at all. Static sources skip it regardless.
    pub enabled: bool,
    pub max_iterations: u32,
    pub stall_threshold: u32,
    pub hard_timeout_secs: u64,
    pub step_timeout_secs: u64,
    /// How long to wait for the page to show progress after an advance.
    pub settle_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Scroll increments per advance.
    pub scroll_steps: u32,
    /// Viewport fraction per scroll increment.
    pub scroll_fraction: f32,
    /// Viewport fraction to scroll back up when oscillating out of a stall.
    pub retreat_fraction: f32,
    /// "Load more" control; clicked instead of scrolling when present.
    pub load_more_selector: Option<String>,
    /// Element holding the "X of Y" counter.
    pub counter_selector: Option<String>,
    pub counter_pattern: Option<String>,
    /// Elements counted when no counter is shown. Defaults to the item selector.
    pub item_count_selector: Option<String>,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: 400,
            stall_threshold: 15,
            hard_timeout_secs: 300,
            step_timeout_secs: 30,
            settle_timeout_ms: 1500,
            poll_interval_ms: 250,
            scroll_steps: 10,
            scroll_fraction: 0.8,
            retreat_fraction: 0.5,
            load_more_selector: None,
            counter_selector: None,
            counter_pattern: None,
            item_count_selector: None,
        }
    }
}

impl ConvergenceConfig {
    pub fn limits(&self) -> ConvergenceLimits {
        ConvergenceLimits {
            max_iterations: self.max_iterations,
            stall_threshold: self.stall_threshold,
            hard_timeout: Duration::from_secs(self.hard_timeout_secs),
            step_timeout: Duration::from_secs(self.step_timeout_secs),
            settle_timeout: Duration::from_millis(self.settle_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            scroll_steps: self.scroll_steps,
            scroll_fraction: self.scroll_fraction,
            retreat_fraction: self.retreat_fraction,
            load_more: self.load_more_selector.clone(),
        }
    }

    /// Counter probe first, then an element count over `item_selector`.
    pub fn probe(&self, item_selector: &str) -> Result<Box<dyn ProgressProbe>, ConfigError> {
        let counter = CounterProbe::new(
            self.counter_selector.as_deref(),
            self.counter_pattern.as_deref(),
        )
        .map_err(ConfigError::Invalid)?;
        let count_selector = self.item_count_selector.as_deref().unwrap_or(item_selector);
        let elements = ElementCountProbe::new(count_selector).map_err(ConfigError::Invalid)?;
        Ok(Box::new(FirstOf(vec![Box::new(counter), Box::new(elements)])))
    }
}

/// Backoff shape for retries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// `base * attempt`.
    #[default]
    Linear,
    /// `base * 2^(attempt-1)`, capped at `max_delay_ms`.
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Linear,
            base_delay_ms: 15_000,
            max_delay_ms: 120_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> BackoffPolicy {
        let base = Duration::from_millis(self.base_delay_ms);
        match self.backoff {
            BackoffKind::Linear => BackoffPolicy::Linear { base },
            BackoffKind::Exponential => BackoffPolicy::Exponential {
                base,
                max: Duration::from_millis(self.max_delay_ms),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    /// Recreate a worker's session after this many items (0 = never).
    pub restart_after: usize,
    /// Pause between items on one worker, in milliseconds.
    pub item_delay_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            restart_after: 50,
            item_delay_ms: 0,
        }
    }
}

impl PoolConfig {
    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }
}

/// Which fields to extract from a detail page and which ones are required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    pub required: Vec<String>,
    pub fields: BTreeMap<String, FieldRule>,
    pub id: IdRules,
}

impl RecordConfig {
    /// Required fields plus the fields extracted as lists.
    pub fn schema(&self) -> RecordSchema {
        RecordSchema {
            required: self.required.clone(),
            list_fields: self
                .fields
                .iter()
                .filter(|(_, rule)| rule.multiple)
                .map(|(name, _)| name.clone())
                .collect(),
        }
    }
}

/// Asset download stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    /// List field holding asset URLs.
    pub field: String,
    /// Field the local paths are written back to.
    pub output_field: String,
    pub dir: String,
    pub workers: usize,
    /// Recreate the HTTP session after this many records (0 = never).
    pub restart_after: usize,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            field: "images".to_string(),
            output_field: "local_images".to_string(),
            dir: "assets".to_string(),
            workers: 4,
            restart_after: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub path: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: "checkpoint.csv".to_string(),
        }
    }
}

/// Full harvest configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub source: SourceConfig,
    pub browser: BrowserConfig,
    pub http: HttpConfig,
    pub discovery: DiscoveryConfig,
    pub convergence: ConvergenceConfig,
    pub retry: RetryConfig,
    pub pool: PoolConfig,
    pub record: RecordConfig,
    pub assets: AssetConfig,
    pub checkpoint: CheckpointConfig,
    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl HarvestConfig {
    /// Load `path` if given, else `harvest.toml` in the working directory if
    /// present, else defaults. Environment overrides are applied last.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::load_from_path(path).await?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load_from_path(default_path).await?
                } else {
                    Self::default()
                }
            }
        };
        Ok(config.with_env_overrides())
    }

    /// Load configuration from a specific TOML file.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let mut config = Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Apply `HARVEST_*` environment variables.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(workers) = var("HARVEST_WORKERS").and_then(|v| v.parse().ok()) {
            tracing::debug!("Using HARVEST_WORKERS from environment: {}", workers);
            self.pool.workers = workers;
        }
        if let Some(url) = var("HARVEST_BROWSER_URL") {
            tracing::debug!("Using HARVEST_BROWSER_URL from environment: {}", url);
            self.browser.remote_url = Some(url);
        }
        if let Some(headless) = var("HARVEST_HEADLESS") {
            self.browser.headless = headless == "1" || headless.eq_ignore_ascii_case("true");
        }
        if let Some(proxy) = var("HARVEST_PROXY") {
            self.browser.proxy = Some(proxy);
        }
        if let Some(path) = var("HARVEST_CHECKPOINT") {
            self.checkpoint.path = path;
        }

        self
    }

    /// Get the base directory for resolving relative paths.
    pub fn base_dir(&self) -> PathBuf {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Resolve a path that may be relative to the config file.
    /// - Absolute paths are returned as-is
    /// - Paths starting with ~ are expanded
    /// - Relative paths are resolved against the config file's directory
    pub fn resolve_path(&self, path_str: &str) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());

        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir().join(path)
        }
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.resolve_path(&self.checkpoint.path)
    }

    /// Checkpoint schema: the record schema plus the asset list fields.
    pub fn schema(&self) -> RecordSchema {
        let mut schema = self.record.schema();
        for field in [&self.assets.field, &self.assets.output_field] {
            if !schema.is_list_field(field) {
                schema.list_fields.push(field.clone());
            }
        }
        schema
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.workers == 0 {
            return Err(ConfigError::Invalid("pool.workers must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.convergence.stall_threshold == 0 {
            return Err(ConfigError::Invalid(
                "convergence.stall_threshold must be at least 1".into(),
            ));
        }
        if let Some(range) = self.discovery.pages {
            if range.start > range.end {
                return Err(ConfigError::Invalid(format!(
                    "discovery.pages start {} is after end {}",
                    range.start, range.end
                )));
            }
        }
        for required in &self.record.required {
            if !self.record.fields.contains_key(required) {
                return Err(ConfigError::Invalid(format!(
                    "required field {:?} has no extraction rule",
                    required
                )));
            }
        }
        self.convergence.probe(&self.discovery.item_selector)?;
        Ok(())
    }
}
