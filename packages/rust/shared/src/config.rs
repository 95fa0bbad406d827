//! Application configuration for ContentPipe.
//!
//! User config lives at `~/.contentpipe/contentpipe.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ContentPipeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "contentpipe.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".contentpipe";

// ---------------------------------------------------------------------------
// Config structs (matching contentpipe.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Backoff policy for transient retrieval failures.
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file path. A leading `~/` expands to the home directory.
    #[serde(default = "default_store_path")]
    pub path: String,

    /// How long a write waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Rows fetched per round trip by search cursors.
    #[serde(default = "default_search_page_size")]
    pub search_page_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            search_page_size: default_search_page_size(),
        }
    }
}

impl StoreConfig {
    /// Resolve `path`, expanding a leading `~/`.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        expand_home(&self.path)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_store_path() -> String {
    "~/.contentpipe/contentpipe.db".into()
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_search_page_size() -> u32 {
    20
}

/// `[retrieval]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Upper bound on a single fetch, after which it is cancelled.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Maximum response body size in bytes.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    /// Maximum redirects followed per request.
    #[serde(default = "default_redirect_limit")]
    pub redirect_limit: usize,

    /// Whether to honour robots.txt `Disallow` rules.
    #[serde(default = "default_true")]
    pub respect_robots_txt: bool,

    /// Allow fetching loopback/private hosts (tests, intranet setups).
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: default_fetch_timeout_ms(),
            max_bytes: default_max_bytes(),
            redirect_limit: default_redirect_limit(),
            respect_robots_txt: true,
            allow_private_hosts: false,
        }
    }
}

impl RetrievalConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

fn default_fetch_timeout_ms() -> u64 {
    30_000
}
fn default_max_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_redirect_limit() -> usize {
    5
}
fn default_true() -> bool {
    true
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total fetch attempts per `fetch_and_index` call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Ceiling for any single backoff delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor applied per retry.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `retry` (1-based): `base * multiplier^(retry-1)`,
    /// capped at `max_delay_ms`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_delay_ms as f64) as u64)
    }

    /// Reject settings that would never terminate or never back off.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ContentPipeError::validation(
                "retry.max_attempts must be at least 1",
            ));
        }
        if self.multiplier < 1.0 {
            return Err(ContentPipeError::validation(
                "retry.multiplier must be >= 1.0",
            ));
        }
        Ok(())
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}

/// `[monitor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Interval between watch sweeps.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Consecutive failures after which a URL is reported as suspect.
    #[serde(default = "default_suspect_threshold")]
    pub suspect_threshold: u32,

    /// Maximum sweeps a failing URL sits out between checks.
    #[serde(default = "default_max_backoff_cycles")]
    pub max_backoff_cycles: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            suspect_threshold: default_suspect_threshold(),
            max_backoff_cycles: default_max_backoff_cycles(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(ContentPipeError::validation(
                "monitor.poll_interval_ms must be at least 1",
            ));
        }
        Ok(())
    }
}

fn default_poll_interval_ms() -> u64 {
    300_000
}
fn default_suspect_threshold() -> u32 {
    3
}
fn default_max_backoff_cycles() -> u32 {
    8
}

/// `[analysis]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Run analysis automatically after each successful index.
    #[serde(default)]
    pub enabled: bool,

    /// Query used for automatic post-index analysis.
    #[serde(default = "default_query")]
    pub default_query: String,

    /// Content longer than this (in chars) is rejected as too large.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,

    /// Upper bound on a single summarization call.
    #[serde(default = "default_analysis_timeout_ms")]
    pub timeout_ms: u64,

    /// Model identifier, recorded with cached summaries.
    #[serde(default = "default_model")]
    pub model: String,

    /// Bridge command (e.g. "bun").
    #[serde(default = "default_bridge_cmd")]
    pub bridge_cmd: String,

    /// Bridge script path passed to the command.
    #[serde(default)]
    pub bridge_script: String,

    /// Working directory for the bridge subprocess.
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_query: default_query(),
            max_input_chars: default_max_input_chars(),
            timeout_ms: default_analysis_timeout_ms(),
            model: default_model(),
            bridge_cmd: default_bridge_cmd(),
            bridge_script: String::new(),
            working_dir: default_working_dir(),
        }
    }
}

impl AnalysisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_query() -> String {
    "Summarize the key points of this document.".into()
}
fn default_max_input_chars() -> usize {
    48_000
}
fn default_analysis_timeout_ms() -> u64 {
    60_000
}
fn default_model() -> String {
    "default".into()
}
fn default_bridge_cmd() -> String {
    "bun".into()
}
fn default_working_dir() -> String {
    ".".into()
}

/// `[orchestrator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum fetches in flight across all URLs.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: default_max_concurrent_fetches(),
        }
    }
}

fn default_max_concurrent_fetches() -> usize {
    8
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.contentpipe/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ContentPipeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.contentpipe/contentpipe.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ContentPipeError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        ContentPipeError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.retry.validate()?;
    config.monitor.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ContentPipeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ContentPipeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ContentPipeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` to the user's home directory.
fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| ContentPipeError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
