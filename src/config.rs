//! TOML configuration parsing.
//!
//! A single [`Config`] is loaded once per invocation by [`load_config`] and
//! passed by reference into every component. Secrets never live in the file
//! itself: the embedding API key and SMTP password are read from environment
//! variables whose *names* are configured here.
//!
//! ```toml
//! [db]
//! path = "./data/relay.sqlite"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [scoring]
//! model_dir = "./models"
//!
//! [broadcast]
//! base_url = "https://papers.example.org"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_min_connections() -> u32 {
    1
}
fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible gateways, or the Ollama host).
    #[serde(default)]
    pub url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_min_secs")]
    pub backoff_min_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            backoff_min_secs: default_backoff_min_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    5
}
fn default_backoff_min_secs() -> u64 {
    5
}
fn default_backoff_max_secs() -> u64 {
    20
}
fn default_timeout_secs() -> u64 {
    60
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScoringConfig {
    /// Directory holding `model-{id}` artifacts.
    pub model_dir: PathBuf,
    #[serde(default = "default_scoring_batch_size")]
    pub batch_size: usize,
    /// Above this many unscored candidates a run is treated as a backfill.
    #[serde(default = "default_max_tracked_candidates")]
    pub max_tracked_candidates: usize,
    #[serde(default)]
    pub lookback_hours: Option<i64>,
}

fn default_scoring_batch_size() -> usize {
    500
}
fn default_max_tracked_candidates() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct BroadcastConfig {
    /// How far back title deduplication looks. Only deliveries still kept
    /// by `retention_days` can be matched, so the effective window is the
    /// shorter of the two.
    #[serde(default = "default_dedup_lookback_months")]
    pub dedup_lookback_months: u32,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Titles matching at least this many delivered titles are boilerplate
    /// and exempt from suppression.
    #[serde(default = "default_boilerplate_match_limit")]
    pub boilerplate_match_limit: usize,
    /// Delivered rows older than this are deleted after each run. Feeds
    /// added before the same cutoff are never admitted by an unrestricted
    /// admission, and `clear_old` refuses a shorter age.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Offset applied to the clock before checking `broadcast_hours`.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Public site URL used to build item links in notifications.
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            dedup_lookback_months: default_dedup_lookback_months(),
            similarity_threshold: default_similarity_threshold(),
            boilerplate_match_limit: default_boilerplate_match_limit(),
            retention_days: default_retention_days(),
            utc_offset_minutes: 0,
            base_url: None,
        }
    }
}

fn default_dedup_lookback_months() -> u32 {
    3
}
fn default_similarity_threshold() -> f64 {
    0.85
}
fn default_boilerplate_match_limit() -> usize {
    6
}
fn default_retention_days() -> i64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_notify_timeout_secs(),
            smtp: None,
        }
    }
}

fn default_notify_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "default_smtp_password_env")]
    pub password_env: String,
    pub from: String,
}

fn default_smtp_password_env() -> String {
    "SMTP_PASSWORD".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Range checks shared by [`load_config`] and configs built in code.
pub fn validate(config: &Config) -> Result<()> {
    if config.db.max_connections == 0 || config.db.min_connections > config.db.max_connections {
        anyhow::bail!("db.min_connections must be <= db.max_connections (and max > 0)");
    }

    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.backoff_min_secs > config.embedding.backoff_max_secs {
        anyhow::bail!("embedding.backoff_min_secs must be <= embedding.backoff_max_secs");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if config.embedding.is_enabled() && config.embedding.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }

    if config.scoring.batch_size == 0 {
        anyhow::bail!("scoring.batch_size must be > 0");
    }

    let threshold = config.broadcast.similarity_threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        anyhow::bail!("broadcast.similarity_threshold must be in (0.0, 1.0]");
    }
    if config.broadcast.boilerplate_match_limit == 0 {
        anyhow::bail!("broadcast.boilerplate_match_limit must be >= 1");
    }
    if config.broadcast.retention_days < 0 {
        anyhow::bail!("broadcast.retention_days must be >= 0");
    }
    if config.broadcast.utc_offset_minutes.abs() >= 24 * 60 {
        anyhow::bail!("broadcast.utc_offset_minutes must be within +/- 1439");
    }
    if config.notify.timeout_secs == 0 {
        anyhow::bail!("notify.timeout_secs must be > 0");
    }

    Ok(())
}
