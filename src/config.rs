//! TOML configuration.
//!
//! Every tunable the core consumes lives here: per-connector concurrency
//! limits, dedup and confidence thresholds, backlog windows, retry policy,
//! and the power-control settings for the inference host. Sources, channels
//! and rules can also be declared in the file and are upserted into storage
//! by `sift sync-sources`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::Priority;
use crate::rules::RuleType;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub classification: ClassificationConfig,
    #[serde(default)]
    pub classifier_worker: ClassifierWorkerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub power: PowerConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduler cycles.
    pub tick_secs: u64,
    /// Per-channel fetch timeout; a fetch exceeding it is abandoned.
    pub fetch_timeout_secs: u64,
    /// Limit for connector types missing from `concurrency`.
    pub default_concurrency: usize,
    /// Maximum concurrent in-flight fetches per connector type.
    pub concurrency: HashMap<String, usize>,
    /// Collect items without running dedup or classification.
    pub training_mode: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let mut concurrency = HashMap::new();
        concurrency.insert("rss".to_string(), 10);
        concurrency.insert("scrape".to_string(), 4);
        concurrency.insert("browser".to_string(), 2);
        Self {
            tick_secs: 30,
            fetch_timeout_secs: 120,
            default_concurrency: 4,
            concurrency,
            training_mode: false,
        }
    }
}

impl SchedulerConfig {
    pub fn limit_for(&self, connector_type: &str) -> usize {
        self.concurrency
            .get(connector_type)
            .copied()
            .unwrap_or(self.default_concurrency)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

fn default_similarity_threshold() -> f64 {
    0.75
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClassificationConfig {
    pub url: String,
    pub timeout_secs: u64,
    /// Below this relevance confidence an item is treated as irrelevant.
    pub low_threshold: f64,
    /// Above this relevance confidence the fast classifier is trusted.
    pub high_threshold: f64,
    /// Name recorded as `model_name` in the processing log.
    pub model_name: String,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8100".to_string(),
            timeout_secs: 15,
            low_threshold: 0.25,
            high_threshold: 0.75,
            model_name: "fast-classifier".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClassifierWorkerConfig {
    pub batch_size: i64,
    /// Duplicate-check window in days; 0 checks the full history.
    pub recency_days: i64,
    pub idle_secs: u64,
}

impl Default for ClassifierWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            recency_days: 7,
            idle_secs: 60,
        }
    }
}

impl ClassifierWorkerConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub url: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Total attempts per item before a sentinel result is recorded.
    pub max_retries: u32,
    /// Base backoff; attempt `n` waits `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,
    /// Items fetched within this many hours are drained before the backlog.
    pub fresh_window_hours: i64,
    pub batch_size: i64,
    pub idle_secs: u64,
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            timeout_secs: 300,
            max_retries: 3,
            retry_backoff_ms: 2000,
            fresh_window_hours: 24,
            batch_size: 10,
            idle_secs: 60,
            system_prompt: None,
        }
    }
}

impl LlmConfig {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(attempt as u64))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PowerConfig {
    /// When false the inference host is assumed always on.
    pub enabled: bool,
    /// Hardware address of the inference host, e.g. `aa:bb:cc:dd:ee:ff`.
    pub mac: Option<String>,
    pub broadcast: String,
    pub port: u16,
    pub ssh_host: Option<String>,
    pub ssh_user: Option<String>,
    pub ssh_key: Option<PathBuf>,
    pub shutdown_command: String,
    pub idle_timeout_secs: u64,
    pub wake_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub tick_secs: u64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mac: None,
            broadcast: "255.255.255.255".to_string(),
            port: 9,
            ssh_host: None,
            ssh_user: None,
            ssh_key: None,
            shutdown_command: "sudo shutdown -h now".to_string(),
            idle_timeout_secs: 300,
            wake_timeout_secs: 180,
            poll_interval_ms: 5000,
            tick_secs: 30,
        }
    }
}

impl PowerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn wake_timeout(&self) -> Duration {
        Duration::from_secs(self.wake_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelConfig {
    pub name: String,
    pub url: String,
    pub connector: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Connector-specific options, stored as JSON.
    #[serde(default)]
    pub options: serde_json::Value,
}

fn default_interval_secs() -> i64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuleConfig {
    pub name: String,
    #[serde(flatten)]
    pub rule_type: RuleType,
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Category added on match. Named `assign_category` in TOML so it cannot
    /// clash with a semantic rule's own `category`.
    #[serde(default, rename = "assign_category")]
    pub category: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.dedup.similarity_threshold) {
            bail!("dedup.similarity_threshold must be in [0.0, 1.0]");
        }

        let c = &self.classification;
        if !(0.0..=1.0).contains(&c.low_threshold) || !(0.0..=1.0).contains(&c.high_threshold) {
            bail!("classification thresholds must be in [0.0, 1.0]");
        }
        if c.low_threshold > c.high_threshold {
            bail!(
                "classification.low_threshold ({}) must not exceed high_threshold ({})",
                c.low_threshold,
                c.high_threshold
            );
        }

        if self.classifier_worker.batch_size < 1 {
            bail!("classifier_worker.batch_size must be >= 1");
        }
        if self.classifier_worker.recency_days < 0 {
            bail!("classifier_worker.recency_days must be >= 0");
        }
        if self.llm.max_retries == 0 {
            bail!("llm.max_retries must be >= 1");
        }
        if self.llm.batch_size < 1 {
            bail!("llm.batch_size must be >= 1");
        }
        if self.scheduler.default_concurrency == 0 {
            bail!("scheduler.default_concurrency must be >= 1");
        }
        if let Some((kind, _)) = self.scheduler.concurrency.iter().find(|(_, v)| **v == 0) {
            bail!("scheduler.concurrency.{} must be >= 1", kind);
        }

        if self.power.enabled {
            let mac = self
                .power
                .mac
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("power.mac is required when power.enabled"))?;
            crate::power::parse_mac(mac)?;
            if self.power.ssh_host.is_none() {
                bail!("power.ssh_host is required when power.enabled");
            }
        }

        for source in &self.sources {
            for channel in &source.channels {
                if channel.interval_secs < 1 {
                    bail!(
                        "channel '{}/{}' interval_secs must be >= 1",
                        source.name,
                        channel.name
                    );
                }
            }
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
