//! Shared fixtures: a temp SQLite store and in-memory backends.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use sift::classification::{
    BackendHealth, ClassificationBackend, ClassificationResult, DuplicateMatch, IndexEntry,
};
use sift::config::{ChannelConfig, PowerConfig, SourceConfig};
use sift::connector::{Connector, Validation};
use sift::db;
use sift::error::{BackendError, PowerError};
use sift::inference::InferenceBackend;
use sift::migrate;
use sift::models::{Channel, Priority, RawItem};
use sift::store::{SqliteStore, Store};

pub struct TestDb {
    pub _tmp: TempDir,
    pub store: Arc<SqliteStore>,
}

impl TestDb {
    pub async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("sift.sqlite"))
            .await
            .unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        Self {
            _tmp: tmp,
            store: Arc::new(SqliteStore::new(pool)),
        }
    }

    pub fn dyn_store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Create (or update) `source/name` and return the stored channel.
    pub async fn channel(&self, source: &str, name: &str, connector: &str) -> Channel {
        let source_id = self
            .store
            .upsert_source(&SourceConfig {
                name: source.to_string(),
                enabled: true,
                channels: Vec::new(),
            })
            .await
            .unwrap();
        let id = self
            .store
            .upsert_channel(
                source_id,
                &ChannelConfig {
                    name: name.to_string(),
                    url: format!("https://{}.example.org/{}", source, name),
                    connector: connector.to_string(),
                    interval_secs: 3600,
                    enabled: true,
                    options: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();
        self.store
            .list_channels()
            .await
            .unwrap()
            .into_iter()
            .find(|c| c.id == id)
            .unwrap()
    }

    /// Move an item's `fetched_at` back by `secs`.
    pub async fn age_item(&self, id: &str, secs: i64) {
        sqlx::query("UPDATE items SET fetched_at = fetched_at - ? WHERE id = ?")
            .bind(secs)
            .bind(id)
            .execute(self.store.pool())
            .await
            .unwrap();
    }

    pub async fn delete_item(&self, id: &str) {
        sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(id)
            .execute(self.store.pool())
            .await
            .unwrap();
    }

    /// Count of log rows for `item_id` with the given step type.
    pub async fn log_count(&self, item_id: &str, step: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM processing_log WHERE item_id = ? AND step_type = ?")
            .bind(item_id)
            .bind(step)
            .fetch_one(self.store.pool())
            .await
            .unwrap()
    }
}

pub fn raw(external_id: &str, title: &str, content: &str) -> RawItem {
    RawItem {
        external_id: external_id.to_string(),
        title: title.to_string(),
        content: content.to_string(),
        url: format!("https://example.org/{}", external_id),
        ..Default::default()
    }
}

// ─── Classification backend ─────────────────────────────────────────

/// Scores every item with `default_confidence` unless `confidences` holds
/// its title. Duplicate lookups return `duplicates` filtered by threshold.
pub struct MockClassifier {
    pub available: AtomicBool,
    pub default_confidence: Mutex<f64>,
    pub confidences: Mutex<HashMap<String, f64>>,
    pub duplicates: Mutex<Vec<DuplicateMatch>>,
    /// Titles whose classification comes back malformed.
    pub malformed: Mutex<Vec<String>>,
    pub reject_batch_index: AtomicBool,
    pub classify_calls: AtomicUsize,
    pub indexed: Mutex<Vec<String>>,
    pub classify_delay: Mutex<Duration>,
}

impl MockClassifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            available: AtomicBool::new(true),
            default_confidence: Mutex::new(0.9),
            confidences: Mutex::new(HashMap::new()),
            duplicates: Mutex::new(Vec::new()),
            malformed: Mutex::new(Vec::new()),
            reject_batch_index: AtomicBool::new(false),
            classify_calls: AtomicUsize::new(0),
            indexed: Mutex::new(Vec::new()),
            classify_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn set_available(&self, up: bool) {
        self.available.store(up, Ordering::SeqCst);
    }

    pub fn score(&self, title: &str, confidence: f64) {
        self.confidences
            .lock()
            .unwrap()
            .insert(title.to_string(), confidence);
    }

    pub fn add_duplicate(&self, id: &str, score: f64) {
        self.duplicates.lock().unwrap().push(DuplicateMatch {
            id: id.to_string(),
            score,
            title: String::new(),
        });
    }

    pub fn classify_calls(&self) -> usize {
        self.classify_calls.load(Ordering::SeqCst)
    }

    fn check_up(&self) -> Result<(), BackendError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl ClassificationBackend for MockClassifier {
    fn name(&self) -> &str {
        "mock-classifier"
    }

    async fn classify(
        &self,
        title: &str,
        _content: &str,
        _source: &str,
    ) -> Result<ClassificationResult, BackendError> {
        self.check_up()?;
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.classify_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.malformed.lock().unwrap().iter().any(|t| t == title) {
            return Err(BackendError::Malformed("missing field `confidence`".to_string()));
        }
        let confidence = self
            .confidences
            .lock()
            .unwrap()
            .get(title)
            .copied()
            .unwrap_or(*self.default_confidence.lock().unwrap());
        Ok(ClassificationResult {
            relevant: confidence >= 0.5,
            confidence,
            priority: Priority::Medium,
            priority_score: Some(0.5),
            categories: vec!["general".to_string()],
            category_confidences: HashMap::from([("general".to_string(), confidence)]),
        })
    }

    async fn find_duplicates(
        &self,
        _title: &str,
        _content: &str,
        threshold: f64,
    ) -> Result<Vec<DuplicateMatch>, BackendError> {
        self.check_up()?;
        let mut matches: Vec<DuplicateMatch> = self
            .duplicates
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.score >= threshold)
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(matches)
    }

    async fn index(&self, id: &str, _title: &str, _content: &str) -> Result<(), BackendError> {
        self.check_up()?;
        self.indexed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn index_batch(&self, entries: &[IndexEntry]) -> Result<(), BackendError> {
        self.check_up()?;
        if self.reject_batch_index.load(Ordering::SeqCst) {
            return Err(BackendError::Http {
                status: 413,
                body: "batch too large".to_string(),
            });
        }
        self.indexed
            .lock()
            .unwrap()
            .extend(entries.iter().map(|e| e.id.clone()));
        Ok(())
    }

    async fn health(&self) -> Result<BackendHealth, BackendError> {
        self.check_up()?;
        Ok(BackendHealth {
            available: true,
            index_size: self.indexed.lock().unwrap().len() as u64,
        })
    }
}

// ─── Inference backend ──────────────────────────────────────────────

pub const GOOD_ANALYSIS: &str = r#"{"summary": "Concise summary.", "detailed_analysis": "Details.",
    "relevant": true, "priority": "high", "categories": ["energy"], "reasoning": "Impact."}"#;

/// Replies from `replies` in order, then `GOOD_ANALYSIS` forever. Health
/// follows the shared `up` flag, which [`MockPowerOps`] flips on wake.
pub struct ScriptedInference {
    pub up: Arc<AtomicBool>,
    pub replies: Mutex<VecDeque<Result<String, BackendError>>>,
    pub generate_calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
    /// How long each generate call takes.
    pub delay: Mutex<Duration>,
}

impl ScriptedInference {
    pub fn new(up: bool) -> Arc<Self> {
        Arc::new(Self {
            up: Arc::new(AtomicBool::new(up)),
            replies: Mutex::new(VecDeque::new()),
            generate_calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn push_reply(&self, reply: &str) {
        self.replies.lock().unwrap().push_back(Ok(reply.to_string()));
    }

    pub fn push_error(&self, err: BackendError) {
        self.replies.lock().unwrap().push_back(Err(err));
    }

    pub fn calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for ScriptedInference {
    fn name(&self) -> &str {
        "mock-llm"
    }

    async fn generate(&self, prompt: &str, _system: Option<&str>) -> Result<String, BackendError> {
        if !self.up.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("host asleep".to_string()));
        }
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let reply = self.replies.lock().unwrap().pop_front();
        reply.unwrap_or_else(|| Ok(GOOD_ANALYSIS.to_string()))
    }

    async fn health(&self) -> Result<(), BackendError> {
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable("host asleep".to_string()))
        }
    }
}

// ─── Power ──────────────────────────────────────────────────────────

/// Wake flips the inference host's `up` flag unless `dead` is set. Like
/// ssh, shutdown fails against a host that is already down.
pub struct MockPowerOps {
    pub host_up: Arc<AtomicBool>,
    pub dead: AtomicBool,
    pub wakes: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl MockPowerOps {
    pub fn new(host_up: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            host_up,
            dead: AtomicBool::new(false),
            wakes: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        })
    }

    pub fn wakes(&self) -> usize {
        self.wakes.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl sift::power::PowerOps for MockPowerOps {
    async fn wake(&self) -> Result<(), PowerError> {
        self.wakes.fetch_add(1, Ordering::SeqCst);
        if !self.dead.load(Ordering::SeqCst) {
            self.host_up.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), PowerError> {
        if !self.host_up.load(Ordering::SeqCst) {
            return Err(PowerError::Shutdown(
                "ssh: connect to host gpu port 22: No route to host".to_string(),
            ));
        }
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.host_up.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Power settings with timings short enough for tests.
pub fn fast_power_config(idle_timeout_secs: u64) -> PowerConfig {
    PowerConfig {
        enabled: true,
        mac: Some("aa:bb:cc:dd:ee:ff".to_string()),
        ssh_host: Some("gpu".to_string()),
        idle_timeout_secs,
        wake_timeout_secs: 1,
        poll_interval_ms: 10,
        ..PowerConfig::default()
    }
}

// ─── Connectors ─────────────────────────────────────────────────────

/// Returns fixed items after `delay`, tracking peak concurrency.
pub struct SlowConnector {
    pub kind: String,
    pub delay: Duration,
    pub items: Vec<RawItem>,
    pub fail_channel: Option<String>,
    pub in_flight: AtomicUsize,
    pub peak: AtomicUsize,
}

impl SlowConnector {
    pub fn new(kind: &str, delay: Duration) -> Self {
        Self {
            kind: kind.to_string(),
            delay,
            items: Vec::new(),
            fail_channel: None,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for SlowConnector {
    fn connector_type(&self) -> &str {
        &self.kind
    }

    async fn fetch(&self, channel: &Channel) -> Result<Vec<RawItem>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_channel.as_deref() == Some(channel.name.as_str()) {
            anyhow::bail!("HTTP 403 from {}", channel.url);
        }
        // Per-channel external ids so channels never collide.
        Ok(self
            .items
            .iter()
            .map(|item| RawItem {
                external_id: format!("{}-{}", channel.name, item.external_id),
                title: format!("{} {}", channel.name, item.title),
                ..item.clone()
            })
            .collect())
    }

    fn validate(&self, _url: &str, _options: &serde_json::Value) -> Validation {
        Validation::ok()
    }
}
