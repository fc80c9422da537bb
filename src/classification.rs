//! Classification Backend client.
//!
//! The backend is an embedding-based fast classifier plus a vector
//! similarity index. It is reached over HTTP and may be offline at any
//! time; callers treat [`BackendError::is_unavailable`] as "defer to the
//! backlog worker", never as fatal.
//!
//! # Endpoints
//!
//! | Method | Path | Body |
//! |--------|------|------|
//! | `POST` | `/classify` | `{title, content, source}` |
//! | `POST` | `/duplicates` | `{title, content, threshold}` |
//! | `POST` | `/index` | `{id, title, content}` |
//! | `POST` | `/index/batch` | `{items: [{id, title, content}]}` |
//! | `GET`  | `/health` | none |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::ClassificationConfig;
use crate::error::BackendError;
use crate::models::{FastClassification, Priority};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub relevant: bool,
    /// Relevance confidence in `[0, 1]`; drives the routing band.
    pub confidence: f64,
    pub priority: Priority,
    #[serde(default)]
    pub priority_score: Option<f64>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub category_confidences: HashMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateMatch {
    pub id: String,
    pub score: f64,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexEntry {
    pub id: String,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackendHealth {
    pub available: bool,
    #[serde(default)]
    pub index_size: u64,
}

#[async_trait]
pub trait ClassificationBackend: Send + Sync {
    /// Identity recorded as `model_name` in the processing log.
    fn name(&self) -> &str;

    async fn classify(
        &self,
        title: &str,
        content: &str,
        source: &str,
    ) -> Result<ClassificationResult, BackendError>;

    /// Matches sorted by descending score, filtered server-side by `threshold`.
    async fn find_duplicates(
        &self,
        title: &str,
        content: &str,
        threshold: f64,
    ) -> Result<Vec<DuplicateMatch>, BackendError>;

    async fn index(&self, id: &str, title: &str, content: &str) -> Result<(), BackendError>;

    async fn index_batch(&self, entries: &[IndexEntry]) -> Result<(), BackendError>;

    async fn health(&self) -> Result<BackendHealth, BackendError>;

    /// `true` only when the health probe answers and reports itself available.
    async fn is_available(&self) -> bool {
        matches!(self.health().await, Ok(h) if h.available)
    }
}

/// Routing band derived from the fast classifier's relevance confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceBand {
    /// `confidence < low`
    Irrelevant,
    /// `low <= confidence <= high`
    Uncertain,
    /// `confidence > high`
    Confident,
}

impl ConfidenceBand {
    pub fn from_confidence(confidence: f64, low: f64, high: f64) -> Self {
        if confidence < low {
            ConfidenceBand::Irrelevant
        } else if confidence <= high {
            ConfidenceBand::Uncertain
        } else {
            ConfidenceBand::Confident
        }
    }

    pub fn needs_deep_analysis(&self) -> bool {
        matches!(self, ConfidenceBand::Uncertain)
    }
}

/// Turn a backend result into the persisted classification, applying the bands.
pub fn route(result: &ClassificationResult, config: &ClassificationConfig) -> FastClassification {
    let band = ConfidenceBand::from_confidence(
        result.confidence,
        config.low_threshold,
        config.high_threshold,
    );
    FastClassification {
        relevant: result.relevant && band != ConfidenceBand::Irrelevant,
        confidence: result.confidence,
        priority: result.priority,
        priority_score: result
            .priority_score
            .unwrap_or_else(|| result.priority.default_score()),
        categories: result.categories.clone(),
        needs_deep_analysis: band.needs_deep_analysis(),
    }
}

// ============ HTTP client ============

pub struct HttpClassificationBackend {
    base_url: String,
    model_name: String,
    client: reqwest::Client,
}

impl HttpClassificationBackend {
    pub fn new(config: &ClassificationConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            model_name: config.model_name.clone(),
            client,
        })
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, BackendError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        check_status(response).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Http {
        status: status.as_u16(),
        body,
    })
}

async fn parse_body<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, BackendError> {
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|e| BackendError::Malformed(e.to_string()))
}

#[derive(Deserialize)]
struct DuplicatesResponse {
    #[serde(default)]
    duplicates: Vec<DuplicateMatch>,
}

#[async_trait]
impl ClassificationBackend for HttpClassificationBackend {
    fn name(&self) -> &str {
        &self.model_name
    }

    async fn classify(
        &self,
        title: &str,
        content: &str,
        source: &str,
    ) -> Result<ClassificationResult, BackendError> {
        let body = serde_json::json!({ "title": title, "content": content, "source": source });
        let response = self.post_json("/classify", &body).await?;
        let result: ClassificationResult = parse_body(response).await?;
        if !(0.0..=1.0).contains(&result.confidence) {
            return Err(BackendError::Malformed(format!(
                "confidence out of range: {}",
                result.confidence
            )));
        }
        Ok(result)
    }

    async fn find_duplicates(
        &self,
        title: &str,
        content: &str,
        threshold: f64,
    ) -> Result<Vec<DuplicateMatch>, BackendError> {
        let body =
            serde_json::json!({ "title": title, "content": content, "threshold": threshold });
        let response = self.post_json("/duplicates", &body).await?;
        let parsed: DuplicatesResponse = parse_body(response).await?;
        let mut matches = parsed.duplicates;
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(matches)
    }

    async fn index(&self, id: &str, title: &str, content: &str) -> Result<(), BackendError> {
        let body = serde_json::json!({ "id": id, "title": title, "content": content });
        self.post_json("/index", &body).await?;
        Ok(())
    }

    async fn index_batch(&self, entries: &[IndexEntry]) -> Result<(), BackendError> {
        if entries.is_empty() {
            return Ok(());
        }
        let body = serde_json::json!({ "items": entries });
        self.post_json("/index/batch", &body).await?;
        Ok(())
    }

    async fn health(&self) -> Result<BackendHealth, BackendError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        let response = check_status(response).await?;
        parse_body(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(confidence: f64) -> ClassificationResult {
        ClassificationResult {
            relevant: true,
            confidence,
            priority: Priority::Medium,
            priority_score: None,
            categories: vec!["energy".to_string()],
            category_confidences: HashMap::new(),
        }
    }

    #[test]
    fn test_band_boundaries_are_inclusive_for_uncertain() {
        let band = |c| ConfidenceBand::from_confidence(c, 0.25, 0.75);
        assert_eq!(band(0.2499), ConfidenceBand::Irrelevant);
        assert_eq!(band(0.25), ConfidenceBand::Uncertain);
        assert_eq!(band(0.5), ConfidenceBand::Uncertain);
        assert_eq!(band(0.75), ConfidenceBand::Uncertain);
        assert_eq!(band(0.7501), ConfidenceBand::Confident);
    }

    #[test]
    fn test_route_sets_deep_analysis_flag() {
        let config = ClassificationConfig::default();
        assert!(!route(&result(0.1), &config).needs_deep_analysis);
        assert!(!route(&result(0.1), &config).relevant);
        assert!(route(&result(0.25), &config).needs_deep_analysis);
        assert!(route(&result(0.75), &config).needs_deep_analysis);
        let confident = route(&result(0.9), &config);
        assert!(!confident.needs_deep_analysis);
        assert!(confident.relevant);
        assert_eq!(confident.priority_score, Priority::Medium.default_score());
    }

    #[test]
    fn test_result_deserializes_with_defaults() {
        let parsed: ClassificationResult =
            serde_json::from_str(r#"{"relevant": true, "confidence": 0.8, "priority": "high"}"#)
                .unwrap();
        assert_eq!(parsed.priority, Priority::High);
        assert!(parsed.categories.is_empty());
        assert!(parsed.category_confidences.is_empty());
    }
}
