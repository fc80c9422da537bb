//! Core data models used throughout sift.
//!
//! These types represent the channels, items and processing-log entries
//! that flow through ingestion, dedup and classification. Timestamps are
//! stored as Unix seconds, matching the SQLite schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Priority assigned by the fast classifier, rules, or deep analysis.
///
/// Ordered from least to most urgent so rules can only raise it via `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// Priority recorded when deep analysis fails terminally.
pub const SENTINEL_PRIORITY: Priority = Priority::Low;

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    /// Bucket a 0..1 priority score.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.85 {
            Priority::Critical
        } else if score >= 0.65 {
            Priority::High
        } else if score >= 0.4 {
            Priority::Medium
        } else {
            Priority::Low
        }
    }

    /// Representative score for a bucket, used when a backend returns only a label.
    pub fn default_score(&self) -> f64 {
        match self {
            Priority::Low => 0.2,
            Priority::Medium => 0.5,
            Priority::High => 0.75,
            Priority::Critical => 0.95,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "none" => Ok(Priority::Low),
            "medium" | "normal" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" | "urgent" => Ok(Priority::Critical),
            other => anyhow::bail!("Unknown priority: '{}'", other),
        }
    }
}

/// One fetchable endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Channel {
    pub id: i64,
    pub source_id: i64,
    pub source_name: String,
    pub name: String,
    pub url: String,
    pub connector_type: String,
    pub options: serde_json::Value,
    pub interval_secs: i64,
    pub enabled: bool,
    pub last_fetched_at: Option<i64>,
    pub last_error: Option<String>,
}

impl Channel {
    /// A channel is due when it was never fetched or its interval has elapsed.
    pub fn is_due(&self, now: i64) -> bool {
        match self.last_fetched_at {
            None => true,
            Some(last) => now >= last + self.interval_secs,
        }
    }
}

/// Item as produced by a connector, before normalization.
#[derive(Debug, Clone, Default)]
pub struct RawItem {
    pub external_id: String,
    pub title: String,
    pub content: String,
    pub url: String,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// Result of the fast classification pass, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct FastClassification {
    pub relevant: bool,
    pub confidence: f64,
    pub priority: Priority,
    pub priority_score: f64,
    pub categories: Vec<String>,
    pub needs_deep_analysis: bool,
}

impl FastClassification {
    /// Recorded when the fast classifier answers with something unusable.
    /// The item is handed to deep analysis instead of being retried.
    pub fn sentinel() -> Self {
        Self {
            relevant: false,
            confidence: 0.0,
            priority: SENTINEL_PRIORITY,
            priority_score: 0.0,
            categories: Vec::new(),
            needs_deep_analysis: true,
        }
    }
}

/// Result of the deep analysis pass, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct DeepAnalysis {
    pub summary: String,
    pub detailed_analysis: String,
    pub relevant: bool,
    pub priority: Priority,
    pub priority_score: f64,
    pub categories: Vec<String>,
    pub reasoning: String,
}

impl DeepAnalysis {
    /// Terminal result recorded when every attempt failed.
    pub fn sentinel(reason: &str) -> Self {
        Self {
            summary: String::new(),
            detailed_analysis: String::new(),
            relevant: false,
            priority: SENTINEL_PRIORITY,
            priority_score: 0.0,
            categories: Vec::new(),
            reasoning: format!("analysis failed: {}", reason),
        }
    }
}

/// Normalized item about to be inserted by the pipeline.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub id: String,
    pub channel_id: i64,
    pub external_id: String,
    pub title: String,
    pub content: String,
    pub url: String,
    pub author: Option<String>,
    pub published_at: Option<i64>,
    pub fetched_at: i64,
    pub content_hash: String,
    pub metadata_json: String,
    pub similar_to_id: Option<String>,
    pub duplicate_checked: bool,
    pub classification: Option<FastClassification>,
}

/// Item as stored.
#[derive(Debug, Clone, Serialize)]
pub struct Item {
    pub id: String,
    pub channel_id: i64,
    pub external_id: String,
    pub title: String,
    pub content: String,
    pub url: String,
    pub author: Option<String>,
    pub published_at: Option<i64>,
    pub fetched_at: i64,
    pub content_hash: String,
    pub similar_to_id: Option<String>,
    pub relevant: Option<bool>,
    pub priority: Option<Priority>,
    pub priority_score: Option<f64>,
    pub assigned_categories: Vec<String>,
    pub needs_deep_analysis: bool,
    pub fast_classified: bool,
    pub fast_classified_at: Option<i64>,
    pub duplicate_checked: bool,
    pub duplicate_checked_at: Option<i64>,
    pub indexed: bool,
    pub summary: Option<String>,
    pub detailed_analysis: Option<String>,
    pub reasoning: Option<String>,
    pub analyzed_at: Option<i64>,
    /// Failed deep-analysis attempts so far, across passes.
    pub analysis_attempts: i64,
}

/// Pipeline or worker step recorded in the processing log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    ExactDedup,
    SemanticDedup,
    FastClassify,
    Rules,
    Persist,
    Index,
    DeepAnalysis,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::ExactDedup => "exact_dedup",
            StepType::SemanticDedup => "semantic_dedup",
            StepType::FastClassify => "fast_classify",
            StepType::Rules => "rules",
            StepType::Persist => "persist",
            StepType::Index => "index",
            StepType::DeepAnalysis => "deep_analysis",
        }
    }
}

impl FromStr for StepType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "exact_dedup" => StepType::ExactDedup,
            "semantic_dedup" => StepType::SemanticDedup,
            "fast_classify" => StepType::FastClassify,
            "rules" => StepType::Rules,
            "persist" => StepType::Persist,
            "index" => StepType::Index,
            "deep_analysis" => StepType::DeepAnalysis,
            other => anyhow::bail!("Unknown step type: '{}'", other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Skipped,
    Error,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Skipped => "skipped",
            StepStatus::Error => "error",
        }
    }
}

impl FromStr for StepStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "success" => StepStatus::Success,
            "skipped" => StepStatus::Skipped,
            "error" => StepStatus::Error,
            other => anyhow::bail!("Unknown step status: '{}'", other),
        })
    }
}

/// Append-only record of one step applied to one item.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingLogEntry {
    pub id: String,
    pub item_id: Option<String>,
    pub channel_id: Option<i64>,
    pub step_type: StepType,
    pub model_name: Option<String>,
    pub confidence: Option<f64>,
    pub priority_input: Option<Priority>,
    pub priority_output: Option<Priority>,
    pub status: StepStatus,
    pub error_message: Option<String>,
    pub started_at: i64,
    pub duration_ms: i64,
}

impl ProcessingLogEntry {
    /// Start an entry for `step`. Call the builder methods, then [`finish`](Self::finish).
    pub fn begin(step_type: StepType, item_id: Option<&str>, channel_id: Option<i64>) -> LogBuilder {
        LogBuilder {
            entry: ProcessingLogEntry {
                id: uuid::Uuid::new_v4().to_string(),
                item_id: item_id.map(str::to_string),
                channel_id,
                step_type,
                model_name: None,
                confidence: None,
                priority_input: None,
                priority_output: None,
                status: StepStatus::Success,
                error_message: None,
                started_at: Utc::now().timestamp(),
                duration_ms: 0,
            },
            started: Instant::now(),
        }
    }
}

pub struct LogBuilder {
    entry: ProcessingLogEntry,
    started: Instant,
}

impl LogBuilder {
    pub fn item(mut self, item_id: &str) -> Self {
        self.entry.item_id = Some(item_id.to_string());
        self
    }

    pub fn model(mut self, name: &str) -> Self {
        self.entry.model_name = Some(name.to_string());
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.entry.confidence = Some(confidence);
        self
    }

    pub fn priorities(mut self, input: Option<Priority>, output: Option<Priority>) -> Self {
        self.entry.priority_input = input;
        self.entry.priority_output = output;
        self
    }

    pub fn skipped(mut self, reason: impl Into<String>) -> Self {
        self.entry.status = StepStatus::Skipped;
        self.entry.error_message = Some(reason.into());
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.entry.status = StepStatus::Error;
        self.entry.error_message = Some(message.into());
        self
    }

    pub fn finish(mut self) -> ProcessingLogEntry {
        self.entry.duration_ms = self.started.elapsed().as_millis() as i64;
        self.entry
    }
}

/// Depth of each backlog queue, surfaced to the status endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub unclassified: i64,
    pub unchecked: i64,
    pub unindexed: i64,
    pub pending_deep_analysis: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::Low.max(Priority::High), Priority::High);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!(" urgent ".parse::<Priority>().unwrap(), Priority::Critical);
        assert!("whenever".parse::<Priority>().is_err());
    }

    #[test]
    fn test_priority_from_score() {
        assert_eq!(Priority::from_score(0.9), Priority::Critical);
        assert_eq!(Priority::from_score(0.65), Priority::High);
        assert_eq!(Priority::from_score(0.4), Priority::Medium);
        assert_eq!(Priority::from_score(0.1), Priority::Low);
    }

    #[test]
    fn test_channel_due() {
        let mut channel = Channel {
            id: 1,
            source_id: 1,
            source_name: "s".to_string(),
            name: "c".to_string(),
            url: "https://example.org".to_string(),
            connector_type: "rss".to_string(),
            options: serde_json::json!({}),
            interval_secs: 600,
            enabled: true,
            last_fetched_at: None,
            last_error: None,
        };
        assert!(channel.is_due(0));
        channel.last_fetched_at = Some(1_000);
        assert!(!channel.is_due(1_599));
        assert!(channel.is_due(1_600));
    }

    #[test]
    fn test_sentinel_analysis() {
        let sentinel = DeepAnalysis::sentinel("bad json");
        assert!(!sentinel.relevant);
        assert!(sentinel.summary.is_empty());
        assert_eq!(sentinel.priority, SENTINEL_PRIORITY);
    }
}
