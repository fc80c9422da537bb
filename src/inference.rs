//! Inference Backend client and deep-analysis response parsing.
//!
//! The backend is a large-model text generator (Ollama-compatible API).
//! Models are asked for a JSON object, but the parser accepts whatever a
//! model actually emits: bare JSON, a fenced ```json block, JSON embedded
//! in prose, or `KEY: value` lines.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::BackendError;
use crate::models::{DeepAnalysis, Item, Priority};

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Model identity recorded in the processing log.
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, BackendError>;

    /// Lightweight reachability probe (list models).
    async fn health(&self) -> Result<(), BackendError>;
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an analyst triaging monitoring items. \
Answer with a single JSON object and nothing else.";

pub struct OllamaBackend {
    base_url: String,
    model: String,
    client: reqwest::Client,
    health_client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        // The probe must fail fast while the host is still asleep.
        let health_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            client,
            health_client,
        })
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, BackendError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        if let Some(system) = system {
            body["system"] = serde_json::Value::String(system.to_string());
        }

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let text = response.text().await?;
        let parsed: GenerateResponse =
            serde_json::from_str(&text).map_err(|e| BackendError::Malformed(e.to_string()))?;
        Ok(parsed.response)
    }

    async fn health(&self) -> Result<(), BackendError> {
        let response = self
            .health_client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Http {
                status: response.status().as_u16(),
                body: String::new(),
            })
        }
    }
}

// ============ Prompt ============

const MAX_PROMPT_CONTENT_CHARS: usize = 6000;

pub fn build_prompt(item: &Item, source_name: &str) -> String {
    let date = item
        .published_at
        .or(Some(item.fetched_at))
        .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let content: String = item.content.chars().take(MAX_PROMPT_CONTENT_CHARS).collect();

    format!(
        r#"Analyze the following item.

Source: {source}
Date: {date}
Title: {title}
URL: {url}

Content:
{content}

Respond with a JSON object with these fields:
  "summary": two or three sentence summary,
  "detailed_analysis": why this matters and to whom,
  "relevant": true or false,
  "priority": one of "low", "medium", "high", "critical",
  "priority_score": number between 0 and 1,
  "categories": list of short topic labels,
  "reasoning": one paragraph justifying relevance and priority"#,
        source = source_name,
        date = date,
        title = item.title,
        url = item.url,
        content = content,
    )
}

// ============ Parsing ============

#[derive(Deserialize, Default)]
struct AnalysisFields {
    #[serde(default)]
    summary: String,
    #[serde(default, alias = "analysis", alias = "deep_analysis")]
    detailed_analysis: String,
    #[serde(default, alias = "is_relevant")]
    relevant: Option<bool>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default, alias = "score")]
    priority_score: Option<f64>,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

impl AnalysisFields {
    fn is_usable(&self) -> bool {
        !self.summary.trim().is_empty() || self.relevant.is_some()
    }

    fn into_analysis(self) -> DeepAnalysis {
        let relevant = self.relevant.unwrap_or(!self.summary.trim().is_empty());
        let score = self.priority_score.map(|s| s.clamp(0.0, 1.0));
        let priority = self
            .priority
            .as_deref()
            .and_then(|p| p.parse::<Priority>().ok())
            .or_else(|| score.map(Priority::from_score))
            .unwrap_or(if relevant {
                Priority::Medium
            } else {
                Priority::Low
            });
        DeepAnalysis {
            summary: self.summary.trim().to_string(),
            detailed_analysis: self.detailed_analysis.trim().to_string(),
            relevant,
            priority,
            priority_score: score.unwrap_or_else(|| priority.default_score()),
            categories: self
                .categories
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            reasoning: self.reasoning.trim().to_string(),
        }
    }
}

fn fenced_block() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("static regex"))
}

fn json_candidates(text: &str) -> Vec<&str> {
    let mut candidates = vec![text.trim()];
    if let Some(cap) = fenced_block().captures(text).and_then(|c| c.get(1)) {
        candidates.push(cap.as_str().trim());
    }
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            candidates.push(&text[start..=end]);
        }
    }
    candidates
}

fn parse_bool(raw: &str) -> Option<bool> {
    let value = raw.trim().trim_matches(|c| c == '"' || c == '.').to_ascii_lowercase();
    match value.as_str() {
        "true" | "yes" | "relevant" | "y" => Some(true),
        "false" | "no" | "irrelevant" | "not relevant" | "n" => Some(false),
        _ => None,
    }
}

/// `KEY: value` extraction for models that ignore the JSON instruction.
fn extract_lines(text: &str) -> AnalysisFields {
    #[derive(Clone, Copy)]
    enum Open {
        Summary,
        Analysis,
        Reasoning,
    }

    let mut fields = AnalysisFields::default();
    let mut open: Option<Open> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let keyed = trimmed.split_once(':').map(|(k, v)| {
            let key = k
                .trim_matches(|c: char| c == '*' || c == '#' || c == '-' || c.is_whitespace())
                .to_ascii_lowercase()
                .replace(' ', "_");
            (key, v.trim().trim_start_matches('*').trim())
        });

        let Some((key, value)) = keyed else {
            append_open(&mut fields, open, trimmed);
            continue;
        };

        match key.as_str() {
            "summary" => {
                fields.summary = value.to_string();
                open = Some(Open::Summary);
            }
            "analysis" | "detailed_analysis" | "deep_analysis" => {
                fields.detailed_analysis = value.to_string();
                open = Some(Open::Analysis);
            }
            "reasoning" => {
                fields.reasoning = value.to_string();
                open = Some(Open::Reasoning);
            }
            "relevant" | "relevance" => {
                fields.relevant = parse_bool(value);
                open = None;
            }
            "priority" => {
                fields.priority = Some(value.trim_matches('"').to_string());
                open = None;
            }
            "priority_score" | "score" => {
                fields.priority_score = value.parse().ok();
                open = None;
            }
            "categories" | "category" => {
                fields.categories = value
                    .trim_matches(|c| c == '[' || c == ']')
                    .split(',')
                    .map(|c| c.trim().trim_matches('"').to_string())
                    .filter(|c| !c.is_empty())
                    .collect();
                open = None;
            }
            _ => append_open(&mut fields, open, trimmed),
        }
    }

    fn append_open(fields: &mut AnalysisFields, open: Option<Open>, line: &str) {
        let target = match open {
            Some(Open::Summary) => &mut fields.summary,
            Some(Open::Analysis) => &mut fields.detailed_analysis,
            Some(Open::Reasoning) => &mut fields.reasoning,
            None => return,
        };
        if !target.is_empty() {
            target.push(' ');
        }
        target.push_str(line);
    }

    fields
}

/// Parse a model response into a [`DeepAnalysis`].
///
/// Fails with [`BackendError::Malformed`] when neither the JSON forms nor
/// line extraction produce a summary or a relevance verdict.
pub fn parse_analysis(text: &str) -> Result<DeepAnalysis, BackendError> {
    for candidate in json_candidates(text) {
        if let Ok(fields) = serde_json::from_str::<AnalysisFields>(candidate) {
            if fields.is_usable() {
                return Ok(fields.into_analysis());
            }
        }
    }

    let fields = extract_lines(text);
    if fields.is_usable() {
        return Ok(fields.into_analysis());
    }

    let preview: String = text.chars().take(120).collect();
    Err(BackendError::Malformed(format!(
        "no structured analysis in response: {:?}",
        preview
    )))
}
