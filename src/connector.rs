//! Connector contract and the built-in connector table.
//!
//! A connector turns one channel into a list of [`RawItem`]s. The scheduler
//! only ever sees the [`Connector`] trait; which implementation runs is
//! decided by the channel's `connector_type` string through
//! [`ConnectorRegistry`].
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │         ConnectorRegistry           │
//! │  "rss" ──► FeedConnector            │
//! │  "..." ──► registered at startup    │
//! └──────────────┬──────────────────────┘
//!                ▼
//!     Scheduler::run_cycle() → Pipeline
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::models::{Channel, RawItem};

/// Outcome of validating a channel's connector configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub ok: bool,
    pub message: String,
}

impl Validation {
    pub fn ok() -> Self {
        Self {
            ok: true,
            message: "ok".to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// A source-specific fetcher.
///
/// Implementations must not touch storage. Errors are per-channel: the
/// scheduler records them on the channel and moves on.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Type string matched against `channels.connector_type`.
    fn connector_type(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Fetch the channel and return items in the order the source lists them.
    async fn fetch(&self, channel: &Channel) -> Result<Vec<RawItem>>;

    /// Check a channel's URL and options without fetching.
    fn validate(&self, url: &str, options: &serde_json::Value) -> Validation;
}

/// Maps connector-type strings to implementations.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the connectors compiled into sift.
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(FeedConnector::new()?));
        Ok(registry)
    }

    /// Register a connector, replacing any previous one of the same type.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors
            .insert(connector.connector_type().to_string(), connector);
    }

    pub fn get(&self, connector_type: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(connector_type).cloned()
    }

    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.connectors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Validate a channel against its connector. Unknown types are invalid.
    pub fn validate(&self, connector_type: &str, url: &str, options: &serde_json::Value) -> Validation {
        match self.get(connector_type) {
            Some(c) => c.validate(url, options),
            None => Validation::invalid(format!(
                "unknown connector type '{}' (known: {})",
                connector_type,
                self.types().join(", ")
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// RSS / Atom feed connector
// ═══════════════════════════════════════════════════════════════════════

const FEED_USER_AGENT: &str = concat!("sift/", env!("CARGO_PKG_VERSION"));

/// Polls RSS 2.0 and Atom feeds.
///
/// Options: `max_items` (integer) caps how many entries are returned.
pub struct FeedConnector {
    client: reqwest::Client,
}

impl FeedConnector {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(FEED_USER_AGENT)
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Connector for FeedConnector {
    fn connector_type(&self) -> &str {
        "rss"
    }

    fn description(&self) -> &str {
        "RSS 2.0 and Atom feed polling"
    }

    async fn fetch(&self, channel: &Channel) -> Result<Vec<RawItem>> {
        let response = self
            .client
            .get(&channel.url)
            .send()
            .await
            .with_context(|| format!("GET {}", channel.url))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("feed returned HTTP {}", status);
        }
        let body = response.text().await?;
        let mut items = parse_feed(&body)?;
        if let Some(max) = channel.options.get("max_items").and_then(|v| v.as_u64()) {
            items.truncate(max as usize);
        }
        Ok(items)
    }

    fn validate(&self, url: &str, options: &serde_json::Value) -> Validation {
        match url::Url::parse(url) {
            Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
            Ok(u) => return Validation::invalid(format!("unsupported scheme '{}'", u.scheme())),
            Err(e) => return Validation::invalid(format!("invalid url: {}", e)),
        }
        if let Some(max) = options.get("max_items") {
            if !max.is_u64() {
                return Validation::invalid("max_items must be a non-negative integer");
            }
        }
        Validation::ok()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
    Id,
    Content,
    Author,
    Date,
}

fn field_for(local_name: &[u8]) -> Option<Field> {
    match local_name {
        b"title" => Some(Field::Title),
        b"link" => Some(Field::Link),
        b"guid" | b"id" => Some(Field::Id),
        b"description" | b"summary" | b"content" | b"encoded" => Some(Field::Content),
        b"author" | b"creator" | b"name" => Some(Field::Author),
        b"pubDate" | b"published" | b"updated" | b"date" => Some(Field::Date),
        _ => None,
    }
}

#[derive(Default)]
struct Entry {
    title: String,
    link: String,
    id: String,
    content: String,
    author: String,
    date: String,
}

impl Entry {
    fn set(&mut self, field: Field, value: String) {
        let slot = match field {
            Field::Title => &mut self.title,
            Field::Link => &mut self.link,
            Field::Id => &mut self.id,
            // The longest body wins: `content:encoded` over `description`.
            Field::Content => {
                if value.len() > self.content.len() {
                    self.content = value;
                }
                return;
            }
            Field::Author => &mut self.author,
            Field::Date => &mut self.date,
        };
        if slot.is_empty() {
            *slot = value;
        }
    }

    fn into_raw(self) -> Option<RawItem> {
        let external_id = [&self.id, &self.link, &self.title]
            .into_iter()
            .find(|s| !s.trim().is_empty())?
            .trim()
            .to_string();
        Some(RawItem {
            external_id,
            title: self.title,
            content: self.content,
            url: self.link,
            author: (!self.author.is_empty()).then_some(self.author),
            published_at: parse_feed_date(&self.date),
            metadata: serde_json::json!({}),
        })
    }
}

fn atom_link_href(e: &BytesStart<'_>) -> Option<String> {
    let mut href = None;
    let mut alternate = true;
    for attr in e.attributes().flatten() {
        match attr.key.local_name().as_ref() {
            b"href" => href = attr.unescape_value().ok().map(|v| v.into_owned()),
            b"rel" => alternate = attr.value.as_ref() == b"alternate",
            _ => {}
        }
    }
    href.filter(|_| alternate)
}

/// RFC 2822 (RSS) or RFC 3339 (Atom) timestamps.
pub fn parse_feed_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|d| d.with_timezone(&Utc))
        .ok()
}

/// Parse an RSS 2.0 or Atom document into raw items, in document order.
///
/// Entries with no id, link or title are dropped.
pub fn parse_feed(xml: &str) -> Result<Vec<RawItem>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut entry: Option<Entry> = None;
    let mut capture: Option<(Field, Vec<u8>)> = None;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"item" | b"entry" => entry = Some(Entry::default()),
                    b"link" if entry.is_some() => {
                        if let (Some(href), Some(cur)) = (atom_link_href(&e), entry.as_mut()) {
                            cur.set(Field::Link, href);
                        }
                        capture = Some((Field::Link, b"link".to_vec()));
                        text.clear();
                    }
                    other if entry.is_some() && capture.is_none() => {
                        if let Some(field) = field_for(other) {
                            capture = Some((field, other.to_vec()));
                            text.clear();
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"link" {
                    if let (Some(href), Some(cur)) = (atom_link_href(&e), entry.as_mut()) {
                        cur.set(Field::Link, href);
                    }
                }
            }
            Ok(Event::Text(t)) if capture.is_some() => {
                let value = t.unescape().context("invalid text in feed")?;
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(&value);
            }
            Ok(Event::CData(c)) if capture.is_some() => {
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(&String::from_utf8_lossy(&c));
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                let closes_capture = capture
                    .as_ref()
                    .is_some_and(|(_, open)| open.as_slice() == name.as_ref());
                if closes_capture {
                    if let (Some((field, _)), Some(cur)) = (capture.take(), entry.as_mut()) {
                        let value = std::mem::take(&mut text).trim().to_string();
                        if !value.is_empty() {
                            cur.set(field, value);
                        }
                    }
                } else if matches!(name.as_ref(), b"item" | b"entry") {
                    capture = None;
                    if let Some(raw) = entry.take().and_then(Entry::into_raw) {
                        items.push(raw);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => anyhow::bail!(
                "feed parse error at position {}: {}",
                reader.buffer_position(),
                e
            ),
            _ => {}
        }
    }

    Ok(items)
}
