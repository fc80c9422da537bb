//! Storage contracts consumed by the pipeline and workers.
//!
//! The [`Store`] trait names every read and write the core performs, so
//! the scheduler and workers never issue SQL themselves. [`SqliteStore`]
//! is the implementation backed by the schema in [`crate::migrate`].
//!
//! Marker state (`fast_classified`, `duplicate_checked`, `indexed`,
//! `needs_deep_analysis`) is always read fresh from storage; every marker
//! write is conditional on the marker still being unset, so two workers
//! racing on the same item converge instead of overwriting each other.
//!
//! | Method | Used by |
//! |--------|---------|
//! | [`due_channels`](Store::due_channels), [`record_fetch`](Store::record_fetch) | scheduler |
//! | [`item_exists`](Store::item_exists), [`content_hash_exists`](Store::content_hash_exists), [`insert_item`](Store::insert_item) | pipeline |
//! | [`unclassified_items`](Store::unclassified_items), [`unchecked_items`](Store::unchecked_items), [`unindexed_items`](Store::unindexed_items) | classifier worker |
//! | [`deep_analysis_candidates`](Store::deep_analysis_candidates), [`apply_deep_analysis`](Store::apply_deep_analysis) | LLM worker |

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::{ChannelConfig, Config, RuleConfig, SourceConfig};
use crate::models::{
    Channel, DeepAnalysis, FastClassification, Item, NewItem, Priority, ProcessingLogEntry,
    QueueDepths,
};
use crate::rules::{Rule, RuleType};

#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_source(&self, source: &SourceConfig) -> Result<i64>;

    async fn upsert_channel(&self, source_id: i64, channel: &ChannelConfig) -> Result<i64>;

    async fn upsert_rule(&self, rule: &RuleConfig, position: i64) -> Result<i64>;

    async fn list_channels(&self) -> Result<Vec<Channel>>;

    /// Enabled channels of enabled sources whose fetch interval has elapsed.
    async fn due_channels(&self, now: i64) -> Result<Vec<Channel>>;

    /// Record a fetch attempt. `error = None` clears any previous error.
    async fn record_fetch(&self, channel_id: i64, fetched_at: i64, error: Option<&str>)
        -> Result<()>;

    async fn item_exists(&self, channel_id: i64, external_id: &str) -> Result<bool>;

    async fn content_hash_exists(&self, channel_id: i64, content_hash: &str) -> Result<bool>;

    /// Insert a new item. Returns `false` when a uniqueness constraint
    /// already holds a row for this identity or hash.
    async fn insert_item(&self, item: &NewItem) -> Result<bool>;

    async fn get_item(&self, id: &str) -> Result<Option<Item>>;

    /// Follow one hop of `similar_to_id` to the primary item.
    ///
    /// Returns `None` when `id` no longer exists or points at a primary that
    /// has been removed, so callers never link to a missing or non-primary row.
    async fn resolve_primary(&self, id: &str) -> Result<Option<String>>;

    /// Oldest-first items with `fast_classified` unset.
    async fn unclassified_items(&self, limit: i64) -> Result<Vec<Item>>;

    /// Oldest-first items with `duplicate_checked` unset and no `similar_to_id`,
    /// fetched at or after `since` when given.
    async fn unchecked_items(&self, since: Option<i64>, limit: i64) -> Result<Vec<Item>>;

    async fn unindexed_items(&self, limit: i64) -> Result<Vec<Item>>;

    /// Items eligible for deep analysis, newest first. `fresh` selects items
    /// fetched at or after `fresh_since`; otherwise strictly before it.
    async fn deep_analysis_candidates(
        &self,
        fresh_since: i64,
        fresh: bool,
        limit: i64,
    ) -> Result<Vec<Item>>;

    /// Persist a fast classification if the item is still unclassified.
    async fn apply_fast_classification(
        &self,
        id: &str,
        classification: &FastClassification,
    ) -> Result<bool>;

    /// Mark the duplicate check done, optionally linking to a primary.
    ///
    /// Any items that referenced `id` as their primary are re-pointed to
    /// `similar_to` so no chain is ever formed.
    async fn mark_duplicate_checked(&self, id: &str, similar_to: Option<&str>) -> Result<bool>;

    async fn mark_indexed(&self, ids: &[String]) -> Result<u64>;

    /// Persist a deep-analysis result and clear the pending flag.
    async fn apply_deep_analysis(&self, id: &str, analysis: &DeepAnalysis) -> Result<bool>;

    /// Count one failed deep-analysis attempt; returns the new total.
    async fn record_analysis_failure(&self, id: &str) -> Result<i64>;

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<()>;

    async fn log_entries(&self, item_id: &str) -> Result<Vec<ProcessingLogEntry>>;

    async fn queue_depths(&self, unchecked_since: Option<i64>) -> Result<QueueDepths>;

    /// Null out `similar_to_id` values whose target no longer exists and
    /// reopen those items for a duplicate check. Returns the count healed.
    async fn clear_dangling_links(&self) -> Result<u64>;

    /// Enabled rules in evaluation order.
    async fn rules(&self) -> Result<Vec<Rule>>;
}

/// SQLite implementation of [`Store`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn count_items(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn list_items(&self, channel_id: i64) -> Result<Vec<Item>> {
        let sql = format!(
            "SELECT {} FROM items WHERE channel_id = ? ORDER BY fetched_at ASC, rowid ASC",
            ITEM_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(channel_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_item).collect()
    }
}

const ITEM_COLUMNS: &str = "id, channel_id, external_id, title, content, url, author, \
    published_at, fetched_at, content_hash, similar_to_id, relevant, priority, priority_score, \
    assigned_categories, needs_deep_analysis, fast_classified, fast_classified_at, \
    duplicate_checked, duplicate_checked_at, indexed, summary, detailed_analysis, reasoning, \
    analyzed_at, analysis_attempts";

const CHANNEL_COLUMNS: &str = "c.id, c.source_id, s.name AS source_name, c.name, c.url, \
    c.connector_type, c.options_json, c.interval_secs, c.enabled, c.last_fetched_at, c.last_error";

fn parse_priority(raw: Option<String>) -> Option<Priority> {
    raw.and_then(|p| p.parse().ok())
}

fn row_to_item(row: &SqliteRow) -> Result<Item> {
    let categories: String = row.try_get("assigned_categories")?;
    Ok(Item {
        id: row.try_get("id")?,
        channel_id: row.try_get("channel_id")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        url: row.try_get("url")?,
        author: row.try_get("author")?,
        published_at: row.try_get("published_at")?,
        fetched_at: row.try_get("fetched_at")?,
        content_hash: row.try_get("content_hash")?,
        similar_to_id: row.try_get("similar_to_id")?,
        relevant: row.try_get("relevant")?,
        priority: parse_priority(row.try_get("priority")?),
        priority_score: row.try_get("priority_score")?,
        assigned_categories: serde_json::from_str(&categories).unwrap_or_default(),
        needs_deep_analysis: row.try_get("needs_deep_analysis")?,
        fast_classified: row.try_get("fast_classified")?,
        fast_classified_at: row.try_get("fast_classified_at")?,
        duplicate_checked: row.try_get("duplicate_checked")?,
        duplicate_checked_at: row.try_get("duplicate_checked_at")?,
        indexed: row.try_get("indexed")?,
        summary: row.try_get("summary")?,
        detailed_analysis: row.try_get("detailed_analysis")?,
        reasoning: row.try_get("reasoning")?,
        analyzed_at: row.try_get("analyzed_at")?,
        analysis_attempts: row.try_get("analysis_attempts")?,
    })
}

fn row_to_channel(row: &SqliteRow) -> Result<Channel> {
    let options: String = row.try_get("options_json")?;
    Ok(Channel {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        source_name: row.try_get("source_name")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        connector_type: row.try_get("connector_type")?,
        options: serde_json::from_str(&options).unwrap_or_else(|_| serde_json::json!({})),
        interval_secs: row.try_get("interval_secs")?,
        enabled: row.try_get("enabled")?,
        last_fetched_at: row.try_get("last_fetched_at")?,
        last_error: row.try_get("last_error")?,
    })
}

fn row_to_log_entry(row: &SqliteRow) -> Result<ProcessingLogEntry> {
    let step: String = row.try_get("step_type")?;
    let status: String = row.try_get("status")?;
    Ok(ProcessingLogEntry {
        id: row.try_get("id")?,
        item_id: row.try_get("item_id")?,
        channel_id: row.try_get("channel_id")?,
        step_type: step.parse()?,
        model_name: row.try_get("model_name")?,
        confidence: row.try_get("confidence")?,
        priority_input: parse_priority(row.try_get("priority_input")?),
        priority_output: parse_priority(row.try_get("priority_output")?),
        status: status.parse()?,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get("started_at")?,
        duration_ms: row.try_get("duration_ms")?,
    })
}

fn options_json(value: &serde_json::Value) -> String {
    if value.is_null() {
        "{}".to_string()
    } else {
        value.to_string()
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_source(&self, source: &SourceConfig) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO sources (name, enabled) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET enabled = excluded.enabled
            "#,
        )
        .bind(&source.name)
        .bind(source.enabled)
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM sources WHERE name = ?")
            .bind(&source.name)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn upsert_channel(&self, source_id: i64, channel: &ChannelConfig) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO channels (source_id, name, url, connector_type, options_json, interval_secs, enabled)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id, name) DO UPDATE SET
                url = excluded.url,
                connector_type = excluded.connector_type,
                options_json = excluded.options_json,
                interval_secs = excluded.interval_secs,
                enabled = excluded.enabled
            "#,
        )
        .bind(source_id)
        .bind(&channel.name)
        .bind(&channel.url)
        .bind(&channel.connector)
        .bind(options_json(&channel.options))
        .bind(channel.interval_secs)
        .bind(channel.enabled)
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM channels WHERE source_id = ? AND name = ?")
            .bind(source_id)
            .bind(&channel.name)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn upsert_rule(&self, rule: &RuleConfig, position: i64) -> Result<i64> {
        let definition = serde_json::to_string(&rule.rule_type)?;
        sqlx::query(
            r#"
            INSERT INTO rules (name, definition_json, priority, category, position, enabled)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                definition_json = excluded.definition_json,
                priority = excluded.priority,
                category = excluded.category,
                position = excluded.position,
                enabled = excluded.enabled
            "#,
        )
        .bind(&rule.name)
        .bind(&definition)
        .bind(rule.priority.map(|p| p.as_str()))
        .bind(&rule.category)
        .bind(position)
        .bind(rule.enabled)
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM rules WHERE name = ?")
            .bind(&rule.name)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn list_channels(&self) -> Result<Vec<Channel>> {
        let sql = format!(
            "SELECT {} FROM channels c JOIN sources s ON s.id = c.source_id ORDER BY c.id",
            CHANNEL_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_channel).collect()
    }

    async fn due_channels(&self, now: i64) -> Result<Vec<Channel>> {
        let sql = format!(
            r#"
            SELECT {} FROM channels c JOIN sources s ON s.id = c.source_id
            WHERE c.enabled = 1 AND s.enabled = 1
              AND (c.last_fetched_at IS NULL OR ? >= c.last_fetched_at + c.interval_secs)
            ORDER BY c.last_fetched_at IS NOT NULL, c.last_fetched_at, c.id
            "#,
            CHANNEL_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_channel).collect()
    }

    async fn record_fetch(
        &self,
        channel_id: i64,
        fetched_at: i64,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE channels SET last_fetched_at = ?, last_error = ? WHERE id = ?")
            .bind(fetched_at)
            .bind(error)
            .bind(channel_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn item_exists(&self, channel_id: i64, external_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM items WHERE channel_id = ? AND external_id = ?)",
        )
        .bind(channel_id)
        .bind(external_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn content_hash_exists(&self, channel_id: i64, content_hash: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM items WHERE channel_id = ? AND content_hash = ?)",
        )
        .bind(channel_id)
        .bind(content_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_item(&self, item: &NewItem) -> Result<bool> {
        let now = Utc::now().timestamp();
        let c = item.classification.as_ref();
        let categories = serde_json::to_string(&c.map(|c| &c.categories).cloned().unwrap_or_default())?;

        let result = sqlx::query(
            r#"
            INSERT INTO items (
                id, channel_id, external_id, title, content, url, author, published_at,
                fetched_at, content_hash, metadata_json, similar_to_id,
                duplicate_checked, duplicate_checked_at,
                relevant, priority, priority_score, assigned_categories,
                needs_deep_analysis, fast_classified, fast_classified_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&item.id)
        .bind(item.channel_id)
        .bind(&item.external_id)
        .bind(&item.title)
        .bind(&item.content)
        .bind(&item.url)
        .bind(&item.author)
        .bind(item.published_at)
        .bind(item.fetched_at)
        .bind(&item.content_hash)
        .bind(&item.metadata_json)
        .bind(&item.similar_to_id)
        .bind(item.duplicate_checked)
        .bind(item.duplicate_checked.then_some(now))
        .bind(c.map(|c| c.relevant))
        .bind(c.map(|c| c.priority.as_str()))
        .bind(c.map(|c| c.priority_score))
        .bind(&categories)
        .bind(c.is_some_and(|c| c.needs_deep_analysis))
        .bind(c.is_some())
        .bind(c.map(|_| now))
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting item {}", item.id))?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_item(&self, id: &str) -> Result<Option<Item>> {
        let sql = format!("SELECT {} FROM items WHERE id = ?", ITEM_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn resolve_primary(&self, id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT i.id, i.similar_to_id, p.id AS primary_id
            FROM items i LEFT JOIN items p ON p.id = i.similar_to_id
            WHERE i.id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let similar_to: Option<String> = row.try_get("similar_to_id")?;
        match similar_to {
            None => Ok(Some(row.try_get("id")?)),
            Some(_) => Ok(row.try_get("primary_id")?),
        }
    }

    async fn unclassified_items(&self, limit: i64) -> Result<Vec<Item>> {
        let sql = format!(
            "SELECT {} FROM items WHERE fast_classified = 0 ORDER BY fetched_at ASC, rowid ASC LIMIT ?",
            ITEM_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn unchecked_items(&self, since: Option<i64>, limit: i64) -> Result<Vec<Item>> {
        let sql = format!(
            r#"
            SELECT {} FROM items
            WHERE duplicate_checked = 0 AND similar_to_id IS NULL
              AND (? IS NULL OR fetched_at >= ?)
            ORDER BY fetched_at ASC, rowid ASC
            LIMIT ?
            "#,
            ITEM_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(since)
            .bind(since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn unindexed_items(&self, limit: i64) -> Result<Vec<Item>> {
        let sql = format!(
            "SELECT {} FROM items WHERE indexed = 0 ORDER BY fetched_at ASC, rowid ASC LIMIT ?",
            ITEM_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn deep_analysis_candidates(
        &self,
        fresh_since: i64,
        fresh: bool,
        limit: i64,
    ) -> Result<Vec<Item>> {
        let window = if fresh {
            "fetched_at >= ?"
        } else {
            "fetched_at < ?"
        };
        let sql = format!(
            r#"
            SELECT {} FROM items
            WHERE fast_classified = 1 AND needs_deep_analysis = 1 AND {}
            ORDER BY fetched_at DESC, rowid DESC
            LIMIT ?
            "#,
            ITEM_COLUMNS, window
        );
        let rows = sqlx::query(&sql)
            .bind(fresh_since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn apply_fast_classification(
        &self,
        id: &str,
        classification: &FastClassification,
    ) -> Result<bool> {
        let categories = serde_json::to_string(&classification.categories)?;
        let result = sqlx::query(
            r#"
            UPDATE items SET
                relevant = ?, priority = ?, priority_score = ?, assigned_categories = ?,
                needs_deep_analysis = ?, fast_classified = 1, fast_classified_at = ?
            WHERE id = ? AND fast_classified = 0
            "#,
        )
        .bind(classification.relevant)
        .bind(classification.priority.as_str())
        .bind(classification.priority_score)
        .bind(&categories)
        .bind(classification.needs_deep_analysis)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_duplicate_checked(&self, id: &str, similar_to: Option<&str>) -> Result<bool> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE items SET duplicate_checked = 1, duplicate_checked_at = ?, similar_to_id = ?
            WHERE id = ? AND duplicate_checked = 0 AND similar_to_id IS NULL
            "#,
        )
        .bind(now)
        .bind(similar_to)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if let (Some(primary), true) = (similar_to, result.rows_affected() > 0) {
            sqlx::query("UPDATE items SET similar_to_id = ? WHERE similar_to_id = ?")
                .bind(primary)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_indexed(&self, ids: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0u64;
        for id in ids {
            let result = sqlx::query("UPDATE items SET indexed = 1 WHERE id = ? AND indexed = 0")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            updated += result.rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    async fn apply_deep_analysis(&self, id: &str, analysis: &DeepAnalysis) -> Result<bool> {
        // Empty categories (sentinel results) keep whatever the fast pass assigned.
        let categories = if analysis.categories.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&analysis.categories)?)
        };
        let result = sqlx::query(
            r#"
            UPDATE items SET
                summary = ?, detailed_analysis = ?, reasoning = ?, relevant = ?,
                priority = ?, priority_score = ?,
                assigned_categories = COALESCE(?, assigned_categories),
                needs_deep_analysis = 0, analyzed_at = ?
            WHERE id = ? AND needs_deep_analysis = 1
            "#,
        )
        .bind(&analysis.summary)
        .bind(&analysis.detailed_analysis)
        .bind(&analysis.reasoning)
        .bind(analysis.relevant)
        .bind(analysis.priority.as_str())
        .bind(analysis.priority_score)
        .bind(categories)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_analysis_failure(&self, id: &str) -> Result<i64> {
        let attempts: Option<i64> = sqlx::query_scalar(
            "UPDATE items SET analysis_attempts = analysis_attempts + 1 WHERE id = ? \
             RETURNING analysis_attempts",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        attempts.with_context(|| format!("item {} not found", id))
    }

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processing_log (
                id, item_id, channel_id, step_type, model_name, confidence,
                priority_input, priority_output, status, error_message, started_at, duration_ms
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.item_id)
        .bind(entry.channel_id)
        .bind(entry.step_type.as_str())
        .bind(&entry.model_name)
        .bind(entry.confidence)
        .bind(entry.priority_input.map(|p| p.as_str()))
        .bind(entry.priority_output.map(|p| p.as_str()))
        .bind(entry.status.as_str())
        .bind(&entry.error_message)
        .bind(entry.started_at)
        .bind(entry.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_entries(&self, item_id: &str) -> Result<Vec<ProcessingLogEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM processing_log WHERE item_id = ? ORDER BY started_at ASC, rowid ASC",
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_log_entry).collect()
    }

    async fn queue_depths(&self, unchecked_since: Option<i64>) -> Result<QueueDepths> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(fast_classified = 0), 0) AS unclassified,
                COALESCE(SUM(duplicate_checked = 0 AND similar_to_id IS NULL
                    AND (? IS NULL OR fetched_at >= ?)), 0) AS unchecked,
                COALESCE(SUM(indexed = 0), 0) AS unindexed,
                COALESCE(SUM(fast_classified = 1 AND needs_deep_analysis = 1), 0) AS pending_deep
            FROM items
            "#,
        )
        .bind(unchecked_since)
        .bind(unchecked_since)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueDepths {
            unclassified: row.try_get("unclassified")?,
            unchecked: row.try_get("unchecked")?,
            unindexed: row.try_get("unindexed")?,
            pending_deep_analysis: row.try_get("pending_deep")?,
        })
    }

    async fn clear_dangling_links(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE items SET similar_to_id = NULL, duplicate_checked = 0, duplicate_checked_at = NULL
            WHERE similar_to_id IS NOT NULL
              AND NOT EXISTS (SELECT 1 FROM items p WHERE p.id = items.similar_to_id)
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn rules(&self) -> Result<Vec<Rule>> {
        let rows = sqlx::query(
            "SELECT id, name, definition_json, priority, category, position FROM rules \
             WHERE enabled = 1 ORDER BY position ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let definition: String = row.try_get("definition_json")?;
            let name: String = row.try_get("name")?;
            let rule_type: RuleType = serde_json::from_str(&definition)
                .with_context(|| format!("invalid definition for rule '{}'", name))?;
            rules.push(Rule {
                id: row.try_get("id")?,
                name,
                rule_type,
                priority: parse_priority(row.try_get("priority")?),
                category: row.try_get("category")?,
                position: row.try_get("position")?,
            });
        }
        Ok(rules)
    }
}

/// Upsert every source, channel and rule declared in the config.
///
/// Entries removed from the file are left untouched; disabling is done by
/// setting `enabled = false`.
pub async fn sync_sources(store: &dyn Store, config: &Config) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    for source in &config.sources {
        let source_id = store.upsert_source(source).await?;
        report.sources += 1;
        for channel in &source.channels {
            store.upsert_channel(source_id, channel).await?;
            report.channels += 1;
        }
    }
    for (position, rule) in config.rules.iter().enumerate() {
        store.upsert_rule(rule, position as i64).await?;
        report.rules += 1;
    }
    Ok(report)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub sources: usize,
    pub channels: usize,
    pub rules: usize,
}
