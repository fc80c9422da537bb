use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations_for(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    run_migrations(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            enabled INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            connector_type TEXT NOT NULL,
            options_json TEXT NOT NULL DEFAULT '{}',
            interval_secs INTEGER NOT NULL DEFAULT 3600,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_fetched_at INTEGER,
            last_error TEXT,
            UNIQUE(source_id, name),
            FOREIGN KEY (source_id) REFERENCES sources(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // similar_to_id is deliberately not a foreign key: primaries may be
    // removed by external retention and the dangling link is healed later.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id TEXT PRIMARY KEY,
            channel_id INTEGER NOT NULL,
            external_id TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            url TEXT NOT NULL,
            author TEXT,
            published_at INTEGER,
            fetched_at INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            similar_to_id TEXT,
            relevant INTEGER,
            priority TEXT,
            priority_score REAL,
            assigned_categories TEXT NOT NULL DEFAULT '[]',
            needs_deep_analysis INTEGER NOT NULL DEFAULT 0,
            fast_classified INTEGER NOT NULL DEFAULT 0,
            fast_classified_at INTEGER,
            duplicate_checked INTEGER NOT NULL DEFAULT 0,
            duplicate_checked_at INTEGER,
            indexed INTEGER NOT NULL DEFAULT 0,
            summary TEXT,
            detailed_analysis TEXT,
            reasoning TEXT,
            analyzed_at INTEGER,
            analysis_attempts INTEGER NOT NULL DEFAULT 0,
            UNIQUE(channel_id, external_id),
            UNIQUE(channel_id, content_hash),
            FOREIGN KEY (channel_id) REFERENCES channels(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_log (
            id TEXT PRIMARY KEY,
            item_id TEXT,
            channel_id INTEGER,
            step_type TEXT NOT NULL,
            model_name TEXT,
            confidence REAL,
            priority_input TEXT,
            priority_output TEXT,
            status TEXT NOT NULL,
            error_message TEXT,
            started_at INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            definition_json TEXT NOT NULL,
            priority TEXT,
            category TEXT,
            position INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One index per backlog queue so each worker poll stays cheap.
    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_items_unclassified ON items(fast_classified, fetched_at)",
        "CREATE INDEX IF NOT EXISTS idx_items_unchecked ON items(duplicate_checked, fetched_at)",
        "CREATE INDEX IF NOT EXISTS idx_items_unindexed ON items(indexed, fetched_at)",
        "CREATE INDEX IF NOT EXISTS idx_items_deep ON items(needs_deep_analysis, fast_classified, fetched_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_items_similar_to ON items(similar_to_id)",
        "CREATE INDEX IF NOT EXISTS idx_log_item ON processing_log(item_id)",
        "CREATE INDEX IF NOT EXISTS idx_channels_source ON channels(source_id)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}
