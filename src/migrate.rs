use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index the pipeline touches. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Rows written by the (external) ingestion layer
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feeds (
            id INTEGER PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL DEFAULT '',
            author TEXT NOT NULL DEFAULT '',
            origin TEXT NOT NULL DEFAULT '',
            link TEXT,
            published INTEGER,
            added INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Written by training; read-only here
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS models (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            score_name TEXT,
            is_active INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            feed_id INTEGER PRIMARY KEY,
            embedding BLOB NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (feed_id) REFERENCES feeds(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS predicted_preferences (
            feed_id INTEGER NOT NULL,
            model_id INTEGER NOT NULL,
            score REAL NOT NULL,
            PRIMARY KEY (feed_id, model_id),
            FOREIGN KEY (feed_id) REFERENCES feeds(id) ON DELETE CASCADE,
            FOREIGN KEY (model_id) REFERENCES models(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            score_threshold REAL NOT NULL DEFAULT 0.7,
            model_id INTEGER NOT NULL,
            broadcast_limit INTEGER NOT NULL DEFAULT 20
                CHECK (broadcast_limit BETWEEN 1 AND 100),
            broadcast_hours TEXT,
            include_abstracts INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY (model_id) REFERENCES models(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS broadcasts (
            feed_id INTEGER NOT NULL,
            channel_id INTEGER NOT NULL,
            broadcasted_time INTEGER,
            PRIMARY KEY (feed_id, channel_id),
            FOREIGN KEY (feed_id) REFERENCES feeds(id) ON DELETE CASCADE,
            FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_feeds_added ON feeds(added)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_preferences_model_score ON predicted_preferences(model_id, score)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_broadcasts_channel_time ON broadcasts(channel_id, broadcasted_time)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
