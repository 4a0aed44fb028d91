//! SQLite database connection management.
//!
//! The pool is bounded by `[db] min_connections` / `max_connections` and runs
//! in WAL mode so the scheduler can overlap a long scoring run with ad-hoc
//! CLI reads. The database file and its parent directories are created on
//! first connect.

use anyhow::{Context, Result};
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::QueryBuilder;
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;
use crate::models::{FeedItem, FEED_COLUMNS};

/// Upper bound on ids bound into a single `IN (...)` list.
pub(crate) const MAX_IN_LIST: usize = 500;

/// Create a connection pool to the configured SQLite database.
///
/// # Errors
///
/// Returns an error if the database cannot be created or connected to.
/// This is the only failure the pipeline treats as fatal.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(10))
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .min_connections(config.db.min_connections)
        .max_connections(config.db.max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    Ok(pool)
}

/// Load feed rows by id, in ascending id order. Unknown ids are skipped.
pub async fn fetch_feeds(pool: &SqlitePool, ids: &[i64]) -> Result<Vec<FeedItem>> {
    let mut feeds = Vec::with_capacity(ids.len());

    for chunk in ids.chunks(MAX_IN_LIST) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM feeds f WHERE f.id IN (", FEED_COLUMNS));
        let mut separated = qb.separated(", ");
        for id in chunk {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let rows = qb.build().fetch_all(pool).await?;
        for row in &rows {
            feeds.push(FeedItem::from_row(row)?);
        }
    }

    feeds.sort_by_key(|feed| feed.id);
    Ok(feeds)
}

/// The subset of `ids` that already have an embedding.
pub async fn embedded_ids(pool: &SqlitePool, ids: &[i64]) -> Result<Vec<i64>> {
    let mut found = Vec::new();

    for chunk in ids.chunks(MAX_IN_LIST) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT feed_id FROM embeddings WHERE feed_id IN (");
        let mut separated = qb.separated(", ");
        for id in chunk {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let ids: Vec<i64> = qb.build_query_scalar().fetch_all(pool).await?;
        found.extend(ids);
    }

    Ok(found)
}

/// Load stored embedding vectors for `ids`, keyed by feed id.
pub async fn fetch_embeddings(pool: &SqlitePool, ids: &[i64]) -> Result<Vec<(i64, Vec<f32>)>> {
    use sqlx::Row;

    let mut vectors = Vec::with_capacity(ids.len());

    for chunk in ids.chunks(MAX_IN_LIST) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT feed_id, embedding FROM embeddings WHERE feed_id IN (");
        let mut separated = qb.separated(", ");
        for id in chunk {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY feed_id");

        for row in qb.build().fetch_all(pool).await? {
            let feed_id: i64 = row.try_get("feed_id")?;
            let blob: Vec<u8> = row.try_get("embedding")?;
            vectors.push((feed_id, crate::embedding::blob_to_vec(&blob)));
        }
    }

    Ok(vectors)
}
