//! Embedding generation for newly ingested feeds.
//!
//! [`EmbeddingGenerator::generate`] splits the requested ids into batches,
//! makes one provider call per batch, and commits each batch's vectors in
//! its own transaction, so a crash loses at most the batch in flight.
//!
//! Only overload signals are retried (see [`RetryPolicy`]). Any other
//! provider error drops that batch and moves on to the next one; rejected
//! credentials stop the whole step.

use anyhow::{bail, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use sqlx::sqlite::Sqlite;
use sqlx::{QueryBuilder, SqlitePool};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::EmbeddingConfig;
use crate::db;
use crate::embedding::{self, EmbedError, EmbeddingProvider};
use crate::models::FeedItem;

/// Bounded retry with a uniformly random pause, used for overload errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_min: Duration::from_secs(config.backoff_min_secs),
            backoff_max: Duration::from_secs(config.backoff_max_secs),
        }
    }

    /// A random delay in `[backoff_min, backoff_max]`.
    pub fn backoff_delay(&self) -> Duration {
        let min = self.backoff_min.as_millis() as u64;
        let max = (self.backoff_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EmbeddingConfig::default())
    }
}

pub struct EmbeddingGenerator {
    pool: SqlitePool,
    provider: Option<Box<dyn EmbeddingProvider>>,
    policy: RetryPolicy,
}

impl EmbeddingGenerator {
    pub fn new(pool: SqlitePool, provider: Box<dyn EmbeddingProvider>, policy: RetryPolicy) -> Self {
        Self {
            pool,
            provider: Some(provider),
            policy,
        }
    }

    /// Build the configured provider. A provider that cannot be built
    /// (disabled, missing key) leaves the generator as a logged no-op.
    pub fn from_config(pool: SqlitePool, config: &EmbeddingConfig) -> Self {
        let provider = match embedding::create_provider(config) {
            Ok(provider) => Some(provider),
            Err(e) => {
                error!(provider = %config.provider, "embedding provider unavailable: {:#}", e);
                None
            }
        };

        Self {
            pool,
            provider,
            policy: RetryPolicy::from_config(config),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.provider.is_some()
    }

    /// Embed `feed_ids` in batches of `batch_size`.
    ///
    /// Returns the ids whose vectors were written by this call. Ids that
    /// already had an embedding are skipped (and not returned) unless
    /// `force_refresh` is set.
    ///
    /// # Errors
    ///
    /// Only `batch_size == 0` and database failures are errors; provider
    /// problems are logged and reflected in a smaller result set.
    pub async fn generate(
        &self,
        feed_ids: &[i64],
        batch_size: usize,
        force_refresh: bool,
    ) -> Result<HashSet<i64>> {
        if batch_size == 0 {
            bail!("batch_size must be > 0");
        }

        let mut embedded = HashSet::new();
        if feed_ids.is_empty() {
            return Ok(embedded);
        }

        let Some(provider) = self.provider.as_deref() else {
            error!(
                requested = feed_ids.len(),
                "embedding provider not configured; skipping embedding step"
            );
            return Ok(embedded);
        };

        let mut seen = HashSet::new();
        let mut ids: Vec<i64> = feed_ids.iter().copied().filter(|id| seen.insert(*id)).collect();

        if !force_refresh {
            let existing: HashSet<i64> = db::embedded_ids(&self.pool, &ids).await?.into_iter().collect();
            ids.retain(|id| !existing.contains(id));
            if !existing.is_empty() {
                debug!(skipped = existing.len(), "feeds already embedded");
            }
        }

        let items = db::fetch_feeds(&self.pool, &ids).await?;
        if items.len() < ids.len() {
            warn!(missing = ids.len() - items.len(), "some requested feeds do not exist");
        }

        let total_batches = items.len().div_ceil(batch_size);

        for (index, batch) in items.chunks(batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(FeedItem::embedding_text).collect();

            match self.embed_with_retry(provider, &texts).await {
                Ok(vectors) if vectors.len() != batch.len() => {
                    warn!(
                        batch = index + 1,
                        expected = batch.len(),
                        received = vectors.len(),
                        "embedding response size mismatch; dropping batch"
                    );
                }
                Ok(vectors) if !matches_dims(&vectors, provider.dims()) => {
                    warn!(
                        batch = index + 1,
                        expected = ?provider.dims(),
                        "embedding dimension mismatch; dropping batch"
                    );
                }
                Ok(vectors) => {
                    store_batch(&self.pool, provider.model_name(), batch, &vectors).await?;
                    embedded.extend(batch.iter().map(|item| item.id));
                    debug!(batch = index + 1, of = total_batches, size = batch.len(), "embedded batch");
                }
                Err(EmbedError::Unauthorized(message)) => {
                    error!(batch = index + 1, "embedding provider rejected credentials: {}", message);
                    break;
                }
                Err(e) => {
                    let first = batch.first().map(|item| item.id);
                    warn!(
                        batch = index + 1,
                        first_feed_id = ?first,
                        size = batch.len(),
                        "embedding batch failed: {}",
                        e
                    );
                }
            }
        }

        info!(
            requested = feed_ids.len(),
            attempted = items.len(),
            embedded = embedded.len(),
            "embedding step finished"
        );
        Ok(embedded)
    }

    async fn embed_with_retry(
        &self,
        provider: &dyn EmbeddingProvider,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut attempt = 0u32;
        loop {
            match provider.embed(texts).await {
                Err(e) if e.is_overloaded() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    let delay = self.policy.backoff_delay();
                    warn!(
                        attempt,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "embedding provider overloaded; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

fn matches_dims(vectors: &[Vec<f32>], dims: Option<usize>) -> bool {
    dims.map_or(true, |dims| vectors.iter().all(|vector| vector.len() == dims))
}

/// Upsert one batch of vectors in a single transaction.
async fn store_batch(
    pool: &SqlitePool,
    model: &str,
    items: &[FeedItem],
    vectors: &[Vec<f32>],
) -> Result<()> {
    let now = Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("INSERT INTO embeddings (feed_id, embedding, model, dims, created_at) ");
    qb.push_values(items.iter().zip(vectors), |mut row, (item, vector)| {
        row.push_bind(item.id)
            .push_bind(embedding::vec_to_blob(vector))
            .push_bind(model.to_string())
            .push_bind(vector.len() as i64)
            .push_bind(now);
    });
    qb.push(
        " ON CONFLICT(feed_id) DO UPDATE SET \
         embedding = excluded.embedding, \
         model = excluded.model, \
         dims = excluded.dims, \
         created_at = excluded.created_at",
    );
    qb.build().execute(&mut *tx).await?;

    tx.commit().await?;
    Ok(())
}

/// Feeds that still lack an embedding, oldest first.
///
/// With `lookback_hours`, only feeds added within that window relative to
/// `now` are returned.
pub async fn pending_feed_ids(
    pool: &SqlitePool,
    lookback_hours: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Vec<i64>> {
    let cutoff = lookback_hours
        .map(|hours| (now - ChronoDuration::hours(hours)).timestamp())
        .unwrap_or(i64::MIN);

    let ids = sqlx::query_scalar(
        r#"
        SELECT f.id
        FROM feeds f
        LEFT JOIN embeddings e ON e.feed_id = f.id
        WHERE e.feed_id IS NULL AND f.added >= ?
        ORDER BY f.added, f.id
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(ids)
}
