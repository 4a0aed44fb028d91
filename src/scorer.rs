//! Per-model scoring of embedded feeds.
//!
//! [`Scorer::score_model`] finds every embedded feed without a score for the
//! model, runs it through the model's scaler and classifier, and upserts the
//! result into `predicted_preferences` one batch (one transaction) at a time.
//!
//! # Backfill safety valve
//!
//! When more than `max_tracked_candidates` feeds are unscored (typically
//! right after a bulk import) every one of them is still scored, but the
//! call returns `None` instead of the scored set. Callers read `None` as
//! "do not admit anything for this model this run" so a backfill cannot
//! flood the model's channels.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::Sqlite;
use sqlx::{QueryBuilder, SqlitePool};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::classifier::{self, ClassifierArtifact};
use crate::config::ScoringConfig;
use crate::db;
use crate::models::Model;

pub struct Scorer {
    pool: SqlitePool,
    model_dir: PathBuf,
    batch_size: usize,
    max_tracked_candidates: usize,
}

impl Scorer {
    pub fn new(pool: SqlitePool, config: &ScoringConfig) -> Self {
        Self {
            pool,
            model_dir: config.model_dir.clone(),
            batch_size: config.batch_size.max(1),
            max_tracked_candidates: config.max_tracked_candidates,
        }
    }

    /// Score every unscored, embedded feed for `model_id`.
    ///
    /// With `lookback_hours`, only feeds added within that window (relative
    /// to `now`) are candidates.
    ///
    /// Returns `Some(ids)` with the feeds scored by this call, or `None`
    /// when the candidate count exceeded the backfill threshold.
    ///
    /// # Errors
    ///
    /// A missing or unreadable artifact, or a database failure. A feed whose
    /// embedding does not fit the classifier is logged and left unscored;
    /// the rest of its batch is still written.
    pub async fn score_model(
        &self,
        model_id: i64,
        lookback_hours: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Option<HashSet<i64>>> {
        let artifact = self.load(model_id)?;

        let cutoff = lookback_hours.map(|hours| (now - ChronoDuration::hours(hours)).timestamp());
        let candidates = unscored_candidates(&self.pool, model_id, cutoff).await?;

        if candidates.is_empty() {
            debug!(model_id, "no unscored feeds");
            return Ok(Some(HashSet::new()));
        }

        let scored = self.score_ids(&artifact, model_id, &candidates).await?;

        if candidates.len() > self.max_tracked_candidates {
            warn!(
                model_id,
                candidates = candidates.len(),
                threshold = self.max_tracked_candidates,
                "backfill detected; scores saved but queue admission will be skipped"
            );
            return Ok(None);
        }

        info!(model_id, scored = scored.len(), "model scoring finished");
        Ok(Some(scored))
    }

    /// Score an explicit list of feeds, overwriting existing scores.
    ///
    /// Feeds without an embedding are skipped. Returns the number scored.
    pub async fn score_feeds(&self, model_id: i64, feed_ids: &[i64]) -> Result<usize> {
        let artifact = self.load(model_id)?;
        let scored = self.score_ids(&artifact, model_id, feed_ids).await?;
        Ok(scored.len())
    }

    fn load(&self, model_id: i64) -> Result<ClassifierArtifact> {
        let artifact = classifier::load_artifact(&self.model_dir, model_id)
            .with_context(|| format!("loading classifier for model {}", model_id))?;
        debug!(model_id, encoding = ?artifact.encoding, "classifier loaded");
        Ok(artifact)
    }

    async fn score_ids(
        &self,
        artifact: &ClassifierArtifact,
        model_id: i64,
        ids: &[i64],
    ) -> Result<HashSet<i64>> {
        let mut scored = HashSet::with_capacity(ids.len());

        for batch in ids.chunks(self.batch_size) {
            let vectors = db::fetch_embeddings(&self.pool, batch).await?;
            if vectors.is_empty() {
                continue;
            }

            let mut rows = Vec::with_capacity(vectors.len());
            for (feed_id, vector) in &vectors {
                match artifact.score(vector) {
                    Ok(score) => rows.push((*feed_id, score)),
                    Err(e) => warn!(feed_id, model_id, "skipping feed that cannot be scored: {}", e),
                }
            }
            if rows.is_empty() {
                continue;
            }

            upsert_scores(&self.pool, model_id, &rows).await?;
            scored.extend(rows.iter().map(|(feed_id, _)| *feed_id));
            debug!(model_id, batch = rows.len(), total = scored.len(), "scored batch");
        }

        Ok(scored)
    }
}

/// Embedded feeds with no score row for `model_id`, oldest first.
pub async fn unscored_candidates(
    pool: &SqlitePool,
    model_id: i64,
    added_since: Option<i64>,
) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar(
        r#"
        SELECT f.id
        FROM feeds f
        JOIN embeddings e ON e.feed_id = f.id
        LEFT JOIN predicted_preferences p ON p.feed_id = f.id AND p.model_id = ?
        WHERE p.feed_id IS NULL AND f.added >= ?
        ORDER BY f.added, f.id
        "#,
    )
    .bind(model_id)
    .bind(added_since.unwrap_or(i64::MIN))
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

async fn upsert_scores(pool: &SqlitePool, model_id: i64, rows: &[(i64, f64)]) -> Result<()> {
    let mut tx = pool.begin().await?;

    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("INSERT INTO predicted_preferences (feed_id, model_id, score) ");
    qb.push_values(rows, |mut row, (feed_id, score)| {
        row.push_bind(*feed_id).push_bind(model_id).push_bind(*score);
    });
    qb.push(" ON CONFLICT(feed_id, model_id) DO UPDATE SET score = excluded.score");
    qb.build().execute(&mut *tx).await?;

    tx.commit().await?;
    Ok(())
}

pub async fn active_models(pool: &SqlitePool) -> Result<Vec<Model>> {
    let rows = sqlx::query(
        "SELECT id, name, score_name, is_active FROM models WHERE is_active = 1 ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| Model::from_row(row).map_err(anyhow::Error::from))
        .collect()
}

pub async fn get_model(pool: &SqlitePool, model_id: i64) -> Result<Option<Model>> {
    let row = sqlx::query("SELECT id, name, score_name, is_active FROM models WHERE id = ?")
        .bind(model_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.as_ref().map(Model::from_row).transpose()?)
}
