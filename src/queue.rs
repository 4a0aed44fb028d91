//! Per-channel broadcast queue.
//!
//! Each `(feed, channel)` pair lives in `broadcasts` and moves through
//!
//! ```text
//! absent ──admit──▶ pending ──dispatch──▶ delivered
//!                      │
//!                      └──deduplicate──▶ (row deleted)
//! ```
//!
//! `broadcasted_time IS NULL` marks a pending row. Delivered rows are kept
//! for deduplication until [`BroadcastQueue::clear_old`] ages them out.
//! Every operation takes an explicit `now` and runs its writes for one
//! channel inside a single transaction.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Months, Offset, Utc};
use sqlx::sqlite::Sqlite;
use sqlx::{QueryBuilder, Row, SqlitePool};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::config::BroadcastConfig;
use crate::db::MAX_IN_LIST;
use crate::hours;
use crate::models::{Channel, FeedItem, QueuedItem, FEED_COLUMNS};
use crate::notify::{NotificationProvider, NotifyItem, SendOptions};
use crate::title::{DuplicateDetector, DuplicateVerdict};

const CHANNEL_COLUMNS: &str = "id, name, endpoint, score_threshold, model_id, broadcast_limit, \
     broadcast_hours, include_abstracts, is_active";

/// Result of one [`BroadcastQueue::deduplicate`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupeOutcome {
    pub checked: usize,
    pub removed: usize,
    /// Pending titles left alone because they matched too many deliveries.
    pub boilerplate: usize,
}

/// Result of one [`BroadcastQueue::dispatch`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchOutcome {
    /// The channel's hours policy forbade sending at `now`.
    pub gated: bool,
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct BroadcastQueue {
    pool: SqlitePool,
    settings: BroadcastConfig,
}

impl BroadcastQueue {
    pub fn new(pool: SqlitePool, settings: &BroadcastConfig) -> Self {
        Self {
            pool,
            settings: settings.clone(),
        }
    }

    /// Queue every feed whose score for the channel's model is at or above
    /// the channel threshold and that was never queued for this channel.
    ///
    /// `candidates` restricts admission to those feed ids. `None` considers
    /// every scored feed added within the last `retention_days` before
    /// `now`: older deliveries may already have been removed by
    /// [`clear_old`](Self::clear_old), so older feeds are never re-queued.
    /// Returns the number of rows inserted.
    pub async fn admit(
        &self,
        channel_id: i64,
        candidates: Option<&HashSet<i64>>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        const ADMIT: &str = "INSERT OR IGNORE INTO broadcasts (feed_id, channel_id, broadcasted_time) \
             SELECT p.feed_id, c.id, NULL \
             FROM predicted_preferences p \
             JOIN channels c ON c.model_id = p.model_id \
             JOIN feeds f ON f.id = p.feed_id \
             WHERE c.id = ";

        let mut tx = self.pool.begin().await?;
        let mut admitted = 0u64;

        match candidates {
            None => {
                let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(ADMIT);
                qb.push_bind(channel_id);
                qb.push(" AND p.score >= c.score_threshold AND f.added >= ");
                qb.push_bind((now - ChronoDuration::days(self.settings.retention_days)).timestamp());
                admitted += qb.build().execute(&mut *tx).await?.rows_affected();
            }
            Some(ids) => {
                let mut ids: Vec<i64> = ids.iter().copied().collect();
                ids.sort_unstable();
                for chunk in ids.chunks(MAX_IN_LIST) {
                    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(ADMIT);
                    qb.push_bind(channel_id);
                    qb.push(" AND p.score >= c.score_threshold AND p.feed_id IN (");
                    let mut separated = qb.separated(", ");
                    for id in chunk {
                        separated.push_bind(*id);
                    }
                    separated.push_unseparated(")");
                    admitted += qb.build().execute(&mut *tx).await?.rows_affected();
                }
            }
        }

        tx.commit().await?;

        if admitted > 0 {
            info!(channel_id, admitted, "admitted feeds to broadcast queue");
        }
        Ok(admitted as usize)
    }

    /// Drop pending entries whose title matches something delivered to the
    /// same channel within the last `lookback_months`.
    pub async fn deduplicate(
        &self,
        channel_id: i64,
        lookback_months: u32,
        now: DateTime<Utc>,
    ) -> Result<DedupeOutcome> {
        let cutoff = now
            .checked_sub_months(Months::new(lookback_months))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
            .timestamp();

        let pending = sqlx::query(
            r#"
            SELECT b.feed_id, f.title
            FROM broadcasts b
            JOIN feeds f ON f.id = b.feed_id
            WHERE b.channel_id = ? AND b.broadcasted_time IS NULL
            ORDER BY f.added, f.id
            "#,
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;

        let mut outcome = DedupeOutcome {
            checked: pending.len(),
            ..DedupeOutcome::default()
        };
        if pending.is_empty() {
            return Ok(outcome);
        }

        let delivered = sqlx::query(
            r#"
            SELECT b.feed_id, f.title
            FROM broadcasts b
            JOIN feeds f ON f.id = b.feed_id
            WHERE b.channel_id = ? AND b.broadcasted_time IS NOT NULL AND b.broadcasted_time >= ?
            "#,
        )
        .bind(channel_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut detector = DuplicateDetector::new(
            self.settings.similarity_threshold,
            self.settings.boilerplate_match_limit,
        );
        for row in &delivered {
            let title: String = row.try_get("title")?;
            detector.add_reference(row.try_get("feed_id")?, &title);
        }
        if detector.reference_len() == 0 {
            return Ok(outcome);
        }

        let mut duplicates = Vec::new();
        for row in &pending {
            let feed_id: i64 = row.try_get("feed_id")?;
            let title: String = row.try_get("title")?;
            match detector.check(&title) {
                DuplicateVerdict::Unique => {}
                DuplicateVerdict::Duplicate { matched_id } => {
                    info!(channel_id, feed_id, matched_id, "suppressing duplicate title: {:?}", title);
                    duplicates.push(feed_id);
                }
                DuplicateVerdict::Boilerplate { matches } => {
                    debug!(channel_id, feed_id, matches, "boilerplate title exempt from dedup");
                    outcome.boilerplate += 1;
                }
            }
        }

        if !duplicates.is_empty() {
            let mut tx = self.pool.begin().await?;
            for chunk in duplicates.chunks(MAX_IN_LIST) {
                let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                    "DELETE FROM broadcasts WHERE broadcasted_time IS NULL AND channel_id = ",
                );
                qb.push_bind(channel_id);
                qb.push(" AND feed_id IN (");
                let mut separated = qb.separated(", ");
                for id in chunk {
                    separated.push_bind(*id);
                }
                separated.push_unseparated(")");
                outcome.removed += qb.build().execute(&mut *tx).await?.rows_affected() as usize;
            }
            tx.commit().await?;
        }

        Ok(outcome)
    }

    /// Oldest pending entries for `channel_id` (by ingestion time).
    pub async fn pending(&self, channel_id: i64, limit: i64) -> Result<Vec<QueuedItem>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}, p.score
            FROM broadcasts b
            JOIN feeds f ON f.id = b.feed_id
            JOIN channels c ON c.id = b.channel_id
            LEFT JOIN predicted_preferences p ON p.feed_id = f.id AND p.model_id = c.model_id
            WHERE b.channel_id = ? AND b.broadcasted_time IS NULL
            ORDER BY f.added, f.id
            LIMIT ?
            "#,
            FEED_COLUMNS
        ))
        .bind(channel_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(QueuedItem {
                    feed: FeedItem::from_row(row)?,
                    score: row.try_get("score")?,
                })
            })
            .collect()
    }

    /// Send up to `limit` (default: the channel's `broadcast_limit`) of the
    /// oldest pending entries and mark the delivered ones.
    ///
    /// Nothing is sent when the channel's hours forbid the current local
    /// hour. Items the provider reports as failed stay pending.
    pub async fn dispatch(
        &self,
        channel: &Channel,
        limit: Option<i64>,
        now: DateTime<Utc>,
        provider: &dyn NotificationProvider,
        options: &SendOptions,
    ) -> Result<DispatchOutcome> {
        let local = now.with_timezone(&self.local_offset());
        if !hours::is_allowed(channel.broadcast_hours.as_deref(), &local) {
            debug!(
                channel_id = channel.id,
                hours = ?channel.broadcast_hours,
                "outside broadcast hours"
            );
            return Ok(DispatchOutcome {
                gated: true,
                ..DispatchOutcome::default()
            });
        }

        let limit = limit.unwrap_or(channel.broadcast_limit).max(0);
        let queued = self.pending(channel.id, limit).await?;
        let mut outcome = DispatchOutcome {
            attempted: queued.len(),
            ..DispatchOutcome::default()
        };
        if queued.is_empty() {
            return Ok(outcome);
        }

        let items: Vec<NotifyItem> = queued.iter().map(NotifyItem::from).collect();
        let results = match provider
            .send(&items, options, self.settings.base_url.as_deref())
            .await
        {
            Ok(results) => results,
            Err(e) => {
                warn!(
                    channel_id = channel.id,
                    provider = provider.name(),
                    items = items.len(),
                    "notification send failed: {:#}",
                    e
                );
                outcome.failed = items.len();
                return Ok(outcome);
            }
        };

        let sent: HashSet<i64> = items.iter().map(|item| item.id).collect();
        let delivered: Vec<i64> = results
            .iter()
            .filter(|(id, ok)| *ok && sent.contains(id))
            .map(|(id, _)| *id)
            .collect();

        if !delivered.is_empty() {
            outcome.delivered = self.mark_delivered(channel.id, &delivered, now).await?;
        }
        outcome.failed = outcome.attempted - outcome.delivered;

        info!(
            channel_id = channel.id,
            provider = provider.name(),
            delivered = outcome.delivered,
            failed = outcome.failed,
            "dispatch finished"
        );
        Ok(outcome)
    }

    async fn mark_delivered(&self, channel_id: i64, feed_ids: &[i64], now: DateTime<Utc>) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0u64;

        for chunk in feed_ids.chunks(MAX_IN_LIST) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("UPDATE broadcasts SET broadcasted_time = ");
            qb.push_bind(now.timestamp());
            qb.push(" WHERE broadcasted_time IS NULL AND channel_id = ");
            qb.push_bind(channel_id);
            qb.push(" AND feed_id IN (");
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            updated += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(updated as usize)
    }

    /// Delete delivered entries older than `days`. Pending rows are kept.
    ///
    /// `days` may not be shorter than `retention_days`, which bounds what
    /// [`admit`](Self::admit) considers. Title deduplication only compares
    /// against rows that survive this cleanup.
    pub async fn clear_old(&self, days: i64, now: DateTime<Utc>) -> Result<u64> {
        if days < self.settings.retention_days {
            bail!(
                "cannot clear deliveries younger than broadcast.retention_days ({}); got {} days",
                self.settings.retention_days,
                days
            );
        }
        let cutoff = (now - ChronoDuration::days(days)).timestamp();
        let result = sqlx::query(
            "DELETE FROM broadcasts WHERE broadcasted_time IS NOT NULL AND broadcasted_time < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, days, "cleared old broadcast records");
        }
        Ok(removed)
    }

    pub async fn pending_count(&self, channel_id: i64) -> Result<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM broadcasts WHERE channel_id = ? AND broadcasted_time IS NULL",
        )
        .bind(channel_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.settings.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }
}

pub async fn list_channels(pool: &SqlitePool, active_only: bool) -> Result<Vec<Channel>> {
    let sql = if active_only {
        format!("SELECT {} FROM channels WHERE is_active = 1 ORDER BY id", CHANNEL_COLUMNS)
    } else {
        format!("SELECT {} FROM channels ORDER BY id", CHANNEL_COLUMNS)
    };
    let rows = sqlx::query(&sql).fetch_all(pool).await?;

    rows.iter()
        .map(|row| Channel::from_row(row).context("reading channel row"))
        .collect()
}

pub async fn get_channel(pool: &SqlitePool, channel_id: i64) -> Result<Option<Channel>> {
    let row = sqlx::query(&format!("SELECT {} FROM channels WHERE id = ?", CHANNEL_COLUMNS))
        .bind(channel_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.as_ref().map(Channel::from_row).transpose()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Mutex;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::apply_schema(&pool).await.unwrap();
        sqlx::query("INSERT INTO models (id, name) VALUES (1, 'm')")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    async fn add_channel(pool: &SqlitePool, id: i64, threshold: f64, limit: i64, hours: Option<&str>) {
        sqlx::query(
            "INSERT INTO channels (id, name, endpoint, score_threshold, model_id, broadcast_limit, broadcast_hours) \
             VALUES (?, 'c', 'https://hooks.example.org/x', ?, 1, ?, ?)",
        )
        .bind(id)
        .bind(threshold)
        .bind(limit)
        .bind(hours)
        .execute(pool)
        .await
        .unwrap();
    }

    /// `added` is an offset in seconds from `at(0)`.
    async fn add_feed(pool: &SqlitePool, id: i64, title: &str, added: i64, score: Option<f64>) {
        sqlx::query("INSERT INTO feeds (id, external_id, title, added) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(format!("ext-{}", id))
            .bind(title)
            .bind(at(0).timestamp() + added)
            .execute(pool)
            .await
            .unwrap();
        if let Some(score) = score {
            sqlx::query("INSERT INTO predicted_preferences (feed_id, model_id, score) VALUES (?, 1, ?)")
                .bind(id)
                .bind(score)
                .execute(pool)
                .await
                .unwrap();
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 15, 0).unwrap()
    }

    /// Records sends; fails the ids in `reject`.
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<i64>>,
        reject: HashSet<i64>,
    }

    #[async_trait]
    impl NotificationProvider for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn send(
            &self,
            items: &[NotifyItem],
            _options: &SendOptions,
            _base_url: Option<&str>,
        ) -> Result<Vec<(i64, bool)>> {
            let mut sent = self.sent.lock().unwrap();
            Ok(items
                .iter()
                .map(|item| {
                    sent.push(item.id);
                    (item.id, !self.reject.contains(&item.id))
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_admit_includes_threshold_score() {
        let pool = pool().await;
        add_channel(&pool, 1, 0.7, 20, None).await;
        add_feed(&pool, 1, "a", 1, Some(0.7)).await;
        add_feed(&pool, 2, "b", 2, Some(0.69)).await;
        add_feed(&pool, 3, "c", 3, Some(0.95)).await;

        let queue = BroadcastQueue::new(pool.clone(), &BroadcastConfig::default());
        assert_eq!(queue.admit(1, None, at(12)).await.unwrap(), 2);
        assert_eq!(queue.pending_count(1).await.unwrap(), 2);

        // Second admission is a no-op
        assert_eq!(queue.admit(1, None, at(12)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_admit_restricted_to_candidates() {
        let pool = pool().await;
        add_channel(&pool, 1, 0.5, 20, None).await;
        add_feed(&pool, 1, "a", 1, Some(0.9)).await;
        add_feed(&pool, 2, "b", 2, Some(0.9)).await;

        let queue = BroadcastQueue::new(pool.clone(), &BroadcastConfig::default());
        let candidates: HashSet<i64> = [2].into_iter().collect();
        assert_eq!(queue.admit(1, Some(&candidates), at(12)).await.unwrap(), 1);
        assert_eq!(queue.admit(1, Some(&HashSet::new()), at(12)).await.unwrap(), 0);

        let pending = queue.pending(1, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].feed.id, 2);
        assert_eq!(pending[0].score, Some(0.9));
    }

    #[tokio::test]
    async fn test_dispatch_fifo_and_limit() {
        let pool = pool().await;
        add_channel(&pool, 1, 0.5, 2, None).await;
        // Inserted out of order; `added` decides
        add_feed(&pool, 1, "newest", 300, Some(0.9)).await;
        add_feed(&pool, 2, "oldest", 100, Some(0.9)).await;
        add_feed(&pool, 3, "middle", 200, Some(0.9)).await;

        let queue = BroadcastQueue::new(pool.clone(), &BroadcastConfig::default());
        queue.admit(1, None, at(12)).await.unwrap();

        let channel = get_channel(&pool, 1).await.unwrap().unwrap();
        let recorder = Recorder::default();
        let outcome = queue
            .dispatch(&channel, None, at(12), &recorder, &SendOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.delivered, 2);
        assert_eq!(*recorder.sent.lock().unwrap(), vec![2, 3]);
        assert_eq!(queue.pending_count(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_failures_stay_pending() {
        let pool = pool().await;
        add_channel(&pool, 1, 0.5, 20, None).await;
        add_feed(&pool, 1, "a", 1, Some(0.9)).await;
        add_feed(&pool, 2, "b", 2, Some(0.9)).await;

        let queue = BroadcastQueue::new(pool.clone(), &BroadcastConfig::default());
        queue.admit(1, None, at(12)).await.unwrap();

        let channel = get_channel(&pool, 1).await.unwrap().unwrap();
        let recorder = Recorder {
            reject: [2].into_iter().collect(),
            ..Recorder::default()
        };
        let outcome = queue
            .dispatch(&channel, None, at(12), &recorder, &SendOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.failed, 1);
        let pending = queue.pending(1, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].feed.id, 2);
    }

    #[tokio::test]
    async fn test_dispatch_respects_hours_and_offset() {
        let pool = pool().await;
        add_channel(&pool, 1, 0.5, 20, Some("9-18")).await;
        add_channel(&pool, 2, 0.5, 20, Some("")).await;
        add_feed(&pool, 1, "a", 1, Some(0.9)).await;

        let queue = BroadcastQueue::new(pool.clone(), &BroadcastConfig::default());
        queue.admit(1, None, at(12)).await.unwrap();
        queue.admit(2, None, at(12)).await.unwrap();

        let recorder = Recorder::default();
        let options = SendOptions::default();
        let c1 = get_channel(&pool, 1).await.unwrap().unwrap();
        let c2 = get_channel(&pool, 2).await.unwrap().unwrap();

        assert!(queue.dispatch(&c1, None, at(20), &recorder, &options).await.unwrap().gated);
        assert!(queue.dispatch(&c2, None, at(12), &recorder, &options).await.unwrap().gated);
        assert!(recorder.sent.lock().unwrap().is_empty());

        // 07:15 UTC is 10:15 at UTC+3
        let shifted = BroadcastConfig {
            utc_offset_minutes: 180,
            ..BroadcastConfig::default()
        };
        let queue = BroadcastQueue::new(pool.clone(), &shifted);
        let outcome = queue.dispatch(&c1, None, at(7), &recorder, &options).await.unwrap();
        assert!(!outcome.gated);
        assert_eq!(outcome.delivered, 1);
    }

    #[tokio::test]
    async fn test_deduplicate_against_recent_deliveries() {
        let pool = pool().await;
        add_channel(&pool, 1, 0.5, 20, None).await;
        add_feed(&pool, 1, "Deep Learning for Protein Folding", 1, Some(0.9)).await;
        add_feed(&pool, 2, "[Preprint] Deep learning for protein folding.", 2, Some(0.9)).await;
        add_feed(&pool, 3, "A completely different subject", 3, Some(0.9)).await;

        let queue = BroadcastQueue::new(pool.clone(), &BroadcastConfig::default());
        let only_first: HashSet<i64> = [1].into_iter().collect();
        queue.admit(1, Some(&only_first), at(12)).await.unwrap();
        let channel = get_channel(&pool, 1).await.unwrap().unwrap();
        queue
            .dispatch(&channel, None, at(12), &Recorder::default(), &SendOptions::default())
            .await
            .unwrap();

        queue.admit(1, None, at(12)).await.unwrap();
        let outcome = queue.deduplicate(1, 3, at(13)).await.unwrap();
        assert_eq!(outcome.checked, 2);
        assert_eq!(outcome.removed, 1);

        let pending = queue.pending(1, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].feed.id, 3);
    }

    #[tokio::test]
    async fn test_deduplicate_ignores_deliveries_outside_lookback() {
        let pool = pool().await;
        add_channel(&pool, 1, 0.5, 20, None).await;
        add_feed(&pool, 1, "Graph neural networks", 1, None).await;
        add_feed(&pool, 2, "Graph neural networks", 2, Some(0.9)).await;

        let long_ago = at(12) - ChronoDuration::days(200);
        sqlx::query("INSERT INTO broadcasts (feed_id, channel_id, broadcasted_time) VALUES (1, 1, ?)")
            .bind(long_ago.timestamp())
            .execute(&pool)
            .await
            .unwrap();

        let queue = BroadcastQueue::new(pool.clone(), &BroadcastConfig::default());
        queue.admit(1, None, at(12)).await.unwrap();
        let outcome = queue.deduplicate(1, 3, at(12)).await.unwrap();
        assert_eq!(outcome.removed, 0);
        assert_eq!(queue.pending_count(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_boilerplate_titles_not_suppressed() {
        let pool = pool().await;
        add_channel(&pool, 1, 0.5, 20, None).await;
        let delivered_at = at(10).timestamp();
        for id in 1..=6 {
            add_feed(&pool, id, "Table of Contents", id, None).await;
            sqlx::query("INSERT INTO broadcasts (feed_id, channel_id, broadcasted_time) VALUES (?, 1, ?)")
                .bind(id)
                .bind(delivered_at)
                .execute(&pool)
                .await
                .unwrap();
        }
        add_feed(&pool, 7, "Table of contents", 7, Some(0.9)).await;

        let queue = BroadcastQueue::new(pool.clone(), &BroadcastConfig::default());
        queue.admit(1, None, at(12)).await.unwrap();
        let outcome = queue.deduplicate(1, 3, at(12)).await.unwrap();
        assert_eq!(outcome.removed, 0);
        assert_eq!(outcome.boilerplate, 1);
    }

    #[tokio::test]
    async fn test_clear_old_keeps_pending_and_recent() {
        let pool = pool().await;
        add_channel(&pool, 1, 0.5, 20, None).await;
        let now = at(12);
        for (id, delivered) in [
            (1, Some((now - ChronoDuration::days(40)).timestamp())),
            (2, Some((now - ChronoDuration::days(5)).timestamp())),
            (3, None),
        ] {
            add_feed(&pool, id, "t", id, None).await;
            sqlx::query("INSERT INTO broadcasts (feed_id, channel_id, broadcasted_time) VALUES (?, 1, ?)")
                .bind(id)
                .bind(delivered)
                .execute(&pool)
                .await
                .unwrap();
        }

        let queue = BroadcastQueue::new(pool.clone(), &BroadcastConfig::default());
        assert_eq!(queue.clear_old(30, now).await.unwrap(), 1);
        let left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM broadcasts")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(left, 2);
    }

    #[tokio::test]
    async fn test_cleared_deliveries_are_not_readmitted() {
        let pool = pool().await;
        add_channel(&pool, 1, 0.5, 20, None).await;
        add_feed(&pool, 1, "Sparse attention", 0, Some(0.9)).await;

        let queue = BroadcastQueue::new(pool.clone(), &BroadcastConfig::default());
        let channel = get_channel(&pool, 1).await.unwrap().unwrap();
        let recorder = Recorder::default();
        queue.admit(1, None, at(12)).await.unwrap();
        queue
            .dispatch(&channel, None, at(12), &recorder, &SendOptions::default())
            .await
            .unwrap();

        let later = at(12) + ChronoDuration::days(40);
        assert_eq!(queue.clear_old(30, later).await.unwrap(), 1);

        // A paper scored after the cleanup is still admitted
        add_feed(&pool, 2, "Mixture of experts", 40 * 86_400, Some(0.9)).await;
        assert_eq!(queue.admit(1, None, later).await.unwrap(), 1);

        let outcome = queue
            .dispatch(&channel, None, later, &recorder, &SendOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.delivered, 1);
        assert_eq!(*recorder.sent.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_clear_old_refuses_window_shorter_than_retention() {
        let pool = pool().await;
        let queue = BroadcastQueue::new(pool.clone(), &BroadcastConfig::default());
        assert!(queue.clear_old(7, at(12)).await.is_err());
        assert_eq!(queue.clear_old(45, at(12)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deduplicate_only_sees_retained_deliveries() {
        let pool = pool().await;
        add_channel(&pool, 1, 0.5, 20, None).await;
        add_feed(&pool, 1, "Graph neural networks", 0, None).await;
        add_feed(&pool, 2, "Graph Neural Networks.", 60, Some(0.9)).await;

        // Delivered 40 days ago: inside the 3 month dedup window
        let delivered = at(12) - ChronoDuration::days(40);
        sqlx::query("INSERT INTO broadcasts (feed_id, channel_id, broadcasted_time) VALUES (1, 1, ?)")
            .bind(delivered.timestamp())
            .execute(&pool)
            .await
            .unwrap();

        let queue = BroadcastQueue::new(pool.clone(), &BroadcastConfig::default());
        queue.admit(1, None, at(12)).await.unwrap();
        assert_eq!(queue.clear_old(30, at(12)).await.unwrap(), 1);

        let outcome = queue.deduplicate(1, 3, at(12)).await.unwrap();
        assert_eq!(outcome.removed, 0);
        assert_eq!(queue.pending_count(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_channels_active_only() {
        let pool = pool().await;
        add_channel(&pool, 1, 0.5, 20, None).await;
        add_channel(&pool, 2, 0.5, 20, Some("9-17")).await;
        sqlx::query("UPDATE channels SET is_active = 0 WHERE id = 2")
            .execute(&pool)
            .await
            .unwrap();

        assert_eq!(list_channels(&pool, true).await.unwrap().len(), 1);
        let all = list_channels(&pool, false).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].broadcast_hours.as_deref(), Some("9-17"));
        assert!(!all[1].is_active);
    }
}
