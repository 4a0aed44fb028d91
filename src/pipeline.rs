//! One full relay invocation.
//!
//! ```text
//! pending feeds ─▶ embed ─▶ score (per active model)
//!                                │ Some(newly scored) / None (backfill)
//!                                ▼
//!         per active channel: admit ─▶ deduplicate ─▶ dispatch
//!                                ▼
//!                        clear old deliveries
//! ```
//!
//! Failures stay local: an unreachable embedding provider only leaves feeds
//! unembedded, a broken model artifact only skips that model's admissions,
//! and a failing channel does not stop the others. Only database errors
//! that prevent reading the model or channel lists abort the run.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::embedder::{self, EmbeddingGenerator};
use crate::models::{Channel, Model};
use crate::notify::{ProviderRegistry, SendOptions};
use crate::queue::{self, BroadcastQueue, DedupeOutcome, DispatchOutcome};
use crate::scorer::{self, Scorer};

#[derive(Debug, Clone, Default)]
pub struct ModelReport {
    pub model_id: i64,
    /// Feeds scored this run; `None` if scoring failed.
    pub scored: Option<usize>,
    /// Admission was skipped because of the backfill valve.
    pub backfill: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelReport {
    pub channel_id: i64,
    pub admitted: usize,
    pub dedupe: DedupeOutcome,
    pub dispatch: DispatchOutcome,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub embedded: usize,
    pub models: Vec<ModelReport>,
    pub channels: Vec<ChannelReport>,
    pub cleared: u64,
}

pub struct Pipeline<'a> {
    config: &'a Config,
    pool: SqlitePool,
    generator: EmbeddingGenerator,
    registry: &'a ProviderRegistry,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a Config,
        pool: SqlitePool,
        generator: EmbeddingGenerator,
        registry: &'a ProviderRegistry,
    ) -> Self {
        Self {
            config,
            pool,
            generator,
            registry,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<PipelineReport> {
        let mut report = PipelineReport {
            embedded: self.embed_pending(now).await,
            ..PipelineReport::default()
        };

        let models = scorer::active_models(&self.pool).await?;
        let admissions = self.score_models(&models, now, &mut report).await;

        let queue = BroadcastQueue::new(self.pool.clone(), &self.config.broadcast);
        let models: HashMap<i64, &Model> = models.iter().map(|model| (model.id, model)).collect();

        for channel in queue::list_channels(&self.pool, true).await? {
            let candidates = admissions.get(&channel.model_id);
            let model = models.get(&channel.model_id).copied();

            let mut channel_report = ChannelReport {
                channel_id: channel.id,
                ..ChannelReport::default()
            };
            if let Err(e) = self
                .run_channel(&queue, &channel, model, candidates, now, &mut channel_report)
                .await
            {
                error!(channel_id = channel.id, "channel processing failed: {:#}", e);
                channel_report.error = Some(format!("{:#}", e));
            }
            report.channels.push(channel_report);
        }

        match queue.clear_old(self.config.broadcast.retention_days, now).await {
            Ok(cleared) => report.cleared = cleared,
            Err(e) => error!("clearing old broadcasts failed: {:#}", e),
        }

        info!(
            embedded = report.embedded,
            models = report.models.len(),
            channels = report.channels.len(),
            "relay run finished"
        );
        Ok(report)
    }

    async fn embed_pending(&self, now: DateTime<Utc>) -> usize {
        let pending = match embedder::pending_feed_ids(&self.pool, self.config.scoring.lookback_hours, now).await {
            Ok(ids) => ids,
            Err(e) => {
                error!("listing unembedded feeds failed: {:#}", e);
                return 0;
            }
        };
        if pending.is_empty() {
            return 0;
        }

        match self
            .generator
            .generate(&pending, self.config.embedding.batch_size, false)
            .await
        {
            Ok(embedded) => embedded.len(),
            Err(e) => {
                error!(pending = pending.len(), "embedding step failed: {:#}", e);
                0
            }
        }
    }

    /// Score every model; returns the admission set for each model that
    /// scored cleanly and stayed under the backfill threshold.
    async fn score_models(
        &self,
        models: &[Model],
        now: DateTime<Utc>,
        report: &mut PipelineReport,
    ) -> HashMap<i64, HashSet<i64>> {
        let scorer = Scorer::new(self.pool.clone(), &self.config.scoring);
        let mut admissions = HashMap::new();

        for model in models {
            let mut model_report = ModelReport {
                model_id: model.id,
                ..ModelReport::default()
            };

            match scorer
                .score_model(model.id, self.config.scoring.lookback_hours, now)
                .await
            {
                Ok(Some(scored)) => {
                    model_report.scored = Some(scored.len());
                    admissions.insert(model.id, scored);
                }
                Ok(None) => {
                    model_report.backfill = true;
                }
                Err(e) => {
                    error!(model_id = model.id, "skipping model: {:#}", e);
                    model_report.error = Some(format!("{:#}", e));
                }
            }
            report.models.push(model_report);
        }

        admissions
    }

    async fn run_channel(
        &self,
        queue: &BroadcastQueue,
        channel: &Channel,
        model: Option<&Model>,
        candidates: Option<&HashSet<i64>>,
        now: DateTime<Utc>,
        report: &mut ChannelReport,
    ) -> Result<()> {
        match candidates {
            Some(ids) if !ids.is_empty() => {
                report.admitted = queue.admit(channel.id, Some(ids), now).await?;
            }
            Some(_) => {}
            None => warn!(
                channel_id = channel.id,
                model_id = channel.model_id,
                "no admissions this run for channel's model"
            ),
        }

        report.dedupe = queue
            .deduplicate(channel.id, self.config.broadcast.dedup_lookback_months, now)
            .await?;

        let provider = self.registry.resolve(&channel.endpoint)?;
        let options = SendOptions {
            model_name: model.map(|m| m.name.clone()).unwrap_or_default(),
            channel_name: channel.name.clone(),
            score_name: model.and_then(|m| m.score_name.clone()),
            include_abstracts: channel.include_abstracts,
        };
        report.dispatch = queue
            .dispatch(channel, None, now, provider.as_ref(), &options)
            .await?;

        Ok(())
    }
}
