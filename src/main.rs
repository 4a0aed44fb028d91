//! # Paper Relay CLI (`relay`)
//!
//! Thin wrapper that loads the configuration and calls the library. Meant to
//! be driven by cron or a systemd timer; every command is safe to re-run.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `relay init` | Create the SQLite database and schema |
//! | `relay embed` | Embed feeds that have no vector yet |
//! | `relay score` | Score unscored feeds for active models |
//! | `relay broadcast` | Deduplicate and dispatch pending queue entries |
//! | `relay run` | Full pipeline: embed, score, queue, dispatch, clean up |
//! | `relay clear-old` | Delete old delivered queue records |
//! | `relay hours <spec>` | Parse and canonicalize a broadcast-hours spec |
//!
//! Logs go to stderr (`RUST_LOG` overrides the default `info` level);
//! command summaries go to stdout.

use anyhow::{bail, Result};
use chrono::{DateTime, Timelike, Utc};
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use paper_relay::config::{self, Config};
use paper_relay::embedder::{self, EmbeddingGenerator};
use paper_relay::models::Channel;
use paper_relay::notify::{ProviderRegistry, SendOptions};
use paper_relay::pipeline::Pipeline;
use paper_relay::queue::{self, BroadcastQueue};
use paper_relay::scorer::{self, Scorer};
use paper_relay::{db, hours, migrate};

/// Paper Relay: score new papers and relay the best ones to chat and email.
#[derive(Parser)]
#[command(name = "relay", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Generate embeddings for feeds that lack one.
    Embed {
        /// Only consider feeds added within this many hours.
        #[arg(long)]
        lookback_hours: Option<i64>,

        /// Embed exactly these feed ids instead of the pending set.
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,

        /// Re-embed feeds that already have a vector.
        #[arg(long)]
        force: bool,

        /// Override the batch size from config.
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Score feeds with the active models.
    Score {
        /// Score only this model.
        #[arg(long)]
        model: Option<i64>,

        /// Re-score exactly these feed ids (requires --model).
        #[arg(long, value_delimiter = ',')]
        feeds: Vec<i64>,

        /// Only consider feeds added within this many hours.
        #[arg(long)]
        lookback_hours: Option<i64>,
    },

    /// Deduplicate and dispatch pending broadcasts.
    Broadcast {
        /// Process only this channel.
        #[arg(long)]
        channel: Option<i64>,

        /// Admit every scored feed above threshold before dispatching.
        #[arg(long)]
        admit: bool,

        /// Override the channel's broadcast_limit.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Run the full pipeline once.
    Run,

    /// Delete delivered broadcast records older than N days.
    ClearOld {
        /// Age in days (defaults to broadcast.retention_days, which is also the minimum).
        #[arg(long)]
        days: Option<i64>,
    },

    /// Show how a broadcast-hours spec is interpreted.
    Hours {
        spec: String,

        /// Also check whether this hour (0-23) is allowed.
        #[arg(long)]
        at: Option<u32>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    // Needs no config
    if let Commands::Hours { spec, at } = &cli.command {
        print_hours(spec, *at)?;
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Embed {
            lookback_hours,
            ids,
            force,
            batch_size,
        } => run_embed(&cfg, lookback_hours, ids, force, batch_size).await?,
        Commands::Score {
            model,
            feeds,
            lookback_hours,
        } => run_score(&cfg, model, feeds, lookback_hours).await?,
        Commands::Broadcast {
            channel,
            admit,
            limit,
        } => run_broadcast(&cfg, channel, admit, limit).await?,
        Commands::Run => {
            let pool = db::connect(&cfg).await?;
            let generator = EmbeddingGenerator::from_config(pool.clone(), &cfg.embedding);
            let registry = ProviderRegistry::with_defaults(&cfg.notify);
            let report = Pipeline::new(&cfg, pool.clone(), generator, &registry)
                .run(Utc::now())
                .await?;

            println!("Embedded: {}", report.embedded);
            for model in &report.models {
                match (&model.error, model.scored) {
                    (Some(err), _) => println!("Model {}: skipped ({})", model.model_id, err),
                    (None, Some(n)) => println!("Model {}: {} scored", model.model_id, n),
                    (None, None) => println!("Model {}: backfill, admission skipped", model.model_id),
                }
            }
            for channel in &report.channels {
                println!(
                    "Channel {}: admitted {}, suppressed {}, delivered {}, failed {}{}",
                    channel.channel_id,
                    channel.admitted,
                    channel.dedupe.removed,
                    channel.dispatch.delivered,
                    channel.dispatch.failed,
                    if channel.dispatch.gated { " (outside hours)" } else { "" }
                );
            }
            println!("Cleared: {}", report.cleared);
            pool.close().await;
        }
        Commands::ClearOld { days } => {
            let pool = db::connect(&cfg).await?;
            let days = days.unwrap_or(cfg.broadcast.retention_days);
            let removed = BroadcastQueue::new(pool.clone(), &cfg.broadcast)
                .clear_old(days, Utc::now())
                .await?;
            println!("Removed {} delivered records older than {} days", removed, days);
            pool.close().await;
        }
        Commands::Hours { .. } => unreachable!("handled before config loading"),
    }

    Ok(())
}

fn print_hours(spec: &str, at: Option<u32>) -> Result<()> {
    let parsed = hours::parse_hours(spec);
    let list: Vec<String> = parsed.iter().map(|h| h.to_string()).collect();

    println!("Canonical: {:?}", hours::canonical(spec));
    println!("Hours: [{}]", list.join(", "));

    if let Some(hour) = at {
        let Some(time) = chrono::NaiveTime::from_hms_opt(hour, 0, 0) else {
            bail!("--at must be an hour between 0 and 23");
        };
        let allowed = hours::is_allowed(Some(spec), &time);
        println!("Hour {}: {}", time.hour(), if allowed { "allowed" } else { "blocked" });
    }
    Ok(())
}

async fn run_embed(
    cfg: &Config,
    lookback_hours: Option<i64>,
    ids: Vec<i64>,
    force: bool,
    batch_size: Option<usize>,
) -> Result<()> {
    let pool = db::connect(cfg).await?;
    let generator = EmbeddingGenerator::from_config(pool.clone(), &cfg.embedding);
    if !generator.is_configured() {
        bail!("No embedding provider configured. Set [embedding] provider and model in the config file.");
    }

    let ids = if ids.is_empty() {
        embedder::pending_feed_ids(&pool, lookback_hours, Utc::now()).await?
    } else {
        ids
    };
    if ids.is_empty() {
        println!("No feeds need embedding.");
        pool.close().await;
        return Ok(());
    }

    let batch_size = batch_size.unwrap_or(cfg.embedding.batch_size);
    let embedded = generator.generate(&ids, batch_size, force).await?;
    println!("Embedded {} of {} feeds", embedded.len(), ids.len());

    pool.close().await;
    Ok(())
}

async fn run_score(
    cfg: &Config,
    model: Option<i64>,
    feeds: Vec<i64>,
    lookback_hours: Option<i64>,
) -> Result<()> {
    let pool = db::connect(cfg).await?;
    let scorer = Scorer::new(pool.clone(), &cfg.scoring);

    if !feeds.is_empty() {
        let Some(model_id) = model else {
            bail!("--feeds requires --model");
        };
        let scored = scorer.score_feeds(model_id, &feeds).await?;
        println!("Model {}: re-scored {} of {} feeds", model_id, scored, feeds.len());
        pool.close().await;
        return Ok(());
    }

    let model_ids: Vec<i64> = match model {
        Some(id) => match scorer::get_model(&pool, id).await? {
            Some(model) => vec![model.id],
            None => bail!("Unknown model: {}", id),
        },
        None => scorer::active_models(&pool)
            .await?
            .into_iter()
            .map(|model| model.id)
            .collect(),
    };

    let lookback = lookback_hours.or(cfg.scoring.lookback_hours);
    for model_id in model_ids {
        match scorer.score_model(model_id, lookback, Utc::now()).await {
            Ok(Some(scored)) => println!("Model {}: {} scored", model_id, scored.len()),
            Ok(None) => println!("Model {}: backfill scored; admission would be skipped", model_id),
            Err(e) => println!("Model {}: skipped ({:#})", model_id, e),
        }
    }

    pool.close().await;
    Ok(())
}

async fn run_broadcast(cfg: &Config, channel: Option<i64>, admit: bool, limit: Option<i64>) -> Result<()> {
    let pool = db::connect(cfg).await?;
    let queue = BroadcastQueue::new(pool.clone(), &cfg.broadcast);
    let registry = ProviderRegistry::with_defaults(&cfg.notify);
    let now = Utc::now();

    let channels = match channel {
        Some(id) => match queue::get_channel(&pool, id).await? {
            Some(channel) => vec![channel],
            None => bail!("Unknown channel: {}", id),
        },
        None => queue::list_channels(&pool, true).await?,
    };

    let step = BroadcastStep {
        cfg,
        pool: &pool,
        queue: &queue,
        registry: &registry,
        now,
    };
    let mut failed = 0;
    for channel in &channels {
        match step.run(channel, admit, limit).await {
            Ok(line) => println!("Channel {} ({}): {}", channel.id, channel.name, line),
            Err(e) => {
                failed += 1;
                error!(channel_id = channel.id, "channel processing failed: {:#}", e);
                println!("Channel {} ({}): failed ({:#})", channel.id, channel.name, e);
            }
        }
    }

    pool.close().await;
    if failed > 0 {
        bail!("{} of {} channels failed", failed, channels.len());
    }
    Ok(())
}

/// Shared handles for broadcasting one channel from the CLI.
struct BroadcastStep<'a> {
    cfg: &'a Config,
    pool: &'a SqlitePool,
    queue: &'a BroadcastQueue,
    registry: &'a ProviderRegistry,
    now: DateTime<Utc>,
}

impl BroadcastStep<'_> {
    /// Admit (optionally), deduplicate and dispatch one channel; returns
    /// its summary line.
    async fn run(&self, channel: &Channel, admit: bool, limit: Option<i64>) -> Result<String> {
        let admitted = if admit {
            self.queue.admit(channel.id, None, self.now).await?
        } else {
            0
        };
        let dedupe = self
            .queue
            .deduplicate(channel.id, self.cfg.broadcast.dedup_lookback_months, self.now)
            .await?;

        let model = scorer::get_model(self.pool, channel.model_id).await?;
        let options = SendOptions {
            model_name: model.as_ref().map(|m| m.name.clone()).unwrap_or_default(),
            channel_name: channel.name.clone(),
            score_name: model.and_then(|m| m.score_name),
            include_abstracts: channel.include_abstracts,
        };
        let provider = self.registry.resolve(&channel.endpoint)?;
        let outcome = self
            .queue
            .dispatch(channel, limit, self.now, provider.as_ref(), &options)
            .await?;

        Ok(format!(
            "admitted {}, suppressed {}, delivered {}, failed {}, pending {}{}",
            admitted,
            dedupe.removed,
            outcome.delivered,
            outcome.failed,
            self.queue.pending_count(channel.id).await?,
            if outcome.gated { " (outside hours)" } else { "" }
        ))
    }
}
