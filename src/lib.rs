//! # Paper Relay
//!
//! Scores newly ingested academic papers with per-user classifiers and
//! relays the high scorers to chat webhooks and email, without repeats and
//! within each channel's delivery limits and active hours.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌────────────┐
//! │  feeds   │──▶│ Embedder │──▶│  Scorer  │──▶│   Queue    │──▶ Slack / Discord / email
//! │ (SQLite) │   │ (OpenAI) │   │ per model│   │ per channel│
//! └──────────┘   └──────────┘   └──────────┘   └────────────┘
//! ```
//!
//! Ingestion and training live elsewhere; they write `feeds`, `models`,
//! `channels` and the classifier artifacts that this crate reads.
//!
//! ## Quick Start
//!
//! ```bash
//! relay init                 # create database
//! relay run                  # embed, score, queue and dispatch
//! relay hours "22-2,9"       # check a broadcast-hours spec
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and row projection |
//! | [`db`] | Database connection and shared lookups |
//! | [`migrate`] | Schema creation |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`embedder`] | Batched embedding generation with retry |
//! | [`classifier`] | Classifier and scaler artifacts |
//! | [`scorer`] | Per-model scoring with backfill guard |
//! | [`title`] | Title normalization and duplicate detection |
//! | [`hours`] | Broadcast-hours specs |
//! | [`queue`] | Broadcast queue admission, dedup and dispatch |
//! | [`notify`] | Notification providers and endpoint registry |
//! | [`pipeline`] | One full relay run |

pub mod classifier;
pub mod config;
pub mod db;
pub mod embedder;
pub mod embedding;
pub mod hours;
pub mod migrate;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod scorer;
pub mod title;
