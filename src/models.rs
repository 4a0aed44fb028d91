//! Core data models used throughout the relay pipeline.
//!
//! Storage rows are projected into these types in exactly one place each
//! (`from_row`), so column naming quirks never leak past this module.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// Column list matching [`FeedItem::from_row`]. Expects the table alias `f`.
pub const FEED_COLUMNS: &str =
    "f.id, f.external_id, f.title, f.content, f.author, f.origin, f.link, f.published, f.added";

/// One ingested paper.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub id: i64,
    pub external_id: String,
    pub title: String,
    pub content: String,
    pub author: String,
    pub origin: String,
    pub link: Option<String>,
    pub published: Option<i64>,
    /// Ingestion time (unix seconds). Dispatch order follows this.
    pub added: i64,
}

impl FeedItem {
    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            external_id: row.try_get("external_id")?,
            title: row.try_get("title")?,
            content: row.try_get("content")?,
            author: row.try_get("author")?,
            origin: row.try_get("origin")?,
            link: row.try_get("link")?,
            published: row.try_get("published")?,
            added: row.try_get("added")?,
        })
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
    }

    /// Text sent to the embedding provider.
    pub fn embedding_text(&self) -> String {
        let title = self.title.trim();
        let content = self.content.trim();
        match (title.is_empty(), content.is_empty()) {
            (false, false) => format!("{}\n\n{}", title, content),
            (false, true) => title.to_string(),
            (true, _) => content.to_string(),
        }
    }
}

/// A trained classifier registered by the training layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub id: i64,
    pub name: String,
    pub score_name: Option<String>,
    pub is_active: bool,
}

impl Model {
    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            score_name: row.try_get("score_name")?,
            is_active: row.try_get("is_active")?,
        })
    }

    /// File stem of this model's classifier artifact.
    pub fn artifact_name(id: i64) -> String {
        format!("model-{}", id)
    }
}

/// A delivery destination bound to one model's scores.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    /// Webhook URL or `mailto:` address.
    pub endpoint: String,
    pub score_threshold: f64,
    pub model_id: i64,
    pub broadcast_limit: i64,
    /// `None` = unrestricted, `Some("")` = fully blocked.
    pub broadcast_hours: Option<String>,
    pub include_abstracts: bool,
    pub is_active: bool,
}

impl Channel {
    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            endpoint: row.try_get("endpoint")?,
            score_threshold: row.try_get("score_threshold")?,
            model_id: row.try_get("model_id")?,
            broadcast_limit: row.try_get("broadcast_limit")?,
            broadcast_hours: row.try_get("broadcast_hours")?,
            include_abstracts: row.try_get("include_abstracts")?,
            is_active: row.try_get("is_active")?,
        })
    }
}

/// A queued feed together with the score that admitted it.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub feed: FeedItem,
    pub score: Option<f64>,
}
