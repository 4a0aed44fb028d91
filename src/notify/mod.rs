//! Notification delivery.
//!
//! A channel's `endpoint` picks its provider through the [`ProviderRegistry`]:
//! an ordered list of URL predicates, each paired with a constructor, plus one
//! fallback used when nothing matches. The built-in routes are
//!
//! | Endpoint | Provider |
//! |----------|----------|
//! | `https://discord.com/api/webhooks/...` | [`discord::DiscordProvider`] |
//! | `mailto:someone@example.org` | [`email::EmailProvider`] |
//! | `https://hooks.slack.com/...` | [`slack::SlackProvider`] |
//! | anything else (fallback) | [`slack::SlackProvider`] |
//!
//! Providers report success per item so a partially failed send leaves only
//! the failed items pending.

pub mod discord;
pub mod email;
pub mod slack;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::NotifyConfig;
use crate::models::QueuedItem;

/// Abstracts are cut to this many characters in chat messages.
const ABSTRACT_PREVIEW_CHARS: usize = 500;

/// One paper ready to be rendered into a notification.
#[derive(Debug, Clone)]
pub struct NotifyItem {
    pub id: i64,
    pub title: String,
    pub author: String,
    pub origin: String,
    pub link: Option<String>,
    pub summary: String,
    pub score: Option<f64>,
    pub published: Option<DateTime<Utc>>,
}

impl From<&QueuedItem> for NotifyItem {
    fn from(queued: &QueuedItem) -> Self {
        Self {
            id: queued.feed.id,
            title: queued.feed.title.clone(),
            author: queued.feed.author.clone(),
            origin: queued.feed.origin.clone(),
            link: queued.feed.link.clone(),
            summary: queued.feed.content.clone(),
            score: queued.score,
            published: queued.feed.published_at(),
        }
    }
}

impl NotifyItem {
    /// Where the message should point: the item's own link, or the item
    /// page under `base_url` when the feed carried none.
    pub fn url(&self, base_url: Option<&str>) -> Option<String> {
        self.link.clone().or_else(|| {
            base_url.map(|base| format!("{}/feeds/{}", base.trim_end_matches('/'), self.id))
        })
    }

    /// `"Relevance: 0.87"`, or `None` when the item has no score.
    pub fn score_line(&self, score_name: Option<&str>) -> Option<String> {
        self.score
            .map(|score| format!("{}: {:.2}", score_name.unwrap_or("Score"), score))
    }

    /// The abstract, cut at [`ABSTRACT_PREVIEW_CHARS`] on a char boundary.
    pub fn summary_preview(&self) -> String {
        let summary = self.summary.trim();
        if summary.chars().count() <= ABSTRACT_PREVIEW_CHARS {
            return summary.to_string();
        }
        let cut: String = summary.chars().take(ABSTRACT_PREVIEW_CHARS).collect();
        format!("{}…", cut.trim_end())
    }
}

/// Per-send context shared by every item in the batch.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub model_name: String,
    pub channel_name: String,
    pub score_name: Option<String>,
    pub include_abstracts: bool,
}

#[async_trait]
pub trait NotificationProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver `items` and report `(item_id, delivered)` for each one.
    ///
    /// An `Err` means nothing was delivered.
    async fn send(
        &self,
        items: &[NotifyItem],
        options: &SendOptions,
        base_url: Option<&str>,
    ) -> Result<Vec<(i64, bool)>>;
}

pub type ProviderConstructor =
    Box<dyn Fn(&str) -> Result<Box<dyn NotificationProvider>> + Send + Sync>;

struct Route {
    name: String,
    matches: fn(&str) -> bool,
    build: ProviderConstructor,
}

/// Maps channel endpoints to provider instances.
pub struct ProviderRegistry {
    routes: Vec<Route>,
    fallback: ProviderConstructor,
}

impl ProviderRegistry {
    /// An empty registry that sends everything to `fallback`.
    pub fn new(fallback: ProviderConstructor) -> Self {
        Self {
            routes: Vec::new(),
            fallback,
        }
    }

    /// The built-in routes, with a generic Slack-compatible webhook as
    /// fallback.
    pub fn with_defaults(config: &NotifyConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        let smtp = config.smtp.clone();

        let mut registry = Self::new(Box::new(
            move |endpoint: &str| -> Result<Box<dyn NotificationProvider>> {
                Ok(Box::new(slack::SlackProvider::new(endpoint, timeout)?))
            },
        ));
        registry.register(
            "slack",
            is_slack_webhook,
            move |endpoint: &str| -> Result<Box<dyn NotificationProvider>> {
                Ok(Box::new(slack::SlackProvider::new(endpoint, timeout)?))
            },
        );
        registry.register(
            "discord",
            is_discord_webhook,
            move |endpoint: &str| -> Result<Box<dyn NotificationProvider>> {
                Ok(Box::new(discord::DiscordProvider::new(endpoint, timeout)?))
            },
        );
        registry.register("email", is_mailto, move |endpoint: &str| -> Result<Box<dyn NotificationProvider>> {
            let smtp = smtp
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("mailto endpoint requires a [notify.smtp] section"))?;
            Ok(Box::new(email::EmailProvider::new(endpoint, smtp, timeout)?))
        });
        registry
    }

    /// Add a route. Routes are tried in registration order.
    pub fn register<F>(&mut self, name: &str, matches: fn(&str) -> bool, build: F)
    where
        F: Fn(&str) -> Result<Box<dyn NotificationProvider>> + Send + Sync + 'static,
    {
        self.routes.push(Route {
            name: name.to_string(),
            matches,
            build: Box::new(build),
        });
    }

    /// Name of the route `endpoint` would take (`"fallback"` if none).
    pub fn route_name(&self, endpoint: &str) -> &str {
        self.routes
            .iter()
            .find(|route| (route.matches)(endpoint))
            .map(|route| route.name.as_str())
            .unwrap_or("fallback")
    }

    /// Build the provider for `endpoint`.
    pub fn resolve(&self, endpoint: &str) -> Result<Box<dyn NotificationProvider>> {
        match self.routes.iter().find(|route| (route.matches)(endpoint)) {
            Some(route) => (route.build)(endpoint),
            None => (self.fallback)(endpoint),
        }
    }
}

fn is_slack_webhook(endpoint: &str) -> bool {
    reqwest::Url::parse(endpoint)
        .map(|url| url.host_str() == Some("hooks.slack.com"))
        .unwrap_or(false)
}

fn is_discord_webhook(endpoint: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(endpoint) else {
        return false;
    };
    matches!(
        url.host_str(),
        Some("discord.com") | Some("discordapp.com") | Some("ptb.discord.com") | Some("canary.discord.com")
    ) && url.path().starts_with("/api/webhooks/")
}

fn is_mailto(endpoint: &str) -> bool {
    endpoint
        .get(..7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("mailto:"))
        && endpoint.len() > 7
}

/// Shared HTTP client for webhook providers.
pub(crate) fn webhook_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Reject endpoints that are not absolute http(s) URLs.
pub(crate) fn parse_webhook_url(endpoint: &str) -> Result<reqwest::Url> {
    let url = reqwest::Url::parse(endpoint)
        .map_err(|e| anyhow::anyhow!("invalid webhook endpoint '{}': {}", endpoint, e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => anyhow::bail!("unsupported webhook scheme '{}'", other),
    }
}
