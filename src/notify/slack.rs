use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::Duration;

use super::{NotificationProvider, NotifyItem, SendOptions};

/// Slack incoming webhook, also used for any endpoint that accepts
/// Slack-style `{"text": ...}` JSON.
pub struct SlackProvider {
    webhook_url: Url,
    client: Client,
}

impl SlackProvider {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            webhook_url: super::parse_webhook_url(endpoint)?,
            client: super::webhook_client(timeout)?,
        })
    }

    async fn post(&self, text: String) -> Result<()> {
        let body = serde_json::json!({ "text": text, "unfurl_links": false });

        self.client
            .post(self.webhook_url.clone())
            .json(&body)
            .send()
            .await
            .context("slack post")?
            .error_for_status()
            .context("slack non-2xx")?;
        Ok(())
    }
}

/// Slack mrkdwn for one item.
pub fn render(item: &NotifyItem, options: &SendOptions, base_url: Option<&str>) -> String {
    let title = escape(&item.title);
    let mut text = match item.url(base_url) {
        Some(url) => format!("*<{}|{}>*", url, title),
        None => format!("*{}*", title),
    };

    let byline: Vec<&str> = [item.author.as_str(), item.origin.as_str()]
        .into_iter()
        .filter(|part| !part.trim().is_empty())
        .collect();
    if !byline.is_empty() {
        text.push('\n');
        text.push_str(&escape(&byline.join(" · ")));
    }

    if let Some(line) = item.score_line(options.score_name.as_deref()) {
        text.push_str(&format!("\n_{}_ ({})", line, escape(&options.model_name)));
    }

    if options.include_abstracts {
        let preview = item.summary_preview();
        if !preview.is_empty() {
            text.push_str("\n>");
            text.push_str(&escape(&preview).replace('\n', "\n>"));
        }
    }

    text
}

/// Slack requires these three characters to be entity-encoded.
fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[async_trait]
impl NotificationProvider for SlackProvider {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send(
        &self,
        items: &[NotifyItem],
        options: &SendOptions,
        base_url: Option<&str>,
    ) -> Result<Vec<(i64, bool)>> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let delivered = match self.post(render(item, options, base_url)).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        feed_id = item.id,
                        channel = %options.channel_name,
                        "slack delivery failed: {:#}",
                        e
                    );
                    false
                }
            };
            results.push((item.id, delivered));
        }
        Ok(results)
    }
}
