use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;
use std::time::Duration;

use super::{NotificationProvider, NotifyItem, SendOptions};

/// Discord caps embed descriptions at 4096 characters; stay well inside it.
const MAX_DESCRIPTION_CHARS: usize = 2000;

/// Discord webhook; one embed message per item.
pub struct DiscordProvider {
    webhook: Url,
    client: Client,
    max_retries: u8,
}

impl DiscordProvider {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            webhook: super::parse_webhook_url(endpoint)?,
            client: super::webhook_client(timeout)?,
            max_retries: 3,
        })
    }

    async fn post(&self, payload: &DiscordWebhookPayload) -> Result<()> {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self.client.post(self.webhook.clone()).json(payload).send().await;

            let err = match res {
                Ok(rsp) => match rsp.error_for_status() {
                    Ok(_) => return Ok(()),
                    // Only rate limits and server errors are worth another try
                    Err(e)
                        if e.status().is_some_and(|s| {
                            s.as_u16() == 429 || s.is_server_error()
                        }) =>
                    {
                        anyhow!("Discord webhook HTTP error: {e}")
                    }
                    Err(e) => return Err(anyhow!("Discord webhook HTTP error: {e}")),
                },
                Err(e) => anyhow!("Discord webhook request failed: {e}"),
            };

            if attempt >= self.max_retries {
                return Err(err);
            }
            tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
        }
    }
}

#[derive(Serialize)]
struct DiscordEmbed {
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
}

#[derive(Serialize)]
struct DiscordWebhookPayload {
    content: Option<String>,
    embeds: Vec<DiscordEmbed>,
}

impl DiscordWebhookPayload {
    fn for_item(item: &NotifyItem, options: &SendOptions, base_url: Option<&str>) -> Self {
        let mut lines = Vec::new();
        let byline: Vec<&str> = [item.author.as_str(), item.origin.as_str()]
            .into_iter()
            .filter(|part| !part.trim().is_empty())
            .collect();
        if !byline.is_empty() {
            lines.push(byline.join(" · "));
        }
        if let Some(line) = item.score_line(options.score_name.as_deref()) {
            lines.push(format!("**{}** ({})", line, options.model_name));
        }
        if options.include_abstracts {
            let preview = item.summary_preview();
            if !preview.is_empty() {
                lines.push(String::new());
                lines.push(preview);
            }
        }

        let description: String = lines.join("\n").chars().take(MAX_DESCRIPTION_CHARS).collect();
        let title: String = item.title.chars().take(256).collect();

        Self {
            content: None,
            embeds: vec![DiscordEmbed {
                title,
                url: item.url(base_url),
                description,
                timestamp: item.published.map(|ts| ts.to_rfc3339()),
            }],
        }
    }
}

#[async_trait]
impl NotificationProvider for DiscordProvider {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send(
        &self,
        items: &[NotifyItem],
        options: &SendOptions,
        base_url: Option<&str>,
    ) -> Result<Vec<(i64, bool)>> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let payload = DiscordWebhookPayload::for_item(item, options, base_url);
            let delivered = match self.post(&payload).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        feed_id = item.id,
                        channel = %options.channel_name,
                        "discord delivery failed: {:#}",
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
