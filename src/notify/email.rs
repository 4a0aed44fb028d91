use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};
use std::time::Duration;

use super::{NotificationProvider, NotifyItem, SendOptions};
use crate::config::SmtpConfig;

/// SMTP digest: every item of a dispatch goes out in one message, so the
/// whole batch either succeeds or fails together.
pub struct EmailProvider {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl EmailProvider {
    /// `endpoint` is `mailto:address`; any `?query` part is ignored.
    pub fn new(endpoint: &str, smtp: &SmtpConfig, timeout: Duration) -> Result<Self> {
        let address = endpoint
            .get(7..)
            .and_then(|rest| rest.split('?').next())
            .unwrap_or_default();
        let to: Mailbox = address
            .parse()
            .with_context(|| format!("invalid mailto address '{}'", address))?;
        let from: Mailbox = smtp
            .from
            .parse()
            .with_context(|| format!("invalid notify.smtp.from '{}'", smtp.from))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
            .with_context(|| format!("invalid SMTP host '{}'", smtp.host))?
            .timeout(Some(timeout));
        if let Some(port) = smtp.port {
            builder = builder.port(port);
        }
        if let Some(user) = &smtp.username {
            let pass = std::env::var(&smtp.password_env)
                .with_context(|| format!("{} not set", smtp.password_env))?;
            builder = builder.credentials(Credentials::new(user.clone(), pass));
        }

        Ok(Self {
            mailer: builder.build(),
            from,
            to,
        })
    }
}

pub fn subject(items: &[NotifyItem], options: &SendOptions) -> String {
    let noun = if items.len() == 1 { "paper" } else { "papers" };
    format!(
        "[{}] {} new {} from {}",
        options.channel_name,
        items.len(),
        noun,
        options.model_name
    )
}

/// Plain-text digest body.
pub fn render(items: &[NotifyItem], options: &SendOptions, base_url: Option<&str>) -> String {
    let mut body = String::new();
    for (index, item) in items.iter().enumerate() {
        body.push_str(&format!("{}. {}\n", index + 1, item.title.trim()));
        if !item.author.trim().is_empty() {
            body.push_str(&format!("   {}\n", item.author.trim()));
        }
        if !item.origin.trim().is_empty() {
            body.push_str(&format!("   {}\n", item.origin.trim()));
        }
        if let Some(line) = item.score_line(options.score_name.as_deref()) {
            body.push_str(&format!("   {}\n", line));
        }
        if let Some(url) = item.url(base_url) {
            body.push_str(&format!("   {}\n", url));
        }
        if options.include_abstracts {
            let summary = item.summary.trim();
            if !summary.is_empty() {
                body.push('\n');
                for line in summary.lines() {
                    body.push_str(&format!("   {}\n", line));
                }
            }
        }
        body.push('\n');
    }
    body
}

#[async_trait]
impl NotificationProvider for EmailProvider {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(
        &self,
        items: &[NotifyItem],
        options: &SendOptions,
        base_url: Option<&str>,
    ) -> Result<Vec<(i64, bool)>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let msg = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject(items, options))
            .header(header::ContentType::TEXT_PLAIN)
            .body(render(items, options, base_url))
            .context("build email")?;

        let delivered = match self.mailer.send(msg).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    channel = %options.channel_name,
                    items = items.len(),
                    "email delivery failed: {}",
                    e
                );
                false
            }
        };

        Ok(items.iter().map(|item| (item.id, delivered)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smtp() -> SmtpConfig {
        SmtpConfig {
            host: "smtp.example.org".to_string(),
            port: Some(2525),
            username: None,
            password_env: "SMTP_PASSWORD".to_string(),
            from: "Paper Relay <relay@example.org>".to_string(),
        }
    }

    fn item(id: i64, title: &str) -> NotifyItem {
        NotifyItem {
            id,
            title: title.to_string(),
            author: "C. Doe".to_string(),
            origin: String::new(),
            link: None,
            summary: "First line.\nSecond line.".to_string(),
            score: Some(0.81),
            published: None,
        }
    }

    #[test]
    fn test_new_parses_mailto() {
        let provider =
            EmailProvider::new("mailto:lab@example.org?subject=x", &smtp(), Duration::from_secs(5))
                .unwrap();
        assert_eq!(provider.to.email.to_string(), "lab@example.org");
        assert_eq!(provider.from.email.to_string(), "relay@example.org");
    }

    #[test]
    fn test_new_rejects_bad_address() {
        assert!(EmailProvider::new("mailto:not-an-address", &smtp(), Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_digest_rendering() {
        let items = vec![item(1, "First"), item(2, "Second")];
        let options = SendOptions {
            model_name: "neuro".to_string(),
            channel_name: "digest".to_string(),
            score_name: None,
            include_abstracts: true,
        };
        assert_eq!(subject(&items, &options), "[digest] 2 new papers from neuro");

        let body = render(&items, &options, Some("https://papers.example.org"));
        assert!(body.starts_with("1. First\n   C. Doe\n   Score: 0.81\n   https://papers.example.org/feeds/1\n"));
        assert!(body.contains("   First line.\n   Second line.\n"));
        assert!(body.contains("2. Second\n"));
    }
}
