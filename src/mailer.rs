use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::MailConfig;

/// A fully rendered email, ready for the transport.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Outbound email transport. The production implementation posts to a hosted
/// mail API; tests substitute a recording fake.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Sends one email and returns the provider's message id.
    async fn send(&self, email: &OutboundEmail) -> anyhow::Result<String>;
}

pub struct HttpMailer {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    from_address: String,
}

impl HttpMailer {
    pub fn new(cfg: &MailConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: cfg.api_url.clone(),
            api_key: cfg.api_key.clone(),
            from_address: cfg.from_address.clone(),
        }
    }
}

#[derive(Serialize)]
struct SendPayload<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

#[derive(Deserialize)]
struct SendReply {
    id: String,
}

#[async_trait]
impl EmailTransport for HttpMailer {
    async fn send(&self, email: &OutboundEmail) -> anyhow::Result<String> {
        let res = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&SendPayload {
                from: &self.from_address,
                to: &email.to,
                subject: &email.subject,
                html: &email.html,
            })
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("mail API returned {status}: {body}");
        }
        let reply: SendReply = res.json().await?;
        Ok(reply.id)
    }
}
