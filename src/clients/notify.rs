//! Best-effort activation notifications via a transactional-mail relay.
//!
//! The provisioned eSIM row is the source of truth; a failed email never
//! rolls anything back. Callers inspect the outcome only to log it.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::store::Esim;

/// Delivery outcome, for logging only — never control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    Skipped,
    Failed(String),
}

#[async_trait]
pub trait ActivationNotifier: Send + Sync {
    async fn send_activation(&self, email: &str, esim: &Esim) -> NotifyOutcome;
}

#[derive(Serialize)]
struct MailMessage<'a> {
    to: &'a str,
    subject: &'a str,
    body: String,
}

pub struct MailNotifier {
    client: reqwest::Client,
    relay_url: Option<String>,
    api_key: Option<String>,
}

impl MailNotifier {
    pub fn new(relay_url: Option<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .user_agent("esimgate/0.1")
                .build()
                .expect("failed to build mail HTTP client"),
            relay_url,
            api_key,
        }
    }
}

#[async_trait]
impl ActivationNotifier for MailNotifier {
    async fn send_activation(&self, email: &str, esim: &Esim) -> NotifyOutcome {
        let url = match &self.relay_url {
            Some(u) => format!("{}/v1/messages", u.trim_end_matches('/')),
            None => {
                tracing::debug!("no mail relay configured, skipping activation email");
                return NotifyOutcome::Skipped;
            }
        };

        let message = MailMessage {
            to: email,
            subject: "Your eSIM is ready",
            body: format!(
                "Your eSIM has been activated.\n\nICCID: {}\nActivation code: {}\n\n\
                 Scan or enter the activation code on your device to install it.",
                esim.iccid, esim.activation_code
            ),
        };

        let mut req = self.client.post(&url).json(&message);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(%email, iccid = %esim.iccid, "activation email sent");
                NotifyOutcome::Sent
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                NotifyOutcome::Failed(format!("relay returned {}: {}", status, body))
            }
            Err(e) => NotifyOutcome::Failed(format!("relay unreachable: {}", e)),
        }
    }
}
