//! Client for the downstream eSIM provisioning API.
//!
//! Failures are surfaced as retryable errors: the orchestrator never retries
//! internally, but a re-invoked call may succeed, so nothing here is treated
//! as fatal.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::NewEsim;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("provisioner unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provisioner rejected allocation: status={status}, body={body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Allocate an eSIM for the given contact email. Returns the ICCID,
    /// optional MSISDN, and the SM-DP+ activation code.
    async fn provision(&self, email: &str, product_id: &str) -> Result<NewEsim, ProvisionError>;
}

#[derive(Serialize)]
struct AllocateRequest<'a> {
    email: &'a str,
    product_id: &'a str,
}

#[derive(Deserialize)]
struct AllocateResponse {
    iccid: String,
    #[serde(default)]
    msisdn: Option<String>,
    activation_code: String,
}

pub struct HttpProvisioner {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpProvisioner {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .user_agent("esimgate/0.1")
                .build()
                .expect("failed to build provisioner HTTP client"),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn provision(&self, email: &str, product_id: &str) -> Result<NewEsim, ProvisionError> {
        let url = format!("{}/v1/esims", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&AllocateRequest { email, product_id })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProvisionError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let allocated: AllocateResponse = resp.json().await?;
        tracing::info!(iccid = %allocated.iccid, "eSIM allocated by provider");
        Ok(NewEsim {
            iccid: allocated.iccid,
            msisdn: allocated.msisdn,
            activation_code: allocated.activation_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn provisions_against_mock_provider() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/esims"))
            .and(bearer_token("prov-key"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "iccid": "8944500512345678903",
                "msisdn": "+14155550123",
                "activation_code": "LPA:1$smdp.example.com$ABC-123"
            })))
            .mount(&server)
            .await;

        let client = HttpProvisioner::new(server.uri(), "prov-key");
        let esim = client
            .provision("user@example.com", "global-esim")
            .await
            .unwrap();
        assert_eq!(esim.iccid, "8944500512345678903");
        assert_eq!(esim.msisdn.as_deref(), Some("+14155550123"));
        assert!(esim.activation_code.starts_with("LPA:1$"));
    }

    #[tokio::test]
    async fn surfaces_provider_rejection_with_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/esims"))
            .respond_with(ResponseTemplate::new(503).set_body_string("inventory exhausted"))
            .mount(&server)
            .await;

        let client = HttpProvisioner::new(server.uri(), "prov-key");
        let err = client
            .provision("user@example.com", "global-esim")
            .await
            .unwrap_err();
        match err {
            ProvisionError::Rejected { status, body } => {
                assert_eq!(status, 503);
                assert!(body.contains("inventory"));
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
    }
}
