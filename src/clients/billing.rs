//! Client for the external billing ledger: hosted invoices for the
//! payment-gated path and usage-event submission for metering.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A payable invoice as created (or already open) on the ledger side.
#[derive(Debug, Clone)]
pub struct InvoiceDraft {
    pub invoice_url: String,
    pub amount_due: Decimal,
}

#[async_trait]
pub trait BillingLedger: Send + Sync {
    /// Create a hosted invoice for `product_id` against the customer's
    /// billing account.
    async fn create_invoice(
        &self,
        billing_customer_id: Option<&str>,
        email: &str,
        product_id: &str,
    ) -> anyhow::Result<InvoiceDraft>;

    /// Submit one usage event. Returns the ledger's event id, which is the
    /// dedupe key for the local billing_events row.
    async fn submit_usage(
        &self,
        billing_customer_id: &str,
        quantity: Decimal,
    ) -> anyhow::Result<String>;
}

#[derive(Serialize)]
struct CreateInvoiceRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    customer_id: Option<&'a str>,
    email: &'a str,
    product_id: &'a str,
}

#[derive(Deserialize)]
struct CreateInvoiceResponse {
    hosted_invoice_url: String,
    amount_due: Decimal,
}

#[derive(Serialize)]
struct UsageEventRequest<'a> {
    customer_id: &'a str,
    quantity: Decimal,
}

#[derive(Deserialize)]
struct UsageEventResponse {
    event_id: String,
}

pub struct HttpBillingLedger {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpBillingLedger {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .user_agent("esimgate/0.1")
                .build()
                .expect("failed to build billing HTTP client"),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl BillingLedger for HttpBillingLedger {
    async fn create_invoice(
        &self,
        billing_customer_id: Option<&str>,
        email: &str,
        product_id: &str,
    ) -> anyhow::Result<InvoiceDraft> {
        let resp = self
            .client
            .post(self.url("/v1/invoices"))
            .bearer_auth(&self.api_key)
            .json(&CreateInvoiceRequest {
                customer_id: billing_customer_id,
                email,
                product_id,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("ledger invoice creation failed: status={}, body={}", status, body);
        }

        let created: CreateInvoiceResponse = resp.json().await?;
        Ok(InvoiceDraft {
            invoice_url: created.hosted_invoice_url,
            amount_due: created.amount_due,
        })
    }

    async fn submit_usage(
        &self,
        billing_customer_id: &str,
        quantity: Decimal,
    ) -> anyhow::Result<String> {
        let resp = self
            .client
            .post(self.url("/v1/usage_events"))
            .bearer_auth(&self.api_key)
            .json(&UsageEventRequest {
                customer_id: billing_customer_id,
                quantity,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("ledger usage submission failed: status={}, body={}", status, body);
        }

        let event: UsageEventResponse = resp.json().await?;
        Ok(event.event_id)
    }
}
