//! Persistence layer. `ActivationStore` is the seam the orchestrator and
//! metering reporter depend on; `postgres::PgStore` is the production
//! implementation, and tests substitute in-memory fakes.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

/// End-user record, keyed by the externally issued auth id.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Identity {
    pub id: Uuid,
    pub external_auth_id: String,
    pub email: String,
    pub billing_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Esim {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub iccid: String,
    pub msisdn: Option<String>,
    pub activation_code: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Entitlement {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub product_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub product_id: String,
    pub invoice_url: String,
    pub amount_due: Decimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Allocation returned by the provisioning provider, to be persisted
/// against an identity.
#[derive(Debug, Clone)]
pub struct NewEsim {
    pub iccid: String,
    pub msisdn: Option<String>,
    pub activation_code: String,
}

/// Read-only aggregate for the metering stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub calls: i64,
    pub billable_quantity: Decimal,
}

#[async_trait]
pub trait ActivationStore: Send + Sync {
    /// Insert-on-conflict-reselect: concurrent calls with the same
    /// `external_auth_id` converge on one row.
    async fn find_or_create_identity(
        &self,
        external_auth_id: &str,
        email: &str,
    ) -> anyhow::Result<Identity>;

    async fn active_esim(&self, identity_id: Uuid) -> anyhow::Result<Option<Esim>>;

    async fn paid_entitlement(
        &self,
        identity_id: Uuid,
        product_id: &str,
    ) -> anyhow::Result<Option<Entitlement>>;

    async fn open_invoice(
        &self,
        identity_id: Uuid,
        product_id: &str,
    ) -> anyhow::Result<Option<Invoice>>;

    async fn record_invoice(
        &self,
        identity_id: Uuid,
        product_id: &str,
        invoice_url: &str,
        amount_due: Decimal,
    ) -> anyhow::Result<Invoice>;

    /// Persist a provisioned eSIM. The partial unique index on
    /// (identity, active) is the authoritative guard: a concurrent
    /// duplicate insert re-fetches and returns the winning row.
    async fn record_esim(&self, identity_id: Uuid, esim: &NewEsim) -> anyhow::Result<Esim>;

    /// Append-only; `ledger_event_id` is the dedupe key.
    async fn insert_billing_event(
        &self,
        identity_id: Uuid,
        billing_customer_id: &str,
        unit_count: i64,
        billable_quantity: Decimal,
        ledger_event_id: &str,
    ) -> anyhow::Result<()>;

    async fn usage_stats(&self, identity_id: Uuid, window_days: i64) -> anyhow::Result<UsageStats>;
}
