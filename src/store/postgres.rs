use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use super::{ActivationStore, Entitlement, Esim, Identity, Invoice, NewEsim, UsageStats};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // -- API Key Operations --

    pub async fn insert_api_key(&self, key: &NewApiKey) -> anyhow::Result<ApiKeyMeta> {
        let row = sqlx::query_as::<_, ApiKeyMeta>(
            r#"INSERT INTO api_keys (key_hash, label, hourly_quota, owner_identity, allowed_origins)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING id, label, hourly_quota, is_active, owner_identity, total_calls, last_used_at, created_at"#,
        )
        .bind(&key.key_hash)
        .bind(&key.label)
        .bind(key.hourly_quota)
        .bind(key.owner_identity)
        .bind(&key.allowed_origins)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_key_by_hash(&self, key_hash: &str) -> anyhow::Result<Option<ApiKeyRow>> {
        let row = sqlx::query_as::<_, ApiKeyRow>(
            "SELECT id, key_hash, label, hourly_quota, is_active, owner_identity, total_calls, last_used_at, created_at
             FROM api_keys WHERE key_hash = $1",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_api_keys(&self) -> anyhow::Result<Vec<ApiKeyMeta>> {
        let rows = sqlx::query_as::<_, ApiKeyMeta>(
            "SELECT id, label, hourly_quota, is_active, owner_identity, total_calls, last_used_at, created_at
             FROM api_keys ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// One-way and idempotent: revoking an already-revoked key is a no-op
    /// that still reports success. Returns false only for unknown ids.
    pub async fn revoke_api_key(&self, id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE api_keys SET is_active = false WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lifetime-counter bump off the request path. Lost updates under race
    /// are tolerated; this is bookkeeping, not enforcement.
    pub async fn bump_key_usage(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE api_keys SET total_calls = total_calls + 1, last_used_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- Usage Log / Quota Operations --

    pub async fn log_usage(&self, entry: &UsageEntry) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO usage_log (api_key_id, path, method, client_ip, user_agent, response_status)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(entry.api_key_id)
        .bind(&entry.path)
        .bind(&entry.method)
        .bind(&entry.client_ip)
        .bind(&entry.user_agent)
        .bind(entry.response_status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Rolling-window usage for one key: count and oldest timestamp of
    /// calls in the trailing hour. Prior quota rejections (429 rows) are
    /// audit-only and do not consume quota.
    pub async fn quota_window(&self, api_key_id: Uuid) -> anyhow::Result<QuotaWindow> {
        let row = sqlx::query_as::<_, QuotaWindow>(
            r#"SELECT COUNT(*) AS used, MIN(created_at) AS oldest
               FROM usage_log
               WHERE api_key_id = $1
                 AND created_at > NOW() - INTERVAL '1 hour'
                 AND response_status <> 429"#,
        )
        .bind(api_key_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Opportunistic housekeeping run piggybacked on quota checks; bounds
    /// usage_log growth without a scheduled job.
    pub async fn purge_expired_usage(&self, retention_hours: i64) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM usage_log WHERE created_at < NOW() - ($1 * INTERVAL '1 hour')",
        )
        .bind(retention_hours)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ActivationStore for PgStore {
    async fn find_or_create_identity(
        &self,
        external_auth_id: &str,
        email: &str,
    ) -> anyhow::Result<Identity> {
        // Insert, and on conflict re-select: closes the check-then-act race
        // without an application-level lock.
        let inserted = sqlx::query_as::<_, Identity>(
            r#"INSERT INTO identities (external_auth_id, email)
               VALUES ($1, $2)
               ON CONFLICT (external_auth_id) DO NOTHING
               RETURNING id, external_auth_id, email, billing_customer_id, created_at"#,
        )
        .bind(external_auth_id)
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(identity) = inserted {
            return Ok(identity);
        }

        let existing = sqlx::query_as::<_, Identity>(
            "SELECT id, external_auth_id, email, billing_customer_id, created_at
             FROM identities WHERE external_auth_id = $1",
        )
        .bind(external_auth_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(existing)
    }

    async fn active_esim(&self, identity_id: Uuid) -> anyhow::Result<Option<Esim>> {
        let row = sqlx::query_as::<_, Esim>(
            "SELECT id, identity_id, iccid, msisdn, activation_code, status, created_at
             FROM esims WHERE identity_id = $1 AND status = 'active'",
        )
        .bind(identity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn paid_entitlement(
        &self,
        identity_id: Uuid,
        product_id: &str,
    ) -> anyhow::Result<Option<Entitlement>> {
        let row = sqlx::query_as::<_, Entitlement>(
            "SELECT id, identity_id, product_id, status, created_at
             FROM entitlements
             WHERE identity_id = $1 AND product_id = $2 AND status = 'paid'
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(identity_id)
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn open_invoice(
        &self,
        identity_id: Uuid,
        product_id: &str,
    ) -> anyhow::Result<Option<Invoice>> {
        let row = sqlx::query_as::<_, Invoice>(
            "SELECT id, identity_id, product_id, invoice_url, amount_due, status, created_at
             FROM invoices
             WHERE identity_id = $1 AND product_id = $2 AND status = 'open'
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(identity_id)
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn record_invoice(
        &self,
        identity_id: Uuid,
        product_id: &str,
        invoice_url: &str,
        amount_due: Decimal,
    ) -> anyhow::Result<Invoice> {
        let row = sqlx::query_as::<_, Invoice>(
            r#"INSERT INTO invoices (identity_id, product_id, invoice_url, amount_due)
               VALUES ($1, $2, $3, $4)
               RETURNING id, identity_id, product_id, invoice_url, amount_due, status, created_at"#,
        )
        .bind(identity_id)
        .bind(product_id)
        .bind(invoice_url)
        .bind(amount_due)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn record_esim(&self, identity_id: Uuid, esim: &NewEsim) -> anyhow::Result<Esim> {
        let inserted = sqlx::query_as::<_, Esim>(
            r#"INSERT INTO esims (identity_id, iccid, msisdn, activation_code)
               VALUES ($1, $2, $3, $4)
               RETURNING id, identity_id, iccid, msisdn, activation_code, status, created_at"#,
        )
        .bind(identity_id)
        .bind(&esim.iccid)
        .bind(&esim.msisdn)
        .bind(&esim.activation_code)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(row) => Ok(row),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                // A concurrent call won the partial-index race; their eSIM
                // is the one active resource for this identity.
                let existing = self.active_esim(identity_id).await?;
                existing.ok_or_else(|| {
                    anyhow::anyhow!("active eSIM vanished after unique-violation race")
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn insert_billing_event(
        &self,
        identity_id: Uuid,
        billing_customer_id: &str,
        unit_count: i64,
        billable_quantity: Decimal,
        ledger_event_id: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO billing_events
               (identity_id, billing_customer_id, unit_count, billable_quantity, ledger_event_id)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(identity_id)
        .bind(billing_customer_id)
        .bind(unit_count)
        .bind(billable_quantity)
        .bind(ledger_event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn usage_stats(&self, identity_id: Uuid, window_days: i64) -> anyhow::Result<UsageStats> {
        let row = sqlx::query_as::<_, StatsRow>(
            r#"SELECT COALESCE(SUM(unit_count), 0)::BIGINT AS calls,
                      COALESCE(SUM(billable_quantity), 0)::NUMERIC AS billable_quantity
               FROM billing_events
               WHERE identity_id = $1
                 AND created_at > NOW() - ($2 * INTERVAL '1 day')"#,
        )
        .bind(identity_id)
        .bind(window_days)
        .fetch_one(&self.pool)
        .await?;
        Ok(UsageStats {
            calls: row.calls,
            billable_quantity: row.billable_quantity,
        })
    }
}

// -- Row types --

#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub key_hash: String,
    pub label: String,
    pub hourly_quota: i64,
    pub owner_identity: Option<Uuid>,
    pub allowed_origins: Option<Vec<String>>,
}

/// Full key row, used only on the validation path.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRow {
    pub id: Uuid,
    pub key_hash: String,
    pub label: String,
    pub hourly_quota: i64,
    pub is_active: bool,
    pub owner_identity: Option<Uuid>,
    pub total_calls: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Key metadata safe to return from the admin API (no hash).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ApiKeyMeta {
    pub id: Uuid,
    pub label: String,
    pub hourly_quota: i64,
    pub is_active: bool,
    pub owner_identity: Option<Uuid>,
    pub total_calls: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UsageEntry {
    pub api_key_id: Uuid,
    pub path: String,
    pub method: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub response_status: i16,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QuotaWindow {
    pub used: i64,
    pub oldest: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct StatsRow {
    calls: i64,
    billable_quantity: Decimal,
}
