//! Bearer-key authentication and per-key rolling quota.
//!
//! Order matters: the quota decision is made before the call is logged, so
//! a rejection's own audit row can never contribute to the exhaustion that
//! caused it. The lifetime-counter refresh attaches to validation itself,
//! so a denied call still updates `last_used_at`. Counter bumps and log
//! purges run off the request path; a storage failure on the count degrades
//! to "allow" rather than rejecting a legitimate caller.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::errors::AppError;
use crate::keys::{self, CredentialInfo, QuotaDecision, KEY_PREFIX, QUOTA_WINDOW_SECS};
use crate::store::postgres::{ApiKeyRow, PgStore, QuotaWindow, UsageEntry};
use crate::AppState;

/// Store operations the credential gate needs, seamed so the gate's
/// decisions are testable without a live database.
#[async_trait]
pub(crate) trait AuthBackend: Send + Sync {
    async fn key_by_hash(&self, key_hash: &str) -> anyhow::Result<Option<ApiKeyRow>>;
    async fn key_window(&self, api_key_id: Uuid) -> anyhow::Result<QuotaWindow>;
    /// Lifetime-counter refresh. Implementations may defer the write.
    fn touch_key(&self, api_key_id: Uuid);
}

#[async_trait]
impl AuthBackend for PgStore {
    async fn key_by_hash(&self, key_hash: &str) -> anyhow::Result<Option<ApiKeyRow>> {
        self.get_key_by_hash(key_hash).await
    }

    async fn key_window(&self, api_key_id: Uuid) -> anyhow::Result<QuotaWindow> {
        self.quota_window(api_key_id).await
    }

    fn touch_key(&self, api_key_id: Uuid) {
        // Bookkeeping, not enforcement; a failure must not block the call.
        let db = self.clone();
        tokio::spawn(async move {
            if let Err(e) = db.bump_key_usage(api_key_id).await {
                tracing::warn!(key = %api_key_id, "usage counter bump failed: {}", e);
            }
        });
    }
}

/// Decision for one presented credential.
#[derive(Debug)]
pub(crate) enum Gate {
    Pass {
        credential: CredentialInfo,
        used: i64,
        reset_at: DateTime<Utc>,
    },
    Throttled {
        key_id: Uuid,
        used: i64,
        limit: i64,
        reset_at: DateTime<Utc>,
    },
}

/// Validate the presented bearer secret and evaluate the rolling quota.
/// Malformed or foreign-prefixed credentials are rejected before any store
/// lookup; unknown and revoked secrets are indistinguishable to the caller.
pub(crate) async fn check_credential(
    backend: &dyn AuthBackend,
    authorization: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Gate, AppError> {
    let presented = authorization
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| t.starts_with(KEY_PREFIX))
        .ok_or(AppError::Unauthenticated)?;

    let hash = keys::hash_secret(presented);
    let key = backend
        .key_by_hash(&hash)
        .await
        .map_err(AppError::Internal)?
        .filter(|k| k.is_active)
        .ok_or(AppError::Unauthenticated)?;

    // Attached to validation, not to the quota outcome: a call denied on
    // quota still refreshes last_used_at.
    backend.touch_key(key.id);

    // Rolling-window usage; fail open if the count is unavailable.
    let (used, oldest) = match backend.key_window(key.id).await {
        Ok(w) => (w.used, w.oldest),
        Err(e) => {
            tracing::warn!(key = %key.id, "quota count unavailable, allowing call: {}", e);
            (0, None)
        }
    };

    match keys::evaluate_quota(used, key.hourly_quota, oldest, now) {
        QuotaDecision::Denied {
            used,
            limit,
            reset_at,
        } => Ok(Gate::Throttled {
            key_id: key.id,
            used,
            limit,
            reset_at,
        }),
        QuotaDecision::Allowed { used, .. } => Ok(Gate::Pass {
            credential: CredentialInfo {
                id: key.id,
                label: key.label,
                hourly_quota: key.hourly_quota,
                owner_identity: key.owner_identity,
            },
            used,
            reset_at: oldest.unwrap_or(now) + Duration::seconds(QUOTA_WINDOW_SECS),
        }),
    }
}

pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let authorization = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let gate = check_credential(&state.db, authorization.as_deref(), Utc::now()).await?;

    // Opportunistic housekeeping, off the request path.
    {
        let db = state.db.clone();
        let retention = state.config.usage_retention_hours;
        tokio::spawn(async move {
            match db.purge_expired_usage(retention).await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "purged expired usage rows"),
                Err(e) => tracing::warn!("usage purge failed: {}", e),
            }
        });
    }

    let entry_template = UsageEntry {
        api_key_id: match &gate {
            Gate::Pass { credential, .. } => credential.id,
            Gate::Throttled { key_id, .. } => *key_id,
        },
        path: req.uri().path().to_string(),
        method: req.method().to_string(),
        client_ip: req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_string()),
        user_agent: req
            .headers()
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        response_status: 0,
    };

    match gate {
        Gate::Throttled {
            used,
            limit,
            reset_at,
            ..
        } => {
            // Audit the rejection too; it was evaluated before this write.
            let entry = UsageEntry {
                response_status: 429,
                ..entry_template
            };
            if let Err(e) = state.db.log_usage(&entry).await {
                tracing::warn!("failed to log rejected call: {}", e);
            }
            Err(AppError::QuotaExceeded {
                used,
                limit,
                reset_at,
            })
        }
        Gate::Pass {
            credential,
            used,
            reset_at,
        } => {
            let limit = credential.hourly_quota;
            req.extensions_mut().insert(credential);

            let mut resp = next.run(req).await;

            let entry = UsageEntry {
                response_status: resp.status().as_u16() as i16,
                ..entry_template
            };
            if let Err(e) = state.db.log_usage(&entry).await {
                tracing::warn!("failed to log accepted call: {}", e);
            }

            let headers = resp.headers_mut();
            set_header(headers, "x-ratelimit-limit", limit.to_string());
            set_header(headers, "x-ratelimit-used", (used + 1).to_string());
            set_header(headers, "x-ratelimit-reset", reset_at.timestamp().to_string());

            Ok(resp)
        }
    }
}

fn set_header(headers: &mut axum::http::HeaderMap, name: &'static str, value: String) {
    if let Ok(v) = HeaderValue::from_str(&value) {
        headers.insert(name, v);
    }
}
