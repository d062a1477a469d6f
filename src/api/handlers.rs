use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::keys;
use crate::store::postgres::{ApiKeyMeta, NewApiKey};
use crate::store::UsageStats;
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    pub label: String,
    pub hourly_quota: Option<i64>,
    pub owner_identity: Option<Uuid>,
    pub allowed_origins: Option<Vec<String>>,
}

#[derive(Serialize)]
pub struct CreateKeyResponse {
    /// Shown exactly once; only the hash is stored.
    pub secret: String,
    pub key: ApiKeyMeta,
    pub message: String,
}

#[derive(Deserialize)]
pub struct UsageQuery {
    pub days: Option<i64>,
}

// ── Handlers ─────────────────────────────────────────────────

/// POST /api/v1/keys — issue a new API key
pub async fn create_key(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<CreateKeyResponse>), StatusCode> {
    if payload.label.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let quota = payload
        .hourly_quota
        .unwrap_or(state.config.default_key_quota);
    if quota <= 0 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let (secret, key_hash) = keys::mint_secret();
    let key = state
        .db
        .insert_api_key(&NewApiKey {
            key_hash,
            label: payload.label,
            hourly_quota: quota,
            owner_identity: payload.owner_identity,
            allowed_origins: payload.allowed_origins,
        })
        .await
        .map_err(|e| {
            tracing::error!("create_key failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok((
        StatusCode::CREATED,
        Json(CreateKeyResponse {
            message: format!("Use: Authorization: Bearer {}", secret),
            secret,
            key,
        }),
    ))
}

/// GET /api/v1/keys — list key metadata (never hashes or secrets)
pub async fn list_keys(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ApiKeyMeta>>, StatusCode> {
    let keys = state.db.list_api_keys().await.map_err(|e| {
        tracing::error!("list_keys failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(keys))
}

/// DELETE /api/v1/keys/:id — revoke a key (one-way, idempotent)
pub async fn revoke_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    let known = state.db.revoke_api_key(id).await.map_err(|e| {
        tracing::error!("revoke_key failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    if known {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

/// GET /api/v1/identities/:id/usage?days=30 — metering aggregates
pub async fn get_usage_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<UsageQuery>,
) -> Result<Json<UsageStats>, StatusCode> {
    let days = params.days.unwrap_or(30).clamp(1, 365);
    let stats = state.reporter.usage_stats(id, days).await.map_err(|e| {
        tracing::error!("get_usage_stats failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(stats))
}
