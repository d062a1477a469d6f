use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid or revoked API key")]
    Unauthenticated,

    #[error("hourly quota exceeded ({used}/{limit})")]
    QuotaExceeded {
        used: i64,
        limit: i64,
        reset_at: DateTime<Utc>,
    },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "invalid_api_key",
                "invalid, missing, or revoked API key".to_string(),
            ),
            AppError::QuotaExceeded { used, limit, .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                "quota_exceeded",
                format!("hourly quota exceeded ({} of {} calls used)", used, limit),
            ),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        let mut response = (status, body).into_response();

        if let AppError::QuotaExceeded {
            used,
            limit,
            reset_at,
        } = &self
        {
            let headers = response.headers_mut();
            if let Ok(v) = limit.to_string().parse() {
                headers.insert("x-ratelimit-limit", v);
            }
            if let Ok(v) = used.to_string().parse() {
                headers.insert("x-ratelimit-used", v);
            }
            if let Ok(v) = reset_at.timestamp().to_string().parse() {
                headers.insert("x-ratelimit-reset", v);
            }
            let retry_secs = (reset_at.timestamp() - Utc::now().timestamp()).max(1);
            if let Ok(v) = retry_secs.to_string().parse() {
                headers.insert("retry-after", v);
            }
        }

        response
    }
}
