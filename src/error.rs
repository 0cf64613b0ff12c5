// src/error.rs
//! Typed error taxonomy shared by every HTTP handler and background worker.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

/// One variant per §7 error kind. `IntoResponse` maps each to its HTTP
/// status and the `{error:{type,message,code?,param?}}` envelope.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("permission denied")]
    PermissionDenied,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
            GatewayError::Unauthenticated => "UNAUTHENTICATED",
            GatewayError::PermissionDenied => "PERMISSION_DENIED",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            GatewayError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            GatewayError::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::PermissionDenied => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    param: Option<String>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if matches!(self, GatewayError::Internal(_)) {
            let correlation_id = uuid::Uuid::new_v4().to_string();
            error!(correlation_id = %correlation_id, "{}", self);
        }
        let status = self.status();
        let retry_after = if let GatewayError::RateLimited { retry_after_secs } = &self {
            Some(*retry_after_secs)
        } else {
            None
        };
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.kind(),
                message: self.to_string(),
                code: None,
                param: None,
            },
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(err: rusqlite::Error) -> Self {
        GatewayError::StoreUnavailable(err.to_string())
    }
}

impl From<r2d2::Error> for GatewayError {
    fn from(err: r2d2::Error) -> Self {
        GatewayError::StoreUnavailable(err.to_string())
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
