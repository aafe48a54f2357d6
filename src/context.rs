//! Request context and the uniform error taxonomy.
//!
//! A crate-wide error type maps onto the error-enum-to-`IntoResponse`
//! pattern, and a request-id-stamped logging middleware wraps every route
//! with span-scoped method/path/status/latency logging.

use std::time::Instant;

use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// The crate-wide error taxonomy. `Internal`'s inner message is logged
/// but never reaches the client — only a generic message does.
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    Validation { field: String, reason: String },
    Unauthorized,
    Forbidden,
    NotFound,
    RateLimitExceeded { retry_after_secs: u64 },
    StoreError,
    CacheError,
    Internal(String),
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::Validation { .. } => "VALIDATION_ERROR",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::Forbidden => "FORBIDDEN",
            AppError::NotFound => "NOT_FOUND",
            AppError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            AppError::StoreError => "STORE_ERROR",
            AppError::CacheError => "CACHE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::StoreError | AppError::CacheError => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Validation { field, reason } => format!("{field}: {reason}"),
            AppError::Unauthorized => "missing or invalid API key".to_string(),
            AppError::Forbidden => "identity tier is not permitted to call this endpoint".to_string(),
            AppError::NotFound => "resource not found".to_string(),
            AppError::RateLimitExceeded { .. } => "rate limit exceeded".to_string(),
            AppError::StoreError => "store temporarily unavailable".to_string(),
            AppError::CacheError => "cache temporarily unavailable".to_string(),
            // No internal detail leaks to the client; the real message was
            // already logged at the call site.
            AppError::Internal(_) => "internal error".to_string(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for AppError {}

impl From<crate::store::StoreError> for AppError {
    fn from(e: crate::store::StoreError) -> Self {
        warn!(error = %e, "store error");
        AppError::StoreError
    }
}

impl From<crate::query::QueryError> for AppError {
    fn from(e: crate::query::QueryError) -> Self {
        warn!(error = %e, "query error");
        AppError::StoreError
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
    status: u16,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
    request_id: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // request_id is attached by `request_context` via an extension on
        // the eventual response; here we emit a placeholder that the
        // middleware overwrites is unnecessary since this impl doesn't have
        // access to the request. Call sites that can, attach a known id via
        // `AppError::into_response_with_id`.
        self.into_response_with_id("unknown")
    }
}

impl AppError {
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let status = self.status();
        let details = match &self {
            AppError::Validation { field, reason } => Some(json!({"field": field, "reason": reason})),
            _ => None,
        };
        let retry_after = match &self {
            AppError::RateLimitExceeded { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };

        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: self.message(),
                details,
                request_id: request_id.to_string(),
            },
            status: status.as_u16(),
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

/// Assigns a `request_id` at entry, echoes it as `X-Request-ID` on every
/// response, and logs `(status, latency_ms, method, path, request_id)` at
/// info level on completion, via the same acquire/release-scoped tracing
/// span style used across this service, generalized to also carry the id.
pub async fn request_context(mut request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let mut response = next.run(request).await;

    let latency_ms = start.elapsed().as_millis() as i64;
    let status = response.status().as_u16();

    metrics::histogram!(
        crate::metrics_registry::HTTP_REQUEST_DURATION,
        "route" => path.clone(),
        "status" => status.to_string(),
    )
    .record(latency_ms as f64);

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    if status >= 500 {
        warn!(%request_id, %method, %path, status, latency_ms, "request failed");
    } else {
        info!(%request_id, %method, %path, status, latency_ms, "request completed");
    }

    response
}

/// Per-request id, stashed in extensions by [`request_context`] and read
/// back out by handlers that need to stamp an error body.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_maps_to_400() {
        let err = AppError::Validation {
            field: "symbol".to_string(),
            reason: "bad".to_string(),
        };
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn store_error_maps_to_503() {
        assert_eq!(AppError::StoreError.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn internal_error_message_does_not_leak_detail() {
        let err = AppError::Internal("db connection string leaked".to_string());
        assert_eq!(err.message(), "internal error");
    }
}
