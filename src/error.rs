//! Gateway-wide error taxonomy.
//!
//! The client-visible error kinds are a fixed set; everything else
//! surfaced to callers is mapped into one of them before it crosses the HTTP
//! boundary. Upstream error bodies are never leaked verbatim — only logged.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

/// Stable, client-facing error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthRequired,
    AuthExpired,
    Forbidden,
    QuotaExceeded,
    Concurrency,
    RateLimited,
    BadRequest,
    ContextTooLarge,
    Upstream,
    Unavailable,
    Timeout,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::AuthRequired | ErrorKind::AuthExpired => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::QuotaExceeded | ErrorKind::Concurrency | ErrorKind::RateLimited => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ErrorKind::BadRequest | ErrorKind::ContextTooLarge => StatusCode::BAD_REQUEST,
            ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

/// Top-level gateway error. `message` is operator-facing (logged in full);
/// the HTTP response only ever carries `kind` and a generic message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
    /// Original upstream error text, if any — retained for the ApiLog row,
    /// never sent to the client.
    pub upstream_detail: Option<String>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            upstream_detail: None,
        }
    }

    pub fn with_upstream_detail(mut self, detail: impl Into<String>) -> Self {
        self.upstream_detail = Some(detail.into());
        self
    }

    pub fn auth_required() -> Self {
        Self::new(ErrorKind::AuthRequired, "missing or invalid API key")
    }

    pub fn auth_expired() -> Self {
        Self::new(ErrorKind::AuthExpired, "API key has expired")
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, reason)
    }

    pub fn quota_exceeded(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::QuotaExceeded, reason)
    }

    pub fn concurrency_limited() -> Self {
        Self::new(ErrorKind::Concurrency, "concurrent request limit reached")
    }

    pub fn rate_limited() -> Self {
        Self::new(ErrorKind::RateLimited, "upstream rate limit persisted through retries")
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, reason)
    }

    pub fn context_too_large() -> Self {
        Self::new(
            ErrorKind::ContextTooLarge,
            "validation exception persisted after the compression ladder was exhausted",
        )
    }

    pub fn upstream(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream, reason)
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, reason)
    }

    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout, "upstream idle timeout")
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: ErrorKind,
    message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let Some(detail) = &self.upstream_detail {
            tracing::warn!(kind = ?self.kind, upstream_detail = %detail, "gateway error");
        } else {
            tracing::warn!(kind = ?self.kind, message = %self.message, "gateway error");
        }
        let status = self.kind.status();
        let body = ErrorEnvelope {
            error: ErrorBody {
                kind: self.kind,
                message: self.message,
            },
        };
        (status, Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
