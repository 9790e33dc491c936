// Error taxonomy shared across the request path

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::json;

/// Retryable upstream failure categories, as reported by the HTTP
/// transport before the first response byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    ConnectFailed,
    ReadTimeout,
    BodyError,
    Status5xx(u16),
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransientKind::ConnectFailed => write!(f, "connect failed"),
            TransientKind::ReadTimeout => write!(f, "read timeout"),
            TransientKind::BodyError => write!(f, "body error"),
            TransientKind::Status5xx(code) => write!(f, "upstream status {}", code),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid request: {0}")]
    RequestInvalid(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("no account available for model {0}")]
    NoAccountAvailable(String),

    #[error("conversation is already serving a request")]
    SessionBusy,

    #[error("session limit reached for account")]
    SessionExhausted { retry_after_secs: u64 },

    #[error("upstream quota exhausted")]
    UpstreamQuota { resets_at: Option<DateTime<Utc>> },

    #[error("transient upstream failure: {0}")]
    UpstreamTransient(TransientKind),

    #[error("upstream failure: {0}")]
    UpstreamFatal(String),

    #[error("oauth code exchange failed: {0}")]
    OAuthExchangeFailed(String),

    #[error("oauth token refresh failed: {0}")]
    OAuthRefreshFailed(String),

    #[error("stream interrupted: {0}")]
    StreamCut(String),

    #[error("unknown tool call id: {0}")]
    UnknownToolCall(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ProxyError {
    /// Stable machine-readable code carried in error bodies and SSE
    /// error events.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::RequestInvalid(_) => "request_invalid",
            ProxyError::Unauthorized => "unauthorized",
            ProxyError::NoAccountAvailable(_) => "no_account_available",
            ProxyError::SessionBusy => "session_busy",
            ProxyError::SessionExhausted { .. } => "session_exhausted",
            ProxyError::UpstreamQuota { .. } => "upstream_quota",
            ProxyError::UpstreamTransient(_) => "upstream_transient",
            ProxyError::UpstreamFatal(_) => "upstream_fatal",
            ProxyError::OAuthExchangeFailed(_) => "oauth_exchange_failed",
            ProxyError::OAuthRefreshFailed(_) => "oauth_refresh_failed",
            ProxyError::StreamCut(_) => "stream_cut",
            ProxyError::UnknownToolCall(_) => "unknown_tool_call",
            ProxyError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::RequestInvalid(_) | ProxyError::UnknownToolCall(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::NoAccountAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::SessionBusy => StatusCode::CONFLICT,
            ProxyError::SessionExhausted { .. } | ProxyError::UpstreamQuota { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ProxyError::UpstreamTransient(_)
            | ProxyError::UpstreamFatal(_)
            | ProxyError::StreamCut(_) => StatusCode::BAD_GATEWAY,
            ProxyError::OAuthExchangeFailed(_) | ProxyError::OAuthRefreshFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the dispatch stages may retry this failure before the
    /// first byte has reached the client.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProxyError::UpstreamTransient(_))
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            ProxyError::SessionExhausted { retry_after_secs } => Some(*retry_after_secs),
            ProxyError::UpstreamQuota {
                resets_at: Some(at),
            } => {
                let delta = (*at - Utc::now()).num_seconds();
                Some(delta.max(1) as u64)
            }
            ProxyError::UpstreamQuota { resets_at: None } => Some(60),
            _ => None,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "detail": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));
        let mut response = (status, body).into_response();
        if let Some(secs) = self.retry_after() {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
