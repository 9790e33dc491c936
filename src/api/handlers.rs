// Public request handler for /v1/messages

use super::models::MessagesRequest;
use super::AppState;
use crate::error::ProxyError;
use crate::pipeline::{self, ClientResponse, EventStream, PipelineContext};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{FutureExt, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Extract the client credential from `x-api-key` or a bearer token.
fn client_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

/// An empty configured key set disables authentication, matching the
/// local-tool default; otherwise the key must be in the set.
pub(super) fn authorized(headers: &HeaderMap, keys: &[String]) -> bool {
    if keys.is_empty() {
        return true;
    }
    match client_key(headers) {
        Some(key) => keys.iter().any(|k| k == &key),
        None => false,
    }
}

pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let config = state.services.settings.get();
    if !authorized(&headers, &config.api_keys) {
        return ProxyError::Unauthorized.into_response();
    }

    let request: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return ProxyError::RequestInvalid(format!("body parse: {}", e)).into_response()
        }
    };
    let client_beta = headers
        .get("anthropic-beta")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    tracing::info!(
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        "messages request"
    );

    let mut ctx = PipelineContext::new(state.services.clone(), request, client_beta);

    // Panics inside stages map to a plain 500 instead of tearing the
    // connection down without a response.
    let outcome = std::panic::AssertUnwindSafe(pipeline::run(&mut ctx))
        .catch_unwind()
        .await;

    match outcome {
        Err(_) => {
            tracing::error!("pipeline panicked");
            ProxyError::Internal(anyhow::anyhow!("pipeline panicked")).into_response()
        }
        Ok(Err(e)) => {
            tracing::warn!("pipeline error: {}", e);
            e.into_response()
        }
        Ok(Ok(())) => match ctx.response.take() {
            Some(ClientResponse::Message(message)) => Json(message).into_response(),
            Some(ClientResponse::Stream(events)) => sse_response(events),
            None => {
                ProxyError::Internal(anyhow::anyhow!("pipeline produced no response"))
                    .into_response()
            }
        },
    }
}

/// Emit the normalized stream as SSE. Errors after the first byte
/// become a final `error` event; the stream ends right after.
fn sse_response(events: EventStream) -> Response {
    let sse_stream = events.map(|item| -> std::result::Result<Event, Infallible> {
        Ok(match item {
            Ok(event) => Event::default()
                .event(event.name())
                .data(serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string())),
            Err(e) => Event::default().event("error").data(
                json!({
                    "type": "error",
                    "error": {"type": e.code(), "message": e.to_string()}
                })
                .to_string(),
            ),
        })
    });

    Sse::new(sse_stream)
        .keep_alive(KeepAlive::new().interval(KEEPALIVE_INTERVAL))
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn api_key_header_authenticates() {
        let keys = vec!["sk-local-1".to_string()];
        assert!(authorized(&headers_with("x-api-key", "sk-local-1"), &keys));
        assert!(!authorized(&headers_with("x-api-key", "sk-wrong"), &keys));
        assert!(!authorized(&HeaderMap::new(), &keys));
    }

    #[test]
    fn bearer_token_authenticates() {
        let keys = vec!["sk-local-1".to_string()];
        assert!(authorized(
            &headers_with("authorization", "Bearer sk-local-1"),
            &keys
        ));
        assert!(!authorized(
            &headers_with("authorization", "Basic sk-local-1"),
            &keys
        ));
    }

    #[test]
    fn empty_key_set_disables_auth() {
        assert!(authorized(&HeaderMap::new(), &[]));
    }
}
