// Stage 3: dispatch over the official messages API with OAuth

use super::{PipelineContext, WireFormat};
use crate::api::models::{MessagesRequest, SystemBlock, SystemPrompt};
use crate::error::{ProxyError, Result};
use crate::http::{status_error, ClientKind};
use crate::selector::Transport;
use chrono::{DateTime, Timelike, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

pub const MESSAGES_API_URL: &str = "https://api.anthropic.com/v1/messages";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Required for OAuth-authenticated access.
pub const OAUTH_BETA: &str = "oauth-2025-04-20";

const CLAUDE_CODE_SYSTEM: &str = "You are Claude Code, Anthropic's official CLI for Claude.";
const BACKOFF_BASE_MS: u64 = 500;

pub async fn dispatch(ctx: &mut PipelineContext) -> Result<()> {
    let Some(selection) = ctx.selection.clone() else {
        return Ok(());
    };
    if selection.transport != Transport::OAuth {
        return Ok(());
    }

    let body = build_body(&ctx.request);
    let mut exclude: HashSet<String> = HashSet::new();
    let mut current = selection;

    loop {
        let outcome = attempt(ctx, &current.account_id, &body).await;
        match outcome {
            Ok(stream) => {
                ctx.raw = Some(stream);
                ctx.wire = Some(WireFormat::ApiSse);
                ctx.selection = Some(current);
                return Ok(());
            }
            Err(ProxyError::UpstreamQuota { resets_at }) => {
                let until = resets_at.unwrap_or_else(next_hour);
                ctx.services.store.mark_cooldown(
                    &current.account_id,
                    &ctx.request.model,
                    until,
                )?;
                tracing::warn!(
                    "account {}... rate limited for {} until {}",
                    &current.account_id[..current.account_id.len().min(8)],
                    ctx.request.model,
                    until
                );
                exclude.insert(current.account_id.clone());
                match ctx.services.selector.select(
                    &ctx.request.model,
                    Some(&ctx.fingerprint),
                    &exclude,
                ) {
                    Ok(next) if next.transport == Transport::OAuth => current = next,
                    Ok(next) => {
                        // The remaining candidates are web-only; hand
                        // the request to the web dispatch stage.
                        ctx.selection = Some(next);
                        return Ok(());
                    }
                    Err(_) => {
                        return Err(ProxyError::UpstreamQuota {
                            resets_at: Some(until),
                        })
                    }
                }
            }
            Err(e @ (ProxyError::OAuthRefreshFailed(_) | ProxyError::OAuthExchangeFailed(_))) => {
                // Auth is gone on this account; demote it for this
                // request and try the next candidate.
                exclude.insert(current.account_id.clone());
                match ctx.services.selector.select(
                    &ctx.request.model,
                    Some(&ctx.fingerprint),
                    &exclude,
                ) {
                    Ok(next) if next.transport == Transport::OAuth => current = next,
                    Ok(next) => {
                        ctx.selection = Some(next);
                        return Ok(());
                    }
                    Err(_) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// One account's worth of attempts: transient retries with backoff,
/// plus a single cookie re-authentication on revoked credentials. All
/// retries happen before any byte reaches the client.
async fn attempt(
    ctx: &PipelineContext,
    account_id: &str,
    body: &Value,
) -> Result<super::ByteStream> {
    let config = ctx.services.settings.get();
    let beta = beta_header(ctx.client_beta.as_deref());
    let mut reauthed = false;
    let mut tries = 0u32;

    loop {
        if tries > 0 {
            let backoff = BACKOFF_BASE_MS * (1 << (tries - 1).min(6));
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }

        let token = ctx.services.oauth.access_token(account_id).await?;
        let client = ctx.services.http.client(ClientKind::Plain)?;
        let request = client
            .post(MESSAGES_API_URL)
            .header("authorization", format!("Bearer {}", token))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("anthropic-beta", &beta)
            .header("content-type", "application/json")
            .header("accept", "text/event-stream")
            .json(body);

        let response = match ctx.services.http.send(request).await {
            Ok(response) => response,
            Err(e) if e.is_retryable() && tries < config.request_retries => {
                tries += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        let status = response.status().as_u16();
        if status == 429 {
            let resets_at = parse_reset_header(&response);
            return Err(ProxyError::UpstreamQuota { resets_at });
        }
        if status >= 400 {
            let text = response.text().await.unwrap_or_default();
            let (error_type, error_message) = parse_error_body(&text);

            if status == 400 && error_message == "system: Invalid model name" {
                return Err(ProxyError::RequestInvalid(format!(
                    "upstream rejected model {}",
                    ctx.request.model
                )));
            }

            // Revoked or invalid credentials: one re-authentication
            // with the session cookie, then retry the call.
            let auth_revoked = (status == 401 && error_type == "authentication_error")
                || (status == 403 && error_type == "permission_error");
            if auth_revoked {
                let has_cookie = ctx
                    .services
                    .store
                    .get(account_id)
                    .and_then(|a| a.cookie_value)
                    .is_some_and(|c| !c.is_empty());
                if !reauthed && has_cookie {
                    tracing::warn!(
                        "credentials revoked for {}..., re-authenticating with cookie",
                        &account_id[..account_id.len().min(8)]
                    );
                    ctx.services.oauth.exchange_from_cookie(account_id).await?;
                    reauthed = true;
                    continue;
                }
                return Err(ProxyError::OAuthRefreshFailed(error_message));
            }

            let err = status_error(status, &text);
            if err.is_retryable() && tries < config.request_retries {
                tries += 1;
                continue;
            }
            return Err(err);
        }

        return Ok(Box::pin(ctx.services.http.byte_stream(response)));
    }
}

/// Upstream request body: the client request with streaming forced on
/// and the CLI system identity prepended exactly once.
pub fn build_body(request: &MessagesRequest) -> Value {
    let mut upstream = request.clone();
    upstream.stream = true;

    let mut blocks = vec![SystemBlock::text(CLAUDE_CODE_SYSTEM)];
    match upstream.system.take() {
        Some(SystemPrompt::Text(text)) if !text.is_empty() => {
            blocks.push(SystemBlock::text(text));
        }
        Some(SystemPrompt::Blocks(existing)) => {
            if existing.first().map(|b| b.text.as_str()) == Some(CLAUDE_CODE_SYSTEM) {
                blocks = existing;
            } else {
                blocks.extend(existing);
            }
        }
        _ => {}
    }
    upstream.system = Some(SystemPrompt::Blocks(blocks));

    serde_json::to_value(&upstream).unwrap_or(Value::Null)
}

/// Merge the mandatory OAuth beta with any client-supplied features,
/// deduplicated in order.
pub fn beta_header(client_beta: Option<&str>) -> String {
    let mut features: Vec<String> = vec![OAUTH_BETA.to_string()];
    if let Some(client) = client_beta {
        for feature in client.split(',') {
            let feature = feature.trim();
            if !feature.is_empty() && !features.iter().any(|f| f == feature) {
                features.push(feature.to_string());
            }
        }
    }
    features.join(",")
}

fn parse_reset_header(response: &reqwest::Response) -> Option<DateTime<Utc>> {
    response
        .headers()
        .get("anthropic-ratelimit-unified-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// Rate limits without a reset header cool down until the top of the
/// next hour.
pub fn next_hour() -> DateTime<Utc> {
    let now = Utc::now();
    let truncated = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    truncated + chrono::Duration::hours(1)
}

pub fn parse_error_body(text: &str) -> (String, String) {
    let value: Value = serde_json::from_str(text).unwrap_or(Value::Null);
    let error = value.get("error").cloned().unwrap_or(Value::Null);
    (
        error
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("unknown")
            .to_string(),
        error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error")
            .to_string(),
    )
}
