// Stage 4: dispatch through the scraped web interface

use super::{ByteStream, PipelineContext, WireFormat};
use crate::error::{ProxyError, Result};
use crate::http::status_error;
use crate::selector::Transport;
use crate::web::transcript;
use crate::web::{Acquired, CompletionPayload, SessionHandle};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const BACKOFF_BASE_MS: u64 = 500;

pub async fn dispatch(ctx: &mut PipelineContext) -> Result<()> {
    let Some(selection) = ctx.selection.clone() else {
        return Ok(());
    };
    if selection.transport != Transport::Web {
        return Ok(());
    }

    let mut exclude: HashSet<String> = HashSet::new();
    let mut current = selection;

    loop {
        let outcome = attempt(ctx, &current.account_id).await;
        match outcome {
            Ok((stream, handle)) => {
                ctx.raw = Some(stream);
                ctx.wire = Some(WireFormat::WebSse);
                ctx.session = Some(Arc::new(handle));
                ctx.selection = Some(current);
                return Ok(());
            }
            // A pinned request has exactly one valid conversation, so
            // quota failover only applies to fresh sessions.
            Err(ProxyError::UpstreamQuota { resets_at }) if ctx.pinned.is_none() => {
                let until = resets_at.unwrap_or_else(super::claude_api::next_hour);
                ctx.services.store.mark_cooldown(
                    &current.account_id,
                    &ctx.request.model,
                    until,
                )?;
                exclude.insert(current.account_id.clone());
                match ctx.services.selector.select(
                    &ctx.request.model,
                    Some(&ctx.fingerprint),
                    &exclude,
                ) {
                    Ok(next) if next.transport == Transport::Web => current = next,
                    // The web pool was the last resort; anything else
                    // the selector offers now cannot serve either.
                    _ => {
                        return Err(ProxyError::UpstreamQuota {
                            resets_at: Some(until),
                        })
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }
}

async fn attempt(
    ctx: &PipelineContext,
    account_id: &str,
) -> Result<(ByteStream, SessionHandle)> {
    let config = ctx.services.settings.get();
    let account = ctx.services.store.get(account_id).ok_or_else(|| {
        ProxyError::RequestInvalid(format!("unknown account: {}", account_id))
    })?;
    let cookie = account
        .cookie_value
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            ProxyError::UpstreamFatal(format!("account {} has no session cookie", account_id))
        })?;

    let web = Arc::clone(ctx.services.sessions.client());

    let handle = if let Some(pinned) = &ctx.pinned {
        ctx.services.sessions.adopt(
            &pinned.account_id,
            &ctx.fingerprint,
            &pinned.conversation_uuid,
        )?
    } else {
        match ctx.services.sessions.acquire(account_id, &ctx.fingerprint)? {
            Acquired::Live(handle) => handle,
            Acquired::Pending(reservation) => {
                let uuid = reservation.conversation_uuid.clone();
                match web.create_conversation(&cookie, account_id, &uuid).await {
                    Ok(()) => reservation.confirm(),
                    Err(e) => {
                        // Dropping the reservation frees the slot.
                        drop(reservation);
                        return Err(e);
                    }
                }
            }
        }
    };

    let rendered = transcript::render(&ctx.request, &config)?;
    let mut file_uuids = Vec::new();
    for (media_type, data) in &rendered.inline_images {
        let bytes = BASE64_STANDARD
            .decode(data)
            .map_err(|e| ProxyError::RequestInvalid(format!("invalid image data: {}", e)))?;
        let file_uuid = web
            .upload_image(&cookie, account_id, media_type, bytes)
            .await?;
        file_uuids.push(file_uuid);
    }
    let payload = CompletionPayload {
        prompt: rendered.prompt,
        file_uuids,
        external_image_urls: rendered.external_image_urls,
    };

    let mut tries = 0u32;
    loop {
        if tries > 0 {
            let backoff = BACKOFF_BASE_MS * (1 << (tries - 1).min(6));
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }

        let response = match web
            .completion(&cookie, account_id, &handle.conversation_uuid, &payload)
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_retryable() && tries < config.request_retries => {
                tries += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        let status = response.status().as_u16();
        if status == 429 {
            let text = response.text().await.unwrap_or_default();
            return Err(ProxyError::UpstreamQuota {
                resets_at: parse_web_reset(&text),
            });
        }
        if status >= 400 {
            let text = response.text().await.unwrap_or_default();
            let err = status_error(status, &text);
            if err.is_retryable() && tries < config.request_retries {
                tries += 1;
                continue;
            }
            return Err(err);
        }

        let stream: ByteStream = Box::pin(ctx.services.http.byte_stream(response));
        return Ok((stream, handle));
    }
}

/// The web interface reports limits as a JSON-encoded `resetsAt`
/// timestamp nested inside the error message.
pub fn parse_web_reset(body: &str) -> Option<DateTime<Utc>> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let message = value.get("error")?.get("message")?.as_str()?;
    let nested: serde_json::Value = serde_json::from_str(message).ok()?;
    let secs = nested.get("resetsAt")?.as_i64()?;
    DateTime::from_timestamp(secs, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::context_for;
    use serde_json::json;

    #[tokio::test]
    async fn non_web_selections_pass_through() {
        let (mut ctx, _dir) = context_for(json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        ctx.selection = Some(crate::selector::Selection {
            account_id: "org-x".to_string(),
            transport: Transport::OAuth,
        });
        dispatch(&mut ctx).await.unwrap();
        assert!(ctx.raw.is_none());
        assert!(ctx.session.is_none());
    }

    #[test]
    fn reset_instants_parse_from_nested_json() {
        let body = r#"{"error":{"type":"rate_limit_error","message":"{\"resetsAt\":1750000000}"}}"#;
        let at = parse_web_reset(body).unwrap();
        assert_eq!(at.timestamp(), 1750000000);
        assert!(parse_web_reset("{}").is_none());
        assert!(parse_web_reset("nope").is_none());
    }
}
