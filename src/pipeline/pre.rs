// Pre-processing stages: request validation / probe short-circuit
// (stage 1) and tool-result pinning plus account selection (stage 2)

use super::{terminal, PipelineContext};
use crate::api::models::{ContentBlock, MessageResponse, Role, StopReason, Usage};
use crate::error::Result;
use crate::selector::{Selection, Transport};
use crate::tokens;
use crate::tools::ToolCallTracker;
use std::collections::HashSet;

const PROBE_REPLY: &str = "Hello! The connection is working.";

/// Stage 1: structural validation, boundary short-circuits, and the
/// canned reply for client connectivity probes.
pub fn test_message(ctx: &mut PipelineContext) -> Result<()> {
    ctx.request.validate()?;

    if ctx.request.max_tokens == 0 {
        let mut message = MessageResponse::empty(ctx.request.model.clone());
        message.stop_reason = Some(StopReason::MaxTokens);
        message.usage = Usage {
            input_tokens: tokens::count_request(&ctx.request)?,
            output_tokens: 0,
        };
        ctx.response = Some(terminal::canned_response(ctx.request.stream, message));
        return Ok(());
    }

    if is_connectivity_probe(ctx) {
        let mut message = MessageResponse::empty(ctx.request.model.clone());
        message.content = vec![ContentBlock::text(PROBE_REPLY)];
        message.stop_reason = Some(StopReason::EndTurn);
        message.usage = Usage {
            input_tokens: tokens::count_request(&ctx.request)?,
            output_tokens: tokens::count_text(PROBE_REPLY),
        };
        ctx.response = Some(terminal::canned_response(ctx.request.stream, message));
    }
    Ok(())
}

/// API clients verify connectivity with a one-word, one-token request
/// before sending real traffic.
fn is_connectivity_probe(ctx: &PipelineContext) -> bool {
    if ctx.request.max_tokens > 1 || ctx.request.messages.len() != 1 {
        return false;
    }
    let message = &ctx.request.messages[0];
    message.role == Role::User && message.content.joined_text().trim().eq_ignore_ascii_case("hi")
}

/// Stage 2: resolve trailing tool_result blocks to the conversation
/// that issued them and pin the pipeline there; otherwise run the
/// account selector.
pub fn tool_result(ctx: &mut PipelineContext) -> Result<()> {
    let ids = ctx.request.trailing_tool_result_ids();
    let synthetic: Vec<&String> = ids
        .iter()
        .filter(|id| ToolCallTracker::is_synthetic(id))
        .collect();

    if let Some(first) = synthetic.first() {
        let pending = ctx.services.tracker.resolve(first)?;
        // Parallel tool calls from the same turn resolve together.
        for id in synthetic.iter().skip(1) {
            let _ = ctx.services.tracker.resolve(id);
        }
        ctx.services.store.touch_usage(&pending.account_id)?;
        ctx.selection = Some(Selection {
            account_id: pending.account_id.clone(),
            transport: Transport::Web,
        });
        ctx.pinned = Some(pending);
        return Ok(());
    }

    let selection = ctx.services.selector.select(
        &ctx.request.model,
        Some(&ctx.fingerprint),
        &HashSet::new(),
    )?;
    ctx.selection = Some(selection);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, Capability, OAuthTokens};
    use crate::error::ProxyError;
    use crate::pipeline::test_support::context_for;
    use crate::pipeline::ClientResponse;
    use chrono::{Duration, Utc};
    use serde_json::json;

    #[test]
    fn probe_request_short_circuits() {
        let (mut ctx, _dir) = context_for(json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "Hi"}]
        }));
        test_message(&mut ctx).unwrap();
        match ctx.response {
            Some(ClientResponse::Message(message)) => {
                assert_eq!(message.content.len(), 1);
                assert_eq!(message.stop_reason, Some(StopReason::EndTurn));
            }
            _ => panic!("expected a canned buffered response"),
        }
    }

    #[test]
    fn ordinary_requests_pass_through_stage_one() {
        let (mut ctx, _dir) = context_for(json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": "Tell me about ferrets"}]
        }));
        test_message(&mut ctx).unwrap();
        assert!(ctx.response.is_none());
    }

    #[test]
    fn zero_max_tokens_returns_empty_content() {
        let (mut ctx, _dir) = context_for(json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 0,
            "messages": [{"role": "user", "content": "long question"}]
        }));
        test_message(&mut ctx).unwrap();
        match ctx.response {
            Some(ClientResponse::Message(message)) => {
                assert!(message.content.is_empty());
                assert_eq!(message.stop_reason, Some(StopReason::MaxTokens));
                assert!(message.usage.input_tokens > 0);
                assert_eq!(message.usage.output_tokens, 0);
            }
            _ => panic!("expected a canned buffered response"),
        }
    }

    #[test]
    fn empty_messages_fail_validation() {
        let (mut ctx, _dir) = context_for(json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": []
        }));
        assert!(matches!(
            test_message(&mut ctx),
            Err(ProxyError::RequestInvalid(_))
        ));
    }

    #[test]
    fn tool_result_pins_to_the_registered_conversation() {
        let (mut ctx, _dir) = context_for(json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_pin", "name": "get_weather", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_pin", "content": "sunny"}
                ]}
            ]
        }));
        ctx.services
            .store
            .create(Account::new("org-web"))
            .unwrap();
        ctx.services.tracker.register("toolu_pin", "org-web", "conv-7");

        tool_result(&mut ctx).unwrap();
        let selection = ctx.selection.unwrap();
        assert_eq!(selection.account_id, "org-web");
        assert_eq!(selection.transport, Transport::Web);
        assert_eq!(ctx.pinned.unwrap().conversation_uuid, "conv-7");
        // Resolution consumes the entry.
        assert_eq!(ctx.services.tracker.pending_count(), 0);
    }

    #[test]
    fn expired_tool_ids_surface_unknown_tool_call() {
        let (mut ctx, _dir) = context_for(json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_gone", "content": "late"}
                ]}
            ]
        }));
        assert!(matches!(
            tool_result(&mut ctx),
            Err(ProxyError::UnknownToolCall(_))
        ));
    }

    #[test]
    fn plain_requests_go_through_the_selector() {
        let (mut ctx, _dir) = context_for(json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": "hello"}]
        }));
        let mut account = Account::new("org-oauth");
        account.capabilities = vec![Capability::Chat, Capability::ClaudePro];
        account.oauth = Some(OAuthTokens {
            access_token: "at".to_string(),
            refresh_token: Some("rt".to_string()),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            scopes: vec![],
            invalid: false,
        });
        ctx.services.store.create(account).unwrap();

        tool_result(&mut ctx).unwrap();
        let selection = ctx.selection.unwrap();
        assert_eq!(selection.account_id, "org-oauth");
        assert_eq!(selection.transport, Transport::OAuth);
    }
}
