// Post-processing stages 7-10: stop sequences, web tool-call
// synthesis, message collection, token accounting

use super::events::{Delta, MessageDeltaBody, StreamEvent};
use super::{PipelineContext, WireFormat};
use crate::api::models::{ContentBlock, StopReason, Usage};
use crate::error::Result;
use crate::tokens::{self, StopSequenceWatcher};
use crate::tools::ToolCallTracker;
use crate::web::transcript::{TOOL_FENCE_CLOSE, TOOL_FENCE_OPEN};
use async_stream::stream;
use futures::StreamExt;
use std::sync::Arc;

/// Stage 7: truncate the stream at the first configured stop
/// sequence. Runs before tool-call detection, so stops win over
/// tool_use emission for the same text.
pub fn stop_sequences(ctx: &mut PipelineContext) -> Result<()> {
    let Some(mut inner) = ctx.take_events() else {
        return Ok(());
    };
    let stops = ctx.request.stop_sequences();
    if stops.is_empty() {
        ctx.events = Some(inner);
        return Ok(());
    }

    ctx.events = Some(Box::pin(stream! {
        let mut watcher = StopSequenceWatcher::new(stops);
        let mut open_text_block: Option<usize> = None;
        while let Some(item) = inner.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            match event {
                StreamEvent::ContentBlockStart {
                    index,
                    content_block: content_block @ ContentBlock::Text { .. },
                } => {
                    open_text_block = Some(index);
                    yield Ok(StreamEvent::ContentBlockStart { index, content_block });
                }
                StreamEvent::ContentBlockDelta {
                    index,
                    delta: Delta::TextDelta { text },
                } => {
                    let fed = watcher.feed(&text);
                    if !fed.emit.is_empty() {
                        yield Ok(StreamEvent::ContentBlockDelta {
                            index,
                            delta: Delta::TextDelta { text: fed.emit },
                        });
                    }
                    if let Some(stop) = fed.stop {
                        if let Some(open) = open_text_block.take() {
                            yield Ok(StreamEvent::ContentBlockStop { index: open });
                        }
                        yield Ok(StreamEvent::MessageDelta {
                            delta: MessageDeltaBody {
                                stop_reason: Some(StopReason::StopSequence),
                                stop_sequence: Some(stop.sequence),
                            },
                            usage: Usage::default(),
                        });
                        yield Ok(StreamEvent::MessageStop);
                        // Dropping the inner stream cancels the
                        // upstream read.
                        return;
                    }
                }
                StreamEvent::ContentBlockStop { index } if open_text_block == Some(index) => {
                    let rest = watcher.flush();
                    if !rest.is_empty() {
                        yield Ok(StreamEvent::ContentBlockDelta {
                            index,
                            delta: Delta::TextDelta { text: rest },
                        });
                    }
                    open_text_block = None;
                    yield Ok(StreamEvent::ContentBlockStop { index });
                }
                other => yield Ok(other),
            }
        }
    }));
    Ok(())
}

/// Incremental scanner for the fenced tool-call convention in the web
/// transport's text stream. Text that could still begin a fence
/// marker is withheld until decided.
#[derive(Debug, Default)]
struct FenceDetector {
    held: String,
    fence_body: Option<String>,
}

#[derive(Debug, Default, PartialEq)]
struct FenceFeed {
    emit: String,
    completed: Option<String>,
}

impl FenceDetector {
    fn feed(&mut self, delta: &str) -> FenceFeed {
        if let Some(body) = self.fence_body.as_mut() {
            body.push_str(delta);
            return self.try_close();
        }

        let mut buf = std::mem::take(&mut self.held);
        buf.push_str(delta);

        if let Some(index) = buf.find(TOOL_FENCE_OPEN) {
            let emit = buf[..index].to_string();
            let rest = buf[index + TOOL_FENCE_OPEN.len()..].to_string();
            self.fence_body = Some(rest);
            let mut feed = self.try_close();
            feed.emit = emit;
            return feed;
        }

        let hold = longest_suffix_prefix(&buf, TOOL_FENCE_OPEN);
        let cut = buf.len() - hold;
        let emit = buf[..cut].to_string();
        self.held = buf[cut..].to_string();
        FenceFeed {
            emit,
            completed: None,
        }
    }

    fn try_close(&mut self) -> FenceFeed {
        let Some(body) = self.fence_body.as_ref() else {
            return FenceFeed::default();
        };
        let close = format!("\n{}", TOOL_FENCE_CLOSE);
        if let Some(index) = body.find(&close) {
            let completed = body[..index].trim().to_string();
            self.fence_body = None;
            return FenceFeed {
                emit: String::new(),
                completed: Some(completed),
            };
        }
        FenceFeed::default()
    }

    fn flush(&mut self) -> String {
        // An unterminated fence flushes back as literal text.
        if let Some(body) = self.fence_body.take() {
            return format!("{}{}", TOOL_FENCE_OPEN, body);
        }
        std::mem::take(&mut self.held)
    }
}

fn longest_suffix_prefix(buf: &str, marker: &str) -> usize {
    let limit = buf.len().min(marker.len() - 1);
    for len in (1..=limit).rev() {
        let start = buf.len() - len;
        if !buf.is_char_boundary(start) {
            continue;
        }
        if marker.as_bytes().starts_with(buf[start..].as_bytes()) {
            return len;
        }
    }
    0
}

/// Stage 8: recognize the fenced calling convention in web-mode text,
/// synthesize tool_use block events, and register the synthetic id.
pub fn tool_call_event(ctx: &mut PipelineContext) -> Result<()> {
    if ctx.wire != Some(WireFormat::WebSse) {
        return Ok(());
    }
    let Some(mut inner) = ctx.take_events() else {
        return Ok(());
    };
    if ctx.request.tools.as_ref().map_or(true, |t| t.is_empty()) {
        ctx.events = Some(inner);
        return Ok(());
    }

    let tracker = Arc::clone(&ctx.services.tracker);
    let session = ctx.session.clone();
    let account_id = ctx
        .selection
        .as_ref()
        .map(|s| s.account_id.clone())
        .unwrap_or_default();
    let conversation_uuid = ctx
        .session
        .as_ref()
        .map(|s| s.conversation_uuid.clone())
        .unwrap_or_default();

    ctx.events = Some(Box::pin(stream! {
        let mut detector = FenceDetector::default();
        let mut open_text_block: Option<usize> = None;
        while let Some(item) = inner.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            match event {
                StreamEvent::ContentBlockStart {
                    index,
                    content_block: content_block @ ContentBlock::Text { .. },
                } => {
                    open_text_block = Some(index);
                    yield Ok(StreamEvent::ContentBlockStart { index, content_block });
                }
                StreamEvent::ContentBlockDelta {
                    index,
                    delta: Delta::TextDelta { text },
                } => {
                    let fed = detector.feed(&text);
                    if !fed.emit.is_empty() {
                        yield Ok(StreamEvent::ContentBlockDelta {
                            index,
                            delta: Delta::TextDelta { text: fed.emit },
                        });
                    }
                    if let Some(body) = fed.completed {
                        match parse_tool_call(&body) {
                            Some((name, input)) => {
                                let id = ToolCallTracker::new_id();
                                // The id must be resolvable before the
                                // client ever sees it.
                                tracker.register(&id, &account_id, &conversation_uuid);
                                if let Some(session) = &session {
                                    session.keep_for_tool_result();
                                }
                                let tool_index = open_text_block.map_or(1, |i| i + 1);
                                if let Some(open) = open_text_block.take() {
                                    yield Ok(StreamEvent::ContentBlockStop { index: open });
                                }
                                yield Ok(StreamEvent::ContentBlockStart {
                                    index: tool_index,
                                    content_block: ContentBlock::ToolUse {
                                        id: id.clone(),
                                        name,
                                        input: serde_json::json!({}),
                                    },
                                });
                                yield Ok(StreamEvent::ContentBlockDelta {
                                    index: tool_index,
                                    delta: Delta::InputJsonDelta {
                                        partial_json: input.to_string(),
                                    },
                                });
                                yield Ok(StreamEvent::ContentBlockStop { index: tool_index });
                                yield Ok(StreamEvent::MessageDelta {
                                    delta: MessageDeltaBody {
                                        stop_reason: Some(StopReason::ToolUse),
                                        stop_sequence: None,
                                    },
                                    usage: Usage::default(),
                                });
                                yield Ok(StreamEvent::MessageStop);
                                return;
                            }
                            None => {
                                // Malformed fences degrade to text.
                                yield Ok(StreamEvent::ContentBlockDelta {
                                    index,
                                    delta: Delta::TextDelta {
                                        text: format!("{}\n{}\n{}", TOOL_FENCE_OPEN, body, TOOL_FENCE_CLOSE),
                                    },
                                });
                            }
                        }
                    }
                }
                StreamEvent::ContentBlockStop { index } if open_text_block == Some(index) => {
                    let rest = detector.flush();
                    if !rest.is_empty() {
                        yield Ok(StreamEvent::ContentBlockDelta {
                            index,
                            delta: Delta::TextDelta { text: rest },
                        });
                    }
                    open_text_block = None;
                    yield Ok(StreamEvent::ContentBlockStop { index });
                }
                other => yield Ok(other),
            }
        }
    }));
    Ok(())
}

fn parse_tool_call(body: &str) -> Option<(String, serde_json::Value)> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let name = value.get("name")?.as_str()?.to_string();
    let input = value.get("input").cloned().unwrap_or(serde_json::json!({}));
    Some((name, input))
}

/// Stage 9: accumulate the full response for the non-streaming
/// terminal, logging, and anything else that wants the whole message.
pub fn message_collector(ctx: &mut PipelineContext) -> Result<()> {
    let Some(mut inner) = ctx.take_events() else {
        return Ok(());
    };
    let collected = Arc::clone(&ctx.collected);

    enum Partial {
        Text(String),
        Thinking { thinking: String, signature: Option<String> },
        Tool { id: String, name: String, json: String },
    }

    ctx.events = Some(Box::pin(stream! {
        let mut current: Option<Partial> = None;
        while let Some(item) = inner.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            match &event {
                StreamEvent::MessageStart { message } => {
                    let mut state = collected.lock();
                    state.id = Some(message.id.clone());
                    state.model = Some(message.model.clone());
                    if message.usage.input_tokens > 0 {
                        state.usage.input_tokens = message.usage.input_tokens;
                    }
                }
                StreamEvent::ContentBlockStart { content_block, .. } => {
                    current = match content_block {
                        ContentBlock::Text { text, .. } => Some(Partial::Text(text.clone())),
                        ContentBlock::Thinking { thinking, signature } => {
                            Some(Partial::Thinking {
                                thinking: thinking.clone(),
                                signature: signature.clone(),
                            })
                        }
                        ContentBlock::ToolUse { id, name, .. } => Some(Partial::Tool {
                            id: id.clone(),
                            name: name.clone(),
                            json: String::new(),
                        }),
                        other => {
                            // Blocks without delta accumulation are
                            // recorded whole at start.
                            collected.lock().blocks.push(other.clone());
                            None
                        }
                    };
                }
                StreamEvent::ContentBlockDelta { delta, .. } => match (&mut current, delta) {
                    (Some(Partial::Text(text)), Delta::TextDelta { text: t }) => {
                        text.push_str(t);
                    }
                    (Some(Partial::Thinking { thinking, .. }), Delta::ThinkingDelta { thinking: t }) => {
                        thinking.push_str(t);
                    }
                    (Some(Partial::Thinking { signature, .. }), Delta::SignatureDelta { signature: s }) => {
                        *signature = Some(signature.take().unwrap_or_default() + s);
                    }
                    (Some(Partial::Tool { json, .. }), Delta::InputJsonDelta { partial_json }) => {
                        json.push_str(partial_json);
                    }
                    _ => {}
                },
                StreamEvent::ContentBlockStop { .. } => {
                    if let Some(partial) = current.take() {
                        let block = match partial {
                            Partial::Text(text) => ContentBlock::text(text),
                            Partial::Thinking { thinking, signature } => ContentBlock::Thinking {
                                thinking,
                                signature,
                            },
                            Partial::Tool { id, name, json } => ContentBlock::ToolUse {
                                id,
                                name,
                                input: serde_json::from_str(&json)
                                    .unwrap_or(serde_json::json!({})),
                            },
                        };
                        collected.lock().blocks.push(block);
                    }
                }
                StreamEvent::MessageDelta { delta, usage } => {
                    let mut state = collected.lock();
                    if delta.stop_reason.is_some() {
                        state.stop_reason = delta.stop_reason;
                    }
                    if delta.stop_sequence.is_some() {
                        state.stop_sequence = delta.stop_sequence.clone();
                    }
                    if usage.input_tokens > 0 {
                        state.usage.input_tokens = usage.input_tokens;
                    }
                    if usage.output_tokens > 0 {
                        state.usage.output_tokens = usage.output_tokens;
                    }
                }
                _ => {}
            }
            yield Ok(event);
        }
    }));
    Ok(())
}

/// Stage 10: input tokens from the request, output tokens from the
/// delta stream; both attached to the terminating message_delta when
/// the upstream did not provide its own accounting.
pub fn token_counter(ctx: &mut PipelineContext) -> Result<()> {
    ctx.input_tokens = tokens::count_request(&ctx.request)?;
    let Some(mut inner) = ctx.take_events() else {
        return Ok(());
    };
    let input_tokens = ctx.input_tokens;
    let counter = Arc::clone(&ctx.output_counter);

    ctx.events = Some(Box::pin(stream! {
        while let Some(item) = inner.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            match event {
                StreamEvent::MessageStart { mut message } => {
                    if message.usage.input_tokens == 0 {
                        message.usage.input_tokens = input_tokens;
                    }
                    yield Ok(StreamEvent::MessageStart { message });
                }
                StreamEvent::ContentBlockDelta { index, delta } => {
                    {
                        let mut counter = counter.lock();
                        match &delta {
                            Delta::TextDelta { text } => {
                                counter.feed(text);
                            }
                            Delta::InputJsonDelta { partial_json } => {
                                counter.feed(partial_json);
                            }
                            Delta::ThinkingDelta { thinking } => {
                                counter.feed(thinking);
                            }
                            Delta::SignatureDelta { .. } => {}
                        }
                    }
                    yield Ok(StreamEvent::ContentBlockDelta { index, delta });
                }
                StreamEvent::MessageDelta { delta, mut usage } => {
                    if usage.input_tokens == 0 {
                        usage.input_tokens = input_tokens;
                    }
                    if usage.output_tokens == 0 {
                        usage.output_tokens = counter.lock().total();
                    }
                    yield Ok(StreamEvent::MessageDelta { delta, usage });
                }
                other => yield Ok(other),
            }
        }
    }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::context_for;
    use futures::stream;
    use serde_json::json;

    fn event_stream(events: Vec<StreamEvent>) -> crate::pipeline::EventStream {
        Box::pin(stream::iter(events.into_iter().map(Ok)))
    }

    fn text_block_stream(deltas: &[&str]) -> Vec<StreamEvent> {
        let mut events = vec![
            StreamEvent::MessageStart {
                message: crate::api::models::MessageResponse::empty(
                    "claude-3-5-sonnet-20241022",
                ),
            },
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlock::text(""),
            },
        ];
        for delta in deltas {
            events.push(StreamEvent::ContentBlockDelta {
                index: 0,
                delta: Delta::TextDelta {
                    text: delta.to_string(),
                },
            });
        }
        events.push(StreamEvent::ContentBlockStop { index: 0 });
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(StopReason::EndTurn),
                stop_sequence: None,
            },
            usage: Usage::default(),
        });
        events.push(StreamEvent::MessageStop);
        events
    }

    async fn drain(ctx: &mut crate::pipeline::PipelineContext) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let mut stream = ctx.take_events().unwrap();
        while let Some(item) = stream.next().await {
            events.push(item.unwrap());
        }
        events
    }

    fn emitted_text(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockDelta {
                    delta: Delta::TextDelta { text },
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn stop_sequence_truncates_across_delta_boundaries() {
        let (mut ctx, _dir) = context_for(json!({
            "model": "claude-3-5-sonnet-20241022",
            "stop_sequences": ["world"],
            "messages": [{"role": "user", "content": "hi"}]
        }));
        ctx.events = Some(event_stream(text_block_stream(&["Hello, wo", "rld! Good"])));
        stop_sequences(&mut ctx).unwrap();
        let events = drain(&mut ctx).await;

        assert_eq!(emitted_text(&events), "Hello, ");
        let delta = events.iter().find_map(|e| match e {
            StreamEvent::MessageDelta { delta, .. } => Some(delta.clone()),
            _ => None,
        });
        let delta = delta.unwrap();
        assert_eq!(delta.stop_reason, Some(StopReason::StopSequence));
        assert_eq!(delta.stop_sequence.as_deref(), Some("world"));
        assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));

        // The truncated block still closes exactly once.
        let stops = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ContentBlockStop { .. }))
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn stop_equal_to_entire_response_truncates_to_empty() {
        let (mut ctx, _dir) = context_for(json!({
            "model": "claude-3-5-sonnet-20241022",
            "stop_sequences": ["whole thing"],
            "messages": [{"role": "user", "content": "hi"}]
        }));
        ctx.events = Some(event_stream(text_block_stream(&["whole thing"])));
        stop_sequences(&mut ctx).unwrap();
        let events = drain(&mut ctx).await;
        assert_eq!(emitted_text(&events), "");
        assert_eq!(
            events
                .iter()
                .find_map(|e| match e {
                    StreamEvent::MessageDelta { delta, .. } => delta.stop_reason,
                    _ => None,
                }),
            Some(StopReason::StopSequence)
        );
    }

    #[tokio::test]
    async fn unmatched_stop_flushes_held_text() {
        let (mut ctx, _dir) = context_for(json!({
            "model": "claude-3-5-sonnet-20241022",
            "stop_sequences": ["zebra"],
            "messages": [{"role": "user", "content": "hi"}]
        }));
        ctx.events = Some(event_stream(text_block_stream(&["ends with ze"])));
        stop_sequences(&mut ctx).unwrap();
        let events = drain(&mut ctx).await;
        assert_eq!(emitted_text(&events), "ends with ze");
        assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));
    }

    #[tokio::test]
    async fn fenced_tool_call_becomes_a_tool_use_block() {
        let (mut ctx, _dir) = context_for(json!({
            "model": "claude-3-5-sonnet-20241022",
            "tools": [{"name": "get_weather", "input_schema": {}}],
            "messages": [{"role": "user", "content": "weather in Paris?"}]
        }));
        ctx.wire = Some(WireFormat::WebSse);
        ctx.selection = Some(crate::selector::Selection {
            account_id: "org-web".to_string(),
            transport: crate::selector::Transport::Web,
        });
        // The fence arrives split across deltas.
        ctx.events = Some(event_stream(text_block_stream(&[
            "Checking the weather.\n``",
            "`tool_use\n{\"name\":\"get_weather\",",
            "\"input\":{\"city\":\"Paris\"}}\n```\n",
        ])));
        tool_call_event(&mut ctx).unwrap();
        let events = drain(&mut ctx).await;

        assert_eq!(emitted_text(&events), "Checking the weather.\n");
        let (id, name) = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::ContentBlockStart {
                    content_block: ContentBlock::ToolUse { id, name, .. },
                    ..
                } => Some((id.clone(), name.clone())),
                _ => None,
            })
            .expect("tool_use block emitted");
        assert!(id.starts_with("toolu_"));
        assert_eq!(name, "get_weather");

        let input_json = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::ContentBlockDelta {
                    delta: Delta::InputJsonDelta { partial_json },
                    ..
                } => Some(partial_json.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&input_json).unwrap(),
            json!({"city": "Paris"})
        );

        assert_eq!(
            events.iter().find_map(|e| match e {
                StreamEvent::MessageDelta { delta, .. } => delta.stop_reason,
                _ => None,
            }),
            Some(StopReason::ToolUse)
        );

        // The synthetic id resolves in the tracker.
        assert!(ctx.services.tracker.resolve(&id).is_ok());
    }

    #[tokio::test]
    async fn plain_web_text_passes_untouched() {
        let (mut ctx, _dir) = context_for(json!({
            "model": "claude-3-5-sonnet-20241022",
            "tools": [{"name": "get_weather", "input_schema": {}}],
            "messages": [{"role": "user", "content": "hello"}]
        }));
        ctx.wire = Some(WireFormat::WebSse);
        ctx.events = Some(event_stream(text_block_stream(&["Just words, ", "no tools."])));
        tool_call_event(&mut ctx).unwrap();
        let events = drain(&mut ctx).await;
        assert_eq!(emitted_text(&events), "Just words, no tools.");
        assert_eq!(ctx.services.tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn collector_accumulates_blocks_and_stop_state() {
        let (mut ctx, _dir) = context_for(json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        ctx.events = Some(event_stream(text_block_stream(&["Hello ", "there"])));
        message_collector(&mut ctx).unwrap();
        let passed = drain(&mut ctx).await;
        assert_eq!(passed.len(), 6);

        let collected = ctx.collected.lock();
        assert_eq!(collected.blocks.len(), 1);
        match &collected.blocks[0] {
            ContentBlock::Text { text, .. } => assert_eq!(text, "Hello there"),
            other => panic!("unexpected block {:?}", other),
        }
        assert_eq!(collected.stop_reason, Some(StopReason::EndTurn));
    }

    #[tokio::test]
    async fn token_counter_fills_missing_usage() {
        let (mut ctx, _dir) = context_for(json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": "count my tokens please"}]
        }));
        ctx.events = Some(event_stream(text_block_stream(&["four char chunks here"])));
        token_counter(&mut ctx).unwrap();
        let events = drain(&mut ctx).await;

        let usage = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::MessageDelta { usage, .. } => Some(usage.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(usage.output_tokens, tokens::count_text("four char chunks here"));
        assert_eq!(usage.input_tokens, ctx.input_tokens);
        assert!(usage.input_tokens > 0);

        let start_usage = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::MessageStart { message } => Some(message.usage.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(start_usage.input_tokens, ctx.input_tokens);
    }

    #[test]
    fn fence_detector_holds_possible_markers() {
        let mut detector = FenceDetector::default();
        let fed = detector.feed("text ``");
        assert_eq!(fed.emit, "text ");
        assert_eq!(fed.completed, None);
        let fed = detector.feed("` not a fence");
        // Three backticks alone no longer match once followed by text
        // that diverges from the marker.
        assert_eq!(fed.emit, "``` not a fence");
        assert_eq!(detector.flush(), "");
    }

    #[test]
    fn fence_detector_completes_split_fences() {
        let mut detector = FenceDetector::default();
        assert_eq!(detector.feed("a``").emit, "a");
        assert_eq!(detector.feed("`tool_use\n{\"name\"").completed, None);
        let fed = detector.feed(":\"f\"}\n```");
        assert_eq!(fed.completed.as_deref(), Some("{\"name\":\"f\"}"));
    }
}
