// Terminal stages 11-12: emit the normalized stream as SSE or drain
// it into a single JSON response

use super::events::{Delta, MessageDeltaBody, StreamEvent};
use super::{ClientResponse, EventStream, PipelineContext};
use crate::api::models::{ContentBlock, MessageResponse, StopReason};
use crate::error::{ProxyError, Result};
use async_stream::stream;
use futures::StreamExt;

/// Stage 11: hand the event stream to the client connection. The
/// session handle rides inside the stream so it is released exactly
/// when the client stops consuming, whether by completion or
/// disconnect.
pub fn streaming(ctx: &mut PipelineContext) -> Result<()> {
    if !ctx.request.stream {
        return Ok(());
    }
    let Some(mut inner) = ctx.take_events() else {
        return Err(ProxyError::Internal(anyhow::anyhow!(
            "streaming terminal reached without an event stream"
        )));
    };
    let session = ctx.session.take();
    ctx.response = Some(ClientResponse::Stream(Box::pin(stream! {
        let _session = session;
        while let Some(item) = inner.next().await {
            let failed = item.is_err();
            yield item;
            if failed {
                return;
            }
        }
    })));
    Ok(())
}

/// Stage 12: drain the stream and assemble the buffered response from
/// the collector's state.
pub async fn non_streaming(ctx: &mut PipelineContext) -> Result<()> {
    if ctx.request.stream {
        return Ok(());
    }
    let Some(mut inner) = ctx.take_events() else {
        return Err(ProxyError::Internal(anyhow::anyhow!(
            "buffered terminal reached without an event stream"
        )));
    };

    while let Some(item) = inner.next().await {
        match item {
            Ok(StreamEvent::Error { error }) => {
                // Nothing has reached the client yet, so upstream
                // errors convert to a plain HTTP error.
                return Err(ProxyError::UpstreamFatal(format!(
                    "{}: {}",
                    error.kind, error.message
                )));
            }
            Ok(_) => {}
            Err(e) => return Err(e),
        }
    }
    drop(inner);
    ctx.session = None;

    let message = assemble_message(ctx);
    ctx.response = Some(ClientResponse::Message(message));
    Ok(())
}

pub(crate) fn assemble_message(ctx: &PipelineContext) -> MessageResponse {
    let collected = ctx.collected.lock();
    // The collector runs inside the token-counter wrapper, so a wire
    // that carries no usage (web mode) leaves zeros here; fill them
    // from the same counters the streamed message_delta gets.
    let mut usage = collected.usage.clone();
    if usage.input_tokens == 0 {
        usage.input_tokens = ctx.input_tokens;
    }
    if usage.output_tokens == 0 {
        usage.output_tokens = ctx.output_counter.lock().total();
    }
    MessageResponse {
        id: collected
            .id
            .clone()
            .unwrap_or_else(crate::api::models::new_message_id),
        message_type: "message".to_string(),
        role: "assistant".to_string(),
        content: collected.blocks.clone(),
        model: collected
            .model
            .clone()
            .unwrap_or_else(|| ctx.request.model.clone()),
        stop_reason: collected.stop_reason.or(Some(StopReason::EndTurn)),
        stop_sequence: collected.stop_sequence.clone(),
        usage,
    }
}

/// Short-circuit responses (probe replies, max_tokens=0) still honor
/// the client's streaming flag by replaying the message as events.
pub fn canned_response(stream_requested: bool, message: MessageResponse) -> ClientResponse {
    if stream_requested {
        ClientResponse::Stream(events_for_message(message))
    } else {
        ClientResponse::Message(message)
    }
}

/// Replay a finished message as the standard event skeleton.
pub fn events_for_message(message: MessageResponse) -> EventStream {
    Box::pin(stream! {
        let mut skeleton = message;
        let blocks = std::mem::take(&mut skeleton.content);
        let stop_reason = skeleton.stop_reason.take();
        let stop_sequence = skeleton.stop_sequence.take();
        let usage = skeleton.usage.clone();
        skeleton.usage.output_tokens = 0;
        yield Ok(StreamEvent::MessageStart { message: skeleton });

        for (index, block) in blocks.into_iter().enumerate() {
            match block {
                ContentBlock::Text { text, .. } => {
                    yield Ok(StreamEvent::ContentBlockStart {
                        index,
                        content_block: ContentBlock::text(""),
                    });
                    if !text.is_empty() {
                        yield Ok(StreamEvent::ContentBlockDelta {
                            index,
                            delta: Delta::TextDelta { text },
                        });
                    }
                    yield Ok(StreamEvent::ContentBlockStop { index });
                }
                ContentBlock::ToolUse { id, name, input } => {
                    yield Ok(StreamEvent::ContentBlockStart {
                        index,
                        content_block: ContentBlock::ToolUse {
                            id,
                            name,
                            input: serde_json::json!({}),
                        },
                    });
                    yield Ok(StreamEvent::ContentBlockDelta {
                        index,
                        delta: Delta::InputJsonDelta {
                            partial_json: input.to_string(),
                        },
                    });
                    yield Ok(StreamEvent::ContentBlockStop { index });
                }
                other => {
                    yield Ok(StreamEvent::ContentBlockStart {
                        index,
                        content_block: other,
                    });
                    yield Ok(StreamEvent::ContentBlockStop { index });
                }
            }
        }

        yield Ok(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason,
                stop_sequence,
            },
            usage,
        });
        yield Ok(StreamEvent::MessageStop);
    })
}
