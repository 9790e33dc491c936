// Normalized event type, wire parsing (stage 5), model injection
// (stage 6)

use super::{ByteStream, EventStream, PipelineContext, WireFormat};
use crate::api::models::{
    ContentBlock, MessageResponse, StopReason, Usage,
};
use crate::error::Result;
use async_stream::stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// The normalized internal event stream. The serialized shape matches
/// the client-facing SSE wire exactly, so the terminal stage only
/// names and serializes events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessageResponse,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: Delta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Usage,
    },
    MessageStop,
    Ping,
    Error {
        error: ErrorBody,
    },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Ping => "ping",
            StreamEvent::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental server-sent-events framing over byte chunks. Frames
/// may split anywhere, including inside a UTF-8 sequence for the
/// lossy path upstream never exercises.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut frames = Vec::new();
        loop {
            let Some(boundary) = find_boundary(&self.buffer) else {
                break;
            };
            let raw: String = self.buffer.drain(..boundary.end).collect();
            let block = &raw[..boundary.start];
            if let Some(frame) = parse_frame(block) {
                frames.push(frame);
            }
        }
        frames
    }
}

struct Boundary {
    start: usize,
    end: usize,
}

fn find_boundary(buffer: &str) -> Option<Boundary> {
    let lf = buffer.find("\n\n").map(|i| Boundary { start: i, end: i + 2 });
    let crlf = buffer
        .find("\r\n\r\n")
        .map(|i| Boundary { start: i, end: i + 4 });
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.start <= b.start { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn parse_frame(block: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut data_lines: Vec<&str> = Vec::new();
    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("event:") {
            frame.event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // Comment lines (":keepalive") and unknown fields are dropped.
    }
    if frame.event.is_none() && data_lines.is_empty() {
        return None;
    }
    frame.data = data_lines.join("\n");
    Some(frame)
}

/// Stage 5: turn the raw upstream bytes into the normalized stream.
pub fn parse_stage(ctx: &mut PipelineContext) -> Result<()> {
    let (Some(raw), Some(wire)) = (ctx.raw.take(), ctx.wire) else {
        return Ok(());
    };
    ctx.events = Some(match wire {
        WireFormat::ApiSse => parse_api_events(raw),
        WireFormat::WebSse => parse_web_events(raw, ctx.request.model.clone()),
    });
    Ok(())
}

fn parse_api_events(mut raw: ByteStream) -> EventStream {
    Box::pin(stream! {
        let mut parser = SseParser::default();
        while let Some(chunk) = raw.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            for frame in parser.feed(&bytes) {
                if let Some(event) = decode_api_frame(&frame) {
                    let is_stop = matches!(event, StreamEvent::MessageStop);
                    yield Ok(event);
                    if is_stop {
                        return;
                    }
                }
            }
        }
    })
}

fn decode_api_frame(frame: &SseFrame) -> Option<StreamEvent> {
    if frame.data.is_empty() {
        return match frame.event.as_deref() {
            Some("ping") => Some(StreamEvent::Ping),
            _ => None,
        };
    }
    let value: Value = serde_json::from_str(&frame.data).ok()?;
    match serde_json::from_value::<StreamEvent>(value) {
        Ok(event) => Some(event),
        Err(e) => {
            // The upstream wire grows new event and delta kinds; they
            // are skipped rather than failing the stream.
            tracing::debug!("skipping unrecognized upstream event: {}", e);
            None
        }
    }
}

/// The web transport's stream has no block structure of its own; a
/// single text block is synthesized around its completion chunks.
fn parse_web_events(mut raw: ByteStream, model: String) -> EventStream {
    Box::pin(stream! {
        let mut parser = SseParser::default();
        let mut started = false;
        loop {
            let Some(chunk) = raw.next().await else { break };
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            for frame in parser.feed(&bytes) {
                match decode_web_frame(&frame) {
                    WebFrame::Text(text) => {
                        if text.is_empty() {
                            continue;
                        }
                        if !started {
                            started = true;
                            yield Ok(StreamEvent::MessageStart {
                                message: MessageResponse::empty(model.clone()),
                            });
                            yield Ok(StreamEvent::ContentBlockStart {
                                index: 0,
                                content_block: ContentBlock::text(""),
                            });
                        }
                        yield Ok(StreamEvent::ContentBlockDelta {
                            index: 0,
                            delta: Delta::TextDelta { text },
                        });
                    }
                    WebFrame::Error(error) => {
                        yield Ok(StreamEvent::Error { error });
                        return;
                    }
                    WebFrame::Ignored => {}
                }
            }
        }
        // Close out the synthesized block even for empty completions,
        // so every stream carries the full event skeleton.
        if !started {
            yield Ok(StreamEvent::MessageStart {
                message: MessageResponse::empty(model.clone()),
            });
            yield Ok(StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlock::text(""),
            });
        }
        yield Ok(StreamEvent::ContentBlockStop { index: 0 });
        yield Ok(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(StopReason::EndTurn),
                stop_sequence: None,
            },
            usage: Usage::default(),
        });
        yield Ok(StreamEvent::MessageStop);
    })
}

enum WebFrame {
    Text(String),
    Error(ErrorBody),
    Ignored,
}

fn decode_web_frame(frame: &SseFrame) -> WebFrame {
    if frame.data.is_empty() || frame.data == "[DONE]" {
        return WebFrame::Ignored;
    }
    let Ok(value) = serde_json::from_str::<Value>(&frame.data) else {
        return WebFrame::Ignored;
    };
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("completion");
    match kind {
        "completion" => {
            let text = value
                .get("completion")
                .and_then(|c| c.as_str())
                .unwrap_or("")
                .to_string();
            WebFrame::Text(text)
        }
        "error" => {
            let error = value.get("error").cloned().unwrap_or(value.clone());
            WebFrame::Error(ErrorBody {
                kind: error
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("upstream_error")
                    .to_string(),
                message: error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("upstream error")
                    .to_string(),
            })
        }
        _ => WebFrame::Ignored,
    }
}

/// Stage 6: the response always reports the model the client asked
/// for; the web transport in particular reports its own names.
pub fn model_injector(ctx: &mut PipelineContext) -> Result<()> {
    let Some(mut inner) = ctx.take_events() else {
        return Ok(());
    };
    let model = ctx.request.model.clone();
    ctx.events = Some(Box::pin(stream! {
        while let Some(item) = inner.next().await {
            match item {
                Ok(StreamEvent::MessageStart { mut message }) => {
                    message.model = model.clone();
                    yield Ok(StreamEvent::MessageStart { message });
                }
                other => yield other,
            }
        }
    }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn bytes_stream(chunks: Vec<&'static str>) -> ByteStream {
        Box::pin(stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(bytes::Bytes::from_static(c.as_bytes()))),
        ))
    }

    async fn collect(events: EventStream) -> Vec<StreamEvent> {
        events
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|e| e.unwrap())
            .collect()
    }

    #[test]
    fn frames_reassemble_across_chunk_splits() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"event: message_st").is_empty());
        let frames = parser.feed(b"art\ndata: {\"a\":1}\n\nevent: ping\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert_eq!(frames[1].event.as_deref(), Some("ping"));
    }

    #[test]
    fn crlf_frames_parse_too() {
        let mut parser = SseParser::default();
        let frames = parser.feed(b"data: {\"x\":1}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"x\":1}");
    }

    #[test]
    fn comment_lines_are_dropped() {
        let mut parser = SseParser::default();
        let frames = parser.feed(b": keepalive\n\ndata: {}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{}");
    }

    #[tokio::test]
    async fn api_wire_round_trips_typed_events() {
        let wire = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"content\":[],\"model\":\"claude-3-5-sonnet-20241022\",\"stop_reason\":null,\"stop_sequence\":null,\"usage\":{\"input_tokens\":10,\"output_tokens\":0}}}\n\n",
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n",
            "event: content_block_stop\n",
            "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\",\"stop_sequence\":null},\"usage\":{\"output_tokens\":2}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let events = collect(parse_api_events(bytes_stream(vec![wire]))).await;
        assert_eq!(events.len(), 6);
        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert!(matches!(
            &events[2],
            StreamEvent::ContentBlockDelta {
                delta: Delta::TextDelta { text },
                ..
            } if text == "Hello"
        ));
        assert!(matches!(events[5], StreamEvent::MessageStop));
    }

    #[tokio::test]
    async fn unknown_api_events_are_skipped() {
        let wire = concat!(
            "event: shiny_new_thing\n",
            "data: {\"type\":\"shiny_new_thing\",\"payload\":42}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let events = collect(parse_api_events(bytes_stream(vec![wire]))).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::MessageStop));
    }

    #[tokio::test]
    async fn web_wire_synthesizes_the_event_skeleton() {
        let wire = concat!(
            "event: completion\n",
            "data: {\"type\":\"completion\",\"completion\":\"Hel\"}\n\n",
            "event: completion\n",
            "data: {\"type\":\"completion\",\"completion\":\"lo\"}\n\n",
        );
        let events = collect(parse_web_events(
            bytes_stream(vec![wire]),
            "claude-3-5-sonnet-20241022".to_string(),
        ))
        .await;

        let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[tokio::test]
    async fn empty_web_completion_still_closes_the_skeleton() {
        let events = collect(parse_web_events(
            bytes_stream(vec![]),
            "claude-3-5-sonnet-20241022".to_string(),
        ))
        .await;
        let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[test]
    fn serialized_events_match_the_client_wire() {
        let event = StreamEvent::ContentBlockDelta {
            index: 0,
            delta: Delta::TextDelta {
                text: "hi".to_string(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": "hi"}
            })
        );
        assert_eq!(event.name(), "content_block_delta");
    }
}
