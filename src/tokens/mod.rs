// Token estimation and streaming stop-sequence tracking

use crate::api::models::{ContentBlock, MessageContent, MessagesRequest, SystemPrompt};
use crate::error::{ProxyError, Result};

/// Fixed per-image cost, matching the upstream accounting ceiling.
pub const IMAGE_TOKEN_COST: u64 = 1568;

/// Model tiers recognized by the proxy. The tier drives both the
/// selector's capability checks and the counter's vocabulary gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Opus,
    Sonnet,
    Haiku,
}

/// Resolve a model id to its tier, or `None` for unknown models.
pub fn model_tier(model: &str) -> Option<ModelTier> {
    let lower = model.to_ascii_lowercase();
    if !lower.starts_with("claude") {
        return None;
    }
    if lower.contains("opus") {
        Some(ModelTier::Opus)
    } else if lower.contains("sonnet") {
        Some(ModelTier::Sonnet)
    } else if lower.contains("haiku") {
        Some(ModelTier::Haiku)
    } else {
        None
    }
}

pub fn ensure_known_model(model: &str) -> Result<ModelTier> {
    model_tier(model)
        .ok_or_else(|| ProxyError::RequestInvalid(format!("unknown model: {}", model)))
}

/// Deterministic text cost: one token per four characters, rounded up.
pub fn count_text(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4)
}

fn count_block(block: &ContentBlock) -> u64 {
    match block {
        ContentBlock::Text { text, .. } => count_text(text),
        ContentBlock::Image { .. } => IMAGE_TOKEN_COST,
        ContentBlock::Thinking { thinking, .. } => count_text(thinking),
        ContentBlock::RedactedThinking { data } => count_text(data),
        ContentBlock::ToolUse { name, input, .. } => {
            count_text(name) + count_text(&input.to_string())
        }
        ContentBlock::ToolResult { content, .. } => {
            count_text(&serde_json::to_string(content).unwrap_or_default())
        }
    }
}

fn count_content(content: &MessageContent) -> u64 {
    match content {
        MessageContent::Text(text) => count_text(text),
        MessageContent::Blocks(blocks) => blocks.iter().map(count_block).sum(),
    }
}

/// Input-token estimate for a full request. Fails on unknown models.
pub fn count_request(request: &MessagesRequest) -> Result<u64> {
    ensure_known_model(&request.model)?;
    let mut total = 0;
    match &request.system {
        Some(SystemPrompt::Text(text)) => total += count_text(text),
        Some(SystemPrompt::Blocks(blocks)) => {
            total += blocks.iter().map(|b| count_text(&b.text)).sum::<u64>();
        }
        None => {}
    }
    for message in &request.messages {
        total += count_content(&message.content) + 3;
    }
    if let Some(tools) = &request.tools {
        for tool in tools {
            total += count_text(&serde_json::to_string(tool).unwrap_or_default());
        }
    }
    Ok(total)
}

/// Running output-token total over streamed text deltas.
#[derive(Debug, Default)]
pub struct StreamingCounter {
    total: u64,
}

impl StreamingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, delta: &str) -> u64 {
        self.total += count_text(delta);
        self.total
    }

    pub fn add(&mut self, tokens: u64) -> u64 {
        self.total += tokens;
        self.total
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopMatch {
    pub sequence: String,
    /// Character offset into the emitted text at which the match begins.
    pub offset: usize,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct FeedResult {
    /// Text safe to emit to the client.
    pub emit: String,
    /// Set on the call that first completes a stop sequence.
    pub stop: Option<StopMatch>,
}

/// Streaming matcher over a watch list of literal stop sequences.
///
/// Deltas are evaluated as one continuous text across block and chunk
/// boundaries. Any trailing text that could still begin a stop
/// sequence is withheld until the next delta decides it; `flush`
/// releases the remainder at end of stream. Once a stop has matched,
/// all further input is swallowed.
#[derive(Debug)]
pub struct StopSequenceWatcher {
    stops: Vec<String>,
    held: String,
    emitted_chars: usize,
    matched: Option<String>,
}

impl StopSequenceWatcher {
    pub fn new(stops: Vec<String>) -> Self {
        Self {
            stops: stops.into_iter().filter(|s| !s.is_empty()).collect(),
            held: String::new(),
            emitted_chars: 0,
            matched: None,
        }
    }

    pub fn is_matched(&self) -> bool {
        self.matched.is_some()
    }

    pub fn feed(&mut self, delta: &str) -> FeedResult {
        if self.matched.is_some() {
            return FeedResult::default();
        }
        if self.stops.is_empty() {
            self.emitted_chars += delta.chars().count();
            return FeedResult {
                emit: delta.to_string(),
                stop: None,
            };
        }

        let mut buf = std::mem::take(&mut self.held);
        buf.push_str(delta);

        // Earliest match across the watch list wins.
        let mut best: Option<(usize, &str)> = None;
        for stop in &self.stops {
            if let Some(index) = buf.find(stop.as_str()) {
                match best {
                    Some((existing, _)) if existing <= index => {}
                    _ => best = Some((index, stop.as_str())),
                }
            }
        }

        if let Some((index, stop)) = best {
            let emit = buf[..index].to_string();
            let offset = self.emitted_chars + emit.chars().count();
            self.emitted_chars = offset;
            self.matched = Some(stop.to_string());
            return FeedResult {
                emit,
                stop: Some(StopMatch {
                    sequence: stop.to_string(),
                    offset,
                }),
            };
        }

        // Withhold the longest suffix that is a prefix of some stop.
        let hold = self.holdback_len(&buf);
        let cut = buf.len() - hold;
        let emit = buf[..cut].to_string();
        self.held = buf[cut..].to_string();
        self.emitted_chars += emit.chars().count();
        FeedResult { emit, stop: None }
    }

    /// Release withheld text once the upstream stream ends without a
    /// match.
    pub fn flush(&mut self) -> String {
        if self.matched.is_some() {
            return String::new();
        }
        let rest = std::mem::take(&mut self.held);
        self.emitted_chars += rest.chars().count();
        rest
    }

    fn holdback_len(&self, buf: &str) -> usize {
        let max_stop = self.stops.iter().map(|s| s.len()).max().unwrap_or(0);
        if max_stop <= 1 {
            return 0;
        }
        let limit = buf.len().min(max_stop - 1);
        for len in (1..=limit).rev() {
            let start = buf.len() - len;
            if !buf.is_char_boundary(start) {
                continue;
            }
            let tail = &buf[start..];
            if self
                .stops
                .iter()
                .any(|stop| stop.len() > len && stop.starts_with(tail))
            {
                return len;
            }
        }
        0
    }
}
