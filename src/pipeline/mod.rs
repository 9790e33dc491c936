// Pipeline engine: an ordered chain of named stages over a shared
// per-request context

use crate::account::AccountStore;
use crate::api::models::{MessageResponse, MessagesRequest, StopReason, Usage};
use crate::auth::OAuthAuthenticator;
use crate::config::Settings;
use crate::error::Result;
use crate::http::HttpTransport;
use crate::selector::{AccountSelector, Selection};
use crate::tokens::StreamingCounter;
use crate::tools::{PendingToolCall, ToolCallTracker};
use crate::web::{SessionHandle, WebSessionManager};
use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub mod claude_api;
pub mod claude_web;
pub mod events;
pub mod post;
pub mod pre;
pub mod terminal;

pub use events::StreamEvent;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send + Sync>>;
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + Sync>>;

/// Process-wide services, constructed at startup and handed to every
/// pipeline through its context.
pub struct Services {
    pub settings: Settings,
    pub store: Arc<AccountStore>,
    pub oauth: Arc<OAuthAuthenticator>,
    pub sessions: Arc<WebSessionManager>,
    pub tracker: Arc<ToolCallTracker>,
    pub selector: Arc<AccountSelector>,
    pub http: Arc<HttpTransport>,
}

/// Upstream wire format feeding the event-parsing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Typed SSE from the official messages API.
    ApiSse,
    /// The web interface's completion stream.
    WebSse,
}

/// What the terminal stage produced for the client.
pub enum ClientResponse {
    Message(MessageResponse),
    Stream(EventStream),
}

/// Response text and blocks accumulated by the message-collector
/// stage, shared with the non-streaming terminal.
#[derive(Debug, Default)]
pub struct Collected {
    pub id: Option<String>,
    pub model: Option<String>,
    pub blocks: Vec<crate::api::models::ContentBlock>,
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

pub struct PipelineContext {
    pub services: Arc<Services>,
    pub request: MessagesRequest,
    /// Client-supplied anthropic-beta header, passed through to the
    /// OAuth transport.
    pub client_beta: Option<String>,
    /// Prompt-cache affinity key; doubles as the web conversation key.
    pub fingerprint: String,
    pub selection: Option<Selection>,
    /// Set by the tool-result stage when a synthetic id pins this
    /// request to the conversation that emitted it.
    pub pinned: Option<PendingToolCall>,
    pub session: Option<Arc<SessionHandle>>,
    pub wire: Option<WireFormat>,
    pub raw: Option<ByteStream>,
    pub events: Option<EventStream>,
    pub collected: Arc<Mutex<Collected>>,
    pub output_counter: Arc<Mutex<StreamingCounter>>,
    pub input_tokens: u64,
    pub cancelled: Arc<AtomicBool>,
    pub response: Option<ClientResponse>,
}

impl PipelineContext {
    pub fn new(
        services: Arc<Services>,
        request: MessagesRequest,
        client_beta: Option<String>,
    ) -> Self {
        let fingerprint = crate::selector::fingerprint(&request);
        Self {
            services,
            request,
            client_beta,
            fingerprint,
            selection: None,
            pinned: None,
            session: None,
            wire: None,
            raw: None,
            events: None,
            collected: Arc::new(Mutex::new(Collected::default())),
            output_counter: Arc::new(Mutex::new(StreamingCounter::new())),
            input_tokens: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
            response: None,
        }
    }

    /// Take the current event stream for wrapping by a post stage.
    pub fn take_events(&mut self) -> Option<EventStream> {
        self.events.take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    TestMessage,
    ToolResult,
    ClaudeApi,
    ClaudeWeb,
    EventParsing,
    ModelInjector,
    StopSequences,
    ToolCallEvent,
    MessageCollector,
    TokenCounter,
    StreamingResponse,
    NonStreamingResponse,
}

impl Stage {
    pub async fn run(self, ctx: &mut PipelineContext) -> Result<()> {
        match self {
            Stage::TestMessage => pre::test_message(ctx),
            Stage::ToolResult => pre::tool_result(ctx),
            Stage::ClaudeApi => claude_api::dispatch(ctx).await,
            Stage::ClaudeWeb => claude_web::dispatch(ctx).await,
            Stage::EventParsing => events::parse_stage(ctx),
            Stage::ModelInjector => events::model_injector(ctx),
            Stage::StopSequences => post::stop_sequences(ctx),
            Stage::ToolCallEvent => post::tool_call_event(ctx),
            Stage::MessageCollector => post::message_collector(ctx),
            Stage::TokenCounter => post::token_counter(ctx),
            Stage::StreamingResponse => terminal::streaming(ctx),
            Stage::NonStreamingResponse => terminal::non_streaming(ctx).await,
        }
    }
}

/// The fixed stage order. Defined by construction; there is no
/// discovery or plugin mechanism.
pub fn standard_stages() -> [Stage; 12] {
    [
        Stage::TestMessage,
        Stage::ToolResult,
        Stage::ClaudeApi,
        Stage::ClaudeWeb,
        Stage::EventParsing,
        Stage::ModelInjector,
        Stage::StopSequences,
        Stage::ToolCallEvent,
        Stage::MessageCollector,
        Stage::TokenCounter,
        Stage::StreamingResponse,
        Stage::NonStreamingResponse,
    ]
}

/// Run the chain to completion. A stage that sets the response short-
/// circuits the rest of the chain.
pub async fn run(ctx: &mut PipelineContext) -> Result<()> {
    for stage in standard_stages() {
        if ctx.response.is_some() {
            break;
        }
        stage.run(ctx).await?;
    }
    Ok(())
}
