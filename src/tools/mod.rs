// Tool-call tracker: correlates synthesized tool_use ids with the web
// conversation that produced them

use crate::api::models::random_token;
use crate::error::{ProxyError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const TOOL_ID_PREFIX: &str = "toolu_";

#[derive(Debug, Clone)]
pub struct PendingToolCall {
    pub account_id: String,
    pub conversation_uuid: String,
    pub created_at: Instant,
}

struct TrackerState {
    entries: HashMap<String, PendingToolCall>,
    // Registration order is creation order, so the front is always
    // the oldest entry.
    queue: VecDeque<(Instant, String)>,
}

pub struct ToolCallTracker {
    state: Mutex<TrackerState>,
    expiry: Duration,
}

impl ToolCallTracker {
    pub fn new(expiry: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TrackerState {
                entries: HashMap::new(),
                queue: VecDeque::new(),
            }),
            expiry,
        })
    }

    /// Synthesize a fresh client-facing id. Never reused: the random
    /// token space is large and resolved ids are removed.
    pub fn new_id() -> String {
        format!("{}{}", TOOL_ID_PREFIX, random_token(16))
    }

    pub fn is_synthetic(id: &str) -> bool {
        id.starts_with(TOOL_ID_PREFIX)
    }

    pub fn register(&self, id: &str, account_id: &str, conversation_uuid: &str) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.entries.insert(
            id.to_string(),
            PendingToolCall {
                account_id: account_id.to_string(),
                conversation_uuid: conversation_uuid.to_string(),
                created_at: now,
            },
        );
        state.queue.push_back((now, id.to_string()));
        tracing::debug!("registered pending tool call {}", id);
    }

    /// Resolve and remove a pending id. Each id resolves at most once.
    pub fn resolve(&self, id: &str) -> Result<PendingToolCall> {
        let mut state = self.state.lock();
        state
            .entries
            .remove(id)
            .ok_or_else(|| ProxyError::UnknownToolCall(id.to_string()))
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Drop entries older than the expiry window. Returns how many
    /// were collected.
    pub fn sweep_once(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut removed = 0;
        while let Some((created_at, _)) = state.queue.front() {
            if now.duration_since(*created_at) < self.expiry {
                break;
            }
            let (created_at, id) = state.queue.pop_front().expect("front just checked");
            // Only remove if the entry was not resolved and re-registered.
            let stale = state
                .entries
                .get(&id)
                .is_some_and(|entry| entry.created_at == created_at);
            if stale {
                state.entries.remove(&id);
                removed += 1;
                tracing::debug!("expired pending tool call {}", id);
            }
        }
        removed
    }
}

/// Periodic expiry sweep alongside the session sweeper.
pub fn spawn_sweeper(tracker: Arc<ToolCallTracker>, period: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            tracker.sweep_once();
        }
    });
}
