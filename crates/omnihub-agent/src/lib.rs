//! Agent backend clients.
//!
//! Two variants selected per instance: a buffered request/response call and
//! a server-sent-event stream that yields chunks as the agent produces
//! them. Both talk JSON to the instance's configured agent endpoint.

pub mod http;

use std::pin::Pin;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_core::Stream;
use omnihub_schema::MediaRef;
use serde::{Deserialize, Serialize};

pub use http::HttpAgentClient;

/// What the hub sends to an agent for one conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub session_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaRef>,
}

/// Final agent reply in buffered mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentReply {
    pub text: String,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// One event of a streaming reply. `done` closes the stream; a final event
/// may carry both trailing content and the done marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent call timed out after {0} ms")]
    Timeout(u64),
    #[error("agent http error ({status}): {body}")]
    Http { status: u16, body: String },
    #[error("agent protocol error: {0}")]
    Protocol(String),
    #[error("agent transport error: {0}")]
    Transport(String),
    #[error("agent call cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            AgentError::Timeout(timeout.as_millis() as u64)
        } else {
            AgentError::Transport(err.to_string())
        }
    }
}

pub type AgentStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, AgentError>> + Send>>;

#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Buffered variant: one request, one full reply.
    async fn invoke(&self, request: AgentRequest) -> Result<AgentReply, AgentError>;

    /// Streaming variant: a finite, non-restartable sequence of chunks.
    async fn stream(&self, _request: AgentRequest) -> Result<AgentStream, AgentError> {
        Err(AgentError::Protocol(
            "streaming not supported by this client".into(),
        ))
    }
}

// ───────────────────────── Stream metrics ───────────────────────────

/// Per-call metrics for the streaming variant.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamMetrics {
    pub first_token_latency_ms: Option<i64>,
    pub total_streaming_duration_ms: i64,
    pub chunk_count: u32,
    pub total_content_length: usize,
    pub first_to_final_ms: Option<i64>,
    pub success: bool,
}

/// Accumulates stream chunks and their timing profile. The router feeds
/// every event through `push` and calls `finish` once the stream ends.
pub struct StreamCollector {
    started: Instant,
    first_at: Option<Instant>,
    chunk_count: u32,
    content: String,
}

impl StreamCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            first_at: None,
            chunk_count: 0,
            content: String::new(),
        }
    }

    pub fn push(&mut self, event: &StreamEvent) {
        if !event.content.is_empty() {
            if self.first_at.is_none() {
                self.first_at = Some(Instant::now());
            }
            self.chunk_count += 1;
            self.content.push_str(&event.content);
        }
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn finish(self, success: bool) -> (String, StreamMetrics) {
        let now = Instant::now();
        let first_token_latency_ms = self
            .first_at
            .map(|t| (t - self.started).as_millis() as i64);
        let first_to_final_ms = self.first_at.map(|t| (now - t).as_millis() as i64);
        let metrics = StreamMetrics {
            first_token_latency_ms,
            total_streaming_duration_ms: (now - self.started).as_millis() as i64,
            chunk_count: self.chunk_count,
            total_content_length: self.content.len(),
            first_to_final_ms,
            success,
        };
        (self.content, metrics)
    }
}

impl Default for StreamCollector {
    fn default() -> Self {
        Self::new()
    }
}
