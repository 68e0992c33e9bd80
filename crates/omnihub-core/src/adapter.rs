//! The channel adapter seam.
//!
//! Adapters own their channel connection and are its sole writer. The
//! router only ever sees this trait plus normalized [`InboundEvent`]s
//! pushed through [`InboundHandler`]. Concrete variants live in
//! `omnihub-channels`; the registry builds them through
//! [`AdapterFactory`] so the wiring stays at the binary edge.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use omnihub_schema::{ChannelType, InboundEvent, InstanceConfig, MediaRef};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Adapter-native connection state plus optional account identity.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdapterStatus {
    pub native_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

/// Onboarding material for channels that need pairing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PairInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SendOutcome {
    pub message_id: Option<String>,
}

/// Send-side failures, split so the delivery layer can decide between
/// retry and permanent failure.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel not connected: {0}")]
    NotConnected(String),
    #[error("channel rate limited")]
    RateLimited,
    #[error("channel transport error: {0}")]
    Transport(String),
    #[error("channel rejected the send: {0}")]
    Rejected(String),
}

impl ChannelError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChannelError::NotConnected(_) | ChannelError::RateLimited | ChannelError::Transport(_)
        )
    }
}

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel_type(&self) -> ChannelType;
    fn instance_name(&self) -> &str;

    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    async fn status(&self) -> Result<AdapterStatus>;
    async fn pair(&self) -> Result<PairInfo>;

    async fn send_text(&self, target: &str, text: &str) -> Result<SendOutcome, ChannelError>;
    async fn send_media(&self, target: &str, media: &MediaRef)
        -> Result<SendOutcome, ChannelError>;
    async fn send_audio(&self, target: &str, audio_url: &str)
        -> Result<SendOutcome, ChannelError>;
    async fn send_reaction(
        &self,
        target: &str,
        target_message_id: &str,
        emoji: &str,
    ) -> Result<SendOutcome, ChannelError>;

    /// Auto-split threshold for this channel, in characters.
    fn chunk_limit(&self) -> usize {
        1600
    }

    // Listing surface proxied through the adapter; channels without the
    // capability keep the default.
    async fn fetch_contacts(&self) -> Result<serde_json::Value> {
        anyhow::bail!("contact listing not supported by this channel")
    }
    async fn fetch_chats(&self) -> Result<serde_json::Value> {
        anyhow::bail!("chat listing not supported by this channel")
    }
    async fn fetch_messages(&self, _chat_id: &str, _limit: u32) -> Result<serde_json::Value> {
        anyhow::bail!("message listing not supported by this channel")
    }

    /// Webhook ingress for gateway-fed channels: normalize the callback
    /// body and route each message through the inbound handler. Channels
    /// that own their connection have no webhook surface.
    async fn ingest_webhook(&self, _body: &serde_json::Value) -> Result<Vec<Ingest>> {
        anyhow::bail!("this channel has no webhook ingress")
    }
}

/// What happened to an inbound event at the intake boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    Accepted,
    /// The same channel message id was seen within the dedup TTL; the
    /// returned trace id is the original one.
    Duplicate,
    /// The per-session queue was full; a failed trace was recorded.
    Overloaded,
}

#[derive(Debug, Clone, Serialize)]
pub struct Ingest {
    pub trace_id: Uuid,
    pub outcome: IngestOutcome,
}

/// Sink for normalized inbound events. Implemented by the router.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_inbound(&self, event: InboundEvent) -> Result<Ingest>;
}

/// Lifecycle notifications from an adapter to the registry.
#[async_trait]
pub trait InstanceEventSink: Send + Sync {
    async fn handshake_complete(&self, instance: &str);
    async fn connection_lost(&self, instance: &str, error: Option<String>);
}

/// Everything an adapter needs at construction time.
pub struct AdapterContext {
    pub config: InstanceConfig,
    pub handler: Arc<dyn InboundHandler>,
    pub events: Arc<dyn InstanceEventSink>,
    /// Cancellation token chained to the instance lifecycle. Adapters
    /// that own a connection tie their gateway task to it so a registry
    /// disconnect or process shutdown tears the connection down even
    /// without an explicit `stop`.
    pub token: CancellationToken,
}

pub trait AdapterFactory: Send + Sync {
    fn build(&self, ctx: AdapterContext) -> Result<Arc<dyn ChannelAdapter>>;
}
