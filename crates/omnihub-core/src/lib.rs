//! Core pipeline of the omnihub messaging hub.
//!
//! Wires the subsystems between the channel edge and the agent backend:
//! admission control, identity resolution, session derivation, the
//! instance registry, trace recording, outbound delivery, and the message
//! router that orchestrates them per inbound event.

pub mod access;
pub mod adapter;
pub mod dedup;
pub mod delivery;
pub mod identity;
pub mod registry;
pub mod router;
pub mod session;
pub mod split;
pub mod trace;

pub use access::{evaluate, AccessControl, Decision};
pub use adapter::{
    AdapterContext, AdapterFactory, AdapterStatus, ChannelAdapter, ChannelError, InboundHandler,
    Ingest, IngestOutcome, InstanceEventSink, PairInfo, SendOutcome,
};
pub use dedup::DedupCache;
pub use delivery::{deliver, DeliveryOptions, DeliveryReport};
pub use identity::IdentityResolver;
pub use registry::{InstanceRegistry, InstanceState, InstanceStatusView, RunningInstance};
pub use router::{AgentClientFactory, HttpAgentFactory, MessageRouter, RouterConfig};
pub use session::derive_session_key;
pub use split::split_text;
pub use trace::{decompress_payload, payload_as_json, TraceRecorder, COMPRESSION_THRESHOLD};
