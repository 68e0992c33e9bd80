//! Shared data model for the omnihub messaging hub.
//!
//! Everything that crosses a crate boundary lives here: tenant instance
//! configuration, platform-neutral user identity, access rules, normalized
//! inbound events, and the message trace records the pipeline appends to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ───────────────────────────── Channels ─────────────────────────────

/// Messaging platform a tenant instance is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    WhatsApp,
    Discord,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::WhatsApp => "whatsapp",
            ChannelType::Discord => "discord",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "whatsapp" => Some(ChannelType::WhatsApp),
            "discord" => Some(ChannelType::Discord),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ───────────────────────────── Instances ────────────────────────────

/// A named, isolated tenant binding one channel account to one agent
/// endpoint. `name` is the stable key used in URLs and logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub channel_type: ChannelType,

    // WhatsApp (Evolution gateway) credentials
    #[serde(default)]
    pub evolution_url: Option<String>,
    #[serde(default)]
    pub evolution_key: Option<String>,
    #[serde(default)]
    pub whatsapp_instance_id: Option<String>,

    // Discord credentials
    #[serde(default)]
    pub discord_bot_token: Option<String>,
    #[serde(default)]
    pub discord_guild_id: Option<String>,

    // Agent endpoint
    pub agent_api_url: String,
    #[serde(default)]
    pub agent_api_key: Option<String>,
    pub agent_id: String,
    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,
    #[serde(default)]
    pub agent_stream_mode: bool,

    // Behavior
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_true")]
    pub enable_auto_split: bool,
    #[serde(default)]
    pub session_id_prefix: Option<String>,
    /// Optional notice sent to the peer when the agent call fails.
    /// Absent means stay silent.
    #[serde(default)]
    pub error_fallback_message: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_agent_timeout_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

impl InstanceConfig {
    /// Validate an instance before it is persisted. Returns the first
    /// problem found, phrased for an admin API response.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("instance name must not be empty".into());
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(format!(
                "instance name '{}' may only contain alphanumerics, '-' and '_'",
                self.name
            ));
        }
        if self.agent_api_url.is_empty() {
            return Err("agent_api_url must not be empty".into());
        }
        if self.agent_id.is_empty() {
            return Err("agent_id must not be empty".into());
        }
        if self.agent_timeout_ms == 0 {
            return Err("agent_timeout_ms must be positive".into());
        }
        match self.channel_type {
            ChannelType::WhatsApp => {
                if self.evolution_url.as_deref().unwrap_or("").is_empty() {
                    return Err("whatsapp instances require evolution_url".into());
                }
                if self.evolution_key.as_deref().unwrap_or("").is_empty() {
                    return Err("whatsapp instances require evolution_key".into());
                }
            }
            ChannelType::Discord => {
                if self.discord_bot_token.as_deref().unwrap_or("").is_empty() {
                    return Err("discord instances require discord_bot_token".into());
                }
            }
        }
        Ok(())
    }

    /// Whether a config change touches the fields that own the channel
    /// connection. Such a change forces a restart; everything else is
    /// hot-reloadable while connected.
    pub fn connection_fields_changed(&self, other: &InstanceConfig) -> bool {
        self.channel_type != other.channel_type
            || self.evolution_url != other.evolution_url
            || self.evolution_key != other.evolution_key
            || self.whatsapp_instance_id != other.whatsapp_instance_id
            || self.discord_bot_token != other.discord_bot_token
            || self.discord_guild_id != other.discord_guild_id
    }
}

/// Partial update applied over an existing instance. `None` fields are
/// left untouched; `name` is immutable.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InstancePatch {
    pub evolution_url: Option<String>,
    pub evolution_key: Option<String>,
    pub whatsapp_instance_id: Option<String>,
    pub discord_bot_token: Option<String>,
    pub discord_guild_id: Option<String>,
    pub agent_api_url: Option<String>,
    pub agent_api_key: Option<String>,
    pub agent_id: Option<String>,
    pub agent_timeout_ms: Option<u64>,
    pub agent_stream_mode: Option<bool>,
    pub is_default: Option<bool>,
    pub is_active: Option<bool>,
    pub enable_auto_split: Option<bool>,
    pub session_id_prefix: Option<String>,
    pub error_fallback_message: Option<String>,
}

impl InstancePatch {
    pub fn apply(&self, cfg: &mut InstanceConfig) {
        let p = self.clone();
        if let Some(v) = p.evolution_url {
            cfg.evolution_url = Some(v);
        }
        if let Some(v) = p.evolution_key {
            cfg.evolution_key = Some(v);
        }
        if let Some(v) = p.whatsapp_instance_id {
            cfg.whatsapp_instance_id = Some(v);
        }
        if let Some(v) = p.discord_bot_token {
            cfg.discord_bot_token = Some(v);
        }
        if let Some(v) = p.discord_guild_id {
            cfg.discord_guild_id = Some(v);
        }
        if let Some(v) = p.agent_api_url {
            cfg.agent_api_url = v;
        }
        if let Some(v) = p.agent_api_key {
            cfg.agent_api_key = Some(v);
        }
        if let Some(v) = p.agent_id {
            cfg.agent_id = v;
        }
        if let Some(v) = p.agent_timeout_ms {
            cfg.agent_timeout_ms = v;
        }
        if let Some(v) = p.agent_stream_mode {
            cfg.agent_stream_mode = v;
        }
        if let Some(v) = p.is_default {
            cfg.is_default = v;
        }
        if let Some(v) = p.is_active {
            cfg.is_active = v;
        }
        if let Some(v) = p.enable_auto_split {
            cfg.enable_auto_split = v;
        }
        if let Some(v) = p.session_id_prefix {
            cfg.session_id_prefix = Some(v);
        }
        if let Some(v) = p.error_fallback_message {
            cfg.error_fallback_message = Some(v);
        }
        cfg.updated_at = Utc::now();
    }
}

// ───────────────────────────── Identity ─────────────────────────────

/// Platform-neutral identity. Created on first contact, never deleted
/// implicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    #[serde(default)]
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Link row binding a channel-native id to an internal user.
/// Unique on `(provider, external_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserExternalId {
    pub provider: String,
    pub external_id: String,
    pub user_id: Uuid,
    #[serde(default)]
    pub extra: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// ───────────────────────────── Access rules ─────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Allow,
    Block,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Allow => "allow",
            RuleType::Block => "block",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(RuleType::Allow),
            "block" => Some(RuleType::Block),
            _ => None,
        }
    }
}

/// Admission rule. `instance_name = None` makes the rule global;
/// `phone_number` is exact E.164 or a prefix with a trailing `*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRule {
    pub id: i64,
    #[serde(default)]
    pub instance_name: Option<String>,
    pub phone_number: String,
    pub rule_type: RuleType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ───────────────────────────── Message kinds ────────────────────────

/// Normalized message type. Closed enumeration: every channel-native key
/// maps to exactly one variant, unrecognized keys to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Reaction,
    Poll,
    PollUpdate,
    Ephemeral,
    ViewOnce,
    Protocol,
    System,
    Edited,
    Call,
    Location,
    LiveLocation,
    Contact,
    Contacts,
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Audio => "audio",
            MessageKind::Document => "document",
            MessageKind::Sticker => "sticker",
            MessageKind::Reaction => "reaction",
            MessageKind::Poll => "poll",
            MessageKind::PollUpdate => "poll_update",
            MessageKind::Ephemeral => "ephemeral",
            MessageKind::ViewOnce => "view_once",
            MessageKind::Protocol => "protocol",
            MessageKind::System => "system",
            MessageKind::Edited => "edited",
            MessageKind::Call => "call",
            MessageKind::Location => "location",
            MessageKind::LiveLocation => "live_location",
            MessageKind::Contact => "contact",
            MessageKind::Contacts => "contacts",
            MessageKind::Unknown => "unknown",
        }
    }

    /// Keys that carry message metadata rather than content. They must
    /// never win type detection.
    pub fn is_metadata_key(key: &str) -> bool {
        matches!(key, "contextInfo" | "messageContextInfo")
    }

    /// Map a channel-native type key (Baileys-style) or an already
    /// normalized name to a kind. Total and idempotent:
    /// `from_raw_key(k.as_str()) == k` for every kind `k`.
    pub fn from_raw_key(key: &str) -> MessageKind {
        match key {
            // Baileys envelope keys
            "conversation" | "extendedTextMessage" => MessageKind::Text,
            "imageMessage" => MessageKind::Image,
            "videoMessage" | "ptvMessage" => MessageKind::Video,
            "audioMessage" => MessageKind::Audio,
            "documentMessage" | "documentWithCaptionMessage" => MessageKind::Document,
            "stickerMessage" => MessageKind::Sticker,
            "reactionMessage" => MessageKind::Reaction,
            "pollMessage" | "pollCreationMessage" | "pollCreationMessageV2"
            | "pollCreationMessageV3" => MessageKind::Poll,
            "pollUpdateMessage" => MessageKind::PollUpdate,
            "ephemeralMessage" => MessageKind::Ephemeral,
            "viewOnceMessage" | "viewOnceMessageV2" | "viewOnceMessageV2Extension" => {
                MessageKind::ViewOnce
            }
            "protocolMessage" => MessageKind::Protocol,
            "senderKeyDistributionMessage" | "deviceSentMessage" => MessageKind::System,
            "editedMessage" => MessageKind::Edited,
            "call" => MessageKind::Call,
            "locationMessage" => MessageKind::Location,
            "liveLocationMessage" => MessageKind::LiveLocation,
            "contactMessage" => MessageKind::Contact,
            "contactsArrayMessage" => MessageKind::Contacts,
            // Normalized names map onto themselves
            "text" => MessageKind::Text,
            "image" => MessageKind::Image,
            "video" => MessageKind::Video,
            "audio" => MessageKind::Audio,
            "document" => MessageKind::Document,
            "sticker" => MessageKind::Sticker,
            "reaction" => MessageKind::Reaction,
            "poll" => MessageKind::Poll,
            "poll_update" => MessageKind::PollUpdate,
            "ephemeral" => MessageKind::Ephemeral,
            "view_once" => MessageKind::ViewOnce,
            "protocol" => MessageKind::Protocol,
            "system" => MessageKind::System,
            "edited" => MessageKind::Edited,
            "location" => MessageKind::Location,
            "live_location" => MessageKind::LiveLocation,
            "contact" => MessageKind::Contact,
            "contacts" => MessageKind::Contacts,
            _ => MessageKind::Unknown,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detect the kind of a Baileys-style `message` object: the first key that
/// maps to a known kind wins; metadata keys never count as content.
pub fn detect_message_kind(message: &serde_json::Value) -> MessageKind {
    let Some(map) = message.as_object() else {
        return MessageKind::Unknown;
    };
    for key in map.keys() {
        if MessageKind::is_metadata_key(key) {
            continue;
        }
        let kind = MessageKind::from_raw_key(key);
        if kind != MessageKind::Unknown {
            return kind;
        }
    }
    MessageKind::Unknown
}

// ───────────────────────────── Media ────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
            MediaKind::Sticker => "sticker",
        }
    }
}

/// Media by reference. The hub never stores binary media content; only
/// URLs or content hashes travel through it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

// ───────────────────────────── Inbound events ───────────────────────

/// Channel-neutral inbound event, produced by adapter normalization and
/// consumed by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub channel_type: ChannelType,
    pub instance_name: String,
    /// Channel-native message id, the dedup key for gateway retries.
    pub channel_message_id: String,
    /// Channel-native sender id (WhatsApp JID, Discord user id).
    pub from_peer: String,
    /// Where replies go (WhatsApp JID, Discord channel id).
    pub chat_target: String,
    #[serde(default)]
    pub peer_display_name: Option<String>,
    /// Sender phone in E.164 when the channel carries one.
    #[serde(default)]
    pub sender_phone: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    #[serde(default)]
    pub quoted_message_id: Option<String>,
    pub kind: MessageKind,
    /// Discord guild id when the message came from a guild channel.
    #[serde(default)]
    pub guild_id: Option<String>,
    /// Timestamp reported by the channel, when present.
    #[serde(default)]
    pub timestamp_source: Option<DateTime<Utc>>,
    /// The raw envelope as observed at the edge, for trace capture.
    pub raw_payload: serde_json::Value,
}

impl InboundEvent {
    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }

    /// The id access control matches against: phone when the channel has
    /// one, otherwise the channel-native peer id.
    pub fn admission_peer(&self) -> &str {
        self.sender_phone.as_deref().unwrap_or(&self.from_peer)
    }
}

// ───────────────────────────── Traces ───────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Received,
    Processing,
    Completed,
    Failed,
    AccessDenied,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::Received => "received",
            TraceStatus::Processing => "processing",
            TraceStatus::Completed => "completed",
            TraceStatus::Failed => "failed",
            TraceStatus::AccessDenied => "access_denied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(TraceStatus::Received),
            "processing" => Some(TraceStatus::Processing),
            "completed" => Some(TraceStatus::Completed),
            "failed" => Some(TraceStatus::Failed),
            "access_denied" => Some(TraceStatus::AccessDenied),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TraceStatus::Completed | TraceStatus::Failed | TraceStatus::AccessDenied
        )
    }
}

/// Pipeline stage a payload row is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStage {
    WebhookReceived,
    AgentRequest,
    AgentResponse,
    OutboundSent,
}

impl TraceStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStage::WebhookReceived => "webhook_received",
            TraceStage::AgentRequest => "agent_request",
            TraceStage::AgentResponse => "agent_response",
            TraceStage::OutboundSent => "outbound_sent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "webhook_received" => Some(TraceStage::WebhookReceived),
            "agent_request" => Some(TraceStage::AgentRequest),
            "agent_response" => Some(TraceStage::AgentResponse),
            "outbound_sent" => Some(TraceStage::OutboundSent),
            _ => None,
        }
    }
}

/// Durable record of one inbound message's journey through the hub.
/// Outbound sends attach to the inbound trace rather than opening one
/// of their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTrace {
    pub trace_id: Uuid,
    pub instance_name: String,
    pub channel_type: ChannelType,
    pub direction: Direction,
    /// Channel-native message id.
    pub message_id: String,
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub sender_phone: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub message_type: MessageKind,
    pub has_media: bool,
    pub has_quoted_message: bool,
    pub status: TraceStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_stage: Option<String>,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub agent_processing_time_ms: Option<i64>,
    #[serde(default)]
    pub total_processing_time_ms: Option<i64>,
    #[serde(default)]
    pub agent_response_success: bool,
    #[serde(default)]
    pub channel_send_success: bool,
}

impl MessageTrace {
    /// Fresh trace for a normalized inbound event, in the `received`
    /// state.
    pub fn open(event: &InboundEvent) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            instance_name: event.instance_name.clone(),
            channel_type: event.channel_type,
            direction: Direction::Inbound,
            message_id: event.channel_message_id.clone(),
            session_name: None,
            user_id: None,
            sender_phone: event.sender_phone.clone(),
            sender_name: event.peer_display_name.clone(),
            message_type: event.kind,
            has_media: event.has_media(),
            has_quoted_message: event.quoted_message_id.is_some(),
            status: TraceStatus::Received,
            error_message: None,
            error_stage: None,
            received_at: Utc::now(),
            completed_at: None,
            agent_processing_time_ms: None,
            total_processing_time_ms: None,
            agent_response_success: false,
            channel_send_success: false,
        }
    }
}

/// Stage-scoped payload snapshot attached to a trace. `payload` is the
/// (possibly compressed) raw bytes observed at that stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracePayload {
    pub id: i64,
    pub trace_id: Uuid,
    pub stage: TraceStage,
    pub payload_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status_code: Option<u16>,
    pub payload_size_original: i64,
    pub payload_size_compressed: i64,
    pub compression_ratio: f64,
    pub contains_media: bool,
    pub contains_base64: bool,
    #[serde(with = "serde_bytes_base64")]
    pub payload: Vec<u8>,
}

/// Blob fields serialize as standard base64 in JSON so the admin API can
/// carry them without a side channel.
mod serde_bytes_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whatsapp_instance(name: &str) -> InstanceConfig {
        InstanceConfig {
            name: name.to_string(),
            channel_type: ChannelType::WhatsApp,
            evolution_url: Some("http://gateway:8080".into()),
            evolution_key: Some("evo-key".into()),
            whatsapp_instance_id: Some("wa-1".into()),
            discord_bot_token: None,
            discord_guild_id: None,
            agent_api_url: "http://agent:8000".into(),
            agent_api_key: Some("agent-key".into()),
            agent_id: "default".into(),
            agent_timeout_ms: 60_000,
            agent_stream_mode: false,
            is_default: false,
            is_active: true,
            enable_auto_split: true,
            session_id_prefix: None,
            error_fallback_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn validate_accepts_complete_whatsapp_instance() {
        assert!(whatsapp_instance("prod-wa").validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_name() {
        let mut cfg = whatsapp_instance("prod wa");
        assert!(cfg.validate().is_err());
        cfg.name = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_evolution_credentials() {
        let mut cfg = whatsapp_instance("prod-wa");
        cfg.evolution_key = None;
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("evolution_key"));
    }

    #[test]
    fn validate_rejects_discord_without_token() {
        let mut cfg = whatsapp_instance("dc");
        cfg.channel_type = ChannelType::Discord;
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("discord_bot_token"));
    }

    #[test]
    fn connection_fields_changed_detects_credentials() {
        let a = whatsapp_instance("prod-wa");
        let mut b = a.clone();
        b.agent_api_url = "http://other:8000".into();
        assert!(!a.connection_fields_changed(&b));
        b.evolution_key = Some("rotated".into());
        assert!(a.connection_fields_changed(&b));
    }

    #[test]
    fn patch_applies_only_set_fields() {
        let mut cfg = whatsapp_instance("prod-wa");
        let patch = InstancePatch {
            agent_timeout_ms: Some(5_000),
            enable_auto_split: Some(false),
            ..Default::default()
        };
        patch.apply(&mut cfg);
        assert_eq!(cfg.agent_timeout_ms, 5_000);
        assert!(!cfg.enable_auto_split);
        assert_eq!(cfg.agent_api_url, "http://agent:8000");
    }

    #[test]
    fn message_kind_detection_covers_baileys_keys() {
        assert_eq!(MessageKind::from_raw_key("conversation"), MessageKind::Text);
        assert_eq!(
            MessageKind::from_raw_key("extendedTextMessage"),
            MessageKind::Text
        );
        assert_eq!(
            MessageKind::from_raw_key("reactionMessage"),
            MessageKind::Reaction
        );
        assert_eq!(
            MessageKind::from_raw_key("viewOnceMessageV2"),
            MessageKind::ViewOnce
        );
        assert_eq!(
            MessageKind::from_raw_key("pollCreationMessage"),
            MessageKind::Poll
        );
        assert_eq!(
            MessageKind::from_raw_key("liveLocationMessage"),
            MessageKind::LiveLocation
        );
        assert_eq!(
            MessageKind::from_raw_key("contactsArrayMessage"),
            MessageKind::Contacts
        );
        assert_eq!(MessageKind::from_raw_key("call"), MessageKind::Call);
        assert_eq!(
            MessageKind::from_raw_key("somethingNew"),
            MessageKind::Unknown
        );
    }

    #[test]
    fn message_kind_is_idempotent_over_normalized_names() {
        let all = [
            MessageKind::Text,
            MessageKind::Image,
            MessageKind::Video,
            MessageKind::Audio,
            MessageKind::Document,
            MessageKind::Sticker,
            MessageKind::Reaction,
            MessageKind::Poll,
            MessageKind::PollUpdate,
            MessageKind::Ephemeral,
            MessageKind::ViewOnce,
            MessageKind::Protocol,
            MessageKind::System,
            MessageKind::Edited,
            MessageKind::Call,
            MessageKind::Location,
            MessageKind::LiveLocation,
            MessageKind::Contact,
            MessageKind::Contacts,
        ];
        for kind in all {
            assert_eq!(MessageKind::from_raw_key(kind.as_str()), kind);
        }
    }

    #[test]
    fn context_info_is_metadata_not_content() {
        assert!(MessageKind::is_metadata_key("contextInfo"));
        assert!(MessageKind::is_metadata_key("messageContextInfo"));
        assert!(!MessageKind::is_metadata_key("conversation"));
    }

    #[test]
    fn detect_kind_skips_metadata_keys() {
        let message = serde_json::json!({
            "messageContextInfo": {"deviceListMetadata": {}},
            "reactionMessage": {"text": "👍", "key": {"id": "3EB01"}}
        });
        assert_eq!(detect_message_kind(&message), MessageKind::Reaction);

        let only_meta = serde_json::json!({"contextInfo": {}});
        assert_eq!(detect_message_kind(&only_meta), MessageKind::Unknown);

        assert_eq!(
            detect_message_kind(&serde_json::json!("not an object")),
            MessageKind::Unknown
        );
    }

    #[test]
    fn trace_open_captures_event_shape() {
        let event = InboundEvent {
            channel_type: ChannelType::WhatsApp,
            instance_name: "prod-wa".into(),
            channel_message_id: "3EB01".into(),
            from_peer: "5511990000101@s.whatsapp.net".into(),
            chat_target: "5511990000101@s.whatsapp.net".into(),
            peer_display_name: Some("Alice".into()),
            sender_phone: Some("+5511990000101".into()),
            text: Some("hi".into()),
            media: vec![],
            quoted_message_id: None,
            kind: MessageKind::Text,
            guild_id: None,
            timestamp_source: None,
            raw_payload: serde_json::json!({}),
        };
        let trace = MessageTrace::open(&event);
        assert_eq!(trace.status, TraceStatus::Received);
        assert_eq!(trace.message_type, MessageKind::Text);
        assert_eq!(trace.sender_phone.as_deref(), Some("+5511990000101"));
        assert!(!trace.has_media);
        assert!(!trace.has_quoted_message);
    }

    #[test]
    fn trace_status_terminality() {
        assert!(!TraceStatus::Received.is_terminal());
        assert!(!TraceStatus::Processing.is_terminal());
        assert!(TraceStatus::Completed.is_terminal());
        assert!(TraceStatus::Failed.is_terminal());
        assert!(TraceStatus::AccessDenied.is_terminal());
    }

    #[test]
    fn admission_peer_prefers_phone() {
        let mut event = InboundEvent {
            channel_type: ChannelType::Discord,
            instance_name: "dc".into(),
            channel_message_id: "1".into(),
            from_peer: "U123".into(),
            chat_target: "C456".into(),
            peer_display_name: None,
            sender_phone: None,
            text: Some("hello".into()),
            media: vec![],
            quoted_message_id: None,
            kind: MessageKind::Text,
            guild_id: None,
            timestamp_source: None,
            raw_payload: serde_json::json!({}),
        };
        assert_eq!(event.admission_peer(), "U123");
        event.sender_phone = Some("+15551234567".into());
        assert_eq!(event.admission_peer(), "+15551234567");
    }

    #[test]
    fn trace_payload_blob_roundtrips_through_json() {
        let payload = TracePayload {
            id: 1,
            trace_id: Uuid::new_v4(),
            stage: TraceStage::WebhookReceived,
            payload_type: "application/json".into(),
            timestamp: Utc::now(),
            status_code: Some(200),
            payload_size_original: 5,
            payload_size_compressed: 5,
            compression_ratio: 1.0,
            contains_media: false,
            contains_base64: false,
            payload: vec![1, 2, 3, 254, 255],
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: TracePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payload, vec![1, 2, 3, 254, 255]);
        assert_eq!(back.stage, TraceStage::WebhookReceived);
    }

    #[test]
    fn channel_type_parse_roundtrip() {
        assert_eq!(ChannelType::parse("whatsapp"), Some(ChannelType::WhatsApp));
        assert_eq!(ChannelType::parse("discord"), Some(ChannelType::Discord));
        assert_eq!(ChannelType::parse("telegram"), None);
        assert_eq!(ChannelType::WhatsApp.to_string(), "whatsapp");
    }
}
