//! WhatsApp channel via an Evolution-style HTTP gateway.
//!
//! The gateway owns the actual WhatsApp socket; this adapter talks to its
//! REST surface for sends and onboarding, and normalizes the Baileys-style
//! webhook envelopes the gateway POSTs back at us. Inbound flow is
//! webhook-driven, so the adapter holds no connection of its own.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use omnihub_core::{
    AdapterContext, AdapterStatus, ChannelAdapter, ChannelError, InboundHandler, Ingest,
    InstanceEventSink, PairInfo, SendOutcome,
};
use omnihub_schema::{
    detect_message_kind, ChannelType, InboundEvent, MediaKind, MediaRef, MessageKind,
};

/// Characters per message before auto-split kicks in.
pub const WHATSAPP_CHUNK_LIMIT: usize = 1600;

// ───────────────────────── Gateway client ───────────────────────────

/// Thin client for the Evolution gateway REST API.
#[derive(Clone)]
pub struct EvolutionClient {
    base_url: String,
    api_key: String,
    instance_id: String,
    client: reqwest::Client,
}

impl EvolutionClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            instance_id: instance_id.into(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            path,
            urlencoding::encode(&self.instance_id)
        )
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ChannelError> {
        let resp = self
            .client
            .post(self.url(path))
            .header("apikey", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        Self::read_json(resp).await
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value, ChannelError> {
        let resp = self
            .client
            .get(self.url(path))
            .header("apikey", &self.api_key)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        Self::read_json(resp).await
    }

    async fn read_json(resp: reqwest::Response) -> Result<serde_json::Value, ChannelError> {
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(ChannelError::RateLimited);
        }
        if status.is_server_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Transport(format!(
                "gateway error {status}: {body}"
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Rejected(format!(
                "gateway rejected request ({status}): {body}"
            )));
        }
        resp.json()
            .await
            .map_err(|e| ChannelError::Transport(format!("bad gateway response: {e}")))
    }

    fn outcome(value: &serde_json::Value) -> SendOutcome {
        SendOutcome {
            message_id: value
                .pointer("/key/id")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }
    }

    pub async fn send_text(&self, number: &str, text: &str) -> Result<SendOutcome, ChannelError> {
        let value = self
            .post(
                "message/sendText",
                serde_json::json!({"number": number, "text": text}),
            )
            .await?;
        Ok(Self::outcome(&value))
    }

    pub async fn send_media(
        &self,
        number: &str,
        media: &MediaRef,
    ) -> Result<SendOutcome, ChannelError> {
        let mut body = serde_json::json!({
            "number": number,
            "mediatype": media.kind.as_str(),
            "media": media.url,
        });
        if let Some(caption) = &media.caption {
            body["caption"] = serde_json::json!(caption);
        }
        if let Some(file_name) = &media.file_name {
            body["fileName"] = serde_json::json!(file_name);
        }
        let value = self.post("message/sendMedia", body).await?;
        Ok(Self::outcome(&value))
    }

    pub async fn send_audio(
        &self,
        number: &str,
        audio_url: &str,
    ) -> Result<SendOutcome, ChannelError> {
        let value = self
            .post(
                "message/sendWhatsAppAudio",
                serde_json::json!({"number": number, "audio": audio_url}),
            )
            .await?;
        Ok(Self::outcome(&value))
    }

    pub async fn send_reaction(
        &self,
        number: &str,
        target_message_id: &str,
        emoji: &str,
    ) -> Result<SendOutcome, ChannelError> {
        let value = self
            .post(
                "message/sendReaction",
                serde_json::json!({
                    "key": {"remoteJid": number, "id": target_message_id, "fromMe": false},
                    "reaction": emoji,
                }),
            )
            .await?;
        Ok(Self::outcome(&value))
    }

    /// Gateway connection state: `open`, `connecting` or `close`.
    pub async fn connection_state(&self) -> Result<String, ChannelError> {
        let value = self.get("instance/connectionState").await?;
        Ok(value
            .pointer("/instance/state")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string())
    }

    /// QR material for linking a phone to the gateway instance.
    pub async fn connect_qr(&self) -> Result<Option<String>, ChannelError> {
        let value = self.get("instance/connect").await?;
        Ok(value
            .get("base64")
            .or_else(|| value.pointer("/qrcode/base64"))
            .and_then(|v| v.as_str())
            .map(str::to_string))
    }

    pub async fn find_contacts(&self) -> Result<serde_json::Value, ChannelError> {
        self.post("chat/findContacts", serde_json::json!({})).await
    }

    pub async fn find_chats(&self) -> Result<serde_json::Value, ChannelError> {
        self.post("chat/findChats", serde_json::json!({})).await
    }

    pub async fn find_messages(
        &self,
        chat_id: &str,
        limit: u32,
    ) -> Result<serde_json::Value, ChannelError> {
        self.post(
            "chat/findMessages",
            serde_json::json!({
                "where": {"key": {"remoteJid": chat_id}},
                "limit": limit,
            }),
        )
        .await
    }
}

// ───────────────────────── Webhook parsing ──────────────────────────

/// Extract the E.164-ish phone from a WhatsApp JID.
pub fn phone_from_jid(jid: &str) -> Option<String> {
    let local = jid.split('@').next()?;
    let digits: String = local.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    Some(format!("+{digits}"))
}

fn is_group_jid(jid: &str) -> bool {
    jid.ends_with("@g.us")
}

/// Parse one Evolution webhook body into normalized inbound events.
/// Non-message events (presence, status) yield an empty list; own
/// (`fromMe`) messages are skipped.
pub fn parse_webhook(instance_name: &str, body: &serde_json::Value) -> Result<Vec<InboundEvent>> {
    let event = body.get("event").and_then(|v| v.as_str()).unwrap_or("");

    if event == "call" {
        return Ok(parse_call(instance_name, body).into_iter().collect());
    }
    if !matches!(event, "messages.upsert" | "messages.update" | "") {
        return Ok(Vec::new());
    }

    let data = body.get("data").unwrap_or(&serde_json::Value::Null);
    let messages: Vec<&serde_json::Value> = if let Some(list) =
        data.get("messages").and_then(|v| v.as_array())
    {
        list.iter().collect()
    } else if data.get("key").is_some() {
        vec![data]
    } else {
        return Ok(Vec::new());
    };

    let mut events = Vec::new();
    for message in messages {
        if let Some(event) = parse_message(instance_name, body, message)? {
            events.push(event);
        }
    }
    Ok(events)
}

fn parse_call(instance_name: &str, body: &serde_json::Value) -> Option<InboundEvent> {
    let data = body.get("data")?;
    let from = data.get("from").and_then(|v| v.as_str())?;
    let id = data
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or("call")
        .to_string();
    Some(InboundEvent {
        channel_type: ChannelType::WhatsApp,
        instance_name: instance_name.to_string(),
        channel_message_id: id,
        from_peer: from.to_string(),
        chat_target: from.to_string(),
        peer_display_name: None,
        sender_phone: phone_from_jid(from),
        text: None,
        media: vec![],
        quoted_message_id: None,
        kind: MessageKind::Call,
        guild_id: None,
        timestamp_source: None,
        raw_payload: body.clone(),
    })
}

fn parse_message(
    instance_name: &str,
    body: &serde_json::Value,
    entry: &serde_json::Value,
) -> Result<Option<InboundEvent>> {
    let key = entry
        .get("key")
        .context("webhook message entry has no key")?;
    if key.get("fromMe").and_then(|v| v.as_bool()).unwrap_or(false) {
        return Ok(None);
    }
    let remote_jid = key
        .get("remoteJid")
        .and_then(|v| v.as_str())
        .context("webhook message has no remoteJid")?;
    let message_id = key
        .get("id")
        .and_then(|v| v.as_str())
        .context("webhook message has no id")?;

    let message = entry.get("message").unwrap_or(&serde_json::Value::Null);
    let kind = detect_message_kind(message);

    // In groups the sender is the participant, not the chat JID.
    let sender_jid = if is_group_jid(remote_jid) {
        key.get("participant")
            .and_then(|v| v.as_str())
            .unwrap_or(remote_jid)
    } else {
        remote_jid
    };

    let timestamp_source = entry
        .get("messageTimestamp")
        .and_then(|v| v.as_i64())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

    Ok(Some(InboundEvent {
        channel_type: ChannelType::WhatsApp,
        instance_name: instance_name.to_string(),
        channel_message_id: message_id.to_string(),
        from_peer: sender_jid.to_string(),
        chat_target: remote_jid.to_string(),
        peer_display_name: entry
            .get("pushName")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        sender_phone: phone_from_jid(sender_jid),
        text: extract_text(message),
        media: extract_media(message),
        quoted_message_id: extract_quoted_id(message),
        kind,
        guild_id: None,
        timestamp_source,
        raw_payload: body.clone(),
    }))
}

fn extract_text(message: &serde_json::Value) -> Option<String> {
    let candidates = [
        message.get("conversation"),
        message.pointer("/extendedTextMessage/text"),
        message.pointer("/imageMessage/caption"),
        message.pointer("/videoMessage/caption"),
        message.pointer("/documentMessage/caption"),
        message.pointer("/ephemeralMessage/message/conversation"),
        message.pointer("/viewOnceMessage/message/imageMessage/caption"),
        message.pointer("/reactionMessage/text"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn extract_media(message: &serde_json::Value) -> Vec<MediaRef> {
    let sources = [
        ("imageMessage", MediaKind::Image),
        ("videoMessage", MediaKind::Video),
        ("audioMessage", MediaKind::Audio),
        ("documentMessage", MediaKind::Document),
        ("stickerMessage", MediaKind::Sticker),
    ];
    let mut media = Vec::new();
    for (field, kind) in sources {
        let Some(obj) = message.get(field) else {
            continue;
        };
        let Some(url) = obj.get("url").and_then(|v| v.as_str()) else {
            continue;
        };
        media.push(MediaRef {
            kind,
            url: url.to_string(),
            mime_type: obj
                .get("mimetype")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            file_name: obj
                .get("fileName")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            caption: obj
                .get("caption")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        });
    }
    media
}

fn extract_quoted_id(message: &serde_json::Value) -> Option<String> {
    let Some(map) = message.as_object() else {
        return None;
    };
    for (key, value) in map {
        if MessageKind::is_metadata_key(key) {
            continue;
        }
        if let Some(stanza) = value.pointer("/contextInfo/stanzaId").and_then(|v| v.as_str()) {
            return Some(stanza.to_string());
        }
    }
    None
}

// ───────────────────────── Adapter ──────────────────────────────────

pub struct WhatsAppAdapter {
    instance_name: String,
    client: EvolutionClient,
    handler: Arc<dyn InboundHandler>,
    events: Arc<dyn InstanceEventSink>,
}

impl WhatsAppAdapter {
    pub fn new(ctx: AdapterContext) -> Result<Self> {
        let cfg = &ctx.config;
        let base_url = cfg
            .evolution_url
            .clone()
            .ok_or_else(|| anyhow!("whatsapp instance '{}' has no evolution_url", cfg.name))?;
        let api_key = cfg
            .evolution_key
            .clone()
            .ok_or_else(|| anyhow!("whatsapp instance '{}' has no evolution_key", cfg.name))?;
        let instance_id = cfg
            .whatsapp_instance_id
            .clone()
            .unwrap_or_else(|| cfg.name.clone());
        Ok(Self {
            instance_name: cfg.name.clone(),
            client: EvolutionClient::new(base_url, api_key, instance_id),
            handler: ctx.handler,
            events: ctx.events,
        })
    }
}

#[async_trait]
impl ChannelAdapter for WhatsAppAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::WhatsApp
    }

    fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Verify the gateway link. Inbound is webhook-driven, so start only
    /// probes the remote state; a gateway that is still pairing is fine.
    async fn start(&self) -> Result<()> {
        match self.client.connection_state().await {
            Ok(state) if state == "open" => {
                self.events.handshake_complete(&self.instance_name).await;
            }
            Ok(state) => {
                tracing::warn!(
                    instance = %self.instance_name,
                    state,
                    "whatsapp gateway not open yet; pair via the qr endpoint"
                );
            }
            Err(e) => return Err(anyhow!("evolution gateway unreachable: {e}")),
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // The remote gateway owns the socket; nothing to tear down here.
        Ok(())
    }

    async fn status(&self) -> Result<AdapterStatus> {
        let state = self
            .client
            .connection_state()
            .await
            .unwrap_or_else(|e| format!("unreachable: {e}"));
        Ok(AdapterStatus {
            native_state: state,
            profile: None,
            identity: None,
        })
    }

    async fn pair(&self) -> Result<PairInfo> {
        let qr = self
            .client
            .connect_qr()
            .await
            .map_err(|e| anyhow!("failed to fetch qr: {e}"))?;
        Ok(PairInfo {
            qr_image: qr,
            invite_url: None,
        })
    }

    async fn send_text(&self, target: &str, text: &str) -> Result<SendOutcome, ChannelError> {
        self.client.send_text(target, text).await
    }

    async fn send_media(
        &self,
        target: &str,
        media: &MediaRef,
    ) -> Result<SendOutcome, ChannelError> {
        self.client.send_media(target, media).await
    }

    async fn send_audio(
        &self,
        target: &str,
        audio_url: &str,
    ) -> Result<SendOutcome, ChannelError> {
        self.client.send_audio(target, audio_url).await
    }

    async fn send_reaction(
        &self,
        target: &str,
        target_message_id: &str,
        emoji: &str,
    ) -> Result<SendOutcome, ChannelError> {
        self.client.send_reaction(target, target_message_id, emoji).await
    }

    fn chunk_limit(&self) -> usize {
        WHATSAPP_CHUNK_LIMIT
    }

    async fn fetch_contacts(&self) -> Result<serde_json::Value> {
        self.client
            .find_contacts()
            .await
            .map_err(|e| anyhow!("contact listing failed: {e}"))
    }

    async fn fetch_chats(&self) -> Result<serde_json::Value> {
        self.client
            .find_chats()
            .await
            .map_err(|e| anyhow!("chat listing failed: {e}"))
    }

    async fn fetch_messages(&self, chat_id: &str, limit: u32) -> Result<serde_json::Value> {
        self.client
            .find_messages(chat_id, limit)
            .await
            .map_err(|e| anyhow!("message listing failed: {e}"))
    }

    /// Normalize and route one webhook body; each message in it yields
    /// one ingest result.
    async fn ingest_webhook(&self, body: &serde_json::Value) -> Result<Vec<Ingest>> {
        let events = parse_webhook(&self.instance_name, body)?;
        let mut results = Vec::with_capacity(events.len());
        for event in events {
            results.push(self.handler.handle_inbound(event).await?);
        }
        Ok(results)
    }
}
