//! Discord channel via the serenity gateway.
//!
//! Inbound scope is deliberately narrow: direct messages and explicit
//! mentions of the bot. Guild messages can additionally be restricted to
//! one guild via the instance's `discord_guild_id`. The adapter owns the
//! gateway client task and is the sole writer of its connection.

use std::sync::Arc;

use anyhow::{anyhow, Context as AnyhowContext, Result};
use omnihub_core::{
    AdapterContext, AdapterStatus, ChannelAdapter, ChannelError, InboundHandler, InstanceEventSink,
    PairInfo, SendOutcome,
};
use omnihub_schema::{ChannelType, InboundEvent, MediaKind, MediaRef, MessageKind};
use serenity::all::{
    ChannelId, Client, Context, EventHandler, GatewayIntents, Http, Message, MessageId,
    ReactionType, Ready,
};
use tokio::sync::{Mutex as TokioMutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Discord caps messages at 2,000 characters; stay under it.
pub const DISCORD_CHUNK_LIMIT: usize = 1_900;

#[derive(Clone)]
struct BotIdentity {
    user_id: u64,
    name: String,
    application_id: Option<u64>,
}

#[derive(Default)]
struct SharedState {
    http: RwLock<Option<Arc<Http>>>,
    bot: RwLock<Option<BotIdentity>>,
}

struct RunHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

pub struct DiscordAdapter {
    instance_name: String,
    bot_token: String,
    guild_filter: Option<String>,
    handler: Arc<dyn InboundHandler>,
    events: Arc<dyn InstanceEventSink>,
    /// Instance lifecycle token from the registry; the gateway task is
    /// chained to it so disconnect and shutdown tear the gateway down
    /// even without an explicit `stop`.
    instance_token: CancellationToken,
    shared: Arc<SharedState>,
    run: TokioMutex<Option<RunHandle>>,
}

impl DiscordAdapter {
    pub fn new(ctx: AdapterContext) -> Result<Self> {
        let cfg = &ctx.config;
        let bot_token = cfg
            .discord_bot_token
            .clone()
            .ok_or_else(|| anyhow!("discord instance '{}' has no discord_bot_token", cfg.name))?;
        Ok(Self {
            instance_name: cfg.name.clone(),
            bot_token,
            guild_filter: cfg.discord_guild_id.clone(),
            handler: ctx.handler,
            events: ctx.events,
            instance_token: ctx.token,
            shared: Arc::new(SharedState::default()),
            run: TokioMutex::new(None),
        })
    }

    async fn http(&self) -> Result<Arc<Http>, ChannelError> {
        self.shared
            .http
            .read()
            .await
            .clone()
            .ok_or_else(|| ChannelError::NotConnected("discord gateway not ready".into()))
    }

    fn parse_channel(target: &str) -> Result<ChannelId, ChannelError> {
        let id: u64 = target
            .parse()
            .map_err(|_| ChannelError::Rejected(format!("invalid discord channel id: {target}")))?;
        if id == 0 {
            return Err(ChannelError::Rejected("discord channel id is zero".into()));
        }
        Ok(ChannelId::new(id))
    }

    fn map_send_error(e: serenity::Error) -> ChannelError {
        match &e {
            serenity::Error::Http(_) => ChannelError::Transport(e.to_string()),
            _ => ChannelError::Rejected(e.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for DiscordAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Discord
    }

    fn instance_name(&self) -> &str {
        &self.instance_name
    }

    async fn start(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return Ok(());
        }

        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        let handler = DiscordEventHandler {
            instance_name: self.instance_name.clone(),
            guild_filter: self.guild_filter.clone(),
            handler: self.handler.clone(),
            events: self.events.clone(),
            shared: self.shared.clone(),
        };

        let mut client = Client::builder(&self.bot_token, intents)
            .event_handler(handler)
            .await
            .context("failed to build discord client")?;

        let shard_manager = client.shard_manager.clone();
        // Stop token for `stop`/`restart`; the instance token covers
        // registry disconnect and process shutdown.
        let stop = CancellationToken::new();
        let stop_for_task = stop.clone();
        let instance_token = self.instance_token.clone();
        let events = self.events.clone();
        let instance_name = self.instance_name.clone();

        let task = tokio::spawn(async move {
            tokio::select! {
                result = client.start() => {
                    if let Err(e) = result {
                        tracing::error!(instance = %instance_name, error = %e, "discord gateway exited");
                        events.connection_lost(&instance_name, Some(e.to_string())).await;
                    }
                }
                _ = stop_for_task.cancelled() => {
                    shard_manager.shutdown_all().await;
                }
                _ = instance_token.cancelled() => {
                    shard_manager.shutdown_all().await;
                }
            }
        });

        *run = Some(RunHandle { stop, task });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(run) = self.run.lock().await.take() else {
            return Ok(());
        };
        run.stop.cancel();
        let _ = run.task.await;
        *self.shared.http.write().await = None;
        *self.shared.bot.write().await = None;
        Ok(())
    }

    async fn status(&self) -> Result<AdapterStatus> {
        let bot = self.shared.bot.read().await.clone();
        Ok(AdapterStatus {
            native_state: if bot.is_some() {
                "connected".into()
            } else {
                "disconnected".into()
            },
            profile: None,
            identity: bot.map(|b| b.name),
        })
    }

    async fn pair(&self) -> Result<PairInfo> {
        let bot = self.shared.bot.read().await.clone();
        let invite_url = bot.and_then(|b| b.application_id).map(|id| {
            format!(
                "https://discord.com/api/oauth2/authorize?client_id={id}&permissions=3072&scope=bot"
            )
        });
        Ok(PairInfo {
            qr_image: None,
            invite_url,
        })
    }

    async fn send_text(&self, target: &str, text: &str) -> Result<SendOutcome, ChannelError> {
        let http = self.http().await?;
        let channel = Self::parse_channel(target)?;
        let message = channel
            .say(http.as_ref(), text)
            .await
            .map_err(Self::map_send_error)?;
        Ok(SendOutcome {
            message_id: Some(message.id.to_string()),
        })
    }

    async fn send_media(
        &self,
        target: &str,
        media: &MediaRef,
    ) -> Result<SendOutcome, ChannelError> {
        // Media travels by reference; Discord unfurls the URL client-side.
        let content = match &media.caption {
            Some(caption) => format!("{caption}\n{}", media.url),
            None => media.url.clone(),
        };
        self.send_text(target, &content).await
    }

    async fn send_audio(
        &self,
        target: &str,
        audio_url: &str,
    ) -> Result<SendOutcome, ChannelError> {
        self.send_text(target, audio_url).await
    }

    async fn send_reaction(
        &self,
        target: &str,
        target_message_id: &str,
        emoji: &str,
    ) -> Result<SendOutcome, ChannelError> {
        let http = self.http().await?;
        let channel = Self::parse_channel(target)?;
        let message_id: u64 = target_message_id
            .parse()
            .map_err(|_| ChannelError::Rejected(format!("invalid message id: {target_message_id}")))?;
        if message_id == 0 {
            return Err(ChannelError::Rejected("discord message id is zero".into()));
        }
        http.create_reaction(
            channel,
            MessageId::new(message_id),
            &ReactionType::Unicode(emoji.to_string()),
        )
        .await
        .map_err(Self::map_send_error)?;
        Ok(SendOutcome { message_id: None })
    }

    fn chunk_limit(&self) -> usize {
        DISCORD_CHUNK_LIMIT
    }
}

struct DiscordEventHandler {
    instance_name: String,
    guild_filter: Option<String>,
    handler: Arc<dyn InboundHandler>,
    events: Arc<dyn InstanceEventSink>,
    shared: Arc<SharedState>,
}

#[serenity::async_trait]
impl EventHandler for DiscordEventHandler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!(
            instance = %self.instance_name,
            bot = %ready.user.name,
            "discord gateway ready"
        );
        *self.shared.http.write().await = Some(ctx.http.clone());
        *self.shared.bot.write().await = Some(BotIdentity {
            user_id: ready.user.id.get(),
            name: ready.user.name.clone(),
            application_id: Some(ready.application.id.get()),
        });
        self.events.handshake_complete(&self.instance_name).await;
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let bot_id = self.shared.bot.read().await.as_ref().map(|b| b.user_id);
        let is_dm = msg.guild_id.is_none();
        let mentioned = bot_id.is_some_and(|id| msg.mentions_user_id(id));
        if !is_dm && !mentioned {
            return;
        }
        if let (Some(filter), Some(guild_id)) = (&self.guild_filter, msg.guild_id) {
            if guild_id.get().to_string() != *filter {
                return;
            }
        }

        let attachments: Vec<(String, Option<String>, Option<String>)> = msg
            .attachments
            .iter()
            .map(|a| {
                (
                    a.url.clone(),
                    a.content_type.clone(),
                    Some(a.filename.clone()),
                )
            })
            .collect();

        let event = build_inbound(
            &self.instance_name,
            msg.id.get(),
            msg.author.id.get(),
            &msg.author.name,
            msg.channel_id.get(),
            msg.guild_id.map(|g| g.get()),
            &msg.content,
            &attachments,
            bot_id,
        );

        if let Err(e) = self.handler.handle_inbound(event).await {
            tracing::error!(
                instance = %self.instance_name,
                error = %e,
                "failed to route discord message"
            );
        }
    }
}

fn media_kind_for_mime(mime: Option<&str>) -> MediaKind {
    match mime.unwrap_or("") {
        m if m.starts_with("image/") => MediaKind::Image,
        m if m.starts_with("video/") => MediaKind::Video,
        m if m.starts_with("audio/") => MediaKind::Audio,
        _ => MediaKind::Document,
    }
}

fn kind_for_media(kind: MediaKind) -> MessageKind {
    match kind {
        MediaKind::Image => MessageKind::Image,
        MediaKind::Video => MessageKind::Video,
        MediaKind::Audio => MessageKind::Audio,
        MediaKind::Document => MessageKind::Document,
        MediaKind::Sticker => MessageKind::Sticker,
    }
}

/// Strip `<@id>` / `<@!id>` mention tokens for the bot itself.
fn strip_bot_mention(content: &str, bot_id: Option<u64>) -> String {
    let Some(id) = bot_id else {
        return content.trim().to_string();
    };
    content
        .replace(&format!("<@{id}>"), "")
        .replace(&format!("<@!{id}>"), "")
        .trim()
        .to_string()
}

/// Build the normalized event for one Discord message. Pure so the
/// normalization is testable without a gateway.
#[allow(clippy::too_many_arguments)]
pub fn build_inbound(
    instance_name: &str,
    message_id: u64,
    author_id: u64,
    author_name: &str,
    channel_id: u64,
    guild_id: Option<u64>,
    content: &str,
    attachments: &[(String, Option<String>, Option<String>)],
    bot_id: Option<u64>,
) -> InboundEvent {
    let media: Vec<MediaRef> = attachments
        .iter()
        .map(|(url, mime, filename)| MediaRef {
            kind: media_kind_for_mime(mime.as_deref()),
            url: url.clone(),
            mime_type: mime.clone(),
            file_name: filename.clone(),
            caption: None,
        })
        .collect();

    let text = strip_bot_mention(content, bot_id);
    let kind = match media.first() {
        Some(first) if text.is_empty() => kind_for_media(first.kind),
        _ => MessageKind::Text,
    };

    InboundEvent {
        channel_type: ChannelType::Discord,
        instance_name: instance_name.to_string(),
        channel_message_id: message_id.to_string(),
        from_peer: author_id.to_string(),
        chat_target: channel_id.to_string(),
        peer_display_name: Some(author_name.to_string()),
        sender_phone: None,
        text: if text.is_empty() { None } else { Some(text) },
        media,
        quoted_message_id: None,
        kind,
        guild_id: guild_id.map(|g| g.to_string()),
        timestamp_source: None,
        raw_payload: serde_json::json!({
            "message_id": message_id.to_string(),
            "author_id": author_id.to_string(),
            "author_name": author_name,
            "channel_id": channel_id.to_string(),
            "guild_id": guild_id.map(|g| g.to_string()),
            "content": content,
            "attachments": attachments.len(),
        }),
    }
}
