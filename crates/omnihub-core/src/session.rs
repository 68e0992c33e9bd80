//! Session key derivation.
//!
//! A session key is the agent's conversation identifier: a pure,
//! deterministic function of the instance config and the peer, stable for
//! the life of the conversation and free of secrets.

use omnihub_schema::{ChannelType, InboundEvent, InstanceConfig};
use uuid::Uuid;

pub fn derive_session_key(cfg: &InstanceConfig, event: &InboundEvent, user_id: Uuid) -> String {
    match event.channel_type {
        ChannelType::WhatsApp => match cfg.session_id_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}{user_id}"),
            _ => event.from_peer.clone(),
        },
        ChannelType::Discord => match event.guild_id.as_deref() {
            Some(guild) => format!("discord_{guild}_{}", event.from_peer),
            None => format!("discord_dm_{}", event.from_peer),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use omnihub_schema::MessageKind;

    fn instance(prefix: Option<&str>) -> InstanceConfig {
        InstanceConfig {
            name: "prod-wa".into(),
            channel_type: ChannelType::WhatsApp,
            evolution_url: Some("http://gw".into()),
            evolution_key: Some("k".into()),
            whatsapp_instance_id: None,
            discord_bot_token: None,
            discord_guild_id: None,
            agent_api_url: "http://agent".into(),
            agent_api_key: None,
            agent_id: "default".into(),
            agent_timeout_ms: 60_000,
            agent_stream_mode: false,
            is_default: false,
            is_active: true,
            enable_auto_split: true,
            session_id_prefix: prefix.map(str::to_owned),
            error_fallback_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn event(channel: ChannelType, peer: &str, guild: Option<&str>) -> InboundEvent {
        InboundEvent {
            channel_type: channel,
            instance_name: "prod-wa".into(),
            channel_message_id: "1".into(),
            from_peer: peer.into(),
            chat_target: peer.into(),
            peer_display_name: None,
            sender_phone: None,
            text: None,
            media: vec![],
            quoted_message_id: None,
            kind: MessageKind::Text,
            guild_id: guild.map(str::to_owned),
            timestamp_source: None,
            raw_payload: serde_json::json!({}),
        }
    }

    #[test]
    fn whatsapp_uses_prefix_and_user_id() {
        let user = Uuid::new_v4();
        let key = derive_session_key(
            &instance(Some("omni_")),
            &event(ChannelType::WhatsApp, "5511990000101@s.whatsapp.net", None),
            user,
        );
        assert_eq!(key, format!("omni_{user}"));
    }

    #[test]
    fn whatsapp_without_prefix_falls_back_to_jid() {
        let key = derive_session_key(
            &instance(None),
            &event(ChannelType::WhatsApp, "5511990000101@s.whatsapp.net", None),
            Uuid::new_v4(),
        );
        assert_eq!(key, "5511990000101@s.whatsapp.net");

        let empty = derive_session_key(
            &instance(Some("")),
            &event(ChannelType::WhatsApp, "5511990000101@s.whatsapp.net", None),
            Uuid::new_v4(),
        );
        assert_eq!(empty, "5511990000101@s.whatsapp.net");
    }

    #[test]
    fn discord_guild_and_dm_shapes() {
        let guild_key = derive_session_key(
            &instance(None),
            &event(ChannelType::Discord, "U123", Some("G9")),
            Uuid::new_v4(),
        );
        assert_eq!(guild_key, "discord_G9_U123");

        let dm_key = derive_session_key(
            &instance(None),
            &event(ChannelType::Discord, "U123", None),
            Uuid::new_v4(),
        );
        assert_eq!(dm_key, "discord_dm_U123");
    }

    #[test]
    fn derivation_is_deterministic() {
        let user = Uuid::new_v4();
        let cfg = instance(Some("omni_"));
        let ev = event(ChannelType::WhatsApp, "5511990000101@s.whatsapp.net", None);
        assert_eq!(
            derive_session_key(&cfg, &ev, user),
            derive_session_key(&cfg, &ev, user)
        );
    }
}
