//! Identity resolution: channel-native ids to stable internal users.

use omnihub_schema::{ChannelType, InboundEvent, User};
use omnihub_store::ConfigStore;

#[derive(Clone)]
pub struct IdentityResolver {
    store: ConfigStore,
}

impl IdentityResolver {
    pub fn new(store: ConfigStore) -> Self {
        Self { store }
    }

    /// Resolve `(provider, external_id)` to its user, creating user and
    /// link row on first contact. The store makes the insert race-safe.
    pub async fn resolve(
        &self,
        provider: &str,
        external_id: &str,
        display_hint: Option<String>,
        extra: Option<serde_json::Value>,
    ) -> omnihub_store::Result<User> {
        let (user, created) = self
            .store
            .resolve_or_create_user(provider, external_id, display_hint, extra)
            .await?;
        if created {
            tracing::info!(provider, external_id, user_id = %user.id, "created user on first contact");
        }
        Ok(user)
    }

    /// Resolve the sender of a normalized inbound event. WhatsApp links by
    /// phone, Discord by user id (with the guild recorded as link extra).
    pub async fn resolve_event(&self, event: &InboundEvent) -> omnihub_store::Result<User> {
        let external_id = match event.channel_type {
            ChannelType::WhatsApp => event
                .sender_phone
                .clone()
                .unwrap_or_else(|| event.from_peer.clone()),
            ChannelType::Discord => event.from_peer.clone(),
        };
        let extra = event
            .guild_id
            .as_ref()
            .map(|guild| serde_json::json!({ "guild_id": guild }));
        self.resolve(
            event.channel_type.as_str(),
            &external_id,
            event.peer_display_name.clone(),
            extra,
        )
        .await
    }
}
