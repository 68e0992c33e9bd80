//! Channel adapter implementations.
//!
//! One module per channel variant; [`DefaultAdapterFactory`] is what the
//! binary hands to the instance registry so adapters are built from tenant
//! config at connect time.

pub mod discord;
pub mod whatsapp;

use std::sync::Arc;

use anyhow::Result;
use omnihub_core::{AdapterContext, AdapterFactory, ChannelAdapter};
use omnihub_schema::ChannelType;

pub struct DefaultAdapterFactory;

impl AdapterFactory for DefaultAdapterFactory {
    fn build(&self, ctx: AdapterContext) -> Result<Arc<dyn ChannelAdapter>> {
        match ctx.config.channel_type {
            ChannelType::WhatsApp => Ok(Arc::new(whatsapp::WhatsAppAdapter::new(ctx)?)),
            ChannelType::Discord => Ok(Arc::new(discord::DiscordAdapter::new(ctx)?)),
        }
    }
}
