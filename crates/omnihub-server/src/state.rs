use std::sync::Arc;

use omnihub_core::{InstanceRegistry, MessageRouter};
use omnihub_store::ConfigStore;

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: ConfigStore,
    pub registry: Arc<InstanceRegistry>,
    pub router: MessageRouter,
    /// Single deployment API key; `None` disables auth (with a warning at
    /// boot). `/health` and `/webhook/*` never require it.
    pub api_key: Option<String>,
}
