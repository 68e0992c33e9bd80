//! Instance registry: the process-wide catalog of running instances.
//!
//! At most one adapter per instance name ever holds the channel
//! connection. Admin operations serialize on a per-instance lock, so a
//! concurrent connect returns the already-running instance and restart is
//! disconnect→connect under the same lock. Config updates hot-reload
//! non-connection fields; credential changes force a restart. The
//! registry never retries on its own — restart is user-initiated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use omnihub_schema::{InstanceConfig, InstancePatch};
use omnihub_store::{ConfigStore, StoreError};
use serde::Serialize;
use tokio::sync::{Mutex as TokioMutex, RwLock as TokioRwLock};
use tokio_util::sync::CancellationToken;

use crate::adapter::{
    AdapterContext, AdapterFactory, AdapterStatus, ChannelAdapter, InboundHandler,
    InstanceEventSink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Unloaded,
    Loading,
    Ready,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Unloaded => "unloaded",
            InstanceState::Loading => "loading",
            InstanceState::Ready => "ready",
            InstanceState::Connecting => "connecting",
            InstanceState::Connected => "connected",
            InstanceState::Disconnecting => "disconnecting",
            InstanceState::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
struct StateInfo {
    state: InstanceState,
    since: DateTime<Utc>,
    last_error: Option<String>,
}

/// A live instance: config snapshot, its adapter, and the cancellation
/// token chained to every router task it spawns.
pub struct RunningInstance {
    pub name: String,
    pub adapter: Arc<dyn ChannelAdapter>,
    pub token: CancellationToken,
    config: StdRwLock<InstanceConfig>,
    state: StdMutex<StateInfo>,
}

impl std::fmt::Debug for RunningInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningInstance")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl RunningInstance {
    fn new(config: InstanceConfig, adapter: Arc<dyn ChannelAdapter>, token: CancellationToken) -> Self {
        Self {
            name: config.name.clone(),
            adapter,
            token,
            config: StdRwLock::new(config),
            state: StdMutex::new(StateInfo {
                state: InstanceState::Loading,
                since: Utc::now(),
                last_error: None,
            }),
        }
    }

    pub fn config(&self) -> InstanceConfig {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn apply_config(&self, cfg: InstanceConfig) {
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = cfg;
    }

    pub fn state(&self) -> (InstanceState, DateTime<Utc>, Option<String>) {
        let info = self.state.lock().unwrap_or_else(|p| p.into_inner());
        (info.state, info.since, info.last_error.clone())
    }

    fn set_state(&self, state: InstanceState, error: Option<String>) {
        let mut info = self.state.lock().unwrap_or_else(|p| p.into_inner());
        info.state = state;
        info.since = Utc::now();
        if error.is_some() {
            info.last_error = error;
        }
        tracing::debug!(instance = %self.name, state = state.as_str(), "instance state transition");
    }
}

/// Public status view served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatusView {
    pub name: String,
    pub state: InstanceState,
    pub last_state_transition: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native: Option<AdapterStatus>,
}

pub struct InstanceRegistry {
    store: ConfigStore,
    factory: Arc<dyn AdapterFactory>,
    running: TokioRwLock<HashMap<String, Arc<RunningInstance>>>,
    op_locks: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
    handler: StdRwLock<Option<Arc<dyn InboundHandler>>>,
    last_errors: StdMutex<HashMap<String, String>>,
    root_token: CancellationToken,
}

impl InstanceRegistry {
    pub fn new(store: ConfigStore, factory: Arc<dyn AdapterFactory>) -> Self {
        Self {
            store,
            factory,
            running: TokioRwLock::new(HashMap::new()),
            op_locks: StdMutex::new(HashMap::new()),
            handler: StdRwLock::new(None),
            last_errors: StdMutex::new(HashMap::new()),
            root_token: CancellationToken::new(),
        }
    }

    /// Wire the inbound handler (the router). Must happen before any
    /// connect.
    pub fn set_handler(&self, handler: Arc<dyn InboundHandler>) {
        *self.handler.write().unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn root_token(&self) -> CancellationToken {
        self.root_token.clone()
    }

    fn op_lock(&self, name: &str) -> Arc<TokioMutex<()>> {
        let mut locks = self.op_locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone()
    }

    fn record_error(&self, name: &str, error: &str) {
        let mut errors = self.last_errors.lock().unwrap_or_else(|p| p.into_inner());
        errors.insert(name.to_string(), error.to_string());
    }

    fn clear_error(&self, name: &str) {
        let mut errors = self.last_errors.lock().unwrap_or_else(|p| p.into_inner());
        errors.remove(name);
    }

    // ───────────────────────── Config CRUD ───────────────────────

    pub async fn create(&self, cfg: InstanceConfig) -> omnihub_store::Result<InstanceConfig> {
        self.store.create_instance(cfg).await
    }

    /// Apply a partial update. Non-connection fields hot-reload into the
    /// running instance; credential changes force a restart.
    pub async fn update(
        self: &Arc<Self>,
        name: &str,
        patch: InstancePatch,
    ) -> omnihub_store::Result<InstanceConfig> {
        let current = self
            .store
            .get_instance(name)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("instance '{name}'")))?;
        let mut updated = current.clone();
        patch.apply(&mut updated);
        let updated = self.store.update_instance(updated).await?;

        let running = self.running.read().await.get(name).cloned();
        if let Some(running) = running {
            if current.connection_fields_changed(&updated) {
                tracing::info!(instance = name, "credentials changed, restarting instance");
                if let Err(e) = self.restart(name).await {
                    tracing::error!(instance = name, error = %e, "restart after update failed");
                    self.record_error(name, &e.to_string());
                    running.set_state(InstanceState::Error, Some(e.to_string()));
                }
            } else {
                running.apply_config(updated.clone());
            }
        }
        Ok(updated)
    }

    /// Delete an instance, disconnecting it first. The store refuses to
    /// drop the sole remaining instance.
    pub async fn delete(self: &Arc<Self>, name: &str) -> omnihub_store::Result<()> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;
        self.disconnect_locked(name).await;
        self.store.delete_instance(name).await
    }

    /// Effective config: the running snapshot when connected (it carries
    /// hot-reloaded fields), else the stored row.
    pub async fn config(&self, name: &str) -> omnihub_store::Result<Option<InstanceConfig>> {
        if let Some(running) = self.running.read().await.get(name) {
            return Ok(Some(running.config()));
        }
        self.store.get_instance(name).await
    }

    // ───────────────────────── Lifecycle ─────────────────────────

    pub async fn connect(self: &Arc<Self>, name: &str) -> Result<Arc<RunningInstance>> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;
        self.connect_locked(name).await
    }

    async fn connect_locked(self: &Arc<Self>, name: &str) -> Result<Arc<RunningInstance>> {
        if let Some(existing) = self.running.read().await.get(name) {
            return Ok(existing.clone());
        }

        let cfg = self
            .store
            .get_instance(name)
            .await
            .map_err(|e| anyhow!(e.to_string()))?
            .ok_or_else(|| anyhow!("instance '{name}' not found"))?;
        if !cfg.is_active {
            bail!("instance '{name}' is not active");
        }

        let handler = self
            .handler
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .context("registry has no inbound handler wired")?;

        let token = self.root_token.child_token();
        let adapter = self.factory.build(AdapterContext {
            config: cfg.clone(),
            handler,
            events: self.clone() as Arc<dyn InstanceEventSink>,
            token: token.clone(),
        })?;

        let running = Arc::new(RunningInstance::new(cfg, adapter.clone(), token));
        self.running
            .write()
            .await
            .insert(name.to_string(), running.clone());

        running.set_state(InstanceState::Connecting, None);
        match adapter.start().await {
            Ok(()) => {
                self.clear_error(name);
                tracing::info!(instance = name, "instance adapter started");
                Ok(running)
            }
            Err(e) => {
                self.running.write().await.remove(name);
                running.token.cancel();
                self.record_error(name, &e.to_string());
                Err(e).with_context(|| format!("failed to start instance '{name}'"))
            }
        }
    }

    pub async fn disconnect(&self, name: &str) -> bool {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;
        self.disconnect_locked(name).await
    }

    async fn disconnect_locked(&self, name: &str) -> bool {
        let Some(running) = self.running.write().await.remove(name) else {
            return false;
        };
        running.set_state(InstanceState::Disconnecting, None);
        if let Err(e) = running.adapter.stop().await {
            tracing::warn!(instance = name, error = %e, "adapter stop failed");
        }
        running.token.cancel();
        running.set_state(InstanceState::Unloaded, None);
        self.clear_error(name);
        true
    }

    pub async fn restart(self: &Arc<Self>, name: &str) -> Result<Arc<RunningInstance>> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;
        self.disconnect_locked(name).await;
        self.connect_locked(name).await
    }

    // ───────────────────────── Introspection ─────────────────────

    pub async fn adapter(&self, name: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.running.read().await.get(name).map(|r| r.adapter.clone())
    }

    pub async fn running_instance(&self, name: &str) -> Option<Arc<RunningInstance>> {
        self.running.read().await.get(name).cloned()
    }

    pub async fn instance_token(&self, name: &str) -> Option<CancellationToken> {
        self.running.read().await.get(name).map(|r| r.token.clone())
    }

    pub async fn status(&self, name: &str) -> omnihub_store::Result<InstanceStatusView> {
        if let Some(running) = self.running.read().await.get(name) {
            let (state, since, last_error) = running.state();
            let native = running.adapter.status().await.ok();
            return Ok(InstanceStatusView {
                name: name.to_string(),
                state,
                last_state_transition: since,
                last_error,
                native,
            });
        }
        let cfg = self
            .store
            .get_instance(name)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("instance '{name}'")))?;
        let last_error = self
            .last_errors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned();
        Ok(InstanceStatusView {
            name: cfg.name,
            state: if last_error.is_some() {
                InstanceState::Error
            } else {
                InstanceState::Unloaded
            },
            last_state_transition: cfg.updated_at,
            last_error,
            native: None,
        })
    }

    /// Connect every active instance; used at boot. Failures are recorded
    /// per instance, never fatal.
    pub async fn connect_active(self: &Arc<Self>) {
        let instances = match self.store.list_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                tracing::error!(error = %e, "failed to list instances at boot");
                return;
            }
        };
        for cfg in instances.into_iter().filter(|c| c.is_active) {
            if let Err(e) = self.connect(&cfg.name).await {
                tracing::warn!(instance = %cfg.name, error = %e, "boot connect failed");
            }
        }
    }

    /// Tear everything down: cancel in-flight router tasks and stop every
    /// adapter.
    pub async fn shutdown(&self) {
        self.root_token.cancel();
        let drained: Vec<_> = self.running.write().await.drain().collect();
        for (name, running) in drained {
            running.set_state(InstanceState::Disconnecting, None);
            if let Err(e) = running.adapter.stop().await {
                tracing::warn!(instance = %name, error = %e, "adapter stop failed during shutdown");
            }
        }
    }
}

#[async_trait]
impl InstanceEventSink for InstanceRegistry {
    async fn handshake_complete(&self, instance: &str) {
        if let Some(running) = self.running.read().await.get(instance) {
            running.set_state(InstanceState::Connected, None);
        }
    }

    async fn connection_lost(&self, instance: &str, error: Option<String>) {
        self.record_error(instance, error.as_deref().unwrap_or("connection lost"));
        if let Some(running) = self.running.read().await.get(instance) {
            running.set_state(InstanceState::Error, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ChannelError, Ingest, PairInfo, SendOutcome};
    use omnihub_schema::{ChannelType, InboundEvent, MediaRef};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    struct NoopHandler;

    #[async_trait]
    impl InboundHandler for NoopHandler {
        async fn handle_inbound(&self, _event: InboundEvent) -> Result<Ingest> {
            bail!("not under test")
        }
    }

    struct TestAdapter {
        name: String,
        starts: AtomicU32,
        stops: AtomicU32,
        fail_start: bool,
    }

    #[async_trait]
    impl ChannelAdapter for TestAdapter {
        fn channel_type(&self) -> ChannelType {
            ChannelType::WhatsApp
        }
        fn instance_name(&self) -> &str {
            &self.name
        }
        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                bail!("gateway unreachable")
            }
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn status(&self) -> Result<AdapterStatus> {
            Ok(AdapterStatus {
                native_state: "open".into(),
                profile: None,
                identity: None,
            })
        }
        async fn pair(&self) -> Result<PairInfo> {
            Ok(PairInfo::default())
        }
        async fn send_text(&self, _t: &str, _x: &str) -> Result<SendOutcome, ChannelError> {
            Ok(SendOutcome::default())
        }
        async fn send_media(&self, _t: &str, _m: &MediaRef) -> Result<SendOutcome, ChannelError> {
            Ok(SendOutcome::default())
        }
        async fn send_audio(&self, _t: &str, _u: &str) -> Result<SendOutcome, ChannelError> {
            Ok(SendOutcome::default())
        }
        async fn send_reaction(
            &self,
            _t: &str,
            _m: &str,
            _e: &str,
        ) -> Result<SendOutcome, ChannelError> {
            Ok(SendOutcome::default())
        }
    }

    struct TestFactory {
        built: AtomicUsize,
        fail_start: bool,
    }

    impl AdapterFactory for TestFactory {
        fn build(&self, ctx: AdapterContext) -> Result<Arc<dyn ChannelAdapter>> {
            self.built.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(TestAdapter {
                name: ctx.config.name,
                starts: AtomicU32::new(0),
                stops: AtomicU32::new(0),
                fail_start: self.fail_start,
            }))
        }
    }

    fn instance(name: &str) -> InstanceConfig {
        InstanceConfig {
            name: name.into(),
            channel_type: ChannelType::WhatsApp,
            evolution_url: Some("http://gw".into()),
            evolution_key: Some("key".into()),
            whatsapp_instance_id: Some(name.into()),
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
            session_id_prefix: None,
            error_fallback_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn registry(fail_start: bool) -> (Arc<InstanceRegistry>, Arc<TestFactory>) {
        let store = ConfigStore::open_in_memory().unwrap();
        let factory = Arc::new(TestFactory {
            built: AtomicUsize::new(0),
            fail_start,
        });
        let registry = Arc::new(InstanceRegistry::new(store, factory.clone()));
        registry.set_handler(Arc::new(NoopHandler));
        (registry, factory)
    }

    #[tokio::test]
    async fn connect_then_duplicate_returns_existing() {
        let (registry, factory) = registry(false).await;
        registry.create(instance("prod-wa")).await.unwrap();

        let first = registry.connect("prod-wa").await.unwrap();
        let second = registry.connect("prod-wa").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_unknown_instance_fails() {
        let (registry, _) = registry(false).await;
        let err = registry.connect("ghost").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn connect_inactive_instance_fails() {
        let (registry, _) = registry(false).await;
        let mut cfg = instance("prod-wa");
        cfg.is_active = false;
        registry.create(cfg).await.unwrap();
        let err = registry.connect("prod-wa").await.unwrap_err();
        assert!(err.to_string().contains("not active"));
    }

    #[tokio::test]
    async fn failed_start_leaves_error_status() {
        let (registry, _) = registry(true).await;
        registry.create(instance("prod-wa")).await.unwrap();
        assert!(registry.connect("prod-wa").await.is_err());
        assert!(registry.adapter("prod-wa").await.is_none());

        let status = registry.status("prod-wa").await.unwrap();
        assert_eq!(status.state, InstanceState::Error);
        assert!(status.last_error.unwrap().contains("gateway unreachable"));
    }

    #[tokio::test]
    async fn restart_rebuilds_adapter() {
        let (registry, factory) = registry(false).await;
        registry.create(instance("prod-wa")).await.unwrap();
        registry.connect("prod-wa").await.unwrap();
        registry.restart("prod-wa").await.unwrap();
        assert_eq!(factory.built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn hot_reload_keeps_adapter_credential_change_restarts() {
        let (registry, factory) = registry(false).await;
        registry.create(instance("prod-wa")).await.unwrap();
        registry.connect("prod-wa").await.unwrap();

        // Agent timeout is hot-reloadable.
        registry
            .update(
                "prod-wa",
                InstancePatch {
                    agent_timeout_ms: Some(5_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(factory.built.load(Ordering::SeqCst), 1);
        let running = registry.running_instance("prod-wa").await.unwrap();
        assert_eq!(running.config().agent_timeout_ms, 5_000);

        // Rotating the gateway key forces a restart.
        registry
            .update(
                "prod-wa",
                InstancePatch {
                    evolution_key: Some("rotated".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(factory.built.load(Ordering::SeqCst), 2);
        assert_eq!(
            registry
                .running_instance("prod-wa")
                .await
                .unwrap()
                .config()
                .evolution_key
                .as_deref(),
            Some("rotated")
        );
    }

    #[tokio::test]
    async fn disconnect_cancels_token_and_removes() {
        let (registry, _) = registry(false).await;
        registry.create(instance("prod-wa")).await.unwrap();
        let running = registry.connect("prod-wa").await.unwrap();
        assert!(!running.token.is_cancelled());

        assert!(registry.disconnect("prod-wa").await);
        assert!(running.token.is_cancelled());
        assert!(registry.adapter("prod-wa").await.is_none());
        assert!(!registry.disconnect("prod-wa").await);
    }

    #[tokio::test]
    async fn delete_refuses_last_instance() {
        let (registry, _) = registry(false).await;
        registry.create(instance("only")).await.unwrap();
        let err = registry.delete("only").await.unwrap_err();
        assert!(matches!(err, StoreError::LastInstance));
    }

    #[tokio::test]
    async fn sink_events_drive_state() {
        let (registry, _) = registry(false).await;
        registry.create(instance("prod-wa")).await.unwrap();
        let running = registry.connect("prod-wa").await.unwrap();
        assert_eq!(running.state().0, InstanceState::Connecting);

        registry.handshake_complete("prod-wa").await;
        assert_eq!(running.state().0, InstanceState::Connected);

        registry
            .connection_lost("prod-wa", Some("socket closed".into()))
            .await;
        let (state, _, error) = running.state();
        assert_eq!(state, InstanceState::Error);
        assert_eq!(error.as_deref(), Some("socket closed"));
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let (registry, _) = registry(false).await;
        registry.create(instance("a")).await.unwrap();
        registry.create(instance("b")).await.unwrap();
        let a = registry.connect("a").await.unwrap();
        let b = registry.connect("b").await.unwrap();

        registry.shutdown().await;
        assert!(a.token.is_cancelled());
        assert!(b.token.is_cancelled());
        assert!(registry.adapter("a").await.is_none());
        assert!(registry.root_token().is_cancelled());
    }

    #[tokio::test]
    async fn status_of_unloaded_instance() {
        let (registry, _) = registry(false).await;
        registry.create(instance("prod-wa")).await.unwrap();
        let status = registry.status("prod-wa").await.unwrap();
        assert_eq!(status.state, InstanceState::Unloaded);
        assert!(status.native.is_none());

        let err = registry.status("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
