//! The message router: one state machine per inbound event.
//!
//! Received → AdmissionChecked → Identified → AgentInFlight → Delivering →
//! Terminal. Every stage writes trace state; errors become trace state too
//! and are never propagated back to the channel adapter. Ordering is FIFO
//! per peer within an instance via bounded per-session queues; a full
//! queue drops the event with a failed/overloaded trace rather than
//! silently discarding it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use omnihub_agent::{
    AgentClient, AgentError, AgentReply, AgentRequest, HttpAgentClient, StreamCollector,
};
use omnihub_schema::{InboundEvent, InstanceConfig, TraceStage, TraceStatus};
use omnihub_store::ConfigStore;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::access::AccessControl;
use crate::adapter::{InboundHandler, Ingest, IngestOutcome};
use crate::delivery::{deliver, DeliveryOptions};
use crate::identity::IdentityResolver;
use crate::registry::InstanceRegistry;
use crate::session::derive_session_key;
use crate::trace::TraceRecorder;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// TTL of the per-instance webhook dedup window.
    pub dedup_ttl: Duration,
    /// Bounded backlog per (instance, peer) session queue.
    pub session_queue_capacity: usize,
    pub delivery: DeliveryOptions,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dedup_ttl: Duration::from_secs(10),
            session_queue_capacity: 64,
            delivery: DeliveryOptions::default(),
        }
    }
}

/// Builds the agent client for an instance; swapped out in tests.
pub trait AgentClientFactory: Send + Sync {
    fn client_for(&self, cfg: &InstanceConfig) -> Arc<dyn AgentClient>;
}

pub struct HttpAgentFactory;

impl AgentClientFactory for HttpAgentFactory {
    fn client_for(&self, cfg: &InstanceConfig) -> Arc<dyn AgentClient> {
        Arc::new(HttpAgentClient::from_instance(cfg))
    }
}

struct Job {
    event: InboundEvent,
    trace_id: Uuid,
    config: InstanceConfig,
    started: Instant,
}

struct RouterInner {
    recorder: TraceRecorder,
    access: AccessControl,
    identity: IdentityResolver,
    registry: Arc<InstanceRegistry>,
    agents: Arc<dyn AgentClientFactory>,
    dedup: crate::dedup::DedupCache,
    queues: TokioMutex<HashMap<String, mpsc::Sender<Job>>>,
    config: RouterConfig,
}

#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

impl MessageRouter {
    pub fn new(
        store: ConfigStore,
        registry: Arc<InstanceRegistry>,
        agents: Arc<dyn AgentClientFactory>,
        config: RouterConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                recorder: TraceRecorder::new(store.clone()),
                access: AccessControl::new(store.clone()),
                identity: IdentityResolver::new(store),
                registry,
                agents,
                dedup: crate::dedup::DedupCache::new(config.dedup_ttl),
                queues: TokioMutex::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Intake boundary. Opens the trace, applies dedup, and enqueues the
    /// event on its per-peer FIFO queue. Returns quickly; the pipeline
    /// itself runs on the queue worker.
    pub async fn handle_event(&self, event: InboundEvent) -> Result<Ingest> {
        let cfg = self
            .inner
            .registry
            .config(&event.instance_name)
            .await
            .map_err(|e| anyhow!(e.to_string()))?
            .ok_or_else(|| anyhow!("unknown instance '{}'", event.instance_name))?;
        if !cfg.is_active {
            bail!("instance '{}' is not active", event.instance_name);
        }

        if let Some(existing) = self
            .inner
            .dedup
            .check(&event.instance_name, &event.channel_message_id)
        {
            tracing::debug!(
                instance = %event.instance_name,
                message_id = %event.channel_message_id,
                trace_id = %existing,
                "duplicate delivery suppressed"
            );
            return Ok(Ingest {
                trace_id: existing,
                outcome: IngestOutcome::Duplicate,
            });
        }

        let trace_id = self.inner.recorder.open(&event).await;
        self.inner
            .dedup
            .register(&event.instance_name, &event.channel_message_id, trace_id);

        let job = Job {
            event,
            trace_id,
            config: cfg,
            started: Instant::now(),
        };
        match self.enqueue(job).await {
            Ok(()) => Ok(Ingest {
                trace_id,
                outcome: IngestOutcome::Accepted,
            }),
            Err(job) => {
                tracing::warn!(
                    instance = %job.event.instance_name,
                    peer = %job.event.from_peer,
                    "session queue full, dropping event"
                );
                self.inner
                    .recorder
                    .finalize(
                        trace_id,
                        TraceStatus::Failed,
                        Some("session queue full".into()),
                        Some("overloaded".into()),
                        None,
                        Some(job.started.elapsed().as_millis() as i64),
                        false,
                        false,
                    )
                    .await;
                Ok(Ingest {
                    trace_id,
                    outcome: IngestOutcome::Overloaded,
                })
            }
        }
    }

    async fn enqueue(&self, mut job: Job) -> std::result::Result<(), Job> {
        let key = format!("{}:{}", job.event.instance_name, job.event.from_peer);
        loop {
            let sender = {
                let mut queues = self.inner.queues.lock().await;
                match queues.get(&key) {
                    Some(sender) => sender.clone(),
                    None => {
                        let (tx, mut rx) =
                            mpsc::channel::<Job>(self.inner.config.session_queue_capacity);
                        let router = self.clone();
                        tokio::spawn(async move {
                            while let Some(job) = rx.recv().await {
                                router.process(job).await;
                            }
                        });
                        queues.insert(key.clone(), tx.clone());
                        tx
                    }
                }
            };
            match sender.try_send(job) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(job)) => return Err(job),
                Err(mpsc::error::TrySendError::Closed(returned)) => {
                    // Worker died; rebuild the queue and retry once more.
                    self.inner.queues.lock().await.remove(&key);
                    job = returned;
                }
            }
        }
    }

    async fn process(&self, job: Job) {
        let token = match self
            .inner
            .registry
            .instance_token(&job.event.instance_name)
            .await
        {
            Some(token) => token,
            None => self.inner.registry.root_token(),
        };
        let trace_id = job.trace_id;
        let total_start = job.started;

        tokio::select! {
            _ = token.cancelled() => {
                let stage = if self.inner.registry.root_token().is_cancelled() {
                    "shutdown"
                } else {
                    "cancelled"
                };
                self.inner.recorder.abandon_stream(trace_id);
                self.inner
                    .recorder
                    .finalize(
                        trace_id,
                        TraceStatus::Failed,
                        Some("processing cancelled".into()),
                        Some(stage.into()),
                        None,
                        Some(total_start.elapsed().as_millis() as i64),
                        false,
                        false,
                    )
                    .await;
            }
            _ = self.pipeline(&job) => {}
        }
    }

    async fn pipeline(&self, job: &Job) {
        let trace_id = job.trace_id;
        let event = &job.event;
        let cfg = &job.config;
        let recorder = &self.inner.recorder;
        let total_ms = || job.started.elapsed().as_millis() as i64;

        // AdmissionChecked
        let peer = event.admission_peer();
        let decision = match self.inner.access.check(&event.instance_name, peer).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(%trace_id, error = %e, "access rule lookup failed");
                recorder
                    .finalize(
                        trace_id,
                        TraceStatus::Failed,
                        Some(format!("access rule lookup failed: {e}")),
                        Some("access_check".into()),
                        None,
                        Some(total_ms()),
                        false,
                        false,
                    )
                    .await;
                return;
            }
        };
        if !decision.allow {
            let rule = decision
                .matched_rule
                .map(|r| format!("rule {} ({})", r.id, r.phone_number))
                .unwrap_or_else(|| "unmatched".into());
            tracing::info!(%trace_id, peer, rule, "admission denied");
            recorder
                .finalize(
                    trace_id,
                    TraceStatus::AccessDenied,
                    Some(format!("access denied by {rule}")),
                    Some("access_denied".into()),
                    None,
                    Some(total_ms()),
                    false,
                    false,
                )
                .await;
            return;
        }

        recorder
            .update_status(trace_id, TraceStatus::Processing, None, None)
            .await;

        // Identified
        let user = match self.inner.identity.resolve_event(event).await {
            Ok(user) => user,
            Err(e) => {
                recorder
                    .finalize(
                        trace_id,
                        TraceStatus::Failed,
                        Some(format!("identity resolution failed: {e}")),
                        Some("identity".into()),
                        None,
                        Some(total_ms()),
                        false,
                        false,
                    )
                    .await;
                return;
            }
        };
        let session = derive_session_key(cfg, event, user.id);
        recorder
            .update_context(trace_id, Some(user.id), Some(session.clone()))
            .await;

        // AgentInFlight
        let request = AgentRequest {
            session_name: session,
            user_id: Some(user.id.to_string()),
            text: event.text.clone().unwrap_or_default(),
            media: event.media.clone(),
        };
        recorder
            .record_json_payload(
                trace_id,
                TraceStage::AgentRequest,
                &serde_json::json!({
                    "agent_id": cfg.agent_id,
                    "stream_mode": cfg.agent_stream_mode,
                    "request": request,
                }),
                None,
                event.has_media(),
            )
            .await;

        let client = self.inner.agents.client_for(cfg);
        let timeout = Duration::from_millis(cfg.agent_timeout_ms);
        let agent_start = Instant::now();
        let outcome = if cfg.agent_stream_mode {
            self.run_streaming(trace_id, client, request, timeout).await
        } else {
            self.run_buffered(trace_id, client, request, timeout).await
        };
        let agent_ms = agent_start.elapsed().as_millis() as i64;

        let reply = match outcome {
            Ok(reply) => reply,
            Err((stage, message)) => {
                let fallback_sent = self.maybe_send_fallback(trace_id, cfg, event).await;
                recorder
                    .finalize(
                        trace_id,
                        TraceStatus::Failed,
                        Some(message),
                        Some(stage),
                        Some(agent_ms),
                        Some(total_ms()),
                        false,
                        fallback_sent,
                    )
                    .await;
                return;
            }
        };

        // A stream may legitimately close with nothing to say.
        if reply.text.trim().is_empty() && reply.media.is_empty() {
            recorder
                .finalize(
                    trace_id,
                    TraceStatus::Completed,
                    None,
                    None,
                    Some(agent_ms),
                    Some(total_ms()),
                    true,
                    true,
                )
                .await;
            return;
        }

        // Delivering
        let Some(adapter) = self.inner.registry.adapter(&event.instance_name).await else {
            recorder
                .record_json_payload(
                    trace_id,
                    TraceStage::OutboundSent,
                    &serde_json::json!({"error": "channel adapter not connected"}),
                    None,
                    false,
                )
                .await;
            recorder
                .finalize(
                    trace_id,
                    TraceStatus::Failed,
                    Some("channel adapter not connected".into()),
                    Some("outbound_sent".into()),
                    Some(agent_ms),
                    Some(total_ms()),
                    true,
                    false,
                )
                .await;
            return;
        };

        let opts = DeliveryOptions {
            auto_split: cfg.enable_auto_split,
            ..self.inner.config.delivery.clone()
        };
        let report = deliver(
            adapter.as_ref(),
            &event.chat_target,
            &reply.text,
            &reply.media,
            &opts,
        )
        .await;
        recorder
            .record_json_payload(
                trace_id,
                TraceStage::OutboundSent,
                &serde_json::json!({
                    "target": event.chat_target,
                    "report": report,
                }),
                None,
                !reply.media.is_empty(),
            )
            .await;

        // Terminal
        if report.success() {
            recorder
                .finalize(
                    trace_id,
                    TraceStatus::Completed,
                    None,
                    None,
                    Some(agent_ms),
                    Some(total_ms()),
                    true,
                    true,
                )
                .await;
        } else {
            recorder
                .finalize(
                    trace_id,
                    TraceStatus::Failed,
                    Some(report.failures.join("; ")),
                    Some("outbound_sent".into()),
                    Some(agent_ms),
                    Some(total_ms()),
                    true,
                    false,
                )
                .await;
        }
    }

    async fn run_buffered(
        &self,
        trace_id: Uuid,
        client: Arc<dyn AgentClient>,
        request: AgentRequest,
        timeout: Duration,
    ) -> std::result::Result<AgentReply, (String, String)> {
        let reply = match tokio::time::timeout(timeout, client.invoke(request)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(AgentError::Timeout(ms))) => {
                return Err((
                    "agent_request".into(),
                    format!("agent call timed out after {ms} ms"),
                ));
            }
            Ok(Err(e)) => return Err(("agent_request".into(), e.to_string())),
            Err(_) => {
                return Err((
                    "agent_request".into(),
                    format!("agent call timed out after {} ms", timeout.as_millis()),
                ));
            }
        };
        self.inner
            .recorder
            .record_json_payload(
                trace_id,
                TraceStage::AgentResponse,
                &serde_json::json!({
                    "text": reply.text,
                    "media": reply.media,
                    "metadata": reply.metadata,
                }),
                None,
                !reply.media.is_empty(),
            )
            .await;
        Ok(reply)
    }

    async fn run_streaming(
        &self,
        trace_id: Uuid,
        client: Arc<dyn AgentClient>,
        request: AgentRequest,
        timeout: Duration,
    ) -> std::result::Result<AgentReply, (String, String)> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut stream = match tokio::time::timeout_at(deadline, client.stream(request)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(("agent_request".into(), e.to_string())),
            Err(_) => {
                return Err((
                    "agent_request".into(),
                    format!("agent stream start timed out after {} ms", timeout.as_millis()),
                ));
            }
        };

        let mut collector = StreamCollector::new();
        loop {
            let next = match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let (_, metrics) = collector.finish(false);
                    self.inner.recorder.finish_stream(trace_id, &metrics).await;
                    return Err((
                        "agent_response".into(),
                        format!("agent stream timed out after {} ms", timeout.as_millis()),
                    ));
                }
            };
            match next {
                Some(Ok(event)) => {
                    if !event.content.is_empty() {
                        let index = collector.chunk_count();
                        collector.push(&event);
                        self.inner
                            .recorder
                            .record_streaming_chunk(trace_id, index, &event.content)
                            .await;
                    }
                    if event.done {
                        break;
                    }
                }
                Some(Err(e)) => {
                    let (_, metrics) = collector.finish(false);
                    self.inner.recorder.finish_stream(trace_id, &metrics).await;
                    return Err(("agent_response".into(), e.to_string()));
                }
                // Stream ended without an explicit done marker; treat the
                // aggregate as final.
                None => break,
            }
        }

        let (text, metrics) = collector.finish(true);
        tracing::debug!(
            %trace_id,
            chunks = metrics.chunk_count,
            length = metrics.total_content_length,
            "agent stream complete"
        );
        self.inner.recorder.finish_stream(trace_id, &metrics).await;
        Ok(AgentReply {
            text,
            media: vec![],
            metadata: None,
        })
    }

    /// Optional configurable notice on agent failure. The attempt is
    /// marked in the outbound payload so the trace never hides it.
    async fn maybe_send_fallback(
        &self,
        trace_id: Uuid,
        cfg: &InstanceConfig,
        event: &InboundEvent,
    ) -> bool {
        let Some(message) = cfg.error_fallback_message.as_deref() else {
            return false;
        };
        let Some(adapter) = self.inner.registry.adapter(&event.instance_name).await else {
            return false;
        };
        let sent = adapter.send_text(&event.chat_target, message).await;
        let ok = sent.is_ok();
        self.inner
            .recorder
            .record_json_payload(
                trace_id,
                TraceStage::OutboundSent,
                &serde_json::json!({
                    "fallback": true,
                    "target": event.chat_target,
                    "text": message,
                    "sent": ok,
                }),
                None,
                false,
            )
            .await;
        ok
    }
}

#[async_trait]
impl InboundHandler for MessageRouter {
    async fn handle_inbound(&self, event: InboundEvent) -> Result<Ingest> {
        self.handle_event(event).await
    }
}
