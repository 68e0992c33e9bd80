//! Trace recording.
//!
//! Append-style writes keyed by trace id, with compressed payload capture.
//! Every write here is best-effort-durable: a failed trace write is logged
//! and metered but never blocks or cancels message delivery.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use omnihub_agent::StreamMetrics;
use omnihub_schema::{
    detect_message_kind, InboundEvent, MessageKind, MessageTrace, TracePayload, TraceStage,
    TraceStatus,
};
use omnihub_store::ConfigStore;
use uuid::Uuid;

/// Payloads below this size are stored uncompressed.
pub const COMPRESSION_THRESHOLD: usize = 512;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

struct StreamBuffer {
    chunk_count: u32,
    content: String,
}

pub struct TraceRecorder {
    store: ConfigStore,
    streams: Mutex<HashMap<Uuid, StreamBuffer>>,
    dropped_writes: AtomicU64,
}

impl TraceRecorder {
    pub fn new(store: ConfigStore) -> Self {
        Self {
            store,
            streams: Mutex::new(HashMap::new()),
            dropped_writes: AtomicU64::new(0),
        }
    }

    /// Writes dropped because the store rejected them. Exposed for the
    /// health surface; the pipeline itself never sees these failures.
    pub fn dropped_writes(&self) -> u64 {
        self.dropped_writes.load(Ordering::Relaxed)
    }

    fn meter_drop(&self, op: &str, trace_id: Uuid, err: impl std::fmt::Display) {
        self.dropped_writes.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(%trace_id, op, error = %err, "trace write dropped");
    }

    /// Open a trace for an inbound event and capture the raw webhook
    /// payload. Always returns a trace id, even when the insert failed.
    pub async fn open(&self, event: &InboundEvent) -> Uuid {
        let trace = MessageTrace::open(event);
        let trace_id = trace.trace_id;
        if let Err(e) = self.store.insert_trace(trace).await {
            self.meter_drop("open", trace_id, e);
        }
        self.record_json_payload(
            trace_id,
            TraceStage::WebhookReceived,
            &event.raw_payload,
            None,
            event.has_media(),
        )
        .await;
        trace_id
    }

    pub async fn update_status(
        &self,
        trace_id: Uuid,
        status: TraceStatus,
        error_message: Option<String>,
        error_stage: Option<String>,
    ) {
        if let Err(e) = self
            .store
            .update_trace_status(trace_id, status, error_message, error_stage)
            .await
        {
            self.meter_drop("update_status", trace_id, e);
        }
    }

    pub async fn update_context(
        &self,
        trace_id: Uuid,
        user_id: Option<Uuid>,
        session_name: Option<String>,
    ) {
        if let Err(e) = self
            .store
            .update_trace_context(trace_id, user_id, session_name)
            .await
        {
            self.meter_drop("update_context", trace_id, e);
        }
    }

    /// Record a JSON payload for a stage, compressing above the threshold.
    pub async fn record_json_payload(
        &self,
        trace_id: Uuid,
        stage: TraceStage,
        value: &serde_json::Value,
        status_code: Option<u16>,
        contains_media: bool,
    ) {
        let raw = match serde_json::to_vec(value) {
            Ok(raw) => raw,
            Err(e) => {
                self.meter_drop("encode_payload", trace_id, e);
                return;
            }
        };
        let contains_base64 = detect_base64(value);
        let payload = build_payload(
            trace_id,
            stage,
            raw,
            status_code,
            contains_media,
            contains_base64,
        );
        if let Err(e) = self.store.upsert_payload(payload).await {
            self.meter_drop("record_payload", trace_id, e);
        }
    }

    /// Append one streaming chunk. Chunks coalesce into a single
    /// `agent_response` row that is rewritten as the aggregate grows, so a
    /// reader always sees the latest partial text.
    pub async fn record_streaming_chunk(&self, trace_id: Uuid, chunk_index: u32, content: &str) {
        let (aggregate, chunk_count) = {
            let mut streams = self.streams.lock().unwrap_or_else(|p| p.into_inner());
            let buffer = streams.entry(trace_id).or_insert_with(|| StreamBuffer {
                chunk_count: 0,
                content: String::new(),
            });
            buffer.chunk_count = buffer.chunk_count.max(chunk_index + 1);
            buffer.content.push_str(content);
            (buffer.content.clone(), buffer.chunk_count)
        };
        let value = serde_json::json!({
            "text": aggregate,
            "chunk_count": chunk_count,
            "done": false,
        });
        self.record_json_payload(trace_id, TraceStage::AgentResponse, &value, None, false)
            .await;
    }

    /// Close the streaming aggregate and write the final `agent_response`
    /// payload with the call metrics attached.
    pub async fn finish_stream(&self, trace_id: Uuid, metrics: &StreamMetrics) {
        let buffer = {
            let mut streams = self.streams.lock().unwrap_or_else(|p| p.into_inner());
            streams.remove(&trace_id)
        };
        let (text, chunk_count) = match buffer {
            Some(buffer) => (buffer.content, buffer.chunk_count),
            None => (String::new(), 0),
        };
        let value = serde_json::json!({
            "text": text,
            "chunk_count": chunk_count,
            "done": true,
            "metrics": metrics,
        });
        self.record_json_payload(trace_id, TraceStage::AgentResponse, &value, None, false)
            .await;
    }

    /// Drop any buffered stream state for a trace that will not finish.
    pub fn abandon_stream(&self, trace_id: Uuid) {
        let mut streams = self.streams.lock().unwrap_or_else(|p| p.into_inner());
        streams.remove(&trace_id);
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn finalize(
        &self,
        trace_id: Uuid,
        status: TraceStatus,
        error_message: Option<String>,
        error_stage: Option<String>,
        agent_processing_time_ms: Option<i64>,
        total_processing_time_ms: Option<i64>,
        agent_response_success: bool,
        channel_send_success: bool,
    ) {
        if let Err(e) = self
            .store
            .finalize_trace(
                trace_id,
                status,
                error_message,
                error_stage,
                agent_processing_time_ms,
                total_processing_time_ms,
                agent_response_success,
                channel_send_success,
            )
            .await
        {
            self.meter_drop("finalize", trace_id, e);
        }
    }

    /// Re-run message-type detection over the stored webhook payloads of
    /// traces still marked `unknown`. Admin operation; errors surface.
    pub async fn backfill_unknown(&self, limit: u32) -> anyhow::Result<usize> {
        let trace_ids = self.store.traces_with_unknown_type(limit).await?;
        let mut migrated = 0usize;
        for trace_id in trace_ids {
            let Some(payload) = self
                .store
                .get_payload(trace_id, TraceStage::WebhookReceived)
                .await?
            else {
                continue;
            };
            let raw = decompress_payload(&payload.payload);
            let Ok(value) = serde_json::from_slice::<serde_json::Value>(&raw) else {
                continue;
            };
            let kind = detect_kind_in_webhook(&value);
            if kind != MessageKind::Unknown {
                self.store.update_trace_message_type(trace_id, kind).await?;
                migrated += 1;
            }
        }
        Ok(migrated)
    }
}

fn build_payload(
    trace_id: Uuid,
    stage: TraceStage,
    raw: Vec<u8>,
    status_code: Option<u16>,
    contains_media: bool,
    contains_base64: bool,
) -> TracePayload {
    let original_size = raw.len() as i64;
    let (stored, compressed) = if raw.len() > COMPRESSION_THRESHOLD {
        (gzip(&raw), true)
    } else {
        (raw, false)
    };
    let compressed_size = stored.len() as i64;
    let compression_ratio = if compressed && original_size > 0 {
        compressed_size as f64 / original_size as f64
    } else {
        1.0
    };
    TracePayload {
        id: 0,
        trace_id,
        stage,
        payload_type: "application/json".into(),
        timestamp: Utc::now(),
        status_code,
        payload_size_original: original_size,
        payload_size_compressed: compressed_size,
        compression_ratio,
        contains_media,
        contains_base64,
        payload: stored,
    }
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writing to a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

/// Inflate a stored payload blob. The gzip header is self-describing, so
/// uncompressed blobs pass through untouched.
pub fn decompress_payload(blob: &[u8]) -> Vec<u8> {
    if blob.len() >= 2 && blob[..2] == GZIP_MAGIC {
        let mut decoder = GzDecoder::new(blob);
        let mut out = Vec::new();
        if decoder.read_to_end(&mut out).is_ok() {
            return out;
        }
    }
    blob.to_vec()
}

/// Whether any string in the payload looks like embedded base64 content.
/// Such payloads are stored as-is (never re-encoded) and flagged for
/// operator awareness.
fn detect_base64(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => {
            let candidate = s
                .strip_prefix("data:")
                .and_then(|rest| rest.split_once(";base64,").map(|(_, data)| data))
                .unwrap_or(s);
            candidate.len() >= 256 && BASE64.decode(candidate.as_bytes()).is_ok()
        }
        serde_json::Value::Array(items) => items.iter().any(detect_base64),
        serde_json::Value::Object(map) => map.values().any(detect_base64),
        _ => false,
    }
}

/// Locate the Baileys message object inside a stored webhook body and
/// detect its kind.
fn detect_kind_in_webhook(value: &serde_json::Value) -> MessageKind {
    if value.get("event").and_then(|e| e.as_str()) == Some("call") {
        return MessageKind::Call;
    }
    let candidates = [
        value.pointer("/data/message"),
        value.pointer("/data/messages/0/message"),
        value.get("message"),
    ];
    for candidate in candidates.into_iter().flatten() {
        let kind = detect_message_kind(candidate);
        if kind != MessageKind::Unknown {
            return kind;
        }
    }
    MessageKind::Unknown
}

/// Convenience used by tests and the payload read API.
pub fn payload_as_json(payload: &TracePayload) -> Option<serde_json::Value> {
    serde_json::from_slice(&decompress_payload(&payload.payload)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnihub_schema::ChannelType;

    fn event(message_id: &str) -> InboundEvent {
        InboundEvent {
            channel_type: ChannelType::WhatsApp,
            instance_name: "prod-wa".into(),
            channel_message_id: message_id.into(),
            from_peer: "5511990000101@s.whatsapp.net".into(),
            chat_target: "5511990000101@s.whatsapp.net".into(),
            peer_display_name: None,
            sender_phone: Some("+5511990000101".into()),
            text: Some("hi".into()),
            media: vec![],
            quoted_message_id: None,
            kind: MessageKind::Text,
            guild_id: None,
            timestamp_source: None,
            raw_payload: serde_json::json!({"event": "messages.upsert", "data": {}}),
        }
    }

    #[tokio::test]
    async fn open_writes_trace_and_webhook_payload() {
        let store = ConfigStore::open_in_memory().unwrap();
        let recorder = TraceRecorder::new(store.clone());
        let trace_id = recorder.open(&event("3EB01")).await;

        let trace = store.get_trace(trace_id).await.unwrap().unwrap();
        assert_eq!(trace.status, TraceStatus::Received);

        let payloads = store.list_payloads(trace_id).await.unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].stage, TraceStage::WebhookReceived);
        let value = payload_as_json(&payloads[0]).unwrap();
        assert_eq!(value["event"], "messages.upsert");
    }

    #[tokio::test]
    async fn large_payloads_are_compressed() {
        let store = ConfigStore::open_in_memory().unwrap();
        let recorder = TraceRecorder::new(store.clone());
        let trace_id = recorder.open(&event("big")).await;

        let big = serde_json::json!({"blob": "a".repeat(4_096)});
        recorder
            .record_json_payload(trace_id, TraceStage::AgentRequest, &big, None, false)
            .await;

        let payload = store
            .get_payload(trace_id, TraceStage::AgentRequest)
            .await
            .unwrap()
            .unwrap();
        assert!(payload.payload_size_original > COMPRESSION_THRESHOLD as i64);
        assert!(payload.payload_size_compressed < payload.payload_size_original);
        assert!(payload.compression_ratio < 1.0);
        assert_eq!(payload_as_json(&payload).unwrap(), big);
    }

    #[tokio::test]
    async fn small_payloads_stay_uncompressed() {
        let store = ConfigStore::open_in_memory().unwrap();
        let recorder = TraceRecorder::new(store.clone());
        let trace_id = recorder.open(&event("small")).await;

        let small = serde_json::json!({"ok": true});
        recorder
            .record_json_payload(trace_id, TraceStage::AgentRequest, &small, None, false)
            .await;

        let payload = store
            .get_payload(trace_id, TraceStage::AgentRequest)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            payload.payload_size_original,
            payload.payload_size_compressed
        );
        assert!((payload.compression_ratio - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn base64_payloads_are_flagged_not_reencoded() {
        let store = ConfigStore::open_in_memory().unwrap();
        let recorder = TraceRecorder::new(store.clone());
        let trace_id = recorder.open(&event("b64")).await;

        let audio = BASE64.encode(vec![7u8; 600]);
        let body = serde_json::json!({"audioMessage": {"base64": audio}});
        recorder
            .record_json_payload(trace_id, TraceStage::AgentRequest, &body, None, true)
            .await;

        let payload = store
            .get_payload(trace_id, TraceStage::AgentRequest)
            .await
            .unwrap()
            .unwrap();
        assert!(payload.contains_base64);
        assert!(payload.contains_media);
        assert_eq!(payload_as_json(&payload).unwrap(), body);
    }

    #[tokio::test]
    async fn streaming_chunks_coalesce_into_one_row() {
        let store = ConfigStore::open_in_memory().unwrap();
        let recorder = TraceRecorder::new(store.clone());
        let trace_id = recorder.open(&event("stream")).await;

        for (i, part) in ["hel", "lo ", "world"].iter().enumerate() {
            recorder
                .record_streaming_chunk(trace_id, i as u32, part)
                .await;
        }
        let metrics = StreamMetrics {
            first_token_latency_ms: Some(12),
            total_streaming_duration_ms: 80,
            chunk_count: 3,
            total_content_length: 11,
            first_to_final_ms: Some(68),
            success: true,
        };
        recorder.finish_stream(trace_id, &metrics).await;

        let payloads = store.list_payloads(trace_id).await.unwrap();
        let responses: Vec<_> = payloads
            .iter()
            .filter(|p| p.stage == TraceStage::AgentResponse)
            .collect();
        assert_eq!(responses.len(), 1);
        let value = payload_as_json(responses[0]).unwrap();
        assert_eq!(value["text"], "hello world");
        assert_eq!(value["chunk_count"], 3);
        assert_eq!(value["done"], true);
        assert_eq!(value["metrics"]["chunk_count"], 3);
    }

    #[tokio::test]
    async fn writes_never_fail_the_caller() {
        // Finalizing a trace that was never opened must not panic or
        // surface an error to the pipeline.
        let store = ConfigStore::open_in_memory().unwrap();
        let recorder = TraceRecorder::new(store.clone());
        let trace_id = recorder.open(&event("x")).await;
        recorder
            .finalize(
                Uuid::new_v4(),
                TraceStatus::Failed,
                None,
                None,
                None,
                None,
                false,
                false,
            )
            .await;
        assert!(store.get_trace(trace_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn backfill_migrates_unknown_types() {
        let store = ConfigStore::open_in_memory().unwrap();
        let recorder = TraceRecorder::new(store.clone());

        let mut ev = event("u1");
        ev.kind = MessageKind::Unknown;
        ev.raw_payload = serde_json::json!({
            "event": "messages.upsert",
            "data": {"messages": [{"key": {"id": "u1"}, "message": {"reactionMessage": {"text": "👍"}}}]}
        });
        let trace_id = recorder.open(&ev).await;

        let migrated = recorder.backfill_unknown(100).await.unwrap();
        assert_eq!(migrated, 1);
        let trace = store.get_trace(trace_id).await.unwrap().unwrap();
        assert_eq!(trace.message_type, MessageKind::Reaction);
    }

    #[test]
    fn decompress_passes_plain_blobs_through() {
        assert_eq!(decompress_payload(b"plain"), b"plain");
        let round = decompress_payload(&gzip(b"round trip"));
        assert_eq!(round, b"round trip");
    }

    #[test]
    fn base64_detection_ignores_short_strings() {
        assert!(!detect_base64(&serde_json::json!({"text": "aGVsbG8="})));
        let long = BASE64.encode(vec![1u8; 300]);
        assert!(detect_base64(&serde_json::json!({"payload": long})));
        let data_uri = format!("data:image/png;base64,{}", BASE64.encode(vec![2u8; 300]));
        assert!(detect_base64(&serde_json::json!([{"url": data_uri}])));
    }
}
