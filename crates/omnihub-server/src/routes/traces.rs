//! Trace listing, payload reads and the analytics summary.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use omnihub_core::decompress_payload;
use omnihub_schema::{MessageTrace, TraceStatus};
use omnihub_store::{AnalyticsSummary, TraceQuery};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_traces))
        .route("/{trace_id}", get(get_trace))
        .route("/{trace_id}/payloads", get(get_payloads))
}

pub fn analytics_router() -> Router<AppState> {
    Router::new().route("/summary", get(analytics_summary))
}

#[derive(Deserialize)]
struct ListTracesQuery {
    #[serde(default)]
    instance_name: Option<String>,
    #[serde(default)]
    sender_phone: Option<String>,
    #[serde(default)]
    session_name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    since: Option<DateTime<Utc>>,
    #[serde(default)]
    until: Option<DateTime<Utc>>,
    #[serde(default = "default_list_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

fn default_list_limit() -> u32 {
    50
}

async fn list_traces(
    State(state): State<AppState>,
    Query(query): Query<ListTracesQuery>,
) -> Result<Json<Vec<MessageTrace>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            TraceStatus::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };
    let traces = state
        .store
        .list_traces(TraceQuery {
            instance_name: query.instance_name,
            sender_phone: query.sender_phone,
            session_name: query.session_name,
            status,
            since: query.since,
            until: query.until,
            limit: query.limit.min(500),
            offset: query.offset,
        })
        .await?;
    Ok(Json(traces))
}

async fn get_trace(
    State(state): State<AppState>,
    Path(trace_id): Path<Uuid>,
) -> Result<Json<MessageTrace>, ApiError> {
    state
        .store
        .get_trace(trace_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("trace '{trace_id}'")))
}

async fn get_payloads(
    State(state): State<AppState>,
    Path(trace_id): Path<Uuid>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    state
        .store
        .get_trace(trace_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("trace '{trace_id}'")))?;

    let payloads = state.store.list_payloads(trace_id).await?;
    let rows = payloads
        .into_iter()
        .map(|p| {
            let inflated = decompress_payload(&p.payload);
            let payload: serde_json::Value = serde_json::from_slice(&inflated)
                .unwrap_or_else(|_| {
                    serde_json::json!(String::from_utf8_lossy(&inflated).to_string())
                });
            serde_json::json!({
                "stage": p.stage,
                "payload_type": p.payload_type,
                "timestamp": p.timestamp,
                "status_code": p.status_code,
                "payload_size_original": p.payload_size_original,
                "payload_size_compressed": p.payload_size_compressed,
                "compression_ratio": p.compression_ratio,
                "contains_media": p.contains_media,
                "contains_base64": p.contains_base64,
                "payload": payload,
            })
        })
        .collect();
    Ok(Json(rows))
}

#[derive(Deserialize)]
struct AnalyticsQuery {
    #[serde(default)]
    since: Option<DateTime<Utc>>,
    #[serde(default)]
    until: Option<DateTime<Utc>>,
    /// `all_time` ignores the window.
    #[serde(default)]
    period: Option<String>,
}

async fn analytics_summary(
    State(state): State<AppState>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<AnalyticsSummary>, ApiError> {
    let (since, until) = if query.period.as_deref() == Some("all_time") {
        (None, None)
    } else {
        (query.since, query.until)
    };
    Ok(Json(state.store.analytics_summary(since, until).await?))
}
