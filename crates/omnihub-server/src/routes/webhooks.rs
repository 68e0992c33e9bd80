//! Channel ingress.
//!
//! The instance's adapter owns webhook normalization and dispatch; this
//! route only locates it. Webhooks are acknowledged with 2xx whenever the
//! body was durably handed to the router; handler-level problems come
//! back as 200-with-diagnostic so the gateway does not retry forever.
//! Hard rejections: unknown instance path (404), a body that contradicts
//! the path (400), and an instance that is not connected (503, so the
//! gateway retries once it is).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/evolution/{instance_name}", post(evolution_webhook))
}

async fn evolution_webhook(
    State(state): State<AppState>,
    Path(instance_name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    state
        .store
        .get_instance(&instance_name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("instance '{instance_name}'")))?;

    // A body that names a different instance than the path is rejected
    // outright; everything else the gateway sends is acknowledged.
    if let Some(body_instance) = body.get("instance").and_then(|v| v.as_str()) {
        if body_instance != instance_name {
            return Ok((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "status": "rejected",
                    "detail": format!(
                        "body instance '{body_instance}' contradicts path '{instance_name}'"
                    ),
                })),
            ));
        }
    }

    let adapter = state
        .registry
        .adapter(&instance_name)
        .await
        .ok_or_else(|| ApiError::Unavailable(format!("instance '{instance_name}' is not connected")))?;

    match adapter.ingest_webhook(&body).await {
        Ok(ingests) => {
            let results: Vec<serde_json::Value> = ingests
                .into_iter()
                .map(|ingest| {
                    serde_json::json!({
                        "trace_id": ingest.trace_id,
                        "outcome": ingest.outcome,
                    })
                })
                .collect();
            Ok((
                StatusCode::OK,
                Json(serde_json::json!({"status": "ok", "results": results})),
            ))
        }
        Err(e) => {
            tracing::warn!(instance = %instance_name, error = %e, "webhook body not routed");
            Ok((
                StatusCode::OK,
                Json(serde_json::json!({"status": "error", "detail": e.to_string()})),
            ))
        }
    }
}
