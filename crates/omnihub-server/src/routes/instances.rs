//! Instance CRUD, lifecycle and adapter proxy routes.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use omnihub_core::{InstanceStatusView, PairInfo};
use omnihub_schema::{InstanceConfig, InstancePatch};
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_instances).post(create_instance))
        .route(
            "/{name}",
            get(get_instance).put(update_instance).delete(delete_instance),
        )
        .route("/{name}/status", get(instance_status))
        .route("/{name}/qr", get(instance_qr))
        .route("/{name}/connect", post(connect_instance))
        .route("/{name}/disconnect", post(disconnect_instance))
        .route("/{name}/restart", post(restart_instance))
        .route("/{name}/contacts", get(list_contacts))
        .route("/{name}/chats", get(list_chats))
        .route("/{name}/chats/{chat_id}/messages", get(list_chat_messages))
}

async fn list_instances(
    State(state): State<AppState>,
) -> Result<Json<Vec<InstanceConfig>>, ApiError> {
    Ok(Json(state.store.list_instances().await?))
}

async fn create_instance(
    State(state): State<AppState>,
    Json(cfg): Json<InstanceConfig>,
) -> Result<Json<InstanceConfig>, ApiError> {
    cfg.validate().map_err(ApiError::Validation)?;
    Ok(Json(state.registry.create(cfg).await?))
}

async fn get_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<InstanceConfig>, ApiError> {
    state
        .store
        .get_instance(&name)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("instance '{name}'")))
}

async fn update_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(patch): Json<InstancePatch>,
) -> Result<Json<InstanceConfig>, ApiError> {
    let current = state
        .store
        .get_instance(&name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("instance '{name}'")))?;
    let mut preview = current.clone();
    patch.apply(&mut preview);
    preview.validate().map_err(ApiError::Validation)?;
    Ok(Json(state.registry.update(&name, patch).await?))
}

async fn delete_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.registry.delete(&name).await?;
    Ok(Json(serde_json::json!({"deleted": name})))
}

async fn instance_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<InstanceStatusView>, ApiError> {
    Ok(Json(state.registry.status(&name).await?))
}

async fn instance_qr(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<PairInfo>, ApiError> {
    ensure_exists(&state, &name).await?;
    let adapter = state
        .registry
        .adapter(&name)
        .await
        .ok_or_else(|| ApiError::Unavailable(format!("instance '{name}' is not connected")))?;
    Ok(Json(adapter.pair().await?))
}

async fn connect_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<InstanceStatusView>, ApiError> {
    ensure_exists(&state, &name).await?;
    state
        .registry
        .connect(&name)
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    Ok(Json(state.registry.status(&name).await?))
}

async fn disconnect_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<InstanceStatusView>, ApiError> {
    ensure_exists(&state, &name).await?;
    state.registry.disconnect(&name).await;
    Ok(Json(state.registry.status(&name).await?))
}

async fn restart_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<InstanceStatusView>, ApiError> {
    ensure_exists(&state, &name).await?;
    state
        .registry
        .restart(&name)
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    Ok(Json(state.registry.status(&name).await?))
}

async fn list_contacts(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let adapter = connected_adapter(&state, &name).await?;
    Ok(Json(adapter.fetch_contacts().await?))
}

async fn list_chats(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let adapter = connected_adapter(&state, &name).await?;
    Ok(Json(adapter.fetch_chats().await?))
}

#[derive(Deserialize)]
struct MessagesQuery {
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_limit() -> u32 {
    50
}

async fn list_chat_messages(
    State(state): State<AppState>,
    Path((name, chat_id)): Path<(String, String)>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let adapter = connected_adapter(&state, &name).await?;
    Ok(Json(adapter.fetch_messages(&chat_id, query.limit).await?))
}

async fn ensure_exists(state: &AppState, name: &str) -> Result<(), ApiError> {
    state
        .store
        .get_instance(name)
        .await?
        .map(|_| ())
        .ok_or_else(|| ApiError::NotFound(format!("instance '{name}'")))
}

pub(crate) async fn connected_adapter(
    state: &AppState,
    name: &str,
) -> Result<std::sync::Arc<dyn omnihub_core::ChannelAdapter>, ApiError> {
    ensure_exists(state, name).await?;
    state
        .registry
        .adapter(name)
        .await
        .ok_or_else(|| ApiError::Unavailable(format!("instance '{name}' is not connected")))
}
