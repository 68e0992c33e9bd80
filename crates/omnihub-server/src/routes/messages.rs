//! Direct send endpoints, proxied through the instance's adapter.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use omnihub_core::ChannelError;
use omnihub_schema::{MediaKind, MediaRef};
use serde::Deserialize;

use crate::error::ApiError;
use crate::routes::instances::connected_adapter;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{name}/send-text", post(send_text))
        .route("/{name}/send-media", post(send_media))
        .route("/{name}/send-audio", post(send_audio))
        .route("/{name}/send-reaction", post(send_reaction))
}

fn map_channel_error(err: ChannelError) -> ApiError {
    match err {
        ChannelError::Rejected(m) => ApiError::Validation(m),
        ChannelError::NotConnected(m) => ApiError::Unavailable(m),
        ChannelError::RateLimited => ApiError::Unavailable("channel rate limited".into()),
        ChannelError::Transport(m) => ApiError::Unavailable(m),
    }
}

#[derive(Deserialize)]
struct SendTextRequest {
    number: String,
    text: String,
}

async fn send_text(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<SendTextRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.text.trim().is_empty() {
        return Err(ApiError::Validation("text must not be empty".into()));
    }
    let adapter = connected_adapter(&state, &name).await?;
    let outcome = adapter
        .send_text(&body.number, &body.text)
        .await
        .map_err(map_channel_error)?;
    Ok(Json(serde_json::json!({"message_id": outcome.message_id})))
}

#[derive(Deserialize)]
struct SendMediaRequest {
    number: String,
    media_url: String,
    #[serde(default)]
    media_kind: Option<MediaKind>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
}

async fn send_media(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<SendMediaRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let adapter = connected_adapter(&state, &name).await?;
    let media = MediaRef {
        kind: body.media_kind.unwrap_or(MediaKind::Image),
        url: body.media_url,
        mime_type: None,
        file_name: body.file_name,
        caption: body.caption,
    };
    let outcome = adapter
        .send_media(&body.number, &media)
        .await
        .map_err(map_channel_error)?;
    Ok(Json(serde_json::json!({"message_id": outcome.message_id})))
}

#[derive(Deserialize)]
struct SendAudioRequest {
    number: String,
    audio_url: String,
}

async fn send_audio(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<SendAudioRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let adapter = connected_adapter(&state, &name).await?;
    let outcome = adapter
        .send_audio(&body.number, &body.audio_url)
        .await
        .map_err(map_channel_error)?;
    Ok(Json(serde_json::json!({"message_id": outcome.message_id})))
}

#[derive(Deserialize)]
struct SendReactionRequest {
    number: String,
    message_id: String,
    emoji: String,
}

async fn send_reaction(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<SendReactionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let adapter = connected_adapter(&state, &name).await?;
    let outcome = adapter
        .send_reaction(&body.number, &body.message_id, &body.emoji)
        .await
        .map_err(map_channel_error)?;
    Ok(Json(serde_json::json!({"message_id": outcome.message_id})))
}
