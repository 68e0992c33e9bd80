//! API-key gate for the admin/data surface.
//!
//! A single configured key authorizes every caller; `/health` and the
//! webhook ingress are mounted outside this layer and stay open.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };
    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());
    if presented != Some(expected) {
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}
