use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use omnihub_store::StoreError;

/// API-boundary error, mapped onto an HTTP status and a JSON body.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Validation(String),
    Unauthorized,
    /// Dependent service (channel gateway, adapter) cannot take the call.
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::NotFound(m)
            | ApiError::Conflict(m)
            | ApiError::Validation(m)
            | ApiError::Unavailable(m)
            | ApiError::Internal(m) => m.clone(),
            ApiError::Unauthorized => "invalid or missing x-api-key".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.message(), "request failed");
        }
        (status, Json(serde_json::json!({"error": self.message()}))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(m) => ApiError::NotFound(m),
            StoreError::Conflict(m) => ApiError::Conflict(m),
            StoreError::LastInstance => {
                ApiError::Conflict("cannot delete the last remaining instance".into())
            }
            StoreError::Persistence(m) => ApiError::Internal(m),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}
