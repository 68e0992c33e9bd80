//! Access rule management and the admission dry-run endpoint.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use omnihub_core::{AccessControl, Decision};
use omnihub_schema::{AccessRule, RuleType};
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rules", get(list_rules).post(add_rule))
        .route("/rules/{id}", axum::routing::delete(delete_rule))
        .route("/check", post(check_access))
}

#[derive(Deserialize)]
struct ListRulesQuery {
    #[serde(default)]
    instance_name: Option<String>,
}

async fn list_rules(
    State(state): State<AppState>,
    Query(query): Query<ListRulesQuery>,
) -> Result<Json<Vec<AccessRule>>, ApiError> {
    Ok(Json(
        state
            .store
            .list_access_rules(query.instance_name.as_deref())
            .await?,
    ))
}

#[derive(Deserialize)]
struct AddRuleRequest {
    #[serde(default)]
    instance_name: Option<String>,
    phone_number: String,
    rule_type: String,
}

fn validate_pattern(pattern: &str) -> Result<(), ApiError> {
    let stripped = pattern.strip_suffix('*').unwrap_or(pattern);
    if pattern != "*" && stripped.is_empty() {
        return Err(ApiError::Validation("phone pattern must not be empty".into()));
    }
    if pattern.trim() != pattern {
        return Err(ApiError::Validation("phone pattern has stray whitespace".into()));
    }
    if stripped.contains('*') {
        return Err(ApiError::Validation(
            "wildcard is only allowed as a trailing '*'".into(),
        ));
    }
    Ok(())
}

async fn add_rule(
    State(state): State<AppState>,
    Json(body): Json<AddRuleRequest>,
) -> Result<Json<AccessRule>, ApiError> {
    validate_pattern(&body.phone_number)?;
    let rule_type = RuleType::parse(&body.rule_type)
        .ok_or_else(|| ApiError::Validation(format!("unknown rule_type '{}'", body.rule_type)))?;
    if let Some(instance) = &body.instance_name {
        state
            .store
            .get_instance(instance)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("instance '{instance}'")))?;
    }
    Ok(Json(
        state
            .store
            .add_access_rule(body.instance_name, body.phone_number, rule_type)
            .await?,
    ))
}

async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.delete_access_rule(id).await?;
    Ok(Json(serde_json::json!({"deleted": id})))
}

#[derive(Deserialize)]
struct CheckRequest {
    instance_name: String,
    phone_number: String,
}

async fn check_access(
    State(state): State<AppState>,
    Json(body): Json<CheckRequest>,
) -> Result<Json<Decision>, ApiError> {
    let access = AccessControl::new(state.store.clone());
    Ok(Json(
        access.check(&body.instance_name, &body.phone_number).await?,
    ))
}
