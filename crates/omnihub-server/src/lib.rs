//! HTTP admin/data/webhook surface for the omnihub messaging hub.
//!
//! `/api/v1/*` is gated by `x-api-key`; `/health` and `/webhook/*` are
//! open by design (webhooks are trusted by path plus the deployment
//! network).

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

use anyhow::Result;
use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::get;
use axum::{middleware, Json, Router};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// CORS knobs, fed from the `AUTOMAGIK_OMNI_CORS_*` environment options.
#[derive(Debug, Clone)]
pub struct CorsOptions {
    pub origins: Vec<String>,
    pub methods: Vec<String>,
    pub headers: Vec<String>,
    pub credentials: bool,
}

impl Default for CorsOptions {
    fn default() -> Self {
        Self {
            origins: vec!["*".into()],
            methods: vec!["*".into()],
            headers: vec!["*".into()],
            credentials: false,
        }
    }
}

fn build_cors(opts: &CorsOptions) -> CorsLayer {
    let wildcard = |values: &[String]| values.iter().any(|v| v == "*");

    let mut cors = CorsLayer::new();
    if wildcard(&opts.origins) {
        cors = cors.allow_origin(AllowOrigin::any());
    } else {
        let origins: Vec<HeaderValue> = opts
            .origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors = cors.allow_origin(origins);
    }
    if wildcard(&opts.methods) {
        cors = cors.allow_methods(AllowMethods::any());
    } else {
        let methods: Vec<Method> = opts
            .methods
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        cors = cors.allow_methods(methods);
    }
    if wildcard(&opts.headers) {
        cors = cors.allow_headers(AllowHeaders::any());
    } else {
        let headers: Vec<HeaderName> = opts
            .headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        cors = cors.allow_headers(headers);
    }
    // Wildcard origins cannot carry credentials; honoring both would make
    // the layer panic at request time.
    if opts.credentials && !wildcard(&opts.origins) {
        cors = cors.allow_credentials(true);
    }
    cors
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "service": "omnihub"}))
}

pub fn create_router(state: AppState, cors: &CorsOptions) -> Router {
    let api = routes::api_router().layer(middleware::from_fn_with_state(
        state.clone(),
        auth::require_api_key,
    ));

    Router::new()
        .route("/health", get(health))
        .nest("/webhook", routes::webhooks::router())
        .nest("/api/v1", api)
        .layer(build_cors(cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    state: AppState,
    cors: &CorsOptions,
    addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    if state.api_key.is_none() {
        tracing::warn!("AUTOMAGIK_OMNI_API_KEY is not set; the admin API is unauthenticated");
    }
    let app = create_router(state, cors);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("omnihub api listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use omnihub_core::{
        AdapterContext, AdapterFactory, AdapterStatus, ChannelAdapter, ChannelError,
        InboundHandler, Ingest, InstanceRegistry, MessageRouter, PairInfo, RouterConfig,
        SendOutcome,
    };
    use omnihub_schema::{ChannelType, MediaRef};
    use omnihub_store::ConfigStore;
    use tower::util::ServiceExt;

    use super::*;
    use crate::state::AppState;

    struct NullAdapter {
        name: String,
        handler: Arc<dyn InboundHandler>,
    }

    #[async_trait]
    impl ChannelAdapter for NullAdapter {
        fn channel_type(&self) -> ChannelType {
            ChannelType::WhatsApp
        }
        fn instance_name(&self) -> &str {
            &self.name
        }
        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn status(&self) -> anyhow::Result<AdapterStatus> {
            Ok(AdapterStatus {
                native_state: "open".into(),
                profile: None,
                identity: None,
            })
        }
        async fn pair(&self) -> anyhow::Result<PairInfo> {
            Ok(PairInfo {
                qr_image: Some("iVBORw0KGgo=".into()),
                invite_url: None,
            })
        }
        async fn send_text(&self, _t: &str, _x: &str) -> Result<SendOutcome, ChannelError> {
            Ok(SendOutcome {
                message_id: Some("SENT1".into()),
            })
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
        async fn ingest_webhook(&self, body: &serde_json::Value) -> anyhow::Result<Vec<Ingest>> {
            let events = omnihub_channels::whatsapp::parse_webhook(&self.name, body)?;
            let mut results = Vec::with_capacity(events.len());
            for event in events {
                results.push(self.handler.handle_inbound(event).await?);
            }
            Ok(results)
        }
    }

    struct NullFactory;

    impl AdapterFactory for NullFactory {
        fn build(&self, ctx: AdapterContext) -> anyhow::Result<Arc<dyn ChannelAdapter>> {
            Ok(Arc::new(NullAdapter {
                name: ctx.config.name,
                handler: ctx.handler,
            }))
        }
    }

    fn test_state(api_key: Option<&str>) -> AppState {
        let store = ConfigStore::open_in_memory().unwrap();
        let registry = Arc::new(InstanceRegistry::new(store.clone(), Arc::new(NullFactory)));
        let router = MessageRouter::new(
            store.clone(),
            registry.clone(),
            Arc::new(omnihub_core::HttpAgentFactory),
            RouterConfig::default(),
        );
        registry.set_handler(Arc::new(router.clone()));
        AppState {
            store,
            registry,
            router,
            api_key: api_key.map(str::to_owned),
        }
    }

    fn app(state: &AppState) -> Router {
        create_router(state.clone(), &CorsOptions::default())
    }

    fn instance_body(name: &str) -> String {
        serde_json::json!({
            "name": name,
            "channel_type": "whatsapp",
            "evolution_url": "http://gateway:8080",
            "evolution_key": "evo-key",
            "whatsapp_instance_id": name,
            "agent_api_url": "http://agent:8000",
            "agent_id": "default",
        })
        .to_string()
    }

    async fn send(
        app: Router,
        method: &str,
        uri: &str,
        api_key: Option<&str>,
        body: Option<String>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = api_key {
            builder = builder.header("x-api-key", key);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body))
                .expect("build request"),
            None => builder.body(Body::empty()).expect("build request"),
        };
        let response = app.oneshot(request).await.expect("send request");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_is_open() {
        let state = test_state(Some("secret"));
        let (status, body) = send(app(&state), "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn api_requires_key_when_configured() {
        let state = test_state(Some("secret"));
        let (status, _) = send(app(&state), "GET", "/api/v1/instances", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            app(&state),
            "GET",
            "/api/v1/instances",
            Some("wrong"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(
            app(&state),
            "GET",
            "/api/v1/instances",
            Some("secret"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn api_open_when_no_key_configured() {
        let state = test_state(None);
        let (status, _) = send(app(&state), "GET", "/api/v1/instances", None, None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn instance_crud_roundtrip() {
        let state = test_state(None);

        let (status, created) = send(
            app(&state),
            "POST",
            "/api/v1/instances",
            None,
            Some(instance_body("prod-wa")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["name"], "prod-wa");

        let (status, got) = send(app(&state), "GET", "/api/v1/instances/prod-wa", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(got["agent_id"], "default");

        let (status, updated) = send(
            app(&state),
            "PUT",
            "/api/v1/instances/prod-wa",
            None,
            Some(serde_json::json!({"agent_timeout_ms": 5000}).to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["agent_timeout_ms"], 5000);

        let (status, _) = send(app(&state), "GET", "/api/v1/instances/ghost", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn instance_validation_and_conflicts() {
        let state = test_state(None);

        // Missing evolution credentials → 422.
        let bad = serde_json::json!({
            "name": "bad",
            "channel_type": "whatsapp",
            "agent_api_url": "http://agent:8000",
            "agent_id": "default",
        })
        .to_string();
        let (status, body) = send(app(&state), "POST", "/api/v1/instances", None, Some(bad)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("evolution_url"));

        let (status, _) = send(
            app(&state),
            "POST",
            "/api/v1/instances",
            None,
            Some(instance_body("prod-wa")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(
            app(&state),
            "POST",
            "/api/v1/instances",
            None,
            Some(instance_body("prod-wa")),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn deleting_last_instance_is_refused() {
        let state = test_state(None);
        send(
            app(&state),
            "POST",
            "/api/v1/instances",
            None,
            Some(instance_body("only")),
        )
        .await;

        let (status, body) =
            send(app(&state), "DELETE", "/api/v1/instances/only", None, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("last remaining"));

        send(
            app(&state),
            "POST",
            "/api/v1/instances",
            None,
            Some(instance_body("second")),
        )
        .await;
        let (status, _) = send(app(&state), "DELETE", "/api/v1/instances/only", None, None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn connect_and_send_through_adapter() {
        let state = test_state(None);
        send(
            app(&state),
            "POST",
            "/api/v1/instances",
            None,
            Some(instance_body("prod-wa")),
        )
        .await;

        let (status, body) = send(
            app(&state),
            "POST",
            "/api/v1/instances/prod-wa/connect",
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "prod-wa");

        let (status, body) = send(
            app(&state),
            "POST",
            "/api/v1/instance/prod-wa/send-text",
            None,
            Some(
                serde_json::json!({"number": "5511990000101@s.whatsapp.net", "text": "hi"})
                    .to_string(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message_id"], "SENT1");

        let (status, body) = send(
            app(&state),
            "GET",
            "/api/v1/instances/prod-wa/qr",
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["qr_image"], "iVBORw0KGgo=");
    }

    #[tokio::test]
    async fn send_without_connection_is_unavailable() {
        let state = test_state(None);
        send(
            app(&state),
            "POST",
            "/api/v1/instances",
            None,
            Some(instance_body("prod-wa")),
        )
        .await;

        let (status, _) = send(
            app(&state),
            "POST",
            "/api/v1/instance/prod-wa/send-text",
            None,
            Some(serde_json::json!({"number": "x", "text": "hi"}).to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn access_rules_and_check() {
        let state = test_state(None);

        let (status, rule) = send(
            app(&state),
            "POST",
            "/api/v1/access/rules",
            None,
            Some(
                serde_json::json!({"phone_number": "+5511*", "rule_type": "block"}).to_string(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let rule_id = rule["id"].as_i64().unwrap();

        let (status, decision) = send(
            app(&state),
            "POST",
            "/api/v1/access/check",
            None,
            Some(
                serde_json::json!({"instance_name": "prod-wa", "phone_number": "+5511990000101"})
                    .to_string(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decision["allow"], false);

        let (status, body) = send(
            app(&state),
            "POST",
            "/api/v1/access/rules",
            None,
            Some(
                serde_json::json!({"phone_number": "+55*11*", "rule_type": "block"}).to_string(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("trailing"));

        let (status, _) = send(
            app(&state),
            "DELETE",
            &format!("/api/v1/access/rules/{rule_id}"),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, decision) = send(
            app(&state),
            "POST",
            "/api/v1/access/check",
            None,
            Some(
                serde_json::json!({"instance_name": "prod-wa", "phone_number": "+5511990000101"})
                    .to_string(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decision["allow"], true);
    }

    #[tokio::test]
    async fn traces_listing_and_analytics() {
        let state = test_state(None);
        let (status, body) = send(app(&state), "GET", "/api/v1/traces", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());

        let (status, _) = send(
            app(&state),
            "GET",
            "/api/v1/traces?status=not-a-status",
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) =
            send(app(&state), "GET", "/api/v1/analytics/summary", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_messages"], 0);

        let missing = uuid::Uuid::new_v4();
        let (status, _) = send(
            app(&state),
            "GET",
            &format!("/api/v1/traces/{missing}"),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn webhook_unknown_instance_is_404() {
        let state = test_state(None);
        let (status, _) = send(
            app(&state),
            "POST",
            "/webhook/evolution/ghost",
            None,
            Some(serde_json::json!({"event": "messages.upsert"}).to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn webhook_instance_mismatch_is_rejected() {
        let state = test_state(None);
        send(
            app(&state),
            "POST",
            "/api/v1/instances",
            None,
            Some(instance_body("prod-wa")),
        )
        .await;

        let (status, body) = send(
            app(&state),
            "POST",
            "/webhook/evolution/prod-wa",
            None,
            Some(serde_json::json!({"event": "messages.upsert", "instance": "other"}).to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "rejected");
    }

    #[tokio::test]
    async fn webhook_without_connection_is_unavailable() {
        let state = test_state(None);
        send(
            app(&state),
            "POST",
            "/api/v1/instances",
            None,
            Some(instance_body("prod-wa")),
        )
        .await;

        let (status, body) = send(
            app(&state),
            "POST",
            "/webhook/evolution/prod-wa",
            None,
            Some(serde_json::json!({"event": "messages.upsert"}).to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("not connected"));
    }

    #[tokio::test]
    async fn webhook_accepts_and_dedups_messages() {
        let state = test_state(None);
        send(
            app(&state),
            "POST",
            "/api/v1/instances",
            None,
            Some(instance_body("prod-wa")),
        )
        .await;
        send(
            app(&state),
            "POST",
            "/api/v1/instances/prod-wa/connect",
            None,
            None,
        )
        .await;

        let webhook = serde_json::json!({
            "event": "messages.upsert",
            "instance": "prod-wa",
            "data": {"messages": [{
                "key": {"remoteJid": "5511990000101@s.whatsapp.net", "id": "3EB01", "fromMe": false},
                "message": {"conversation": "hi"}
            }]}
        })
        .to_string();

        let (status, body) = send(
            app(&state),
            "POST",
            "/webhook/evolution/prod-wa",
            None,
            Some(webhook.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        let first_trace = body["results"][0]["trace_id"].as_str().unwrap().to_string();
        assert_eq!(body["results"][0]["outcome"], "accepted");

        let (status, body) = send(
            app(&state),
            "POST",
            "/webhook/evolution/prod-wa",
            None,
            Some(webhook),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"][0]["outcome"], "duplicate");
        assert_eq!(body["results"][0]["trace_id"], first_trace.as_str());
    }
}
