pub mod access;
pub mod instances;
pub mod messages;
pub mod traces;
pub mod webhooks;

use axum::Router;

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/instances", instances::router())
        .nest("/instance", messages::router())
        .nest("/access", access::router())
        .nest("/traces", traces::router())
        .nest("/analytics", traces::analytics_router())
}
