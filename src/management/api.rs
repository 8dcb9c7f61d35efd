//! HTTP Routes

use super::handlers::*;
use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;

/// Relay HTTP router
pub struct RelayApi;

impl RelayApi {
    /// Create the router serving the WebSocket endpoint and the status routes
    pub fn create_router(state: AppState, ws_path: &str, metrics_enabled: bool) -> Router {
        let mut router = Router::new()
            .route("/status", get(get_status))
            .route("/health", get(health_check))
            .route(ws_path, get(ws_upgrade));

        if metrics_enabled {
            router = router.route("/metrics", get(export_metrics));
        }

        router.with_state(state).layer(CorsLayer::permissive())
    }
}
