//! HTTP and WebSocket Handlers

use super::types::*;
use crate::connection::{handle_socket, ConnectionSettings, OriginPolicy};
use crate::metrics::Metrics;
use crate::relay::{message::format_timestamp, RelayHandle};
use crate::resource::MemoryUsage;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{error, warn};

/// Shared application state for handlers
#[derive(Clone)]
pub struct AppState {
    pub relay: RelayHandle,
    pub metrics: Arc<Metrics>,
    pub origins: Arc<OriginPolicy>,
    pub connection: ConnectionSettings,
    pub start_time: Instant,
}

impl AppState {
    fn uptime(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

/// Server status with the cached payload
pub async fn get_status(
    State(state): State<AppState>,
) -> Result<Json<StatusResponse>, (StatusCode, Json<ApiError>)> {
    let snapshot = state.relay.snapshot().await.map_err(|e| {
        error!(error = %e, "Status query failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new("Relay is not running")),
        )
    })?;

    Ok(Json(StatusResponse {
        status: "running".to_string(),
        connections: snapshot.connections,
        uptime: state.uptime(),
        timestamp: format_timestamp(SystemTime::now()),
        latest_json: snapshot.latest.map(|latest| latest.to_value()),
    }))
}

/// Health check handler
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        memory_usage: MemoryUsage::sample(),
        uptime: state.uptime(),
    })
}

/// Prometheus text exposition
pub async fn export_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.export_prometheus(),
    )
}

/// WebSocket upgrade, refused with 403 when the origin is not allowed
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let origin = headers.get(header::ORIGIN);

    if !state.origins.allows_header(origin) {
        warn!(peer = %peer, origin = ?origin, "Rejected connection from disallowed origin");
        state.metrics.origin_rejected();
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    let relay = state.relay.clone();
    let metrics = state.metrics.clone();
    let settings = state.connection;
    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, peer, relay, metrics, settings).await;
    })
}
