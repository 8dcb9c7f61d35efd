//! Relay Server
//!
//! Binds the listener, restores the mirrored payload, starts the dispatcher
//! and serves the WebSocket endpoint together with the HTTP status routes.

use super::{api::RelayApi, handlers::AppState};
use crate::config::Config;
use crate::connection::{ConnectionSettings, OriginPolicy};
use crate::metrics::Metrics;
use crate::relay::{Dispatcher, DispatcherSettings, PayloadCache, PayloadMirror, RelayHandle};
use crate::Result;
use anyhow::Context;
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A bound relay server, ready to serve
pub struct RelayServer {
    listener: TcpListener,
    router: Router,
    relay: RelayHandle,
    dispatcher: JoinHandle<()>,
    metrics: Arc<Metrics>,
    config: Config,
}

impl RelayServer {
    /// Bind the listener and start the dispatcher. Failing to bind is fatal.
    pub async fn bind(config: Config, metrics: Arc<Metrics>) -> Result<Self> {
        let mirror = config.relay.mirror_path.clone().map(PayloadMirror::new);

        let cache = match &mirror {
            Some(mirror) => match mirror.load().await {
                Ok(Some(latest)) => PayloadCache::with_payload(latest),
                Ok(None) => PayloadCache::new(),
                Err(e) => {
                    warn!(error = %e, "Ignoring unreadable mirror file, starting with an empty cache");
                    PayloadCache::new()
                }
            },
            None => PayloadCache::new(),
        };

        let listener = TcpListener::bind(config.server.bind_addr)
            .await
            .with_context(|| format!("Failed to bind relay server to {}", config.server.bind_addr))?;

        let settings = DispatcherSettings {
            policy: config.relay.broadcast,
            max_payload_bytes: config.server.max_payload_bytes,
            mirror,
        };
        let (relay, dispatcher) = Dispatcher::new(settings, cache, metrics.clone()).spawn();

        let state = AppState {
            relay: relay.clone(),
            metrics: metrics.clone(),
            origins: Arc::new(OriginPolicy::new(&config.relay.allowed_origins)),
            connection: ConnectionSettings {
                heartbeat_interval: config.server.heartbeat_interval,
                outbound_queue: config.server.outbound_queue,
            },
            start_time: Instant::now(),
        };
        let router = RelayApi::create_router(
            state,
            &config.server.ws_path,
            config.monitoring.metrics_enabled,
        );

        Ok(Self {
            listener,
            router,
            relay,
            dispatcher,
            metrics,
            config,
        })
    }

    /// Address actually bound, useful when the configured port is 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn relay(&self) -> RelayHandle {
        self.relay.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Serve until the process is killed.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serve until `signal` resolves, then drop all connections and stop the dispatcher.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        info!(
            addr = %addr,
            ws_path = %self.config.server.ws_path,
            broadcast = %self.config.relay.broadcast,
            "Relay server listening"
        );

        // Stopping the dispatcher closes every outbound queue, which ends the
        // upgraded WebSocket tasks so the graceful shutdown can complete.
        let relay = self.relay.clone();
        let signal = async move {
            signal.await;
            info!("Shutdown requested, closing relay connections");
            if let Err(e) = relay.shutdown().await {
                debug!(error = %e, "Dispatcher already stopped");
            }
        };

        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();
        let served = axum::serve(self.listener, app)
            .with_graceful_shutdown(signal)
            .await;

        if let Err(e) = &served {
            error!(error = %e, "Relay server error");
            if let Err(e) = self.relay.shutdown().await {
                debug!(error = %e, "Dispatcher already stopped");
            }
        }

        let timeout = self.config.server.shutdown_timeout;
        match tokio::time::timeout(timeout, self.dispatcher).await {
            Ok(Ok(())) => info!("Relay server stopped"),
            Ok(Err(e)) => error!(error = %e, "Dispatcher task failed"),
            Err(_) => warn!("Dispatcher did not stop within {:?}", timeout),
        }

        served.context("Relay server terminated with an error")
    }
}
