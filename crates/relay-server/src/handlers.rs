//! Connection handlers for Relay server.
//!
//! This module wires accepted sockets from either WebSocket backend into
//! the gateway.

use crate::config::{Backend, Config, StoreConfig};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::sync::Arc;
use tenvis_relay_core::{ConnectParams, Fixture, Gateway, MemoryStore, Stores};
use tenvis_relay_transport::websocket::{WebSocketConfig, WebSocketTransport};
use tenvis_relay_transport::{axum_ws, Socket, Transport};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The gateway every connection is served by.
    pub gateway: Gateway,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, stores: Stores) -> Self {
        let gateway = Gateway::new(
            stores,
            config.trusted_credential(),
            config.connection_config(),
        );
        Self { gateway, config }
    }
}

/// Build the in-memory store, seeded from the configured fixture if any.
///
/// # Errors
///
/// Returns an error if the fixture cannot be read or parsed.
pub fn load_store(config: &StoreConfig) -> Result<MemoryStore> {
    let Some(path) = &config.fixture else {
        return Ok(MemoryStore::new());
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read store fixture: {}", path.display()))?;
    let fixture = Fixture::from_json(&contents)
        .with_context(|| format!("Failed to parse store fixture: {}", path.display()))?;
    info!(
        users = fixture.users.len(),
        guilds = fixture.guilds.len(),
        "Loaded store fixture"
    );
    Ok(MemoryStore::from_fixture(fixture))
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let store = Arc::new(load_store(&config.store)?);
    let state = Arc::new(AppState::new(config.clone(), Stores::shared(store)));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    match config.transport.backend {
        Backend::Axum => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;

            info!("Relay server listening on {}", addr);
            info!(
                "WebSocket endpoint: ws://{}{}",
                addr, config.transport.websocket_path
            );

            axum::serve(listener, router(state)).await?;
        }
        Backend::Tungstenite => {
            let transport = WebSocketTransport::new(WebSocketConfig {
                bind_addr: addr,
                max_message_size: config.transport.max_message_size,
            })
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

            accept_loop(transport, state).await;
        }
    }

    Ok(())
}

/// The axum application: the WebSocket endpoint and `/health`.
pub fn router(state: Arc<AppState>) -> Router {
    let path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Accept connections from a tungstenite listener until it fails for good.
pub async fn accept_loop(transport: WebSocketTransport, state: Arc<AppState>) {
    info!(transport = transport.name(), "Accepting connections");
    loop {
        match transport.accept().await {
            Ok(accepted) => {
                debug!(remote = ?accepted.remote_addr, "Accepted");
                let params = ConnectParams::from_query(accepted.query.as_deref());
                tokio::spawn(handle_socket(accepted.socket, params, state.clone()));
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                metrics::record_error("accept");
            }
        }
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connections = state.gateway.registry().len();
    metrics::set_registry_size(connections);
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": connections,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(state.config.transport.max_message_size)
        .on_upgrade(move |socket| handle_socket(axum_ws::socket(socket), params, state))
}

/// Serve one accepted socket.
async fn handle_socket(socket: Socket, params: ConnectParams, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    if let Err(e) = state.gateway.serve(metrics::metered(socket), params).await {
        debug!("Connection ended with error: {}", e);
        metrics::record_error("connection");
    }

    metrics::set_registry_size(state.gateway.registry().len());
}
