//! Connection handlers for the Trailcast server.
//!
//! This module wires the relay together and handles the viewer connection
//! lifecycle: a viewer is registered when its WebSocket opens and removed
//! the moment it closes.

use crate::config::Config;
use crate::metrics::{self, PrometheusMetrics, ViewerMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, trace, warn};
use trailcast_broker::{AmqpBroker, Supervisor};
use trailcast_core::{
    MessageRouter, PresenceTracker, Registry, SubscriptionKey, Viewer, ALL_ATHLETES,
};

/// Trail used when a viewer does not name one.
const DEFAULT_TRAIL: &str = "default";

/// Shared server state.
pub struct AppState {
    /// Viewer registry shared with the message router.
    pub registry: Arc<Registry>,
    /// Per-viewer outbound buffer size.
    pub viewer_buffer: usize,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(registry: Arc<Registry>, viewer_buffer: usize) -> Self {
        Self {
            registry,
            viewer_buffer,
        }
    }
}

/// Viewer connection parameters.
#[derive(Debug, Default, Deserialize)]
pub struct ViewerParams {
    /// Trail to follow.
    pub trail: Option<String>,
    /// Athlete to follow, or `all`.
    pub athlete: Option<String>,
}

impl ViewerParams {
    /// Subscription key, with defaults for missing or blank values.
    #[must_use]
    pub fn key(&self) -> SubscriptionKey {
        fn or_default(value: &Option<String>, default: &str) -> String {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
                .to_string()
        }

        SubscriptionKey::new(
            or_default(&self.trail, DEFAULT_TRAIL),
            or_default(&self.athlete, ALL_ATHLETES),
        )
    }
}

/// Run the relay: broker supervisor, metrics exporter and viewer endpoint.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let bind_addr = config.bind_addr()?;

    if config.metrics.enabled {
        metrics::start_metrics_server(config.metrics_addr()?)?;
        // Descriptions only reach a recorder that is already installed
        metrics::init_metrics();
    }

    let registry = Arc::new(Registry::new());
    let presence = Arc::new(PresenceTracker::new(config.presence_ttl()));
    let router = Arc::new(MessageRouter::new(
        registry.clone(),
        presence,
        Arc::new(PrometheusMetrics),
    ));

    let supervisor = Supervisor::new(
        Arc::new(AmqpBroker::new(config.amqp())),
        router,
        config.supervisor(),
    );
    let supervisor_task = tokio::spawn(supervisor.run());

    let state = Arc::new(AppState::new(registry, config.limits.viewer_buffer));
    let app = app(state, &config.websocket_path);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind viewer endpoint on {bind_addr}"))?;

    info!("Trailcast listening on {}", bind_addr);
    info!(
        "Viewer endpoint: ws://{}{}?trail=<trail>&athlete=<athlete|all>",
        bind_addr, config.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    supervisor_task.abort();
    info!("Trailcast stopped");
    Ok(())
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>, websocket_path: &str) -> Router {
    Router::new()
        .route(websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "viewers": state.registry.len(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ViewerParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let key = params.key();
    ws.on_upgrade(move |socket| handle_websocket(socket, state, key))
}

/// Handle a viewer connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, key: SubscriptionKey) {
    // Record connection metrics
    let _metrics_guard = ViewerMetricsGuard::new();

    let (viewer, mut outbound) = Viewer::channel(state.viewer_buffer);
    let connection_id = viewer.id();
    state.registry.register(viewer, key.clone());

    debug!(connection = connection_id, subscription = %key, "Viewer connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            biased;

            // Position updates routed to this viewer
            Some(payload) = outbound.recv() => {
                let text = match String::from_utf8(payload.to_vec()) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(connection = connection_id, error = %e, "Skipping non UTF-8 payload");
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = connection_id, "Received close frame");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Viewers have nothing to say
                        trace!(connection = connection_id, "Ignoring viewer frame");
                    }
                    Some(Err(e)) => {
                        warn!(connection = connection_id, error = %e, "WebSocket error");
                        break;
                    }
                    None => {
                        debug!(connection = connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.registry.unregister(connection_id);
    debug!(connection = connection_id, "Viewer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;
    use trailcast_core::{InMemoryMetrics, PresenceTracker};

    const PR9: &str = r#"{"trail":"pr9","athlete":"runner42","location":{"latitude":32.7,"longitude":-17.0},"gender":"male"}"#;

    async fn spawn_app() -> (SocketAddr, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let state = Arc::new(AppState::new(registry.clone(), 8));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app(state, "/")).await.unwrap();
        });

        (addr, registry)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn router_for(registry: Arc<Registry>) -> (MessageRouter, Arc<InMemoryMetrics>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        let router = MessageRouter::new(
            registry,
            Arc::new(PresenceTracker::default()),
            metrics.clone(),
        );
        (router, metrics)
    }

    #[test]
    fn test_viewer_params_defaults() {
        assert_eq!(ViewerParams::default().key(), SubscriptionKey::all("default"));

        let params = ViewerParams {
            trail: Some("pr9".into()),
            athlete: Some(" ".into()),
        };
        assert_eq!(params.key(), SubscriptionKey::all("pr9"));
    }

    #[tokio::test]
    async fn test_viewer_receives_exact_payload() {
        let (addr, registry) = spawn_app().await;
        let (router, metrics) = router_for(registry.clone());

        let url = format!("ws://{addr}/?trail=pr9&athlete=runner42");
        let (mut client, _) = connect_async(url).await.unwrap();
        wait_until(|| registry.len() == 1).await;

        let fanout = router.route(PR9).unwrap();
        assert_eq!(fanout.delivered, 1);

        let msg = client.next().await.unwrap().unwrap();
        assert_eq!(msg.into_text().unwrap(), PR9);
        assert_eq!(metrics.active_runners_for_trail("pr9"), Some(1));
    }

    #[tokio::test]
    async fn test_default_subscription() {
        let (addr, registry) = spawn_app().await;

        let (_client, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        wait_until(|| registry.len() == 1).await;

        assert_eq!(registry.subscriber_count("default"), 1);
        assert_eq!(registry.lookup("default", "anyone").len(), 1);
    }

    #[tokio::test]
    async fn test_close_unregisters() {
        let (addr, registry) = spawn_app().await;
        let (router, metrics) = router_for(registry.clone());

        let (mut leaving, _) = connect_async(format!("ws://{addr}/?trail=pr9"))
            .await
            .unwrap();
        let (mut staying, _) = connect_async(format!("ws://{addr}/?trail=pr9"))
            .await
            .unwrap();
        wait_until(|| registry.len() == 2).await;

        leaving.close(None).await.unwrap();
        wait_until(|| registry.len() == 1).await;

        let fanout = router.route(PR9).unwrap();
        assert_eq!(fanout.delivered, 1);
        assert_eq!(fanout.failed, 0);
        assert_eq!(metrics.delivery_failures(), 0);

        let msg = staying.next().await.unwrap().unwrap();
        assert_eq!(msg.into_text().unwrap(), PR9);
    }

    #[tokio::test]
    async fn test_health() {
        let registry = Arc::new(Registry::new());
        let state = Arc::new(AppState::new(registry, 8));

        let response = health_handler(State(state)).await.into_response();
        assert!(response.status().is_success());

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["viewers"], 0);
    }
}
