//! Connection handlers for Switchboard server.
//!
//! This module handles the connection lifecycle: WebSocket upgrade, the
//! per-connection writer task, and feeding inbound frames to the router.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::network::{self, ReachabilityProbe, SystemPing};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use switchboard_core::{
    CloseReason, PeerHandle, Registry, RegistryConfig, RegistryEntry, Router as EnvelopeRouter,
    RouterConfig, Session,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The envelope router and, through it, the registry.
    pub router: EnvelopeRouter,
    /// Reachability probe behind `/ping`.
    pub prober: Arc<dyn ReachabilityProbe>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let prober = Arc::new(SystemPing::new(config.probe.timeout()));
        Self::with_prober(config, prober)
    }

    /// Create new app state with a specific reachability probe.
    #[must_use]
    pub fn with_prober(config: Config, prober: Arc<dyn ReachabilityProbe>) -> Self {
        let registry = Arc::new(Registry::with_config(RegistryConfig {
            probe_interval: config.heartbeat.interval(),
        }));
        let router_config = RouterConfig {
            max_envelope_size: config.limits.max_message_size,
        };

        Self {
            router: EnvelopeRouter::with_config(registry, router_config),
            prober,
            config,
        }
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        self.router.registry()
    }
}

/// Build the HTTP application.
pub fn app(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/registry", get(registry_handler));

    if state.config.probe.enabled {
        app = app.merge(network::routes());
    }

    app.with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Switchboard listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, state).await
}

/// Serve the application on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops with an I/O error.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.registry().len(),
    }))
}

/// Registry snapshot handler.
async fn registry_handler(State(state): State<Arc<AppState>>) -> Json<Vec<RegistryEntry>> {
    Json(state.registry().snapshot())
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state, remote))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, remote: SocketAddr) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (peer, mut outbound) = PeerHandle::open();
    let connection_id = peer.id();
    let mut session = Session::new(peer);

    debug!(connection = %connection_id, remote = %remote, "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    // Writer: everything queued for this connection goes out in order.
    let mut writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            metrics::record_message(text.len(), "outbound");
            if sender.send(Message::Text(text.to_string())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let reason = loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_message(text.len(), "inbound");
                        let start = Instant::now();
                        let result = state.router.handle_text(&mut session, &text);
                        metrics::record_outcome(&result);
                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        metrics::record_message(data.len(), "inbound");
                        let start = Instant::now();
                        let result = state.router.handle_bytes(&mut session, &data);
                        metrics::record_outcome(&result);
                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        // Pongs to WebSocket pings are sent by the protocol layer.
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break CloseReason::Closed;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break CloseReason::Fault(e.to_string());
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break CloseReason::Closed;
                    }
                }
                metrics::set_registered_identities(state.registry().len());
            }

            _ = &mut writer => {
                metrics::record_error("websocket_write");
                break CloseReason::Fault("outbound stream closed".to_string());
            }
        }
    };

    // Cleanup: drop the registration, then stop the writer
    state.router.handle_close(&mut session, reason);
    writer.abort();
    metrics::set_registered_identities(state.registry().len());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ProbeError;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::net::IpAddr;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct NeverProbe;

    #[async_trait]
    impl ReachabilityProbe for NeverProbe {
        async fn probe(&self, _address: IpAddr) -> Result<bool, ProbeError> {
            Ok(false)
        }
    }

    async fn start() -> (SocketAddr, Arc<AppState>) {
        let mut config = Config::default();
        config.metrics.enabled = false;
        let state = Arc::new(AppState::with_prober(config, Arc::new(NeverProbe)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = Arc::clone(&state);
        tokio::spawn(async move {
            serve(listener, served).await.unwrap();
        });
        (addr, state)
    }

    async fn client(addr: SocketAddr) -> Client {
        let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        ws
    }

    async fn send(ws: &mut Client, value: Value) {
        ws.send(tungstenite::Message::Text(value.to_string()))
            .await
            .unwrap();
    }

    async fn recv(ws: &mut Client) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for envelope")
                .expect("stream ended")
                .unwrap();
            if let tungstenite::Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn register(ws: &mut Client, name: &str) {
        send(ws, json!({"type": "register", "userId": name})).await;
        assert_eq!(
            recv(ws).await,
            json!({"type": "registered", "userId": name, "tailscaleIp": "N/A"})
        );
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_message_between_clients() {
        let (addr, _state) = start().await;
        let mut alice = client(addr).await;
        let mut bob = client(addr).await;
        register(&mut alice, "alice").await;
        register(&mut bob, "bob").await;

        send(
            &mut alice,
            json!({"type": "message", "from": "alice", "to": "bob", "message": "hi", "timestamp": 1}),
        )
        .await;

        assert_eq!(
            recv(&mut bob).await,
            json!({"type": "message", "to": "bob", "from": "alice", "message": "hi", "timestamp": 1})
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let (addr, state) = start().await;
        let mut first = client(addr).await;
        let mut second = client(addr).await;
        register(&mut first, "alice").await;

        send(&mut second, json!({"type": "register", "userId": "alice"})).await;
        assert_eq!(
            recv(&mut second).await,
            json!({"type": "error", "message": "User \"alice\" is already registered."})
        );
        assert_eq!(state.registry().len(), 1);

        // The first connection still receives traffic for alice.
        send(
            &mut second,
            json!({"type": "webrtc-signal", "from": "anon", "to": "alice", "data": {"type": "offer", "sdp": "x"}}),
        )
        .await;
        assert_eq!(
            recv(&mut first).await,
            json!({"type": "webrtc-signal", "from": "anon", "to": "alice", "data": {"type": "offer", "sdp": "x"}})
        );
    }

    #[tokio::test]
    async fn test_disconnect_frees_identity() {
        let (addr, state) = start().await;
        let mut first = client(addr).await;
        register(&mut first, "alice").await;

        first.close(None).await.unwrap();
        drop(first);
        wait_until(|| state.registry().lookup("alice").is_none()).await;

        let mut second = client(addr).await;
        register(&mut second, "alice").await;
    }

    #[tokio::test]
    async fn test_garbage_is_ignored() {
        let (addr, state) = start().await;
        let mut alice = client(addr).await;

        send(&mut alice, json!({"type": "bogus"})).await;
        alice
            .send(tungstenite::Message::Text("{{{".into()))
            .await
            .unwrap();

        // The connection survives and still works.
        register(&mut alice, "alice").await;
        assert_eq!(state.registry().snapshot()[0].identity, "alice");
    }
}
