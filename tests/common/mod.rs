#![allow(dead_code)]

use futures::stream::{SplitSink, SplitStream};
use futures::StreamExt;
use std::net::SocketAddr;
use std::time::Duration;
use tailwatch::api;
use tailwatch::connection::ConnectionRegistry;
use tailwatch::hub::BroadcastHub;
use tailwatch::shutdown::ShutdownCoordinator;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;
pub type WsReader = SplitStream<WsStream>;

pub const ARTIFACT: &str = "site.css";

/// A relay server running on an ephemeral port.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub hub: BroadcastHub,
    pub registry: ConnectionRegistry,
    pub coordinator: ShutdownCoordinator,
}

/// Start the full router on 127.0.0.1:0 without a watcher.
pub async fn start_relay() -> TestRelay {
    let registry = ConnectionRegistry::new();
    let hub = BroadcastHub::new(registry.clone());
    let coordinator = ShutdownCoordinator::new(registry.clone())
        .with_close_timeout(Duration::from_secs(2));
    let state = api::AppState::new(hub.clone(), coordinator.token(), ARTIFACT);
    let app = api::router(state, api::RouterConfig::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestRelay {
        addr,
        hub,
        registry,
        coordinator,
    }
}

/// Connect to `/ws` and consume the `__CSS_FILE__` handshake.
pub async fn connect_client(addr: SocketAddr) -> (WsSink, WsReader) {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let (tx, mut rx) = ws.split();
    let handshake = recv_json(&mut rx).await;
    assert_eq!(handshake["type"], "__CSS_FILE__");
    (tx, rx)
}

/// Poll until the registry holds exactly `n` connections.
pub async fn wait_for_clients(registry: &ConnectionRegistry, n: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while registry.len() != n {
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {n} registered clients, have {}",
            registry.len()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receive the next text frame and parse it as JSON.
pub async fn recv_json(ws: &mut WsReader) -> serde_json::Value {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timeout waiting for message")
        .expect("stream ended")
        .expect("ws error");
    match msg {
        Message::Text(text) => serde_json::from_str(&text).expect("invalid JSON"),
        other => panic!("expected text message, got {:?}", other),
    }
}

/// Receive a JSON frame within `timeout`, or `None` if nothing arrived.
pub async fn try_recv_json(ws: &mut WsReader, timeout: Duration) -> Option<serde_json::Value> {
    match tokio::time::timeout(timeout, ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => Some(serde_json::from_str(&text).unwrap()),
        _ => None,
    }
}
