use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::Response,
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::connection::{Connection, ConnectionState, WsConnection, SHUTDOWN_REASON};
use crate::message::types;
use crate::supervisor::ProcessState;

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    watcher: Option<ProcessState>,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let watcher = state.watcher.as_ref().map(|rx| *rx.borrow());
    Json(HealthResponse {
        status: "ok",
        watcher,
    })
}

#[derive(Deserialize)]
pub(super) struct PublishRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
}

pub(super) async fn publish_message(
    State(state): State<AppState>,
    Json(req): Json<PublishRequest>,
) -> Result<StatusCode, ApiError> {
    if state.shutdown.is_cancelled() {
        return Err(ApiError::ShuttingDown);
    }
    if req.kind.trim().is_empty() {
        return Err(ApiError::InvalidRequest("type must not be empty".into()));
    }
    state.hub.publish(&req.kind, &req.message).await;
    Ok(StatusCode::ACCEPTED)
}

pub(super) async fn ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: AppState) {
    let (ws_tx, mut ws_rx) = socket.split();
    let conn = Arc::new(WsConnection::new(ws_tx));
    let id = conn.id();

    // The handshake goes out before registration so it is always the first
    // frame the client sees.
    state
        .hub
        .send_to_one(&*conn, types::CSS_FILE, &state.artifact_name)
        .await;
    if conn.state() != ConnectionState::Open {
        tracing::debug!(%id, "handshake failed, dropping connection");
        return;
    }
    if state.shutdown.is_cancelled() {
        let _ = conn.close(SHUTDOWN_REASON).await;
        return;
    }

    let registry = state.hub.registry().clone();
    registry.register(conn.clone());

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(%id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
            _ = state.shutdown.cancelled() => {
                if let Err(e) = conn.close(SHUTDOWN_REASON).await {
                    tracing::debug!(%id, error = %e, "close on shutdown failed");
                }
                break;
            }
        }
    }

    registry.unregister(id);
    if conn.state() == ConnectionState::Open {
        // Completes the closing handshake the peer started.
        let _ = conn.close("").await;
    }
    conn.mark_closed();
}
