use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket};
use futures::future::BoxFuture;
use futures::stream::SplitSink;
use futures::SinkExt;
use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

/// Stable identity of a client connection, used for unregistering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    const OPEN: u8 = 0;
    const CLOSING: u8 = 1;
    const CLOSED: u8 = 2;

    fn from_u8(v: u8) -> Self {
        match v {
            Self::OPEN => Self::Open,
            Self::CLOSING => Self::Closing,
            _ => Self::Closed,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connection is not open ({0:?})")]
    NotOpen(ConnectionState),

    #[error("transport error: {0}")]
    Transport(#[source] axum::Error),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

/// A bidirectional channel to one remote client.
///
/// `state()` must reflect the transport at the time of the call. The
/// registry and hub only ever hold `Arc<dyn Connection>` handles; they never
/// create or tear down the underlying channel themselves.
pub trait Connection: Send + Sync + 'static {
    fn id(&self) -> ConnectionId;

    fn state(&self) -> ConnectionState;

    /// Send one text frame.
    fn send_text(&self, text: Arc<str>) -> BoxFuture<'_, Result<(), ConnectionError>>;

    /// Send a normal-closure close frame. Closing a connection that is not
    /// Open is a no-op.
    fn close(&self, reason: &'static str) -> BoxFuture<'_, Result<(), ConnectionError>>;
}

/// [`Connection`] over the sending half of an axum WebSocket.
///
/// The receiving half stays with the handler's read loop, which reports the
/// end of the stream through [`WsConnection::mark_closed`].
pub struct WsConnection {
    id: ConnectionId,
    sink: tokio::sync::Mutex<SplitSink<WebSocket, WsMessage>>,
    state: AtomicU8,
}

impl WsConnection {
    pub fn new(sink: SplitSink<WebSocket, WsMessage>) -> Self {
        Self {
            id: ConnectionId::new(),
            sink: tokio::sync::Mutex::new(sink),
            state: AtomicU8::new(ConnectionState::OPEN),
        }
    }

    /// Record that the peer is gone (read loop saw close, EOF or an error).
    pub fn mark_closed(&self) {
        self.state.store(ConnectionState::CLOSED, Ordering::Release);
    }
}

impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn send_text(&self, text: Arc<str>) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(async move {
            let state = self.state();
            if state != ConnectionState::Open {
                return Err(ConnectionError::NotOpen(state));
            }
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(WsMessage::Text(text.to_string().into())).await {
                self.mark_closed();
                return Err(ConnectionError::Transport(e));
            }
            Ok(())
        })
    }

    fn close(&self, reason: &'static str) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(async move {
            if self
                .state
                .compare_exchange(
                    ConnectionState::OPEN,
                    ConnectionState::CLOSING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                return Ok(());
            }
            let mut sink = self.sink.lock().await;
            let close_frame = CloseFrame {
                code: close_code::NORMAL,
                reason: reason.into(),
            };
            let result = match sink.send(WsMessage::Close(Some(close_frame))).await {
                Ok(()) => sink.flush().await,
                Err(e) => Err(e),
            };
            self.mark_closed();
            result.map_err(ConnectionError::Transport)
        })
    }
}

/// The set of live client connections.
///
/// All membership changes go through this type. Iteration always happens on
/// a [`snapshot`](Self::snapshot) so no lock is held across network I/O.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<Vec<Arc<dyn Connection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: Arc<dyn Connection>) {
        let id = connection.id();
        let count = {
            let mut inner = self.inner.write();
            inner.push(connection);
            inner.len()
        };
        tracing::info!(%id, count, "connection registered");
    }

    /// Remove a connection by id. Returns false if it was already gone.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let (removed, count) = {
            let mut inner = self.inner.write();
            let before = inner.len();
            inner.retain(|c| c.id() != id);
            (inner.len() != before, inner.len())
        };
        if removed {
            tracing::info!(%id, count, "connection unregistered");
        }
        removed
    }

    /// Point-in-time copy of the live set, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<dyn Connection>> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered connection and empty the registry.
    ///
    /// Membership is drained under a single write lock, then all Open
    /// connections are closed in parallel. Returns after all closes finish or
    /// `timeout` elapses, whichever comes first.
    pub async fn close_all(&self, timeout: Duration) {
        let drained: Vec<Arc<dyn Connection>> = std::mem::take(&mut *self.inner.write());
        if drained.is_empty() {
            return;
        }
        tracing::info!(count = drained.len(), "closing all connections");

        let closes = drained
            .iter()
            .filter(|c| c.state() == ConnectionState::Open)
            .map(|c| async move {
                if let Err(e) = c.close(SHUTDOWN_REASON).await {
                    tracing::debug!(id = %c.id(), error = %e, "close failed during shutdown");
                }
            });

        if tokio::time::timeout(timeout, futures::future::join_all(closes))
            .await
            .is_err()
        {
            tracing::warn!(?timeout, "timed out waiting for connections to close");
        }
    }
}

/// Close reason sent to clients when the server shuts down.
pub const SHUTDOWN_REASON: &str = "Application shutting down";
