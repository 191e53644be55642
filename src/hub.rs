use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::connection::{Connection, ConnectionError, ConnectionRegistry, ConnectionState};
use crate::message::{Envelope, Message};

/// Upper bound on a single per-connection send. A client that cannot accept
/// a frame within this time is treated as dead and pruned.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle returned by [`BroadcastHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// In-process observer of every broadcast message.
pub type Listener = Arc<dyn Fn(&Message) + Send + Sync>;

/// Fans messages out to every registered connection.
///
/// Cloning is cheap; all clones share the registry and listener list.
#[derive(Clone)]
pub struct BroadcastHub {
    registry: ConnectionRegistry,
    listeners: Arc<RwLock<Vec<(ListenerId, Listener)>>>,
    next_listener: Arc<AtomicU64>,
    send_timeout: Duration,
}

impl BroadcastHub {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self::with_send_timeout(registry, DEFAULT_SEND_TIMEOUT)
    }

    pub fn with_send_timeout(registry: ConnectionRegistry, send_timeout: Duration) -> Self {
        Self {
            registry,
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_listener: Arc::new(AtomicU64::new(0)),
            send_timeout,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Register a local listener. Listeners run synchronously on the
    /// broadcasting task, before any network send starts.
    pub fn subscribe(&self, listener: impl Fn(&Message) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Stamp a message with the current time and broadcast it.
    pub async fn publish(&self, kind: &str, message: &str) {
        self.broadcast(&Message::now(kind, message)).await;
    }

    /// Deliver `message` to every connection in a registry snapshot.
    ///
    /// Sends run concurrently and independently; this returns once each one
    /// has completed, failed or timed out. Connections that fail are
    /// unregistered. Connections registered after the snapshot is taken do
    /// not receive this message.
    pub async fn broadcast(&self, message: &Message) {
        self.notify_listeners(message);

        let payload: Arc<str> = match message.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::error!(error = %e, kind = message.kind(), "failed to serialize message");
                return;
            }
        };

        let targets = self.registry.snapshot();
        if targets.is_empty() {
            return;
        }

        let sends = targets.iter().map(|conn| {
            let payload = payload.clone();
            async move {
                match self.send_bounded(conn.as_ref(), payload).await {
                    Ok(()) => None,
                    Err(e) => {
                        tracing::warn!(id = %conn.id(), error = %e, "failed to send message to connection");
                        Some(conn.id())
                    }
                }
            }
        });

        for id in futures::future::join_all(sends).await.into_iter().flatten() {
            self.registry.unregister(id);
        }
    }

    /// Send a `{"type", "message"}` frame to a single connection.
    ///
    /// Failures are logged only; the connection stays registered because its
    /// read loop owns unregistration on this path.
    pub async fn send_to_one(&self, connection: &dyn Connection, kind: &str, message: &str) {
        let payload: Arc<str> = match Envelope::new(kind, message).to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::error!(error = %e, kind, "failed to serialize envelope");
                return;
            }
        };
        if let Err(e) = self.send_bounded(connection, payload).await {
            tracing::warn!(id = %connection.id(), error = %e, kind, "failed to send message to connection");
        }
    }

    async fn send_bounded(
        &self,
        connection: &dyn Connection,
        payload: Arc<str>,
    ) -> Result<(), ConnectionError> {
        let state = connection.state();
        if state != ConnectionState::Open {
            return Err(ConnectionError::NotOpen(state));
        }
        match tokio::time::timeout(self.send_timeout, connection.send_text(payload)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(self.send_timeout)),
        }
    }

    fn notify_listeners(&self, message: &Message) {
        // Copy out so a listener may (un)subscribe without deadlocking.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::MockConnection;
    use crate::message::types;

    fn hub() -> BroadcastHub {
        BroadcastHub::with_send_timeout(ConnectionRegistry::new(), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn broadcast_with_no_connections() {
        let hub = hub();
        hub.publish(types::OUTPUT, "hello").await;
        assert!(hub.registry().is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_open_connection_once() {
        let hub = hub();
        let conns: Vec<_> = (0..5).map(|_| MockConnection::new()).collect();
        for c in &conns {
            hub.registry().register(c.clone());
        }

        let msg = Message::now(types::OUTPUT, "Rebuilding...");
        hub.broadcast(&msg).await;

        let expected = msg.to_json().unwrap();
        for c in &conns {
            assert_eq!(c.frames(), vec![expected.clone()]);
        }
        assert_eq!(hub.registry().len(), 5);
    }

    #[tokio::test]
    async fn failing_connection_is_pruned_without_affecting_others() {
        let hub = hub();
        let good = MockConnection::new();
        let bad = MockConnection::failing();
        let closed = MockConnection::new();
        closed.set_state(ConnectionState::Closed);
        hub.registry().register(bad.clone());
        hub.registry().register(good.clone());
        hub.registry().register(closed.clone());

        hub.publish(types::ERROR, "Error: boom").await;

        assert_eq!(good.frames().len(), 1);
        let remaining: Vec<_> = hub.registry().snapshot().iter().map(|c| c.id()).collect();
        assert_eq!(remaining, vec![good.id()]);
    }

    #[tokio::test]
    async fn slow_connection_times_out_and_is_pruned() {
        let hub = hub();
        let good = MockConnection::new();
        let slow = MockConnection::hanging_send();
        hub.registry().register(slow.clone());
        hub.registry().register(good.clone());

        let started = std::time::Instant::now();
        hub.publish(types::OUTPUT, "Done in 12ms").await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(good.frames().len(), 1);
        assert_eq!(hub.registry().len(), 1);
    }

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let hub = hub();
        let conn = MockConnection::new();
        hub.registry().register(conn.clone());

        for i in 0..20 {
            hub.publish(types::OUTPUT, &format!("line {i}")).await;
        }

        let lines: Vec<String> = conn
            .frames()
            .iter()
            .map(|f| serde_json::from_str::<Message>(f).unwrap().message().to_string())
            .collect();
        let expected: Vec<String> = (0..20).map(|i| format!("line {i}")).collect();
        assert_eq!(lines, expected);
    }

    #[tokio::test]
    async fn send_to_one_uses_plain_envelope() {
        let hub = hub();
        let conn = MockConnection::new();

        hub.send_to_one(&*conn, types::CSS_FILE, "app.css").await;

        assert_eq!(
            conn.frames(),
            vec![r#"{"type":"__CSS_FILE__","message":"app.css"}"#.to_string()]
        );
    }

    #[tokio::test]
    async fn send_to_one_failure_does_not_unregister() {
        let hub = hub();
        let conn = MockConnection::failing();
        hub.registry().register(conn.clone());

        hub.send_to_one(&*conn, types::CSS_FILE, "app.css").await;

        assert_eq!(hub.registry().len(), 1);
    }

    #[tokio::test]
    async fn listeners_run_before_network_fanout() {
        let hub = hub();
        let conn = MockConnection::new();
        hub.registry().register(conn.clone());

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let conn_clone = conn.clone();
        hub.subscribe(move |msg| {
            // The network frame must not have been sent yet.
            seen_clone
                .lock()
                .push((msg.message().to_string(), conn_clone.frames().len()));
        });

        hub.publish(types::OUTPUT, "first").await;
        hub.publish(types::OUTPUT, "second").await;

        assert_eq!(
            *seen.lock(),
            vec![("first".to_string(), 0), ("second".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn unsubscribed_listener_is_not_called() {
        let hub = hub();
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = count.clone();
        let id = hub.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        hub.publish(types::OUTPUT, "one").await;
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        hub.publish(types::OUTPUT, "two").await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_registered_after_snapshot_misses_in_flight_message() {
        let hub = hub();
        let slow = MockConnection::hanging_send();
        hub.registry().register(slow.clone());

        let late = MockConnection::new();
        let in_flight = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.publish(types::OUTPUT, "in flight").await })
        };
        // Let the broadcast take its snapshot and block on the slow peer.
        tokio::time::sleep(Duration::from_millis(50)).await;
        hub.registry().register(late.clone());
        in_flight.await.unwrap();

        assert!(late.frames().is_empty());

        hub.publish(types::OUTPUT, "after").await;
        assert_eq!(late.frames().len(), 1);
    }
}
