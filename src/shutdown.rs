use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionRegistry;
use crate::supervisor::{ProcessState, SupervisorHandle};

/// Default upper bound on closing every client connection.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared shutdown signal plus the resources that must be released when it
/// fires.
///
/// Connection read loops watch [`token`](Self::token); [`shutdown`](Self::shutdown)
/// stops the watcher and closes all connections concurrently.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    registry: ConnectionRegistry,
    supervisor: Option<SupervisorHandle>,
    close_timeout: Duration,
}

/// What happened during shutdown, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Final watcher state, or `None` if there was no watcher or it did not
    /// finish in time.
    pub watcher: Option<ProcessState>,
    /// Connections that were registered when shutdown began.
    pub connections_closed: usize,
}

impl ShutdownCoordinator {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            token: CancellationToken::new(),
            registry,
            supervisor: None,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Attach the started watcher so shutdown terminates it.
    pub fn set_supervisor(&mut self, supervisor: SupervisorHandle) {
        self.supervisor = Some(supervisor);
    }

    /// The shutdown signal. Cancelled at the start of [`shutdown`](Self::shutdown).
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop the watcher and close all connections, in parallel.
    ///
    /// Always completes: each half is bounded (the watcher by its grace
    /// period plus reap time, the connections by the close timeout) and
    /// failures are only logged.
    pub async fn shutdown(self) -> ShutdownReport {
        let Self {
            token,
            registry,
            supervisor,
            close_timeout,
        } = self;
        tracing::info!("shutting down");
        token.cancel();

        let connections_closed = registry.len();
        let stop_watcher = async move {
            match supervisor {
                Some(handle) => {
                    let budget = handle.stop_budget();
                    let state = handle.stop(budget).await;
                    tracing::info!(?state, "tailwind watcher stopped");
                    state
                }
                None => None,
            }
        };
        let close_connections = registry.close_all(close_timeout);

        let (watcher, ()) = tokio::join!(stop_watcher, close_connections);

        tracing::info!(connections_closed, "shutdown complete");
        ShutdownReport {
            watcher,
            connections_closed,
        }
    }
}
