//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use aria_core::{Broker, CloseStatus};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Default timeout for draining read-loops before giving up.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Close reason sent to every peer on shutdown.
pub const SHUTDOWN_REASON: &str = "server shutting down";

/// Coordinates graceful shutdown of the accept loop, in-flight handshakes
/// and live connections.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    handshakes: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handshakes: TaskTracker::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Tracker for accepted sockets that have not finished connecting.
    ///
    /// Shutdown waits for these before closing connections, so a socket
    /// accepted just before the cancel still gets its going-away close.
    pub fn handshakes(&self) -> &TaskTracker {
        &self.handshakes
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Perform a graceful shutdown.
    ///
    /// 1. Cancel the token and wait for the accept loop to stop
    /// 2. Wait for in-flight handshakes to register or fail
    /// 3. Send a going-away close to every registered connection
    /// 4. Wait for all read-loops to finish
    ///
    /// Steps 2 and 4 share one `timeout`. Returns `false` if it elapsed.
    pub async fn graceful_shutdown(
        &self,
        broker: &Broker,
        accept_loop: Option<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        if let Some(handle) = accept_loop {
            let _ = handle.await;
        }
        let deadline = Instant::now() + timeout;

        let _ = self.handshakes.close();
        let mut complete = true;
        if tokio::time::timeout_at(deadline, self.handshakes.wait()).await.is_err() {
            warn!(
                pending = self.handshakes.len(),
                "handshakes still pending at shutdown deadline"
            );
            complete = false;
        }

        let closing = broker.close_all(CloseStatus::GoingAway, SHUTDOWN_REASON).await;
        info!(
            connections = closing,
            timeout_secs = timeout.as_secs(),
            "waiting for connections to drain"
        );

        if tokio::time::timeout_at(deadline, broker.drain()).await.is_err() {
            warn!(
                remaining = broker.active_loops(),
                "shutdown timed out after {timeout:?}, some connections may still be open"
            );
            return false;
        }
        complete
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
