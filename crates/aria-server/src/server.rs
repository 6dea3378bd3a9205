//! `AriaServer`: TCP listener feeding a [`Broker`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use aria_core::Broker;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::errors::{ConfigError, ServerError};
use crate::origin::OriginPolicy;
use crate::shutdown::ShutdownCoordinator;
use crate::transport::TungsteniteAcceptor;

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Listens for TCP connections and hands each one to the broker.
pub struct AriaServer {
    config: ServerConfig,
    broker: Broker,
    acceptor: Arc<TungsteniteAcceptor>,
    shutdown: Arc<ShutdownCoordinator>,
    listening: AtomicBool,
}

impl AriaServer {
    /// Create a new server. Nothing is bound until [`listen`](Self::listen).
    pub fn new(config: ServerConfig, broker: Broker) -> Self {
        let acceptor = Arc::new(TungsteniteAcceptor::from_config(&config));
        Self {
            config,
            broker,
            acceptor,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            listening: AtomicBool::new(false),
        }
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the broker.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Bind and start accepting connections.
    ///
    /// Returns the bound address and the accept loop's handle. The loop
    /// stops when the shutdown token is cancelled.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let _ = OriginPolicy::from_options(self.broker.options())
            .map_err(ConfigError::InvalidValue)?;
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyListening);
        }

        let addr = self.config.bind_addr();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.listening.store(false, Ordering::SeqCst);
                return Err(ServerError::Bind { addr, source });
            }
        };
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!(%local_addr, "aria server listening");

        let handle = tokio::spawn(accept_loop(
            listener,
            self.broker.clone(),
            Arc::clone(&self.acceptor),
            self.shutdown.token(),
            self.shutdown.handshakes().clone(),
        ));
        Ok((local_addr, handle))
    }

    /// Stop accepting, let in-flight handshakes settle, close every
    /// connection with going-away, and wait up to the configured timeout
    /// for them to drain.
    pub async fn shutdown_gracefully(&self, accept_loop: JoinHandle<()>) -> bool {
        self.shutdown
            .graceful_shutdown(
                &self.broker,
                Some(accept_loop),
                Some(self.config.shutdown_timeout()),
            )
            .await
    }

    /// Listen, then shut down gracefully on Ctrl-C.
    pub async fn run_until_ctrl_c(&self) -> Result<(), ServerError> {
        let (_, handle) = self.listen().await?;
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c, shutting down");
        }
        info!("shutting down");
        let _ = self.shutdown_gracefully(handle).await;
        info!("shutdown complete");
        Ok(())
    }
}

impl std::fmt::Debug for AriaServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AriaServer")
            .field("config", &self.config)
            .field("broker", &self.broker)
            .field("listening", &self.listening.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    listener: TcpListener,
    broker: Broker,
    acceptor: Arc<TungsteniteAcceptor>,
    token: CancellationToken,
    handshakes: TaskTracker,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let broker = broker.clone();
                    let acceptor = Arc::clone(&acceptor);
                    let _ = handshakes.spawn(async move {
                        match broker.handle(acceptor.as_ref(), stream).await {
                            Ok(conn_id) => debug!(%peer, %conn_id, "connection served"),
                            Err(err) => debug!(%peer, error = %err, "connection not served"),
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    info!("accept loop stopped");
}
