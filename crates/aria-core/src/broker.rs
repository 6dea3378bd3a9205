//! The broker handle: hook table, live registry and broadcast engine.
//!
//! A [`Broker`] is built once with [`Broker::builder`], then cloned freely.
//! Each accepted session is registered, passed through on-connect, and
//! handed to its own read-loop task (see [`crate::dispatcher`]).

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use metrics::{counter, gauge};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::dispatcher;
use crate::errors::{BroadcastError, BrokerError, HookKind, Result, SendFailure};
use crate::hooks::{self, HookResult, Hooks};
use crate::ids::ConnectionId;
use crate::metrics::{
    WS_BROADCAST_FAILURES_TOTAL, WS_BROADCASTS_TOTAL, WS_CONNECTIONS_ACTIVE,
    WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL, WS_HOOK_ERRORS_TOTAL,
};
use crate::options::AcceptOptions;
use crate::registry::ConnectionRegistry;
use crate::transport::{Acceptor, CloseStatus, Session};

/// Configures hooks and accept options before any connection exists.
///
/// Registering the same hook twice keeps the last one.
#[derive(Default)]
pub struct BrokerBuilder {
    hooks: Hooks,
    options: AcceptOptions,
}

impl BrokerBuilder {
    /// Start with no hooks and default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs after registration, before the read-loop starts. An error
    /// aborts the connection.
    #[must_use]
    pub fn on_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Broker, Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.hooks.on_connect = Some(hooks::lifecycle(hook));
        self
    }

    /// Runs for every text message. An error ends the read-loop.
    #[must_use]
    pub fn on_message<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Broker, Arc<Connection>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.hooks.on_message = Some(hooks::text(hook));
        self
    }

    /// Runs for every binary message. An error ends the read-loop.
    #[must_use]
    pub fn on_message_binary<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Broker, Arc<Connection>, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.hooks.on_message_binary = Some(hooks::binary(hook));
        self
    }

    /// Runs when the peer closes cleanly (1000, 1001, 1005).
    #[must_use]
    pub fn on_close<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Broker, Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.hooks.on_close = Some(hooks::lifecycle(hook));
        self
    }

    /// Runs when the session ends abnormally.
    #[must_use]
    pub fn on_disconnect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Broker, Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.hooks.on_disconnect = Some(hooks::lifecycle(hook));
        self
    }

    /// Observes every reported error. Runs inline and must not block.
    #[must_use]
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Broker, &Arc<Connection>, &BrokerError) + Send + Sync + 'static,
    {
        self.hooks.on_error = Some(hooks::error(hook));
        self
    }

    /// Options passed to the acceptor for every handshake.
    #[must_use]
    pub fn accept_options(mut self, options: AcceptOptions) -> Self {
        self.options = options;
        self
    }

    /// Freeze the configuration.
    pub fn build(self) -> Broker {
        debug!(hooks = ?self.hooks.registered(), "broker built");
        Broker {
            inner: Arc::new(Inner {
                registry: ConnectionRegistry::new(),
                hooks: self.hooks,
                options: self.options,
                tasks: TaskTracker::new(),
            }),
        }
    }
}

struct Inner {
    registry: ConnectionRegistry,
    hooks: Hooks,
    options: AcceptOptions,
    tasks: TaskTracker,
}

/// Cheap-to-clone handle to one broker instance.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    /// Start configuring a broker.
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::new()
    }

    /// Accept options this broker hands to acceptors.
    pub fn options(&self) -> &AcceptOptions {
        &self.inner.options
    }

    /// The live registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Snapshot of the registered connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.registry.snapshot()
    }

    /// Look up one registered connection.
    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.registry.get(id)
    }

    /// Read-loops still running.
    pub fn active_loops(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Accept one inbound request and start serving it.
    ///
    /// Handshake failures are returned without registering anything.
    pub async fn handle<A>(&self, acceptor: &A, request: A::Request) -> Result<ConnectionId>
    where
        A: Acceptor,
    {
        let session = match acceptor.accept(request, &self.inner.options).await {
            Ok(session) => session,
            Err(err) => {
                debug!(error = %err, "handshake rejected");
                return Err(BrokerError::Accept(err));
            }
        };
        self.serve(session).await
    }

    /// Register an already accepted session, run on-connect, and spawn its
    /// read-loop.
    pub async fn serve(&self, session: impl Session) -> Result<ConnectionId> {
        let conn = Arc::new(Connection::new(session));
        let id = conn.id().clone();
        if self.inner.registry.insert(Arc::clone(&conn)) {
            counter!(WS_CONNECTIONS_TOTAL).increment(1);
            gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        }
        info!(conn_id = %id, "connection accepted");

        if let Err(err) = dispatcher::invoke(
            self,
            &conn,
            self.inner.hooks.on_connect.as_ref(),
            HookKind::Connect,
        )
        .await
        {
            warn!(conn_id = %id, error = %err, "on_connect failed, dropping connection");
            let _ = self.evict(&id);
            self.report(&conn, &err);
            return Err(err);
        }

        let _ = self.inner.tasks.spawn(dispatcher::run(self.clone(), conn));
        Ok(id)
    }

    /// Send `message` as text to every registered connection.
    pub async fn broadcast_all(&self, message: &str) -> std::result::Result<(), BroadcastError> {
        self.broadcast_filter(message, |_| true).await
    }

    /// Send `message` as text to every registered connection for which
    /// `predicate` holds.
    ///
    /// Every target is attempted even after failures. Each failure is
    /// reported to on-error, and the failed connections are evicted once
    /// the pass is over.
    pub async fn broadcast_filter<P>(
        &self,
        message: &str,
        predicate: P,
    ) -> std::result::Result<(), BroadcastError>
    where
        P: Fn(&Connection) -> bool,
    {
        let targets: Vec<Arc<Connection>> = self
            .inner
            .registry
            .snapshot()
            .into_iter()
            .filter(|conn| predicate(conn))
            .collect();
        let attempted = targets.len();
        counter!(WS_BROADCASTS_TOTAL).increment(1);

        let mut failures = Vec::new();
        for conn in &targets {
            if let Err(error) = conn.send_text(message).await {
                warn!(conn_id = %conn.id(), error = %error, "failed to deliver broadcast");
                let reported = BrokerError::Send {
                    connection_id: conn.id().clone(),
                    source: error.clone(),
                };
                self.report(conn, &reported);
                failures.push(SendFailure {
                    connection_id: conn.id().clone(),
                    error,
                });
            }
        }

        for failure in &failures {
            let _ = self.evict(&failure.connection_id);
        }

        debug!(recipients = attempted, failed = failures.len(), "broadcast complete");
        if failures.is_empty() {
            Ok(())
        } else {
            counter!(WS_BROADCAST_FAILURES_TOTAL).increment(failures.len() as u64);
            Err(BroadcastError::new(attempted, failures))
        }
    }

    /// Start the closing handshake on every registered connection.
    ///
    /// Returns how many handshakes were started. The read-loops observe the
    /// echoed close and run on-close as usual.
    pub async fn close_all(&self, status: CloseStatus, reason: &str) -> usize {
        let conns = self.connections();
        let mut closed = 0;
        for conn in &conns {
            match conn.close(status, reason).await {
                Ok(()) => closed += 1,
                Err(err) => debug!(conn_id = %conn.id(), error = %err, "close failed"),
            }
        }
        info!(closed, total = conns.len(), %status, "closing connections");
        closed
    }

    /// Wait for every read-loop spawned so far to finish.
    pub async fn drain(&self) {
        let _ = self.inner.tasks.close();
        self.inner.tasks.wait().await;
        let _ = self.inner.tasks.reopen();
    }

    pub(crate) fn hooks(&self) -> &Hooks {
        &self.inner.hooks
    }

    /// Remove `id` from the registry. Idempotent.
    pub(crate) fn evict(&self, id: &ConnectionId) -> bool {
        let removed = self.inner.registry.remove(id);
        if removed {
            counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
            gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
            debug!(conn_id = %id, "connection evicted");
        }
        removed
    }

    /// Hand `err` to the on-error hook, if one is registered.
    pub(crate) fn report(&self, conn: &Arc<Connection>, err: &BrokerError) {
        if let Some(kind) = err.hook_kind() {
            counter!(WS_HOOK_ERRORS_TOTAL, "hook" => kind.as_str()).increment(1);
        }
        match &self.inner.hooks.on_error {
            Some(hook) => hook(self, conn, err),
            None => debug!(conn_id = %conn.id(), error = %err, "unhandled connection error"),
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("connections", &self.inner.registry.len())
            .field("hooks", &self.inner.hooks.registered())
            .field("options", &self.inner.options)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use crate::testing::{ScriptedAcceptor, ScriptedSession, eventually};
    use crate::transport::{MessageKind, MockSession};
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failing_mock() -> MockSession {
        let mut mock = MockSession::new();
        let _ = mock
            .expect_write()
            .times(1)
            .returning(|_, _| Err(TransportError::Io("connection reset".into())));
        mock
    }

    #[tokio::test]
    async fn serve_registers_connection() {
        let broker = Broker::default();
        let (session, _handle) = ScriptedSession::new();
        let id = broker.serve(session).await.unwrap();
        assert_eq!(broker.connection_count(), 1);
        assert!(broker.connection(&id).is_some());
    }

    #[tokio::test]
    async fn handle_passes_options_unmodified() {
        let broker = Broker::builder()
            .accept_options(AcceptOptions::new().with_subprotocols(["chat"]).with_compression_threshold(64))
            .build();
        let acceptor = ScriptedAcceptor::new();
        let (session, _handle) = ScriptedSession::new();
        let _ = broker.handle(&acceptor, session).await.unwrap();

        let seen = acceptor.seen_options();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].subprotocols, vec!["chat"]);
        assert_eq!(seen[0].compression_threshold, 64);
    }

    #[tokio::test]
    async fn rejected_handshake_registers_nothing() {
        let broker = Broker::default();
        let acceptor = ScriptedAcceptor::rejecting(TransportError::Handshake("bad origin".into()));
        let (session, _handle) = ScriptedSession::new();
        let err = broker.handle(&acceptor, session).await.unwrap_err();
        assert_matches!(err, BrokerError::Accept(TransportError::Handshake(_)));
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn on_connect_failure_reports_and_evicts() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let messages = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&messages);
        let broker = Broker::builder()
            .on_connect(|_, _| async { Err("not welcome".into()) })
            .on_message(move |_, _, _| {
                let seen = Arc::clone(&seen);
                async move {
                    let _ = seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .on_error(move |_, _, err| sink.lock().push(err.to_string()))
            .build();

        let (session, handle) = ScriptedSession::new();
        handle.text("never read");
        let err = broker.serve(session).await.unwrap_err();

        assert_eq!(err.hook_kind(), Some(HookKind::Connect));
        assert_eq!(broker.connection_count(), 0);
        assert_eq!(errors.lock().as_slice(), ["on_connect hook failed: not welcome"]);
        assert_eq!(broker.active_loops(), 0);
        assert_eq!(messages.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn on_connect_runs_before_reads() {
        let broker = Broker::builder()
            .on_connect(|_, conn| async move {
                conn.set("greeting", "hello".to_string());
                Ok(())
            })
            .on_message(|_, conn, text| async move {
                let greeting = conn.get_as::<String>("greeting").ok_or("missing greeting")?;
                conn.send_text(&format!("{greeting} {text}")).await?;
                Ok(())
            })
            .build();

        let (session, handle) = ScriptedSession::new();
        let log = session.writes();
        handle.text("world");
        let _ = broker.serve(session).await.unwrap();

        assert!(eventually(|| !log.texts().is_empty()).await);
        assert_eq!(log.texts(), vec!["hello world"]);
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let broker = Broker::builder()
            .on_message(|_, conn, _| async move {
                conn.send_text("first").await?;
                Ok(())
            })
            .on_message(|_, conn, _| async move {
                conn.send_text("second").await?;
                Ok(())
            })
            .build();

        let (session, handle) = ScriptedSession::new();
        let log = session.writes();
        handle.text("go");
        let _ = broker.serve(session).await.unwrap();

        assert!(eventually(|| !log.texts().is_empty()).await);
        assert_eq!(log.texts(), vec!["second"]);
    }

    #[tokio::test]
    async fn broadcast_to_mock_failure_evicts() {
        let reported = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reported);
        let broker = Broker::builder()
            .on_error(move |_, _, err| {
                assert_matches!(err, BrokerError::Send { .. });
                let _ = counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        let conn = Arc::new(Connection::new(failing_mock()));
        let _ = broker.registry().insert(Arc::clone(&conn));

        let err = broker.broadcast_all("hi").await.unwrap_err();
        assert_eq!(err.attempted(), 1);
        assert!(err.contains(conn.id()));
        assert_eq!(err.failures()[0].error, TransportError::Io("connection reset".into()));
        assert_eq!(reported.load(Ordering::SeqCst), 1);
        assert!(broker.registry().is_empty());
    }

    #[tokio::test]
    async fn broadcast_writes_whole_text_message() {
        let mut mock = MockSession::new();
        let _ = mock
            .expect_write()
            .withf(|kind, payload| *kind == MessageKind::Text && payload == b"payload")
            .times(1)
            .returning(|_, _| Ok(()));
        let broker = Broker::default();
        let _ = broker.registry().insert(Arc::new(Connection::new(mock)));

        broker.broadcast_all("payload").await.unwrap();
        assert_eq!(broker.connection_count(), 1);
    }

    #[tokio::test]
    async fn broadcast_to_empty_registry_is_ok() {
        let broker = Broker::default();
        assert!(broker.broadcast_all("anyone?").await.is_ok());
    }

    #[tokio::test]
    async fn broadcast_filter_by_store_value() {
        let broker = Broker::default();
        let (red, _hr) = ScriptedSession::new();
        let (blue, _hb) = ScriptedSession::new();
        let red_log = red.writes();
        let blue_log = blue.writes();
        let red_id = broker.serve(red).await.unwrap();
        let _ = broker.serve(blue).await.unwrap();
        broker.connection(&red_id).unwrap().set("team", "red".to_string());

        broker
            .broadcast_filter("red only", |conn| {
                conn.get_as::<String>("team").is_some_and(|t| t.as_str() == "red")
            })
            .await
            .unwrap();

        assert_eq!(red_log.texts(), vec!["red only"]);
        assert_eq!(blue_log.attempts(), 0);
    }

    #[tokio::test]
    async fn close_all_then_drain_empties_registry() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        let broker = Broker::builder()
            .on_close(move |_, _| {
                let counter = Arc::clone(&counter);
                async move {
                    let _ = counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let (session, handle) = ScriptedSession::new();
            handles.push(handle);
            let _ = broker.serve(session).await.unwrap();
        }

        assert_eq!(broker.close_all(CloseStatus::GoingAway, "shutdown").await, 3);
        broker.drain().await;

        assert_eq!(broker.connection_count(), 0);
        assert_eq!(broker.active_loops(), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn drain_allows_new_connections_after() {
        let broker = Broker::default();
        let (session, handle) = ScriptedSession::new();
        let _ = broker.serve(session).await.unwrap();
        handle.close(CloseStatus::Normal);
        broker.drain().await;

        let (session, _handle) = ScriptedSession::new();
        let _ = broker.serve(session).await.unwrap();
        assert_eq!(broker.active_loops(), 1);
    }

    #[test]
    fn debug_shows_hooks() {
        let broker = Broker::builder().on_error(|_, _, _| {}).build();
        let debug = format!("{broker:?}");
        assert!(debug.contains("on_error"));
        assert!(debug.contains("connections: 0"));
    }
}
