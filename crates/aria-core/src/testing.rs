//! In-memory transport for exercising the broker without sockets.
//!
//! [`ScriptedSession`] reads whatever its [`ScriptHandle`] pushes and records
//! every write in a shared [`WriteLog`]. Writes can be made to fail on demand
//! to simulate a peer that vanished between broadcasts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::options::AcceptOptions;
use crate::transport::{Acceptor, CloseStatus, Message, MessageKind, Session};

type Inbound = Result<Message, TransportError>;

#[derive(Default)]
struct LogState {
    attempts: usize,
    writes: Vec<(MessageKind, Vec<u8>)>,
    pings: usize,
    closes: Vec<(CloseStatus, String)>,
}

/// Shared record of everything written to a [`ScriptedSession`].
#[derive(Clone, Default)]
pub struct WriteLog {
    state: Arc<Mutex<LogState>>,
}

impl WriteLog {
    /// Successful writes, in order.
    pub fn snapshot(&self) -> Vec<(MessageKind, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    /// Successful text writes decoded as UTF-8.
    pub fn texts(&self) -> Vec<String> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(kind, _)| *kind == MessageKind::Text)
            .map(|(_, bytes)| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }

    /// Write attempts, including failed ones.
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    /// Pings sent.
    pub fn pings(&self) -> usize {
        self.state.lock().pings
    }

    /// Close handshakes initiated locally.
    pub fn closes(&self) -> Vec<(CloseStatus, String)> {
        self.state.lock().closes.clone()
    }
}

/// Test-side controls for one [`ScriptedSession`].
///
/// Dropping the handle ends the session as if the peer vanished
/// (abnormal closure).
pub struct ScriptHandle {
    inbound: mpsc::UnboundedSender<Inbound>,
    write_failure: Arc<Mutex<Option<TransportError>>>,
}

impl ScriptHandle {
    /// Deliver a text message.
    pub fn text(&self, message: impl Into<String>) {
        self.push(Ok(Message::Text(message.into())));
    }

    /// Deliver a binary message.
    pub fn binary(&self, payload: impl Into<Bytes>) {
        self.push(Ok(Message::Binary(payload.into())));
    }

    /// Terminate reads with a close status.
    pub fn close(&self, status: CloseStatus) {
        self.push(Err(TransportError::Closed(status)));
    }

    /// Terminate reads with an arbitrary error.
    pub fn fail_read(&self, error: TransportError) {
        self.push(Err(error));
    }

    /// Make every subsequent write fail with `error`.
    pub fn fail_writes(&self, error: TransportError) {
        *self.write_failure.lock() = Some(error);
    }

    /// Let writes succeed again.
    pub fn heal_writes(&self) {
        *self.write_failure.lock() = None;
    }

    fn push(&self, item: Inbound) {
        let _ = self.inbound.send(item);
    }
}

/// A [`Session`] driven entirely by its [`ScriptHandle`].
pub struct ScriptedSession {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    loopback: mpsc::WeakUnboundedSender<Inbound>,
    write_failure: Arc<Mutex<Option<TransportError>>>,
    log: WriteLog,
    closed: AtomicBool,
}

impl ScriptedSession {
    /// Create a session and the handle that drives it.
    pub fn new() -> (Self, ScriptHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let write_failure = Arc::new(Mutex::new(None));
        let session = Self {
            inbound: tokio::sync::Mutex::new(rx),
            loopback: tx.downgrade(),
            write_failure: Arc::clone(&write_failure),
            log: WriteLog::default(),
            closed: AtomicBool::new(false),
        };
        let handle = ScriptHandle {
            inbound: tx,
            write_failure,
        };
        (session, handle)
    }

    /// The write log; clone it before handing the session to a broker.
    pub fn writes(&self) -> WriteLog {
        self.log.clone()
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn read(&self) -> Result<Message, TransportError> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(item) => item,
            None => Err(TransportError::Closed(CloseStatus::Abnormal)),
        }
    }

    async fn write(&self, kind: MessageKind, payload: &[u8]) -> Result<(), TransportError> {
        let mut state = self.log.state.lock();
        state.attempts += 1;
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if let Some(err) = self.write_failure.lock().clone() {
            return Err(err);
        }
        state.writes.push((kind, payload.to_vec()));
        Ok(())
    }

    async fn ping(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.log.state.lock().pings += 1;
        Ok(())
    }

    async fn close(&self, status: CloseStatus, reason: &str) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.log.state.lock().closes.push((status, reason.to_owned()));
        // The peer echoes the close, which ends the read side.
        if let Some(tx) = self.loopback.upgrade() {
            let _ = tx.send(Err(TransportError::Closed(status)));
        }
        Ok(())
    }
}

/// An [`Acceptor`] whose requests are pre-built [`ScriptedSession`]s.
#[derive(Default)]
pub struct ScriptedAcceptor {
    reject: Option<TransportError>,
    seen: Mutex<Vec<AcceptOptions>>,
}

impl ScriptedAcceptor {
    /// Accept every request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every request with `error`.
    pub fn rejecting(error: TransportError) -> Self {
        Self {
            reject: Some(error),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Options passed to each `accept` call so far.
    pub fn seen_options(&self) -> Vec<AcceptOptions> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Acceptor for ScriptedAcceptor {
    type Request = ScriptedSession;
    type Session = ScriptedSession;

    async fn accept(
        &self,
        request: ScriptedSession,
        options: &AcceptOptions,
    ) -> Result<ScriptedSession, TransportError> {
        self.seen.lock().push(options.clone());
        match &self.reject {
            Some(err) => Err(err.clone()),
            None => Ok(request),
        }
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
