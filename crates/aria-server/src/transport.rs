//! `tokio-tungstenite` implementation of the broker's transport traits.
//!
//! [`TungsteniteAcceptor`] performs the opening handshake (origin check,
//! subprotocol selection, size limits) and yields a [`TungsteniteSession`]
//! whose halves are locked independently, so the read-loop and a broadcast
//! can use one connection at the same time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async_with_config};
use tracing::{debug, warn};

use aria_core::{
    AcceptOptions, Acceptor, CloseStatus, CompressionMode, Message, MessageKind, Session,
    TransportError,
};

use crate::config::ServerConfig;
use crate::origin::OriginPolicy;

/// Default cap on a reassembled message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
/// Default cap on a single frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Default wait for the pong answering a server ping.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(15);
/// Default deadline for a socket to finish the opening handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ── Acceptor ────────────────────────────────────────────────────────────────

/// Upgrades raw byte streams into WebSocket sessions.
#[derive(Debug)]
pub struct TungsteniteAcceptor {
    max_message_size: usize,
    max_frame_size: usize,
    ping_timeout: Duration,
    handshake_timeout: Duration,
    compression_warned: AtomicBool,
}

impl TungsteniteAcceptor {
    /// Acceptor with default size limits.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Acceptor with explicit message and frame limits in bytes.
    pub fn with_limits(max_message_size: usize, max_frame_size: usize) -> Self {
        Self {
            max_message_size,
            max_frame_size,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            compression_warned: AtomicBool::new(false),
        }
    }

    /// How long [`Session::ping`] waits for the pong on accepted sessions.
    #[must_use]
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Deadline for a TCP socket to complete the opening handshake.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Acceptor using the limits in `config`.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::with_limits(config.max_message_size, config.max_frame_size)
            .with_ping_timeout(config.ping_timeout())
            .with_handshake_timeout(config.handshake_timeout())
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_frame_size);
        config
    }

    /// Handshake over any async byte stream.
    pub async fn accept_stream<S>(
        &self,
        stream: S,
        options: &AcceptOptions,
    ) -> Result<TungsteniteSession<S>, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if options.compression_mode != CompressionMode::Disabled
            && !self.compression_warned.swap(true, Ordering::Relaxed)
        {
            warn!(
                mode = ?options.compression_mode,
                "per-message compression is not supported by this transport, continuing uncompressed"
            );
        }

        let policy = OriginPolicy::from_options(options).map_err(TransportError::Handshake)?;
        let subprotocols = options.subprotocols.as_slice();
        let callback = move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
            if let Err(reason) = policy.check(req.headers()) {
                debug!(%reason, "rejecting handshake");
                let mut rejection = ErrorResponse::new(Some(reason));
                *rejection.status_mut() = StatusCode::FORBIDDEN;
                return Err(rejection);
            }
            if let Some(protocol) = negotiate_subprotocol(req, subprotocols) {
                if let Ok(value) = HeaderValue::from_str(protocol) {
                    let _ = resp.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                }
            }
            Ok(resp)
        };

        let ws = accept_hdr_async_with_config(stream, callback, Some(self.ws_config()))
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(TungsteniteSession::new(ws, options.clone()).with_ping_timeout(self.ping_timeout))
    }
}

impl Default for TungsteniteAcceptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Acceptor for TungsteniteAcceptor {
    type Request = TcpStream;
    type Session = TungsteniteSession<TcpStream>;

    async fn accept(
        &self,
        request: TcpStream,
        options: &AcceptOptions,
    ) -> Result<Self::Session, TransportError> {
        let _ = request.set_nodelay(true);
        tokio::time::timeout(self.handshake_timeout, self.accept_stream(request, options))
            .await
            .map_err(|_| {
                TransportError::Handshake(format!(
                    "handshake not completed within {:?}",
                    self.handshake_timeout
                ))
            })?
    }
}

/// Pick the first server-preferred subprotocol the client offered.
pub fn negotiate_subprotocol<'a>(request: &Request, supported: &'a [String]) -> Option<&'a str> {
    let offered: Vec<&str> = request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    supported
        .iter()
        .find(|s| offered.iter().any(|o| o.eq_ignore_ascii_case(s)))
        .map(String::as_str)
}

// ── Session ─────────────────────────────────────────────────────────────────

/// Pings awaiting their pong, keyed by the payload they were sent with.
type PendingPongs = parking_lot::Mutex<HashMap<u64, oneshot::Sender<()>>>;

/// One accepted WebSocket connection.
#[derive(Debug)]
pub struct TungsteniteSession<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    options: AcceptOptions,
    pongs: PendingPongs,
    next_ping: AtomicU64,
    ping_timeout: Duration,
}

impl<S> TungsteniteSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already upgraded stream.
    pub fn new(ws: WebSocketStream<S>, options: AcceptOptions) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            options,
            pongs: parking_lot::Mutex::new(HashMap::new()),
            next_ping: AtomicU64::new(1),
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }

    /// Override how long [`Session::ping`] waits for its pong.
    #[must_use]
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Wake the ping waiting on `payload`, if any.
    fn complete_pong(&self, payload: &[u8]) {
        let Ok(raw) = <[u8; 8]>::try_from(payload) else {
            return;
        };
        if let Some(waiter) = self.pongs.lock().remove(&u64::from_be_bytes(raw)) {
            let _ = waiter.send(());
        }
    }

    /// Fail every outstanding ping once the read side is finished.
    fn abandon_pongs(&self) {
        self.pongs.lock().clear();
    }

    async fn send(&self, message: WsMessage) -> Result<(), TransportError> {
        self.sink.lock().await.send(message).await.map_err(map_error)
    }
}

#[async_trait]
impl<S> Session for TungsteniteSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read(&self) -> Result<Message, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            let frame = match stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    self.abandon_pongs();
                    return Err(map_error(err));
                }
                None => {
                    self.abandon_pongs();
                    return Err(TransportError::Closed(CloseStatus::Abnormal));
                }
            };
            match frame {
                WsMessage::Text(text) => return Ok(Message::Text(text.as_str().to_owned())),
                WsMessage::Binary(data) => return Ok(Message::Binary(data)),
                WsMessage::Ping(payload) => self.options.notify_ping(&payload),
                WsMessage::Pong(payload) => {
                    self.complete_pong(&payload);
                    self.options.notify_pong(&payload);
                }
                WsMessage::Close(frame) => {
                    self.abandon_pongs();
                    // Push out the queued close echo before the loop stops reading.
                    let _ = self.sink.lock().await.flush().await;
                    let status = frame.map_or(CloseStatus::NoStatusReceived, |f| {
                        CloseStatus::from_code(u16::from(f.code))
                    });
                    return Err(TransportError::Closed(status));
                }
                WsMessage::Frame(_) => {}
            }
        }
    }

    async fn write(&self, kind: MessageKind, payload: &[u8]) -> Result<(), TransportError> {
        let message = match kind {
            MessageKind::Text => {
                let text = std::str::from_utf8(payload)
                    .map_err(|e| TransportError::Io(format!("text payload is not UTF-8: {e}")))?;
                WsMessage::text(text.to_owned())
            }
            MessageKind::Binary => WsMessage::binary(Bytes::copy_from_slice(payload)),
        };
        self.send(message).await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let id = self.next_ping.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let _ = self.pongs.lock().insert(id, tx);
        let pending = PendingPing { pongs: &self.pongs, id };

        self.send(WsMessage::Ping(Bytes::copy_from_slice(&id.to_be_bytes())))
            .await?;
        let outcome = tokio::time::timeout(self.ping_timeout, rx).await;
        drop(pending);
        match outcome {
            Ok(Ok(())) => Ok(()),
            // The read side ended before the pong arrived.
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => Err(TransportError::Io(format!(
                "no pong within {:?}",
                self.ping_timeout
            ))),
        }
    }

    async fn close(&self, status: CloseStatus, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(status.code()),
            reason: reason.to_owned().into(),
        };
        self.send(WsMessage::Close(Some(frame))).await
    }
}

/// Removes a ping's waiter however the ping ends, including cancellation.
struct PendingPing<'a> {
    pongs: &'a PendingPongs,
    id: u64,
}

impl Drop for PendingPing<'_> {
    fn drop(&mut self) {
        let _ = self.pongs.lock().remove(&self.id);
    }
}

/// Translate a tungstenite failure into the broker's vocabulary.
pub(crate) fn map_error(err: WsError) -> TransportError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::NotConnected,
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            TransportError::Closed(CloseStatus::Abnormal)
        }
        WsError::Protocol(_) => TransportError::Closed(CloseStatus::ProtocolError),
        WsError::Capacity(_) => TransportError::Closed(CloseStatus::MessageTooBig),
        WsError::Utf8 { .. } => TransportError::Closed(CloseStatus::InvalidPayload),
        WsError::Io(e) => TransportError::Io(e.to_string()),
        other => TransportError::Io(other.to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
