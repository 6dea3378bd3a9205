//! Transport boundary consumed by the broker.
//!
//! The broker never parses frames or performs handshakes itself. It drives
//! a [`Session`] (one accepted peer) obtained from an [`Acceptor`], and sees
//! inbound traffic only as whole [`Message`]s or a terminal
//! [`TransportError`]. Ping/pong frames never surface through [`Session::read`];
//! implementations answer them and notify the observers in [`AcceptOptions`].

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::TransportError;
use crate::options::AcceptOptions;

/// Payload kind for outbound writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// UTF-8 text frame.
    Text,
    /// Opaque binary frame.
    Binary,
}

/// A complete inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text payload.
    Text(String),
    /// Binary payload.
    Binary(Bytes),
}

impl Message {
    /// The kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text(_) => MessageKind::Text,
            Self::Binary(_) => MessageKind::Binary,
        }
    }

    /// Payload as raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) => data,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Close status carried by a terminated session (RFC 6455 §7.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseStatus {
    /// 1000
    Normal,
    /// 1001
    GoingAway,
    /// 1002
    ProtocolError,
    /// 1003
    Unsupported,
    /// 1005, peer closed without a status code.
    NoStatusReceived,
    /// 1006, connection dropped without a close frame.
    Abnormal,
    /// 1007
    InvalidPayload,
    /// 1008
    PolicyViolation,
    /// 1009
    MessageTooBig,
    /// 1010
    MandatoryExtension,
    /// 1011
    InternalError,
    /// 1012
    ServiceRestart,
    /// 1013
    TryAgainLater,
    /// 1014
    BadGateway,
    /// 1015
    TlsHandshake,
    /// Reserved, library or application code without a named variant.
    Other(u16),
}

impl CloseStatus {
    /// Map a wire close code to a status.
    pub fn from_code(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::ProtocolError,
            1003 => Self::Unsupported,
            1005 => Self::NoStatusReceived,
            1006 => Self::Abnormal,
            1007 => Self::InvalidPayload,
            1008 => Self::PolicyViolation,
            1009 => Self::MessageTooBig,
            1010 => Self::MandatoryExtension,
            1011 => Self::InternalError,
            1012 => Self::ServiceRestart,
            1013 => Self::TryAgainLater,
            1014 => Self::BadGateway,
            1015 => Self::TlsHandshake,
            other => Self::Other(other),
        }
    }

    /// The wire close code.
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolError => 1002,
            Self::Unsupported => 1003,
            Self::NoStatusReceived => 1005,
            Self::Abnormal => 1006,
            Self::InvalidPayload => 1007,
            Self::PolicyViolation => 1008,
            Self::MessageTooBig => 1009,
            Self::MandatoryExtension => 1010,
            Self::InternalError => 1011,
            Self::ServiceRestart => 1012,
            Self::TryAgainLater => 1013,
            Self::BadGateway => 1014,
            Self::TlsHandshake => 1015,
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal closure",
            Self::GoingAway => "going away",
            Self::ProtocolError => "protocol error",
            Self::Unsupported => "unsupported data",
            Self::NoStatusReceived => "no status received",
            Self::Abnormal => "abnormal closure",
            Self::InvalidPayload => "invalid frame payload data",
            Self::PolicyViolation => "policy violation",
            Self::MessageTooBig => "message too big",
            Self::MandatoryExtension => "mandatory extension",
            Self::InternalError => "internal error",
            Self::ServiceRestart => "service restart",
            Self::TryAgainLater => "try again later",
            Self::BadGateway => "bad gateway",
            Self::TlsHandshake => "tls handshake",
            Self::Other(_) => "status",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// One accepted, bidirectional message session.
///
/// Reads and writes may be issued concurrently from different tasks (the
/// read-loop and a broadcast), so implementations serialize internally.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Block until the next complete message or a terminal outcome.
    async fn read(&self) -> Result<Message, TransportError>;

    /// Write one whole message.
    async fn write(&self, kind: MessageKind, payload: &[u8]) -> Result<(), TransportError>;

    /// Send a ping and wait for the peer's pong.
    ///
    /// The pong is only observed by a concurrent [`read`](Self::read), so
    /// this must not be awaited from the task that drives reads.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Initiate the closing handshake.
    async fn close(&self, status: CloseStatus, reason: &str) -> Result<(), TransportError>;
}

/// Upgrades an inbound request into a [`Session`].
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Whatever the listener hands over per inbound connection.
    type Request: Send + 'static;
    /// The session type produced on success.
    type Session: Session;

    /// Perform the handshake using `options` unmodified.
    async fn accept(
        &self,
        request: Self::Request,
        options: &AcceptOptions,
    ) -> Result<Self::Session, TransportError>;
}
