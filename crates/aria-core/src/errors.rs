//! Error types for the broker and its transport boundary.

use std::fmt;

use thiserror::Error;

use crate::ids::ConnectionId;
use crate::transport::CloseStatus;

/// Boxed error returned by user hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures reported by a [`Session`](crate::transport::Session) or
/// [`Acceptor`](crate::transport::Acceptor).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The session ended with a close status (received or synthesized).
    #[error("connection closed: {0}")]
    Closed(CloseStatus),
    /// The handshake was refused or malformed.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// Underlying I/O failure with no close status attached.
    #[error("transport i/o error: {0}")]
    Io(String),
    /// The session is already closed on our side.
    #[error("connection is not open")]
    NotConnected,
}

impl TransportError {
    /// Close status carried by this error, if any.
    pub fn close_status(&self) -> Option<CloseStatus> {
        match self {
            Self::Closed(status) => Some(*status),
            _ => None,
        }
    }
}

/// Which hook produced a [`BrokerError::Hook`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// on-connect
    Connect,
    /// on-message (text)
    Message,
    /// on-message (binary)
    MessageBinary,
    /// on-close
    Close,
    /// on-disconnect
    Disconnect,
}

impl HookKind {
    /// Slot name as used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "on_connect",
            Self::Message => "on_message",
            Self::MessageBinary => "on_message_binary",
            Self::Close => "on_close",
            Self::Disconnect => "on_disconnect",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the broker, either returned to the caller or passed
/// to the on-error hook.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The transport refused the inbound request; nothing was registered.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] TransportError),
    /// A user hook returned an error.
    #[error("{kind} hook failed: {source}")]
    Hook {
        /// The failing hook.
        kind: HookKind,
        /// What the hook returned.
        #[source]
        source: BoxError,
    },
    /// The read side of a session terminated.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A broadcast write to one connection failed.
    #[error("failed to send to connection {connection_id}: {source}")]
    Send {
        /// The connection whose write failed.
        connection_id: ConnectionId,
        /// The transport failure.
        #[source]
        source: TransportError,
    },
}

impl BrokerError {
    /// The hook kind, when this is a hook failure.
    pub fn hook_kind(&self) -> Option<HookKind> {
        match self {
            Self::Hook { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// The underlying transport error, when there is one.
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            Self::Accept(err) | Self::Transport(err) | Self::Send { source: err, .. } => Some(err),
            Self::Hook { .. } => None,
        }
    }
}

/// One failed delivery within a broadcast pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendFailure {
    /// Connection the write was addressed to.
    pub connection_id: ConnectionId,
    /// Why it failed.
    pub error: TransportError,
}

/// Aggregate of every failed delivery in one broadcast pass.
#[derive(Clone, Debug, Error)]
#[error("broadcast failed for {} of {} connection(s)", .failures.len(), .attempted)]
pub struct BroadcastError {
    attempted: usize,
    failures: Vec<SendFailure>,
}

impl BroadcastError {
    /// Build from the attempted count and the collected failures.
    pub fn new(attempted: usize, failures: Vec<SendFailure>) -> Self {
        Self {
            attempted,
            failures,
        }
    }

    /// Number of sends attempted in the pass.
    pub fn attempted(&self) -> usize {
        self.attempted
    }

    /// Every failure, in send order.
    pub fn failures(&self) -> &[SendFailure] {
        &self.failures
    }

    /// Number of failed sends.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Whether no failures were collected.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether the pass failed for `id`.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.failures.iter().any(|f| &f.connection_id == id)
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn closed_display() {
        let err = TransportError::Closed(CloseStatus::GoingAway);
        assert_eq!(err.to_string(), "connection closed: going away (1001)");
        assert_eq!(err.close_status(), Some(CloseStatus::GoingAway));
    }

    #[test]
    fn io_has_no_close_status() {
        assert_eq!(TransportError::Io("reset".into()).close_status(), None);
    }

    #[test]
    fn hook_error_display_and_source() {
        let err = BrokerError::Hook {
            kind: HookKind::Message,
            source: "bad payload".into(),
        };
        assert_eq!(err.to_string(), "on_message hook failed: bad payload");
        assert_eq!(err.hook_kind(), Some(HookKind::Message));
        assert!(err.source().is_some());
        assert!(err.transport().is_none());
    }

    #[test]
    fn transport_converts_into_broker_error() {
        let err: BrokerError = TransportError::NotConnected.into();
        assert_eq!(err.transport(), Some(&TransportError::NotConnected));
    }

    #[test]
    fn send_error_names_connection() {
        let err = BrokerError::Send {
            connection_id: ConnectionId::from("c1"),
            source: TransportError::Io("broken pipe".into()),
        };
        assert!(err.to_string().contains("c1"));
        assert!(err.to_string().contains("broken pipe"));
    }

    #[test]
    fn broadcast_error_aggregates() {
        let err = BroadcastError::new(
            3,
            vec![SendFailure {
                connection_id: ConnectionId::from("b"),
                error: TransportError::Io("gone".into()),
            }],
        );
        assert_eq!(err.attempted(), 3);
        assert_eq!(err.len(), 1);
        assert!(err.contains(&ConnectionId::from("b")));
        assert!(!err.contains(&ConnectionId::from("a")));
        assert_eq!(err.to_string(), "broadcast failed for 1 of 3 connection(s)");
    }

    #[test]
    fn broadcast_error_boxes_into_hook_error() {
        let boxed: BoxError = BroadcastError::new(1, Vec::new()).into();
        assert!(boxed.to_string().starts_with("broadcast failed"));
    }
}
