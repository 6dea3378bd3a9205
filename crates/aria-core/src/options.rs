//! Accept-time options handed to the transport unmodified.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Observer for raw ping or pong payloads.
pub type FrameObserver = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Per-message compression negotiation mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMode {
    /// Never negotiate compression.
    #[default]
    Disabled,
    /// Compress with a sliding window shared across messages.
    ContextTakeover,
    /// Compress each message independently.
    NoContextTakeover,
}

/// Handshake and session options.
///
/// Built once per broker and passed to every
/// [`Acceptor::accept`](crate::transport::Acceptor::accept) call.
#[derive(Clone, Default)]
pub struct AcceptOptions {
    /// Subprotocols the server is willing to select, in preference order.
    pub subprotocols: Vec<String>,
    /// Glob patterns for cross-origin hosts allowed to connect.
    pub origin_patterns: Vec<String>,
    /// Skip origin verification entirely.
    pub insecure_skip_verify: bool,
    /// Compression negotiation mode.
    pub compression_mode: CompressionMode,
    /// Minimum message size in bytes before compression applies.
    pub compression_threshold: usize,
    /// Called with the payload of every ping received.
    pub on_ping_received: Option<FrameObserver>,
    /// Called with the payload of every pong received.
    pub on_pong_received: Option<FrameObserver>,
}

impl AcceptOptions {
    /// Options with everything disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the accepted subprotocols.
    #[must_use]
    pub fn with_subprotocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Set the allowed origin patterns.
    #[must_use]
    pub fn with_origin_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.origin_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Toggle origin verification bypass.
    #[must_use]
    pub fn with_insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }

    /// Set the compression mode.
    #[must_use]
    pub fn with_compression_mode(mut self, mode: CompressionMode) -> Self {
        self.compression_mode = mode;
        self
    }

    /// Set the compression threshold in bytes.
    #[must_use]
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Observe incoming ping payloads. Pongs are still sent automatically.
    #[must_use]
    pub fn with_on_ping_received<F>(mut self, observer: F) -> Self
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.on_ping_received = Some(Arc::new(observer));
        self
    }

    /// Observe incoming pong payloads.
    #[must_use]
    pub fn with_on_pong_received<F>(mut self, observer: F) -> Self
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.on_pong_received = Some(Arc::new(observer));
        self
    }

    /// Notify the ping observer, if any.
    pub fn notify_ping(&self, payload: &[u8]) {
        if let Some(observer) = &self.on_ping_received {
            observer(payload);
        }
    }

    /// Notify the pong observer, if any.
    pub fn notify_pong(&self, payload: &[u8]) {
        if let Some(observer) = &self.on_pong_received {
            observer(payload);
        }
    }
}

impl fmt::Debug for AcceptOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptOptions")
            .field("subprotocols", &self.subprotocols)
            .field("origin_patterns", &self.origin_patterns)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("compression_mode", &self.compression_mode)
            .field("compression_threshold", &self.compression_threshold)
            .field("on_ping_received", &self.on_ping_received.is_some())
            .field("on_pong_received", &self.on_pong_received.is_some())
            .finish()
    }
}
