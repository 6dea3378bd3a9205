//! Server configuration.

use std::time::Duration;

use aria_core::{AcceptOptions, CompressionMode};
use serde::{Deserialize, Serialize};

/// Configuration for the aria server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Max single frame size in bytes.
    pub max_frame_size: usize,
    /// How long shutdown waits for read-loops to finish.
    pub shutdown_timeout_secs: u64,
    /// How long an accepted socket may take to complete the opening handshake.
    pub handshake_timeout_ms: u64,
    /// How long a server ping waits for the peer's pong.
    pub ping_timeout_ms: u64,
    /// Handshake options.
    pub accept: AcceptConfig,
}

impl ServerConfig {
    /// `host:port` as passed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Shutdown drain timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Opening handshake deadline.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Ping-to-pong deadline.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Accept options for [`aria_core::BrokerBuilder::accept_options`].
    pub fn accept_options(&self) -> AcceptOptions {
        self.accept.to_options()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            max_frame_size: 16 * 1024 * 1024,
            shutdown_timeout_secs: 10,
            handshake_timeout_ms: 10_000,
            ping_timeout_ms: 15_000,
            accept: AcceptConfig::default(),
        }
    }
}

/// Serializable subset of [`AcceptOptions`]. Ping/pong observers are code,
/// not config, and are added on the options afterwards.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptConfig {
    /// Subprotocols to select from, in preference order.
    pub subprotocols: Vec<String>,
    /// Glob patterns for allowed cross-origin hosts.
    pub origin_patterns: Vec<String>,
    /// Skip origin verification.
    pub insecure_skip_verify: bool,
    /// Compression mode.
    pub compression_mode: CompressionMode,
    /// Compression threshold in bytes.
    pub compression_threshold: usize,
}

impl AcceptConfig {
    /// Build the equivalent [`AcceptOptions`].
    pub fn to_options(&self) -> AcceptOptions {
        AcceptOptions::new()
            .with_subprotocols(self.subprotocols.iter().cloned())
            .with_origin_patterns(self.origin_patterns.iter().cloned())
            .with_insecure_skip_verify(self.insecure_skip_verify)
            .with_compression_mode(self.compression_mode)
            .with_compression_threshold(self.compression_threshold)
    }
}
