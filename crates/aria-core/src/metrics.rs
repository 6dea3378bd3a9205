//! Metric names recorded by the broker.
//!
//! The library only records through the `metrics` facade; installing a
//! recorder or exporter is left to the embedding application. Without one,
//! every call is a no-op.

/// Connections registered total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Connections evicted total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Registered connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Messages received total (counter, labels: kind).
pub const WS_MESSAGES_RECEIVED_TOTAL: &str = "ws_messages_received_total";
/// Broadcast passes total (counter).
pub const WS_BROADCASTS_TOTAL: &str = "ws_broadcasts_total";
/// Failed broadcast deliveries total (counter).
pub const WS_BROADCAST_FAILURES_TOTAL: &str = "ws_broadcast_failures_total";
/// Hook failures total (counter, labels: hook).
pub const WS_HOOK_ERRORS_TOTAL: &str = "ws_hook_errors_total";
