//! # aria-core
//!
//! Connection broker for persistent WebSocket-style message channels.
//!
//! - [`Broker`]: accepts sessions through an [`Acceptor`], tracks them in a
//!   [`ConnectionRegistry`], and fans text messages out with
//!   [`Broker::broadcast_all`] / [`Broker::broadcast_filter`]
//! - Hooks for connect, message, binary message, close, disconnect and error,
//!   configured once through [`BrokerBuilder`]
//! - One read-loop task per connection with guaranteed deregistration
//! - [`Connection`] carries a concurrent key/value [`ConnectionStore`]
//!
//! Framing, handshakes and sockets live behind the [`Session`] and
//! [`Acceptor`] traits; `aria-server` provides the `tokio-tungstenite`
//! implementation.

#![deny(unsafe_code)]

pub mod broker;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod hooks;
pub mod ids;
pub mod metrics;
pub mod options;
pub mod registry;
pub mod testing;
pub mod transport;

pub use broker::{Broker, BrokerBuilder};
pub use connection::{Connection, ConnectionStore};
pub use dispatcher::{Termination, classify};
pub use errors::{BoxError, BroadcastError, BrokerError, HookKind, SendFailure, TransportError};
pub use hooks::HookResult;
pub use ids::ConnectionId;
pub use options::{AcceptOptions, CompressionMode};
pub use registry::ConnectionRegistry;
pub use transport::{Acceptor, CloseStatus, Message, MessageKind, Session};
