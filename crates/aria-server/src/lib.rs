//! # aria-server
//!
//! Runs an [`aria_core::Broker`] on real sockets.
//!
//! - [`TungsteniteAcceptor`] / [`TungsteniteSession`]: the `tokio-tungstenite`
//!   transport, with origin checks, subprotocol negotiation and size limits
//! - [`AriaServer`]: TCP accept loop with graceful shutdown
//! - [`ServerConfig`] and [`loader`]: JSON file plus `ARIA_*` env overrides
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod loader;
pub mod logging;
pub mod origin;
pub mod server;
pub mod shutdown;
pub mod transport;

pub use config::{AcceptConfig, ServerConfig};
pub use errors::{ConfigError, ServerError};
pub use loader::load_config;
pub use origin::OriginPolicy;
pub use server::AriaServer;
pub use shutdown::ShutdownCoordinator;
pub use transport::{TungsteniteAcceptor, TungsteniteSession};
