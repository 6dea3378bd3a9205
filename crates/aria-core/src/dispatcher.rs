//! Per-connection read-loop.
//!
//! One task per connection reads until the session terminates, routing
//! each message to its hook. The terminal read is classified:
//!
//! - [`Termination::Clean`]: on-close runs; the loop ends without error
//!   unless on-close fails.
//! - [`Termination::Abnormal`]: on-disconnect runs; the loop ends with the
//!   hook's error, or the transport error if the hook succeeded.
//! - [`Termination::Failed`]: no lifecycle hook; the loop ends with the
//!   transport error.
//!
//! The connection leaves the registry before any lifecycle hook runs, and
//! a drop guard covers every other exit (hook error, panic). A non-`Ok`
//! outcome goes to on-error after eviction.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, instrument};

use crate::broker::Broker;
use crate::connection::Connection;
use crate::errors::{BrokerError, HookKind, Result, TransportError};
use crate::hooks::LifecycleHook;
use crate::ids::ConnectionId;
use crate::metrics::WS_MESSAGES_RECEIVED_TOTAL;
use crate::transport::{CloseStatus, Message};

/// How a terminal read is routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// Peer closed normally, went away, or sent no status.
    Clean,
    /// The session broke: protocol error, oversized or invalid payload,
    /// abnormal closure, bad gateway, or a failure with no close status.
    Abnormal,
    /// Any other close status.
    Failed,
}

/// Classify a terminal read error.
pub fn classify(error: &TransportError) -> Termination {
    match error {
        TransportError::Closed(status) => match status {
            CloseStatus::Normal | CloseStatus::GoingAway | CloseStatus::NoStatusReceived => {
                Termination::Clean
            }
            CloseStatus::ProtocolError
            | CloseStatus::Abnormal
            | CloseStatus::InvalidPayload
            | CloseStatus::MessageTooBig
            | CloseStatus::BadGateway => Termination::Abnormal,
            _ => Termination::Failed,
        },
        TransportError::Io(_) | TransportError::NotConnected => Termination::Abnormal,
        TransportError::Handshake(_) => Termination::Failed,
    }
}

struct EvictOnDrop {
    broker: Broker,
    id: ConnectionId,
}

impl Drop for EvictOnDrop {
    fn drop(&mut self) {
        let _ = self.broker.evict(&self.id);
    }
}

/// Drive one connection until it terminates.
#[instrument(skip_all, fields(conn_id = %conn.id()))]
pub(crate) async fn run(broker: Broker, conn: Arc<Connection>) {
    let outcome = {
        let _evict = EvictOnDrop {
            broker: broker.clone(),
            id: conn.id().clone(),
        };
        read_loop(&broker, &conn).await
    };

    match outcome {
        Ok(()) => debug!("read loop finished"),
        Err(err) => {
            debug!(error = %err, "read loop finished with error");
            broker.report(&conn, &err);
        }
    }
}

async fn read_loop(broker: &Broker, conn: &Arc<Connection>) -> Result<()> {
    let hooks = broker.hooks();
    loop {
        let message = match conn.session().read().await {
            Ok(message) => message,
            Err(error) => return terminate(broker, conn, error).await,
        };

        match message {
            Message::Text(text) => {
                counter!(WS_MESSAGES_RECEIVED_TOTAL, "kind" => "text").increment(1);
                if let Some(hook) = &hooks.on_message {
                    hook(broker.clone(), Arc::clone(conn), text)
                        .await
                        .map_err(|source| BrokerError::Hook {
                            kind: HookKind::Message,
                            source,
                        })?;
                }
            }
            Message::Binary(payload) => {
                counter!(WS_MESSAGES_RECEIVED_TOTAL, "kind" => "binary").increment(1);
                if let Some(hook) = &hooks.on_message_binary {
                    hook(broker.clone(), Arc::clone(conn), payload)
                        .await
                        .map_err(|source| BrokerError::Hook {
                            kind: HookKind::MessageBinary,
                            source,
                        })?;
                }
            }
        }
    }
}

async fn terminate(broker: &Broker, conn: &Arc<Connection>, error: TransportError) -> Result<()> {
    let termination = classify(&error);
    debug!(?termination, error = %error, "session terminated");
    let _ = broker.evict(conn.id());

    let hooks = broker.hooks();
    match termination {
        Termination::Clean => invoke(broker, conn, hooks.on_close.as_ref(), HookKind::Close).await,
        Termination::Abnormal => {
            invoke(broker, conn, hooks.on_disconnect.as_ref(), HookKind::Disconnect).await?;
            Err(error.into())
        }
        Termination::Failed => Err(error.into()),
    }
}

/// Run a lifecycle hook if one is registered.
pub(crate) async fn invoke(
    broker: &Broker,
    conn: &Arc<Connection>,
    hook: Option<&LifecycleHook>,
    kind: HookKind,
) -> Result<()> {
    let Some(hook) = hook else {
        return Ok(());
    };
    hook(broker.clone(), Arc::clone(conn))
        .await
        .map_err(|source| BrokerError::Hook { kind, source })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
