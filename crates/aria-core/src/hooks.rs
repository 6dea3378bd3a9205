//! Hook table: one optional callback per lifecycle or message event.
//!
//! Async hooks receive a [`Broker`] handle (so they can broadcast) and the
//! connection the event belongs to. The on-error hook is a synchronous
//! observer; it runs inline on whichever task hit the failure.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::broker::Broker;
use crate::connection::Connection;
use crate::errors::{BoxError, BrokerError};

/// What an async hook returns.
pub type HookResult = Result<(), BoxError>;

/// on-connect, on-close and on-disconnect.
pub type LifecycleHook =
    Arc<dyn Fn(Broker, Arc<Connection>) -> BoxFuture<'static, HookResult> + Send + Sync>;

/// on-message (text).
pub type TextHook =
    Arc<dyn Fn(Broker, Arc<Connection>, String) -> BoxFuture<'static, HookResult> + Send + Sync>;

/// on-message (binary).
pub type BinaryHook =
    Arc<dyn Fn(Broker, Arc<Connection>, Bytes) -> BoxFuture<'static, HookResult> + Send + Sync>;

/// on-error.
pub type ErrorHook = Arc<dyn Fn(&Broker, &Arc<Connection>, &BrokerError) + Send + Sync>;

/// The six hook slots. Absent slots are no-ops.
#[derive(Clone, Default)]
pub struct Hooks {
    pub(crate) on_connect: Option<LifecycleHook>,
    pub(crate) on_message: Option<TextHook>,
    pub(crate) on_message_binary: Option<BinaryHook>,
    pub(crate) on_close: Option<LifecycleHook>,
    pub(crate) on_disconnect: Option<LifecycleHook>,
    pub(crate) on_error: Option<ErrorHook>,
}

impl Hooks {
    /// Names of the registered slots, for logging.
    pub fn registered(&self) -> Vec<&'static str> {
        [
            ("on_connect", self.on_connect.is_some()),
            ("on_message", self.on_message.is_some()),
            ("on_message_binary", self.on_message_binary.is_some()),
            ("on_close", self.on_close.is_some()),
            ("on_disconnect", self.on_disconnect.is_some()),
            ("on_error", self.on_error.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect()
    }
}

pub(crate) fn lifecycle<F, Fut>(hook: F) -> LifecycleHook
where
    F: Fn(Broker, Arc<Connection>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HookResult> + Send + 'static,
{
    Arc::new(move |broker: Broker, conn: Arc<Connection>| hook(broker, conn).boxed())
}

pub(crate) fn text<F, Fut>(hook: F) -> TextHook
where
    F: Fn(Broker, Arc<Connection>, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HookResult> + Send + 'static,
{
    Arc::new(move |broker: Broker, conn: Arc<Connection>, message: String| {
        hook(broker, conn, message).boxed()
    })
}

pub(crate) fn binary<F, Fut>(hook: F) -> BinaryHook
where
    F: Fn(Broker, Arc<Connection>, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HookResult> + Send + 'static,
{
    Arc::new(move |broker: Broker, conn: Arc<Connection>, payload: Bytes| {
        hook(broker, conn, payload).boxed()
    })
}

pub(crate) fn error<F>(hook: F) -> ErrorHook
where
    F: Fn(&Broker, &Arc<Connection>, &BrokerError) + Send + Sync + 'static,
{
    Arc::new(hook)
}
