//! A live peer and its per-connection key/value store.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::errors::TransportError;
use crate::ids::ConnectionId;
use crate::transport::{CloseStatus, MessageKind, Session};

/// Type-erased value held in a [`ConnectionStore`].
pub type StoreValue = Arc<dyn Any + Send + Sync>;

/// Concurrent string-keyed store attached to each connection.
///
/// Last write wins; keys have no ordering.
#[derive(Default)]
pub struct ConnectionStore {
    entries: RwLock<HashMap<String, StoreValue>>,
}

impl ConnectionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value.
    pub fn set<V>(&self, key: impl Into<String>, value: V)
    where
        V: Any + Send + Sync,
    {
        let _ = self.entries.write().insert(key.into(), Arc::new(value));
    }

    /// Fetch the raw value stored under `key`.
    pub fn get(&self, key: &str) -> Option<StoreValue> {
        self.entries.read().get(key).cloned()
    }

    /// Fetch the value under `key` if it has type `T`.
    pub fn get_as<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.get(key)?.downcast::<T>().ok()
    }

    /// Remove `key`. Returns whether anything was removed.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl fmt::Debug for ConnectionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        let mut keys: Vec<&String> = entries.keys().collect();
        keys.sort();
        f.debug_struct("ConnectionStore").field("keys", &keys).finish()
    }
}

/// An accepted connection.
///
/// Shared as `Arc<Connection>` between the registry, its read-loop and any
/// hook or broadcast pass holding it.
pub struct Connection {
    id: ConnectionId,
    session: Box<dyn Session>,
    store: ConnectionStore,
}

impl Connection {
    /// Wrap an accepted session with a fresh ID and empty store.
    pub fn new(session: impl Session) -> Self {
        Self::from_boxed(Box::new(session))
    }

    /// Wrap an already boxed session.
    pub fn from_boxed(session: Box<dyn Session>) -> Self {
        Self {
            id: ConnectionId::new(),
            session,
            store: ConnectionStore::new(),
        }
    }

    /// This connection's ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// The per-connection store.
    pub fn store(&self) -> &ConnectionStore {
        &self.store
    }

    /// Shorthand for [`ConnectionStore::set`].
    pub fn set<V>(&self, key: impl Into<String>, value: V)
    where
        V: Any + Send + Sync,
    {
        self.store.set(key, value);
    }

    /// Shorthand for [`ConnectionStore::get`].
    pub fn get(&self, key: &str) -> Option<StoreValue> {
        self.store.get(key)
    }

    /// Shorthand for [`ConnectionStore::get_as`].
    pub fn get_as<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.store.get_as(key)
    }

    /// Shorthand for [`ConnectionStore::delete`].
    pub fn delete(&self, key: &str) -> bool {
        self.store.delete(key)
    }

    /// Ping the peer and wait for its pong.
    ///
    /// Awaiting this inside one of this connection's own message hooks
    /// stalls until the transport's ping timeout, since the read-loop is
    /// what observes the pong. Spawn it instead.
    pub async fn ping(&self) -> Result<(), TransportError> {
        self.session.ping().await
    }

    /// Send a whole text message to this peer only.
    pub async fn send_text(&self, message: &str) -> Result<(), TransportError> {
        self.session.write(MessageKind::Text, message.as_bytes()).await
    }

    /// Send a whole binary message to this peer only.
    pub async fn send_binary(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.session.write(MessageKind::Binary, payload).await
    }

    /// Start the closing handshake. The read-loop observes the close and
    /// runs the matching lifecycle hook.
    pub async fn close(&self, status: CloseStatus, reason: &str) -> Result<(), TransportError> {
        self.session.close(status, reason).await
    }

    pub(crate) fn session(&self) -> &dyn Session {
        self.session.as_ref()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
