//! Live connection registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::Connection;
use crate::ids::ConnectionId;

/// Set of live connections keyed by ID.
///
/// Every operation takes the same mutex and none of them await while
/// holding it. Broadcast iterates a [`snapshot`](Self::snapshot), so writes
/// happen outside the lock.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Returns `false` if it was already present.
    pub fn insert(&self, connection: Arc<Connection>) -> bool {
        let mut conns = self.connections.lock();
        if conns.contains_key(connection.id()) {
            return false;
        }
        let _ = conns.insert(connection.id().clone(), connection);
        true
    }

    /// Remove a connection. Returns `false` if it was absent.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        self.connections.lock().remove(id).is_some()
    }

    /// Look up one connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().get(id).cloned()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.lock().contains_key(id)
    }

    /// Point-in-time copy of the members, in no particular order.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().values().cloned().collect()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Whether there are no members.
    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSession;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn make_connection() -> Arc<Connection> {
        let (session, _handle) = ScriptedSession::new();
        Arc::new(Connection::new(session))
    }

    #[test]
    fn insert_and_snapshot() {
        let reg = ConnectionRegistry::new();
        let a = make_connection();
        let b = make_connection();
        assert!(reg.insert(Arc::clone(&a)));
        assert!(reg.insert(Arc::clone(&b)));

        let ids: HashSet<ConnectionId> = reg.snapshot().iter().map(|c| c.id().clone()).collect();
        assert_eq!(ids, HashSet::from([a.id().clone(), b.id().clone()]));
    }

    #[test]
    fn insert_is_idempotent() {
        let reg = ConnectionRegistry::new();
        let a = make_connection();
        assert!(reg.insert(Arc::clone(&a)));
        assert!(!reg.insert(a));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_absent_is_noop() {
        let reg = ConnectionRegistry::new();
        let a = make_connection();
        let _ = reg.insert(a);
        assert!(!reg.remove(&ConnectionId::from("nope")));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_then_get_is_none() {
        let reg = ConnectionRegistry::new();
        let a = make_connection();
        let _ = reg.insert(Arc::clone(&a));
        assert!(reg.remove(a.id()));
        assert!(reg.get(a.id()).is_none());
        assert!(!reg.contains(a.id()));
        assert!(reg.is_empty());
    }

    #[test]
    fn snapshot_is_detached() {
        let reg = ConnectionRegistry::new();
        let a = make_connection();
        let _ = reg.insert(Arc::clone(&a));
        let snap = reg.snapshot();
        let _ = reg.remove(a.id());
        assert_eq!(snap.len(), 1);
        assert!(reg.snapshot().is_empty());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Insert(usize),
        Remove(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..8_usize).prop_map(Op::Insert),
            (0..8_usize).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn size_equals_distinct_inserted_minus_removed(ops in proptest::collection::vec(op(), 0..64)) {
            let pool: Vec<Arc<Connection>> = (0..8).map(|_| make_connection()).collect();
            let reg = ConnectionRegistry::new();
            let mut model: HashSet<usize> = HashSet::new();

            for op in ops {
                match op {
                    Op::Insert(i) => {
                        let _ = reg.insert(Arc::clone(&pool[i]));
                        let _ = model.insert(i);
                    }
                    Op::Remove(i) => {
                        let _ = reg.remove(pool[i].id());
                        let _ = model.remove(&i);
                    }
                }
            }

            prop_assert_eq!(reg.len(), model.len());
            for (i, conn) in pool.iter().enumerate() {
                prop_assert_eq!(reg.contains(conn.id()), model.contains(&i));
            }
        }
    }
}
