//! Connection Registry
//!
//! The authoritative set of live connections. A connection is present if and
//! only if it has been accepted and not yet closed.
//!
//! Every operation takes the same lock. A [`Snapshot`] keeps holding it for as
//! long as it lives, so a broadcast iterating a snapshot never observes a
//! half-applied add or remove, and a removed connection cannot be written to
//! by a broadcast that started before the removal.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::connection::{Connection, ConnectionId};

/// Registry of connected clients
pub struct ConnectionRegistry<C: ?Sized> {
    connections: Mutex<HashMap<ConnectionId, Arc<C>>>,
}

impl<C: Connection + ?Sized> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connection + ?Sized> ConnectionRegistry<C> {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Register an accepted connection
    ///
    /// Re-adding the same id replaces the previous entry, so the registry never
    /// holds duplicates.
    pub fn add(&self, conn: Arc<C>) {
        let id = conn.id();
        let mut connections = self.connections.lock();
        connections.insert(id, conn);
        debug!("Registered {} ({} connected)", id, connections.len());
    }

    /// Remove a connection, returning it if it was present
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<C>> {
        let mut connections = self.connections.lock();
        let removed = connections.remove(&id);
        if removed.is_some() {
            debug!("Unregistered {} ({} connected)", id, connections.len());
        }
        removed
    }

    /// Lock the registry for iteration
    ///
    /// Adds and removes block until the returned snapshot is dropped; keep it
    /// short-lived.
    pub fn snapshot(&self) -> Snapshot<'_, C> {
        Snapshot {
            guard: self.connections.lock(),
        }
    }

    /// Whether a connection is currently registered
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().contains_key(&id)
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Whether no connections are registered
    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Ids of all registered connections
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.lock().keys().copied().collect()
    }
}

impl<C: ?Sized> std::fmt::Debug for ConnectionRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.connections.lock().len())
            .finish()
    }
}

/// Consistent view of the registry, holding its lock
pub struct Snapshot<'a, C: ?Sized> {
    guard: MutexGuard<'a, HashMap<ConnectionId, Arc<C>>>,
}

impl<C: ?Sized> Snapshot<'_, C> {
    /// Iterate the registered connections
    pub fn iter(&self) -> impl Iterator<Item = &Arc<C>> {
        self.guard.values()
    }

    /// Number of connections in the view
    pub fn len(&self) -> usize {
        self.guard.len()
    }

    /// Whether the view is empty
    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::MockConnection;
    use std::collections::HashSet;
    use std::thread;

    fn registry() -> ConnectionRegistry<MockConnection> {
        ConnectionRegistry::new()
    }

    #[test]
    fn test_registry_new() {
        let registry = registry();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_add_and_contains() {
        let registry = registry();
        let conn = Arc::new(MockConnection::new(5000));
        registry.add(Arc::clone(&conn));

        assert!(registry.contains(conn.id()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_add_same_connection_twice_no_duplicate() {
        let registry = registry();
        let conn = Arc::new(MockConnection::new(5000));
        registry.add(Arc::clone(&conn));
        registry.add(Arc::clone(&conn));

        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_returns_connection() {
        let registry = registry();
        let conn = Arc::new(MockConnection::new(5000));
        registry.add(Arc::clone(&conn));

        let removed = registry.remove(conn.id()).expect("connection registered");
        assert!(Arc::ptr_eq(&removed, &conn));
        assert!(!registry.contains(conn.id()));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let registry = registry();
        let conn = Arc::new(MockConnection::new(5000));
        registry.add(Arc::clone(&conn));

        assert!(registry.remove(conn.id()).is_some());
        assert!(registry.remove(conn.id()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_sees_all_connections() {
        let registry = registry();
        let conns: Vec<_> = (0..3)
            .map(|i| Arc::new(MockConnection::new(6000 + i)))
            .collect();
        for conn in &conns {
            registry.add(Arc::clone(conn));
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 3);
        let ids: HashSet<_> = snapshot.iter().map(|c| c.id()).collect();
        for conn in &conns {
            assert!(ids.contains(&conn.id()));
        }
    }

    #[test]
    fn test_snapshot_blocks_mutation_until_dropped() {
        let registry = Arc::new(registry());
        registry.add(Arc::new(MockConnection::new(5000)));

        let snapshot = registry.snapshot();
        let writer = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.add(Arc::new(MockConnection::new(5001))))
        };

        thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(snapshot.len(), 1);
        drop(snapshot);

        writer.join().unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_adds_and_removes() {
        let registry = Arc::new(registry());
        let conns: Vec<_> = (0..64)
            .map(|i| Arc::new(MockConnection::new(10000 + i)))
            .collect();

        let handles: Vec<_> = conns
            .iter()
            .cloned()
            .map(|conn| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.add(conn))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Remove every other connection concurrently
        let removed: Vec<_> = conns.iter().step_by(2).map(|c| c.id()).collect();
        let handles: Vec<_> = removed
            .iter()
            .copied()
            .map(|id| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.remove(id))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_some());
        }

        let expected: HashSet<_> = conns.iter().skip(1).step_by(2).map(|c| c.id()).collect();
        let actual: HashSet<_> = registry.ids().into_iter().collect();
        assert_eq!(actual, expected);
        assert_eq!(registry.len(), expected.len());
    }

    #[test]
    fn test_interleaved_adds_removes_and_snapshots() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Barrier;

        let registry = Arc::new(registry());
        // Half are present up front and get removed while the rest are added
        let initial: Vec<_> = (0..32)
            .map(|i| Arc::new(MockConnection::new(20000 + i)))
            .collect();
        let incoming: Vec<_> = (0..32)
            .map(|i| Arc::new(MockConnection::new(21000 + i)))
            .collect();
        for conn in &initial {
            registry.add(Arc::clone(conn));
        }

        let done = Arc::new(AtomicBool::new(false));
        let start = Arc::new(Barrier::new(initial.len() + incoming.len() + 2));

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let done = Arc::clone(&done);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    let mut views = 0;
                    while !done.load(Ordering::SeqCst) || views == 0 {
                        let snapshot = registry.snapshot();
                        let ids: Vec<_> = snapshot.iter().map(|c| c.id()).collect();
                        let unique: HashSet<_> = ids.iter().copied().collect();
                        assert_eq!(ids.len(), unique.len(), "snapshot holds duplicates");
                        assert_eq!(ids.len(), snapshot.len());
                        views += 1;
                    }
                })
            })
            .collect();

        let removers = initial.iter().map(|conn| {
            let registry = Arc::clone(&registry);
            let start = Arc::clone(&start);
            let id = conn.id();
            thread::spawn(move || {
                start.wait();
                assert!(registry.remove(id).is_some());
            })
        });
        let adders = incoming.iter().cloned().map(|conn| {
            let registry = Arc::clone(&registry);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                registry.add(conn);
            })
        });
        let writers: Vec<_> = removers.chain(adders).collect();

        for handle in writers {
            handle.join().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        for handle in readers {
            handle.join().unwrap();
        }

        let expected: HashSet<_> = incoming.iter().map(|c| c.id()).collect();
        let actual: HashSet<_> = registry.ids().into_iter().collect();
        assert_eq!(actual, expected);
        assert_eq!(registry.len(), incoming.len());
    }

    #[test]
    fn test_trait_object_registry() {
        let registry: ConnectionRegistry<dyn Connection> = ConnectionRegistry::new();
        let conn: Arc<dyn Connection> = Arc::new(MockConnection::new(7000));
        registry.add(Arc::clone(&conn));
        assert!(registry.contains(conn.id()));
    }
}
