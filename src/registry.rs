//! Registry of live connections' write queues.
//!
//! The registry stores non-owning weak references to each connection's
//! [`OutboundQueue`], letting the reaper and notifiers deliver responses to
//! connections the reactor may tear down at any moment. A failed upgrade
//! simply means the connection is gone and the delivery is dropped. Dead
//! entries are removed on teardown and can also be pruned opportunistically.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use dashmap::DashMap;

use crate::writer::OutboundQueue;

/// Identifier assigned to a connection at accept time, monotonically
/// increasing for the lifetime of the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Concurrent map from [`ConnectionId`] to that connection's write queue.
#[derive(Debug, Default)]
pub struct ConnectionRegistry(DashMap<ConnectionId, Weak<OutboundQueue>>);

impl ConnectionRegistry {
    /// Retrieve the write queue for `id` if the connection is still alive.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<OutboundQueue>> {
        self.0.get(&id).and_then(|weak| weak.upgrade())
    }

    /// Record a newly accepted connection's queue.
    pub fn insert(&self, id: ConnectionId, queue: &Arc<OutboundQueue>) {
        self.0.insert(id, Arc::downgrade(queue));
    }

    /// Remove an entry, typically on connection teardown.
    pub fn remove(&self, id: ConnectionId) { self.0.remove(&id); }

    /// Drop entries whose connections have terminated.
    pub fn prune(&self) { self.0.retain(|_, weak| weak.strong_count() > 0); }
}
