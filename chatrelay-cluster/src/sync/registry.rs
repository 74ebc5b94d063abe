use chatrelay_core::models::{generate_id, Principal};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::outbound::{OutboundFrame, OutboundQueue};
use crate::error::Error;

/// One live session: queue producer plus the shutdown signal of its writer
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: String,
    principal: Principal,
    queue: OutboundQueue,
    shutdown: CancellationToken,
    connected_at: Instant,
}

impl ConnectionHandle {
    #[must_use]
    pub fn new(principal: Principal, queue: OutboundQueue) -> Self {
        Self {
            connection_id: generate_id(),
            principal,
            queue,
            shutdown: CancellationToken::new(),
            connected_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub const fn principal(&self) -> &Principal {
        &self.principal
    }

    #[must_use]
    pub const fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Token the writer task watches; cancelled on eviction and shutdown
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn enqueue(&self, frame: OutboundFrame) -> crate::Result<()> {
        if self.is_shut_down() {
            return Err(Error::ConnectionClosed);
        }
        self.queue.enqueue(frame)
    }

    #[must_use]
    pub fn same_connection(&self, other: &Self) -> bool {
        self.connection_id == other.connection_id
    }
}

/// Result of a registry delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Principal has no live connection on this process
    NotConnected,
    /// Recipient queue at capacity; frame dropped
    QueueFull,
    /// Connection is shutting down
    Closed,
}

/// Process-local map of principal to its single live connection
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<Principal, ConnectionHandle>>>,

    /// Metrics
    total_registrations: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` as the live connection of its principal
    ///
    /// A previous handle for the same principal is signalled to shut down
    /// under the same write lock, so no lookup ever observes both. Returns the
    /// evicted handle.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let principal = handle.principal().clone();
        let connection_id = handle.connection_id().to_string();

        let evicted = {
            let mut connections = self.connections.write();
            let evicted = connections.remove(&principal);
            if let Some(old) = &evicted {
                old.shutdown();
            }
            connections.insert(principal.clone(), handle);
            evicted
        };

        self.total_registrations.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = &evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            info!(
                principal = %principal,
                connection_id = %connection_id,
                evicted_connection_id = %old.connection_id(),
                "Connection replaced, previous session evicted"
            );
        } else {
            info!(
                principal = %principal,
                connection_id = %connection_id,
                "Connection registered"
            );
        }

        evicted
    }

    /// Remove the entry for `handle`'s principal if it still refers to `handle`
    ///
    /// A stale unregister from an evicted session leaves its replacement alone.
    pub fn unregister(&self, handle: &ConnectionHandle) -> bool {
        let removed = {
            let mut connections = self.connections.write();
            match connections.get(handle.principal()) {
                Some(current) if current.same_connection(handle) => {
                    connections.remove(handle.principal());
                    true
                }
                _ => false,
            }
        };

        if removed {
            info!(
                principal = %handle.principal(),
                connection_id = %handle.connection_id(),
                duration = ?handle.duration(),
                "Connection unregistered"
            );
        } else {
            debug!(
                principal = %handle.principal(),
                connection_id = %handle.connection_id(),
                "Stale unregister ignored"
            );
        }
        removed
    }

    /// Current handle for `principal`; may be stale by the time it is used
    #[must_use]
    pub fn lookup(&self, principal: &Principal) -> Option<ConnectionHandle> {
        self.connections.read().get(principal).cloned()
    }

    #[must_use]
    pub fn is_connected(&self, principal: &Principal) -> bool {
        self.connections.read().contains_key(principal)
    }

    /// Subset of `principals` connected to this process, in input order
    #[must_use]
    pub fn enumerate(&self, principals: &[Principal]) -> Vec<Principal> {
        let connections = self.connections.read();
        principals
            .iter()
            .filter(|p| connections.contains_key(*p))
            .cloned()
            .collect()
    }

    /// Non-blocking delivery to `principal`'s live connection, if any
    pub fn deliver(&self, principal: &Principal, frame: OutboundFrame) -> DeliveryOutcome {
        // Lock released before enqueue
        let Some(handle) = self.lookup(principal) else {
            return DeliveryOutcome::NotConnected;
        };

        match handle.enqueue(frame) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                DeliveryOutcome::Delivered
            }
            Err(Error::QueueFull { capacity }) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    principal = %principal,
                    connection_id = %handle.connection_id(),
                    capacity,
                    "Outbound queue full, frame dropped"
                );
                DeliveryOutcome::QueueFull
            }
            Err(_) => DeliveryOutcome::Closed,
        }
    }

    /// Remove every entry and signal each handle to shut down
    pub fn shutdown_all(&self) -> usize {
        let drained: Vec<ConnectionHandle> = {
            let mut connections = self.connections.write();
            connections.drain().map(|(_, handle)| handle).collect()
        };

        for handle in &drained {
            handle.shutdown();
        }
        info!(count = drained.len(), "All connections signalled to shut down");
        drained.len()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    #[must_use]
    pub fn metrics(&self) -> RegistryMetrics {
        RegistryMetrics {
            active_connections: self.connection_count(),
            total_registrations: self.total_registrations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Registry metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryMetrics {
    pub active_connections: usize,
    pub total_registrations: u64,
    pub evictions: u64,
    pub delivered: u64,
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(principal: &str, capacity: usize) -> (ConnectionHandle, tokio::sync::mpsc::Receiver<OutboundFrame>) {
        let (queue, rx) = OutboundQueue::bounded(capacity);
        (ConnectionHandle::new(principal.into(), queue), rx)
    }

    fn ping() -> OutboundFrame {
        OutboundFrame::error("TEST", "ping")
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let (alice, _rx) = handle("alice", 8);

        assert!(registry.register(alice.clone()).is_none());

        let found = registry.lookup(&"alice".into()).unwrap();
        assert!(found.same_connection(&alice));
        assert!(registry.lookup(&"bob".into()).is_none());
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_second_register_evicts_first() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle("alice", 8);
        let (second, _rx2) = handle("alice", 8);

        registry.register(first.clone());
        let evicted = registry.register(second.clone()).unwrap();

        assert!(evicted.same_connection(&first));
        assert!(first.is_shut_down());
        assert!(!second.is_shut_down());
        assert!(registry.lookup(&"alice".into()).unwrap().same_connection(&second));
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.metrics().evictions, 1);
    }

    #[test]
    fn test_stale_unregister_keeps_replacement() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle("alice", 8);
        let (second, _rx2) = handle("alice", 8);

        registry.register(first.clone());
        registry.register(second.clone());

        assert!(!registry.unregister(&first));
        assert!(registry.lookup(&"alice".into()).unwrap().same_connection(&second));

        assert!(registry.unregister(&second));
        assert!(registry.lookup(&"alice".into()).is_none());
    }

    #[test]
    fn test_enumerate_preserves_input_order() {
        let registry = ConnectionRegistry::new();
        let (carol, _rx1) = handle("carol", 8);
        let (alice, _rx2) = handle("alice", 8);
        registry.register(carol);
        registry.register(alice);

        let online = registry.enumerate(&["alice".into(), "bob".into(), "carol".into()]);
        assert_eq!(online, vec![Principal::from("alice"), Principal::from("carol")]);
        assert!(registry.enumerate(&[]).is_empty());
    }

    #[test]
    fn test_deliver_outcomes() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.deliver(&"bob".into(), ping()), DeliveryOutcome::NotConnected);

        let (bob, mut rx) = handle("bob", 1);
        registry.register(bob.clone());

        assert_eq!(registry.deliver(&"bob".into(), ping()), DeliveryOutcome::Delivered);
        assert_eq!(registry.deliver(&"bob".into(), ping()), DeliveryOutcome::QueueFull);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        bob.shutdown();
        assert_eq!(registry.deliver(&"bob".into(), ping()), DeliveryOutcome::Closed);

        let metrics = registry.metrics();
        assert_eq!(metrics.delivered, 1);
        assert_eq!(metrics.dropped, 1);
    }

    #[test]
    fn test_deliver_to_dropped_writer_is_closed() {
        let registry = ConnectionRegistry::new();
        let (bob, rx) = handle("bob", 4);
        registry.register(bob);
        drop(rx);

        assert_eq!(registry.deliver(&"bob".into(), ping()), DeliveryOutcome::Closed);
    }

    #[test]
    fn test_shutdown_all() {
        let registry = ConnectionRegistry::new();
        let (alice, _rx1) = handle("alice", 8);
        let (bob, _rx2) = handle("bob", 8);
        registry.register(alice.clone());
        registry.register(bob.clone());

        assert_eq!(registry.shutdown_all(), 2);
        assert!(alice.is_shut_down());
        assert!(bob.is_shut_down());
        assert_eq!(registry.connection_count(), 0);
        assert!(!registry.unregister(&alice));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registers_leave_one_live_handle() {
        let registry = ConnectionRegistry::new();
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (queue, rx) = OutboundQueue::bounded(4);
                let handle = ConnectionHandle::new("alice".into(), queue);
                registry.register(handle.clone());
                (handle, rx)
            }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }

        let live: Vec<_> = handles.iter().filter(|(h, _)| !h.is_shut_down()).collect();
        assert_eq!(live.len(), 1);
        assert!(registry
            .lookup(&"alice".into())
            .unwrap()
            .same_connection(&live[0].0));
        assert_eq!(registry.metrics().total_registrations, 32);
        assert_eq!(registry.metrics().evictions, 31);
    }
}
