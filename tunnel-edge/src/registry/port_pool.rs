//! Port pool (spec.md §4.4): allocation and release over a contiguous TCP
//! port range, with persistent reservation for named tunnels. In-memory
//! free/held bookkeeping is mirrored to the store's port-reservation table
//! so the assignment survives a restart; the in-memory half is what guards
//! concurrent allocation within one process.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::EdgeError;
use crate::store::TunnelStore;

struct Inner {
    /// Ports free to hand out right now.
    free: BTreeSet<u16>,
    /// Ports currently bound to a tunnel, live or held-for-reconnect.
    held: HashMap<u16, Uuid>,
}

pub struct PortPool {
    low: u16,
    high: u16,
    store: Arc<dyn TunnelStore>,
    inner: Mutex<Inner>,
}

impl PortPool {
    pub fn new(low: u16, high: u16, store: Arc<dyn TunnelStore>) -> Self {
        assert!(low <= high, "port pool range must be non-empty");
        let free = (low..=high).collect();
        PortPool {
            low,
            high,
            store,
            inner: Mutex::new(Inner {
                free,
                held: HashMap::new(),
            }),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.low, self.high)
    }

    /// Reloads persisted port reservations from the store, withholding
    /// every already-reserved port from `free` (spec.md §3 "Port
    /// reservation (persisted, TCP only)"). Called once at startup, before
    /// the registry accepts any registration — a process restart must not
    /// hand a port still held by a disconnected tunnel to someone new.
    pub async fn reload_reservations(&self) -> Result<(), EdgeError> {
        let reservations = self
            .store
            .list_port_reservations()
            .await
            .map_err(|e| EdgeError::Internal(e.to_string()))?;
        let mut inner = self.inner.lock();
        for (port, tunnel_id) in reservations {
            if port < self.low || port > self.high {
                continue;
            }
            inner.free.remove(&port);
            inner.held.insert(port, tunnel_id);
        }
        Ok(())
    }

    /// Selects the lowest free port and reserves it for `tunnel_id`.
    pub async fn allocate(&self, tunnel_id: Uuid) -> Result<u16, EdgeError> {
        let port = {
            let mut inner = self.inner.lock();
            let port = *inner
                .free
                .iter()
                .next()
                .ok_or_else(|| EdgeError::ResourceExhausted("no available ports".into()))?;
            inner.free.remove(&port);
            inner.held.insert(port, tunnel_id);
            port
        };
        if let Err(e) = self
            .store
            .insert_port_reservation(port, tunnel_id, false)
            .await
        {
            self.inner.lock().held.remove(&port);
            self.inner.lock().free.insert(port);
            return Err(EdgeError::Internal(format!(
                "failed to persist port reservation: {e}"
            )));
        }
        Ok(port)
    }

    /// Reclaims the exact previously-held port for a persistent
    /// reactivation. Fails only if another live tunnel currently owns it.
    pub async fn reallocate(&self, tunnel_id: Uuid, port: u16) -> Result<(), EdgeError> {
        if port < self.low || port > self.high {
            return Err(EdgeError::FailedPrecondition(format!(
                "port {port} is outside the configured range"
            )));
        }
        {
            let mut inner = self.inner.lock();
            if let Some(owner) = inner.held.get(&port) {
                if *owner != tunnel_id {
                    return Err(EdgeError::FailedPrecondition(format!(
                        "port {port} is held by another tunnel"
                    )));
                }
            }
            inner.free.remove(&port);
            inner.held.insert(port, tunnel_id);
        }
        self.store
            .insert_port_reservation(port, tunnel_id, true)
            .await
            .map_err(|e| EdgeError::Internal(format!("failed to persist port reservation: {e}")))
    }

    /// Releases `port`. If `persistent`, the port stays out of the free set
    /// (held-for-tunnel) until the tunnel itself is deleted; otherwise it
    /// returns to the free set immediately. Idempotent: releasing an
    /// already-released port with the same persistence flag is a no-op.
    pub async fn release(&self, port: u16, persistent: bool) {
        let mut inner = self.inner.lock();
        if persistent {
            // Stays in `held` — nothing to do beyond what allocate/reallocate
            // already recorded.
            return;
        }
        if inner.held.remove(&port).is_some() {
            inner.free.insert(port);
            drop(inner);
            let _ = self.store.delete_port_reservation(port).await;
        }
    }

    /// Permanently frees a held port (tunnel deletion, not merely
    /// disconnect). Only meaningful for ports released with `persistent =
    /// true`.
    pub async fn forget(&self, port: u16) {
        self.inner.lock().held.remove(&port);
        self.inner.lock().free.insert(port);
        let _ = self.store.delete_port_reservation(port).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn pool() -> PortPool {
        PortPool::new(20000, 20002, Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn allocates_lowest_free_port() {
        let pool = pool();
        let t1 = Uuid::new_v4();
        assert_eq!(pool.allocate(t1).await.unwrap(), 20000);
        let t2 = Uuid::new_v4();
        assert_eq!(pool.allocate(t2).await.unwrap(), 20001);
    }

    #[tokio::test]
    async fn exhausts_and_reports_no_available_ports() {
        let pool = pool();
        for _ in 0..3 {
            pool.allocate(Uuid::new_v4()).await.unwrap();
        }
        let err = pool.allocate(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EdgeError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn persistent_release_holds_port_until_reallocated() {
        let pool = pool();
        let tunnel_id = Uuid::new_v4();
        let port = pool.allocate(tunnel_id).await.unwrap();
        pool.release(port, true).await;
        // Held, not free: a new tunnel must not receive it.
        let other = Uuid::new_v4();
        let p2 = pool.allocate(other).await.unwrap();
        assert_ne!(p2, port);
        // Same tunnel reconnecting reacquires it.
        pool.reallocate(tunnel_id, port).await.unwrap();
        assert!(pool.reallocate(other, port).await.is_err());
    }

    #[tokio::test]
    async fn transient_release_returns_port_to_free_set() {
        let pool = pool();
        let tunnel_id = Uuid::new_v4();
        let port = pool.allocate(tunnel_id).await.unwrap();
        pool.release(port, false).await;
        pool.release(port, false).await; // idempotent no-op
        let p2 = pool.allocate(Uuid::new_v4()).await.unwrap();
        assert_eq!(p2, port);
    }
}
