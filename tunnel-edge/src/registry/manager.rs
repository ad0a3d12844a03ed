//! Tunnel registry — the Manager (spec.md §4.5): subdomain allocation,
//! tunnel registration/reactivation/unregistration, lookup by subdomain or
//! ID, per-user limits, public URL construction, the periodic stats flush,
//! and startup cleanup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use tunnel_protocol::RequestFrame;

use crate::config::EdgeConfig;
use crate::error::EdgeError;
use crate::events::{EventBus, TunnelEvent};
use crate::ids;
use crate::registry::port_pool::PortPool;
use crate::registry::tunnel::Tunnel;
use crate::store::{unix_now, TunnelProtocol, TunnelRow, TunnelRowStatus, TunnelStore};

/// The interface the registry drives to start/stop per-port TCP listeners
/// (C8), kept as a trait so `registry` does not depend on `tcp_proxy`
/// directly — `tcp_proxy::TcpProxy` is the production implementation.
#[async_trait]
pub trait TcpListenerController: Send + Sync {
    async fn start_listener(&self, port: u16, tunnel_id: Uuid) -> Result<(), EdgeError>;
    async fn stop_listener(&self, port: u16);
}

/// A no-op controller for non-TCP-only deployments and tests.
pub struct NullTcpListenerController;

#[async_trait]
impl TcpListenerController for NullTcpListenerController {
    async fn start_listener(&self, _port: u16, _tunnel_id: Uuid) -> Result<(), EdgeError> {
        Ok(())
    }

    async fn stop_listener(&self, _port: u16) {}
}

pub const STATS_FLUSH_INTERVAL: Duration = Duration::from_secs(3);

/// Inputs the caller (C6's registration handler) gathers before calling
/// [`Manager::register`] — everything external (token validation, org
/// lookup) has already happened by this point.
pub struct RegisterRequest {
    pub user_id: Uuid,
    pub token_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub subdomain: String,
    pub protocol: TunnelProtocol,
    pub local_addr: String,
    pub saved_name: Option<String>,
}

pub struct Manager {
    config: Arc<EdgeConfig>,
    store: Arc<dyn TunnelStore>,
    ports: Arc<PortPool>,
    tcp: Arc<dyn TcpListenerController>,
    events: EventBus,
    by_subdomain: DashMap<String, Arc<Tunnel>>,
    by_id: DashMap<Uuid, Arc<Tunnel>>,
    tls_enabled: bool,
}

impl Manager {
    /// Constructs the registry and runs startup cleanup (spec.md §4.5):
    /// any row left `active`/`connected` from a previous process is marked
    /// `offline` — subdomain reservations are retained.
    pub async fn new(
        config: Arc<EdgeConfig>,
        store: Arc<dyn TunnelStore>,
        ports: Arc<PortPool>,
        tcp: Arc<dyn TcpListenerController>,
        events: EventBus,
        tls_enabled: bool,
    ) -> Result<Arc<Manager>, EdgeError> {
        let manager = Arc::new(Manager {
            config,
            store,
            ports,
            tcp,
            events,
            by_subdomain: DashMap::new(),
            by_id: DashMap::new(),
            tls_enabled,
        });
        manager.ports.reload_reservations().await?;
        manager.startup_cleanup().await?;
        Ok(manager)
    }

    async fn startup_cleanup(&self) -> Result<(), EdgeError> {
        let rows = self
            .store
            .list_non_closed_tunnels()
            .await
            .map_err(|e| EdgeError::Internal(e.to_string()))?;
        for row in rows {
            if row.status == TunnelRowStatus::Active {
                if let Err(e) = self
                    .store
                    .update_tunnel_status(row.id, TunnelRowStatus::Offline, Some(unix_now()))
                    .await
                {
                    warn!(tunnel_id = %row.id, error = %e, "startup cleanup failed for a row");
                }
            }
        }
        Ok(())
    }

    pub fn lookup_by_subdomain(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        self.by_subdomain.get(subdomain).map(|e| e.clone())
    }

    pub fn lookup_by_id(&self, id: Uuid) -> Option<Arc<Tunnel>> {
        self.by_id.get(&id).map(|e| e.clone())
    }

    /// Allocates a subdomain (spec.md §4.5 "Allocate subdomain"). If
    /// `requested_custom` is empty, draws a random 8-character candidate
    /// and retries up to 10 times on collision.
    pub async fn allocate_subdomain(
        &self,
        user_id: Uuid,
        organization: Option<(Uuid, &str)>,
        requested_custom: &str,
    ) -> Result<(String, String), EdgeError> {
        if requested_custom.is_empty() {
            for _ in 0..10 {
                let candidate = ids::random_subdomain(8);
                let full = Self::compose_full_subdomain(&candidate, organization.map(|(_, s)| s));
                match self
                    .store
                    .insert_subdomain(&full, user_id, organization.map(|(id, _)| id))
                    .await
                {
                    Ok(()) => return Ok((full, candidate)),
                    Err(crate::store::StoreError::SubdomainTaken) => continue,
                    Err(e) => return Err(EdgeError::Internal(e.to_string())),
                }
            }
            return Err(EdgeError::Internal(
                "failed to allocate a random subdomain after 10 attempts".into(),
            ));
        }

        let custom = ids::normalize(requested_custom);
        if !ids::is_valid(&custom) {
            return Err(EdgeError::InvalidArgument(format!(
                "invalid subdomain: {custom}"
            )));
        }
        let full = Self::compose_full_subdomain(&custom, organization.map(|(_, s)| s));
        match self
            .store
            .insert_subdomain(&full, user_id, organization.map(|(id, _)| id))
            .await
        {
            Ok(()) => Ok((full, custom)),
            Err(crate::store::StoreError::SubdomainTaken) => {
                Err(EdgeError::AlreadyExists(format!("subdomain {full} is taken")))
            }
            Err(e) => Err(EdgeError::Internal(e.to_string())),
        }
    }

    fn compose_full_subdomain(custom: &str, org_subdomain: Option<&str>) -> String {
        match org_subdomain {
            Some(org) => format!("{custom}-{org}"),
            None => custom.to_string(),
        }
    }

    /// Finds a persistent, currently-offline tunnel by its saved name
    /// (spec.md §4.5 "Find offline by saved name").
    pub async fn find_offline_by_saved_name(
        &self,
        user_id: Uuid,
        saved_name: &str,
    ) -> Result<Option<TunnelRow>, EdgeError> {
        self.store
            .find_offline_by_saved_name(user_id, saved_name)
            .await
            .map_err(|e| EdgeError::Internal(e.to_string()))
    }

    /// Public URL construction (spec.md §4.5): TCP gets `tcp://{base}:{port}`;
    /// everything else gets `{scheme}://{subdomain}.{base}[:{port}]` with
    /// the port omitted when it equals the scheme default.
    pub fn build_public_url(&self, protocol: TunnelProtocol, subdomain: &str, port: Option<u16>) -> String {
        let base = &self.config.domain;
        match protocol {
            TunnelProtocol::Tcp => {
                let port = port.expect("tcp tunnels always carry an allocated port");
                format!("tcp://{base}:{port}")
            }
            TunnelProtocol::Http | TunnelProtocol::Https => {
                let scheme = if self.tls_enabled { "https" } else { "http" };
                let (effective_port, default_port) = if self.tls_enabled {
                    (self.config.https_port, 443u16)
                } else {
                    (self.config.http_port, 80u16)
                };
                if effective_port == default_port {
                    format!("{scheme}://{subdomain}.{base}")
                } else {
                    format!("{scheme}://{subdomain}.{base}:{effective_port}")
                }
            }
        }
    }

    /// Registers a brand-new tunnel (spec.md §4.5 "Register"). Enforces the
    /// per-user concurrent-tunnel limit, allocates a TCP port when needed,
    /// adds the tunnel to both in-memory indexes, persists the row, and
    /// emits `TunnelConnected`. Rolls back memory state and releases any
    /// allocated port on storage failure.
    pub async fn register(
        &self,
        request: RegisterRequest,
    ) -> Result<(Arc<Tunnel>, mpsc::Receiver<RequestFrame>), EdgeError> {
        let active_count = self
            .store
            .count_active_for_user(request.user_id)
            .await
            .map_err(|e| EdgeError::Internal(e.to_string()))?;
        if active_count >= self.config.tunnels.max_per_user as u64 {
            return Err(EdgeError::ResourceExhausted(format!(
                "user already has {active_count} active tunnels (limit {})",
                self.config.tunnels.max_per_user
            )));
        }

        let tunnel_id = Uuid::new_v4();
        let mut allocated_port: Option<u16> = None;
        if request.protocol == TunnelProtocol::Tcp {
            let port = self.ports.allocate(tunnel_id).await?;
            if let Err(e) = self.tcp.start_listener(port, tunnel_id).await {
                self.ports.release(port, false).await;
                return Err(e);
            }
            allocated_port = Some(port);
        }

        let public_url = self.build_public_url(request.protocol, &request.subdomain, allocated_port);
        let now = unix_now();

        let row = TunnelRow {
            id: tunnel_id,
            user_id: request.user_id,
            token_id: request.token_id,
            organization_id: request.organization_id,
            protocol: request.protocol,
            subdomain: request.subdomain.clone(),
            remote_port: allocated_port,
            local_addr: request.local_addr.clone(),
            public_url: public_url.clone(),
            status: TunnelRowStatus::Active,
            saved_name: request.saved_name.clone(),
            is_persistent: request.saved_name.is_some(),
            bytes_in: 0,
            bytes_out: 0,
            requests_count: 0,
            connected_at: now,
            disconnected_at: None,
            last_activity_at: now,
        };

        if let Err(e) = self.store.upsert_tunnel(row).await {
            if let Some(port) = allocated_port {
                self.tcp.stop_listener(port).await;
                self.ports.release(port, false).await;
            }
            return Err(EdgeError::Internal(e.to_string()));
        }

        let (tunnel, rx) = Tunnel::new(
            tunnel_id,
            request.user_id,
            request.token_id,
            request.organization_id,
            request.subdomain.clone(),
            request.protocol,
            request.local_addr,
            public_url,
            allocated_port,
            request.saved_name,
            now,
            0,
            0,
            0,
        );

        self.by_subdomain.insert(request.subdomain, tunnel.clone());
        self.by_id.insert(tunnel_id, tunnel.clone());

        info!(tunnel_id = %tunnel_id, subdomain = %tunnel.subdomain, "tunnel registered");
        self.events.emit_tunnel(TunnelEvent::Connected(tunnel.snapshot()));
        Ok((tunnel, rx))
    }

    /// Reactivates a previously-offline persistent tunnel (spec.md §4.5
    /// "Reactivate"): reallocates the same TCP port (or fails), regenerates
    /// the public URL, updates the persisted row, and seeds a fresh
    /// in-memory record from the persisted cumulative counters.
    pub async fn reactivate(
        &self,
        row: TunnelRow,
        new_local_addr: String,
    ) -> Result<(Arc<Tunnel>, mpsc::Receiver<RequestFrame>), EdgeError> {
        let mut port = row.remote_port;
        if row.protocol == TunnelProtocol::Tcp {
            let p = port.ok_or_else(|| {
                EdgeError::Internal("persistent TCP tunnel row is missing its port".into())
            })?;
            self.ports.reallocate(row.id, p).await?;
            if let Err(e) = self.tcp.start_listener(p, row.id).await {
                self.ports.release(p, true).await;
                return Err(e);
            }
            port = Some(p);
        }

        let public_url = self.build_public_url(row.protocol, &row.subdomain, port);
        let now = unix_now();

        self.store
            .upsert_tunnel(TunnelRow {
                status: TunnelRowStatus::Active,
                local_addr: new_local_addr.clone(),
                public_url: public_url.clone(),
                remote_port: port,
                disconnected_at: None,
                last_activity_at: now,
                ..row.clone()
            })
            .await
            .map_err(|e| EdgeError::Internal(e.to_string()))?;

        let (tunnel, rx) = Tunnel::new(
            row.id,
            row.user_id,
            row.token_id,
            row.organization_id,
            row.subdomain.clone(),
            row.protocol,
            new_local_addr,
            public_url,
            port,
            row.saved_name.clone(),
            row.connected_at,
            row.bytes_in,
            row.bytes_out,
            row.requests_count,
        );

        self.by_subdomain.insert(row.subdomain.clone(), tunnel.clone());
        self.by_id.insert(row.id, tunnel.clone());

        info!(tunnel_id = %row.id, subdomain = %row.subdomain, "tunnel reactivated");
        self.events.emit_tunnel(TunnelEvent::Connected(tunnel.snapshot()));
        Ok((tunnel, rx))
    }

    /// Unregisters a tunnel (spec.md §4.5 "Unregister"). Idempotent: a
    /// second call against an already-removed ID returns `Unavailable`
    /// (the spec's "TunnelNotFound").
    pub async fn unregister(&self, tunnel_id: Uuid, reason: &str) -> Result<(), EdgeError> {
        let (_, tunnel) = self
            .by_id
            .remove(&tunnel_id)
            .ok_or_else(|| EdgeError::Unavailable("tunnel not found".into()))?;
        self.by_subdomain.remove(&tunnel.subdomain);
        tunnel.close();

        if let Some(port) = tunnel.port() {
            self.tcp.stop_listener(port).await;
            self.ports.release(port, tunnel.persistent).await;
        }

        // Both named and unnamed tunnels land in `Offline`, retaining the
        // subdomain reservation (the core never deletes a domain) and, for
        // persistent TCP tunnels, the held port via the release() call above.
        if let Err(e) = self
            .store
            .update_tunnel_status(tunnel_id, TunnelRowStatus::Offline, Some(unix_now()))
            .await
        {
            error!(tunnel_id = %tunnel_id, error = %e, "failed to persist unregister status");
        }

        info!(tunnel_id = %tunnel_id, reason, "tunnel unregistered");
        self.events.emit_tunnel(TunnelEvent::Disconnected {
            tunnel_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Background task: every [`STATS_FLUSH_INTERVAL`], walks the by-ID
    /// index and persists each tunnel's current counters (spec.md §4.5
    /// "Periodic stats flush"). Runs until the process exits; failures are
    /// logged and the row is skipped.
    pub async fn run_stats_flush(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(STATS_FLUSH_INTERVAL);
        loop {
            ticker.tick().await;
            for entry in self.by_id.iter() {
                let tunnel = entry.value();
                let stats = tunnel.snapshot();
                if let Err(e) = self
                    .store
                    .update_tunnel_stats(
                        stats.id,
                        stats.bytes_in,
                        stats.bytes_out,
                        stats.requests_count,
                        stats.last_activity,
                    )
                    .await
                {
                    warn!(tunnel_id = %stats.id, error = %e, "stats flush failed for a tunnel");
                    continue;
                }
                self.events.emit_tunnel(TunnelEvent::StatsUpdated(stats));
            }
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn manager() -> Arc<Manager> {
        let config = Arc::new(EdgeConfig::default());
        let store: Arc<dyn TunnelStore> = Arc::new(MemoryStore::new());
        let ports = Arc::new(PortPool::new(
            config.tcp_port_start,
            config.tcp_port_end,
            store.clone(),
        ));
        Manager::new(
            config,
            store,
            ports,
            Arc::new(NullTcpListenerController),
            EventBus::new(),
            false,
        )
        .await
        .unwrap()
    }

    fn register_request(user_id: Uuid, subdomain: &str) -> RegisterRequest {
        RegisterRequest {
            user_id,
            token_id: Uuid::new_v4(),
            organization_id: None,
            subdomain: subdomain.to_string(),
            protocol: TunnelProtocol::Http,
            local_addr: "localhost:3000".to_string(),
            saved_name: None,
        }
    }

    #[tokio::test]
    async fn subdomain_collision_surfaces_already_exists() {
        let manager = manager().await;
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        manager
            .allocate_subdomain(user_a, None, "myapp")
            .await
            .unwrap();
        let err = manager
            .allocate_subdomain(user_b, None, "myapp")
            .await
            .unwrap_err();
        assert!(matches!(err, EdgeError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn register_then_lookup_by_subdomain_and_id() {
        let manager = manager().await;
        let user_id = Uuid::new_v4();
        let (tunnel, _rx) = manager
            .register(register_request(user_id, "myapp"))
            .await
            .unwrap();
        assert!(manager.lookup_by_subdomain("myapp").is_some());
        assert!(manager.lookup_by_id(tunnel.id).is_some());
    }

    #[tokio::test]
    async fn unregister_removes_from_both_indexes_and_is_idempotent() {
        let manager = manager().await;
        let user_id = Uuid::new_v4();
        let (tunnel, _rx) = manager
            .register(register_request(user_id, "myapp"))
            .await
            .unwrap();
        manager.unregister(tunnel.id, "test teardown").await.unwrap();
        assert!(manager.lookup_by_subdomain("myapp").is_none());
        assert!(manager.lookup_by_id(tunnel.id).is_none());
        let err = manager.unregister(tunnel.id, "test teardown").await.unwrap_err();
        assert!(matches!(err, EdgeError::Unavailable(_)));
    }

    #[tokio::test]
    async fn per_user_limit_rejects_beyond_the_configured_maximum() {
        let mut config = EdgeConfig::default();
        config.tunnels.max_per_user = 1;
        let store: Arc<dyn TunnelStore> = Arc::new(MemoryStore::new());
        let ports = Arc::new(PortPool::new(20000, 20010, store.clone()));
        let manager = Manager::new(
            Arc::new(config),
            store,
            ports,
            Arc::new(NullTcpListenerController),
            EventBus::new(),
            false,
        )
        .await
        .unwrap();
        let user_id = Uuid::new_v4();
        manager
            .register(register_request(user_id, "one"))
            .await
            .unwrap();
        let err = manager
            .register(register_request(user_id, "two"))
            .await
            .unwrap_err();
        assert!(matches!(err, EdgeError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn public_url_omits_default_port() {
        let manager = manager().await;
        let url = manager.build_public_url(TunnelProtocol::Http, "myapp", None);
        assert_eq!(url, format!("http://myapp.{}", manager.config.domain));
    }
}
