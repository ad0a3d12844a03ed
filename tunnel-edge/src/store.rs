//! External collaborator contracts (spec.md §4.11, §6).
//!
//! Persistent storage, token issuance, and TLS certificate provisioning are
//! out of scope for this crate (spec.md §1) — the core is written against
//! thin trait objects instead. Production callers plug in a real
//! implementation (a relational store, an OAuth/TOTP service, ACME
//! automation); this module also ships an in-memory `MemoryStore` and a
//! self-signed `DevTlsConfigProvider` so the registry and proxy layers have
//! something to run against in tests and local development.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

/// Tunnel protocol, stored alongside the persisted row (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelProtocol {
    Http,
    Https,
    Tcp,
}

impl TunnelProtocol {
    pub fn from_public_url_scheme(url: &str) -> Option<Self> {
        if url.starts_with("https://") {
            Some(TunnelProtocol::Https)
        } else if url.starts_with("tcp://") {
            Some(TunnelProtocol::Tcp)
        } else if url.starts_with("http://") {
            Some(TunnelProtocol::Http)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelRowStatus {
    Active,
    Offline,
    Closed,
}

/// The persisted shape of a tunnel row (spec.md §6 `tunnels` table).
#[derive(Debug, Clone)]
pub struct TunnelRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub protocol: TunnelProtocol,
    pub subdomain: String,
    pub remote_port: Option<u16>,
    pub local_addr: String,
    pub public_url: String,
    pub status: TunnelRowStatus,
    pub saved_name: Option<String>,
    pub is_persistent: bool,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub requests_count: u64,
    pub connected_at: u64,
    pub disconnected_at: Option<u64>,
    pub last_activity_at: u64,
}

/// Append-only request log row (spec.md §6 `request_logs`).
#[derive(Debug, Clone)]
pub struct RequestLogRow {
    pub id: Uuid,
    pub tunnel_id: Uuid,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub duration_ms: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub client_ip: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct WebhookAppRow {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct WebhookRouteRow {
    pub id: Uuid,
    pub webhook_app_id: Uuid,
    pub tunnel_id: Uuid,
    pub priority: i32,
    pub is_enabled: bool,
    pub health_status: RouteHealth,
    pub failure_count: u32,
}

#[derive(Debug, Clone)]
pub struct WebhookEventRow {
    pub id: Uuid,
    pub webhook_app_id: Uuid,
    pub success: bool,
    pub tunnel_count: u32,
    pub success_count: u32,
    pub created_at: u64,
}

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("subdomain already taken")]
    SubdomainTaken,
    #[error("port {0} is held by another tunnel")]
    PortHeld(u16),
    #[error("not found")]
    NotFound,
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Thin repository contract the registry (C5) and proxy layers drive.
///
/// Every method that can race against a concurrent caller (subdomain
/// insert, port insert) is expected to enforce uniqueness at the storage
/// layer itself (spec.md §5 "races resolve with `SubdomainTaken`") —
/// callers never pre-check-then-insert.
#[async_trait]
pub trait TunnelStore: Send + Sync {
    /// Inserts a new globally-unique subdomain reservation.
    async fn insert_subdomain(
        &self,
        subdomain: &str,
        user_id: Uuid,
        organization_id: Option<Uuid>,
    ) -> Result<(), StoreError>;

    /// Inserts or updates a tunnel row (used on register/reactivate/unregister).
    async fn upsert_tunnel(&self, row: TunnelRow) -> Result<(), StoreError>;

    /// Updates only the mutable status-bearing columns of a tunnel row.
    async fn update_tunnel_status(
        &self,
        id: Uuid,
        status: TunnelRowStatus,
        disconnected_at: Option<u64>,
    ) -> Result<(), StoreError>;

    /// Flushes current counters for the periodic stats task (spec.md §4.5).
    async fn update_tunnel_stats(
        &self,
        id: Uuid,
        bytes_in: u64,
        bytes_out: u64,
        requests_count: u64,
        last_activity_at: u64,
    ) -> Result<(), StoreError>;

    /// Looks up a persistent, currently-offline tunnel by its saved name.
    async fn find_offline_by_saved_name(
        &self,
        user_id: Uuid,
        saved_name: &str,
    ) -> Result<Option<TunnelRow>, StoreError>;

    /// Returns every row not in a terminal `closed` state (startup cleanup).
    async fn list_non_closed_tunnels(&self) -> Result<Vec<TunnelRow>, StoreError>;

    /// Counts currently-active tunnels owned by a user (per-user limit).
    async fn count_active_for_user(&self, user_id: Uuid) -> Result<u64, StoreError>;

    /// Resolves an organization's own subdomain, used to compose
    /// `{custom}-{org_subdomain}` (spec.md §4.5). Organization directory
    /// management itself is out of scope; this is the one fact about an
    /// org the registry needs.
    async fn organization_subdomain(&self, organization_id: Uuid) -> Result<Option<String>, StoreError>;

    async fn insert_port_reservation(
        &self,
        port: u16,
        tunnel_id: Uuid,
        persistent: bool,
    ) -> Result<(), StoreError>;

    async fn delete_port_reservation(&self, port: u16) -> Result<(), StoreError>;

    async fn port_owner(&self, port: u16) -> Result<Option<Uuid>, StoreError>;

    /// Every persisted `(port, tunnel_id)` reservation, persistent or not.
    /// Read once at startup so a restarting process doesn't hand an
    /// already-reserved port to a new tunnel (spec.md §3 "Port reservation
    /// (persisted, TCP only)").
    async fn list_port_reservations(&self) -> Result<Vec<(u16, Uuid)>, StoreError>;

    async fn insert_request_log(&self, row: RequestLogRow) -> Result<(), StoreError>;

    /// Deletes the oldest request-log rows for a tunnel above `keep` rows.
    /// `keep = 0` disables retention entirely (a no-op).
    async fn trim_request_logs(&self, tunnel_id: Uuid, keep: u64) -> Result<(), StoreError>;

    async fn find_webhook_app(
        &self,
        organization_subdomain: &str,
        app_name: &str,
    ) -> Result<Option<WebhookAppRow>, StoreError>;

    async fn list_webhook_routes(
        &self,
        webhook_app_id: Uuid,
    ) -> Result<Vec<WebhookRouteRow>, StoreError>;

    async fn insert_webhook_event(&self, row: WebhookEventRow) -> Result<(), StoreError>;

    async fn update_route_health(
        &self,
        route_id: Uuid,
        health: RouteHealth,
        failure_count: u32,
    ) -> Result<(), StoreError>;
}

/// Result of validating an auth token (spec.md §4.1, §6).
#[derive(Debug, Clone, Copy)]
pub struct TokenIdentity {
    pub user_id: Uuid,
    pub token_id: Uuid,
    pub organization_id: Option<Uuid>,
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate_token(&self, token: &str) -> Result<TokenIdentity, StoreError>;
}

/// TLS config provider (spec.md §4.11). Production callers supply ACME or
/// another cert-automation-backed provider; this crate only ships the dev
/// self-signed one below.
pub trait TlsConfigProvider: Send + Sync {
    fn enabled(&self) -> bool;
    fn server_config(&self) -> Option<Arc<rustls::ServerConfig>>;
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A development TLS provider backed by an `rcgen` self-signed certificate.
/// Production certificate automation is explicitly out of scope
/// (spec.md §1) — this exists so local runs and tests can exercise the
/// `tls.enabled` branch without a real certificate authority.
pub struct DevTlsConfigProvider {
    enabled: bool,
    config: Option<Arc<rustls::ServerConfig>>,
}

impl DevTlsConfigProvider {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            config: None,
        }
    }

    pub fn self_signed(domain: &str) -> Result<Self, StoreError> {
        let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()])
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let cert_der = cert.cert.der().clone();
        let key_der = rustls_pki_types::PrivateKeyDer::Pkcs8(cert.signing_key.serialize_der().into());
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        // Required for the config to double as a QUIC server config
        // (`quinn::crypto::rustls::QuicServerConfig::try_from` rejects a
        // rustls config with no ALPN protocols configured).
        config.alpn_protocols = vec![b"tunnel/1".to_vec()];
        Ok(Self {
            enabled: true,
            config: Some(Arc::new(config)),
        })
    }
}

impl TlsConfigProvider for DevTlsConfigProvider {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn server_config(&self) -> Option<Arc<rustls::ServerConfig>> {
        self.config.clone()
    }
}

/// In-memory reference `TunnelStore`, for tests and local development
/// without a database. Mirrors the table shapes of spec.md §6 as plain
/// `HashMap`s behind a single `parking_lot::RwLock` — adequate for a
/// reference implementation, not meant to scale like a real store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    subdomains: HashMap<String, (Uuid, Option<Uuid>)>,
    tunnels: HashMap<Uuid, TunnelRow>,
    ports: HashMap<u16, (Uuid, bool)>,
    request_logs: HashMap<Uuid, Vec<RequestLogRow>>,
    webhook_apps: HashMap<(String, String), WebhookAppRow>,
    webhook_routes: HashMap<Uuid, Vec<WebhookRouteRow>>,
    webhook_events: Vec<WebhookEventRow>,
    organizations: HashMap<Uuid, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/dev helper: seeds a webhook app + its routes directly, bypassing
    /// the (out-of-scope) admin API that would normally create them.
    pub fn seed_webhook_app(
        &self,
        organization_subdomain: &str,
        app: WebhookAppRow,
        routes: Vec<WebhookRouteRow>,
    ) {
        let mut inner = self.inner.write();
        inner.webhook_routes.insert(app.id, routes);
        inner
            .webhook_apps
            .insert((organization_subdomain.to_string(), app.name.clone()), app);
    }

    /// Test/dev helper: seeds an organization's own subdomain.
    pub fn seed_organization(&self, organization_id: Uuid, subdomain: &str) {
        self.inner
            .write()
            .organizations
            .insert(organization_id, subdomain.to_string());
    }
}

#[async_trait]
impl TunnelStore for MemoryStore {
    async fn insert_subdomain(
        &self,
        subdomain: &str,
        user_id: Uuid,
        organization_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.subdomains.contains_key(subdomain) {
            return Err(StoreError::SubdomainTaken);
        }
        inner
            .subdomains
            .insert(subdomain.to_string(), (user_id, organization_id));
        Ok(())
    }

    async fn upsert_tunnel(&self, row: TunnelRow) -> Result<(), StoreError> {
        self.inner.write().tunnels.insert(row.id, row);
        Ok(())
    }

    async fn update_tunnel_status(
        &self,
        id: Uuid,
        status: TunnelRowStatus,
        disconnected_at: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let row = inner.tunnels.get_mut(&id).ok_or(StoreError::NotFound)?;
        row.status = status;
        row.disconnected_at = disconnected_at;
        Ok(())
    }

    async fn update_tunnel_stats(
        &self,
        id: Uuid,
        bytes_in: u64,
        bytes_out: u64,
        requests_count: u64,
        last_activity_at: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let row = inner.tunnels.get_mut(&id).ok_or(StoreError::NotFound)?;
        row.bytes_in = bytes_in;
        row.bytes_out = bytes_out;
        row.requests_count = requests_count;
        row.last_activity_at = last_activity_at;
        Ok(())
    }

    async fn find_offline_by_saved_name(
        &self,
        user_id: Uuid,
        saved_name: &str,
    ) -> Result<Option<TunnelRow>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .tunnels
            .values()
            .find(|t| {
                t.user_id == user_id
                    && t.is_persistent
                    && t.status == TunnelRowStatus::Offline
                    && t.saved_name.as_deref() == Some(saved_name)
            })
            .cloned())
    }

    async fn list_non_closed_tunnels(&self) -> Result<Vec<TunnelRow>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .tunnels
            .values()
            .filter(|t| t.status != TunnelRowStatus::Closed)
            .cloned()
            .collect())
    }

    async fn count_active_for_user(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .tunnels
            .values()
            .filter(|t| t.user_id == user_id && t.status == TunnelRowStatus::Active)
            .count() as u64)
    }

    async fn organization_subdomain(&self, organization_id: Uuid) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().organizations.get(&organization_id).cloned())
    }

    async fn insert_port_reservation(
        &self,
        port: u16,
        tunnel_id: Uuid,
        persistent: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some((owner, _)) = inner.ports.get(&port) {
            if *owner != tunnel_id {
                return Err(StoreError::PortHeld(port));
            }
        }
        inner.ports.insert(port, (tunnel_id, persistent));
        Ok(())
    }

    async fn delete_port_reservation(&self, port: u16) -> Result<(), StoreError> {
        self.inner.write().ports.remove(&port);
        Ok(())
    }

    async fn port_owner(&self, port: u16) -> Result<Option<Uuid>, StoreError> {
        Ok(self.inner.read().ports.get(&port).map(|(id, _)| *id))
    }

    async fn list_port_reservations(&self) -> Result<Vec<(u16, Uuid)>, StoreError> {
        Ok(self.inner.read().ports.iter().map(|(port, (id, _))| (*port, *id)).collect())
    }

    async fn insert_request_log(&self, row: RequestLogRow) -> Result<(), StoreError> {
        self.inner
            .write()
            .request_logs
            .entry(row.tunnel_id)
            .or_default()
            .push(row);
        Ok(())
    }

    async fn trim_request_logs(&self, tunnel_id: Uuid, keep: u64) -> Result<(), StoreError> {
        if keep == 0 {
            return Ok(());
        }
        let mut inner = self.inner.write();
        if let Some(logs) = inner.request_logs.get_mut(&tunnel_id) {
            logs.sort_by_key(|r| r.created_at);
            let excess = logs.len().saturating_sub(keep as usize);
            if excess > 0 {
                logs.drain(0..excess);
            }
        }
        Ok(())
    }

    async fn find_webhook_app(
        &self,
        organization_subdomain: &str,
        app_name: &str,
    ) -> Result<Option<WebhookAppRow>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .webhook_apps
            .get(&(organization_subdomain.to_string(), app_name.to_string()))
            .cloned())
    }

    async fn list_webhook_routes(
        &self,
        webhook_app_id: Uuid,
    ) -> Result<Vec<WebhookRouteRow>, StoreError> {
        Ok(self
            .inner
            .read()
            .webhook_routes
            .get(&webhook_app_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_webhook_event(&self, row: WebhookEventRow) -> Result<(), StoreError> {
        self.inner.write().webhook_events.push(row);
        Ok(())
    }

    async fn update_route_health(
        &self,
        route_id: Uuid,
        health: RouteHealth,
        failure_count: u32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        for routes in inner.webhook_routes.values_mut() {
            if let Some(route) = routes.iter_mut().find(|r| r.id == route_id) {
                route.health_status = health;
                route.failure_count = failure_count;
            }
        }
        Ok(())
    }
}

/// Token validator that accepts any token hashing to an entry pre-seeded
/// via [`MemoryTokenValidator::insert`] — a stand-in for the (out of scope)
/// token-issuance service.
#[derive(Default)]
pub struct MemoryTokenValidator {
    tokens: RwLock<HashMap<[u8; 32], TokenIdentity>>,
}

impl MemoryTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: &str, identity: TokenIdentity) {
        let hash = crate::ids::hash_token(token);
        self.tokens.write().insert(hash, identity);
    }
}

#[async_trait]
impl TokenValidator for MemoryTokenValidator {
    async fn validate_token(&self, token: &str) -> Result<TokenIdentity, StoreError> {
        let hash = crate::ids::hash_token(token);
        let tokens = self.tokens.read();
        for (stored_hash, identity) in tokens.iter() {
            if crate::ids::constant_time_eq(stored_hash, &hash) {
                return Ok(*identity);
            }
        }
        Err(StoreError::NotFound)
    }
}
