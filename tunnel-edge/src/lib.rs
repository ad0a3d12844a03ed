//! Edge server core: the duplex control channel (C6), the tunnel registry
//! (C3-C5), the HTTP/HTTPS and raw TCP proxy surfaces (C7-C8), webhook
//! fan-out with circuit breaking (C9), the event bus (C10), and the
//! storage/TLS/token contracts external callers implement (C11).
//!
//! [`EdgeState`] is the one aggregate a binary needs to build: it wires
//! every collaborator together from an [`EdgeConfig`] and a handful of
//! trait objects, then hands back the pieces a caller mounts onto a QUIC
//! endpoint and an axum router.

pub mod config;
pub mod duplex;
pub mod error;
pub mod events;
pub mod http_proxy;
pub mod ids;
pub mod registry;
pub mod store;
pub mod tcp_proxy;
pub mod webhook;

use std::sync::Arc;

pub use config::EdgeConfig;
pub use error::EdgeError;

use events::EventBus;
use registry::{Manager, PortPool};
use store::{TlsConfigProvider, TokenValidator, TunnelStore};
use tcp_proxy::TcpProxy;
use webhook::WebhookRouter;

/// Every live collaborator a running edge server needs, wired together from
/// an [`EdgeConfig`] plus the storage/TLS/token contracts a caller supplies.
/// Building one runs the registry's startup cleanup (spec.md §4.5), so
/// constructing it is fallible and asynchronous.
pub struct EdgeState {
    pub config: Arc<EdgeConfig>,
    pub manager: Arc<Manager>,
    pub tcp_proxy: Arc<TcpProxy>,
    pub http_proxy: Arc<http_proxy::HttpProxy>,
    pub webhook: Arc<WebhookRouter>,
    pub duplex: Arc<duplex::DuplexService>,
    pub tls: Arc<dyn TlsConfigProvider>,
}

impl EdgeState {
    pub async fn new(
        config: EdgeConfig,
        store: Arc<dyn TunnelStore>,
        validator: Arc<dyn TokenValidator>,
        tls: Arc<dyn TlsConfigProvider>,
    ) -> Result<Self, EdgeError> {
        let config = Arc::new(config);
        let events = EventBus::new();
        let ports = Arc::new(PortPool::new(config.tcp_port_start, config.tcp_port_end, store.clone()));

        // `Manager::new` needs a `TcpListenerController` up front, but
        // `TcpProxy` needs the constructed `Manager` to dispatch accepted
        // connections into — `TcpProxy::bind_manager` closes that loop.
        let tcp_proxy = TcpProxy::new();
        let manager = Manager::new(
            config.clone(),
            store.clone(),
            ports,
            tcp_proxy.clone(),
            events,
            tls.enabled(),
        )
        .await?;
        tcp_proxy.bind_manager(manager.clone());

        let webhook = WebhookRouter::new(store.clone(), manager.clone(), manager.events().clone(), config.domain.clone());
        let webhook = Arc::new(webhook);
        let http_proxy = http_proxy::HttpProxy::new(
            manager.clone(),
            webhook.clone(),
            store.clone(),
            config.domain.clone(),
            config.max_request_logs_per_tunnel,
        );
        let duplex = duplex::DuplexService::new(manager.clone(), store, validator);

        Ok(Self {
            config,
            manager,
            tcp_proxy,
            http_proxy,
            webhook,
            duplex,
            tls,
        })
    }
}
