//! # Tunnel Edge Server
//!
//! A QUIC-based relay that gives NAT'd clients a public HTTP(S)/TCP
//! presence: clients dial in over a duplex control channel, the edge
//! server exposes subdomain-routed HTTP/HTTPS tunnels and dedicated TCP
//! port tunnels, and multiplexes webhook delivery with per-tunnel circuit
//! breaking.
//!
//! ## Architecture
//!
//! ```text
//! Client ──QUIC──► Edge Server ──HTTP/TCP──► Public Internet
//! ```
//!
//! ## Modules
//!
//! - [`tunnel_edge::duplex`]   — the control channel client connections speak (C6)
//! - [`tunnel_edge::registry`] — tunnel lifecycle, ports, and indexes (C3-C5)
//! - [`tunnel_edge::http_proxy`] — subdomain-routed HTTP/HTTPS/WebSocket proxying (C7)
//! - [`tunnel_edge::tcp_proxy`]  — raw TCP port tunnels (C8)
//! - [`tunnel_edge::webhook`]    — webhook fan-out and circuit breaking (C9)
//!
//! This binary wires the reference in-memory collaborators
//! (`MemoryStore`, `MemoryTokenValidator`, `DevTlsConfigProvider`) — a real
//! deployment supplies its own `TunnelStore`/`TokenValidator`/
//! `TlsConfigProvider` and otherwise reuses [`tunnel_edge::EdgeState`]
//! unchanged.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use tunnel_edge::registry::Manager;
use tunnel_edge::store::{DevTlsConfigProvider, MemoryStore, MemoryTokenValidator, TlsConfigProvider};
use tunnel_edge::{EdgeConfig, EdgeState};

/// Server entry point.
///
/// Initializes logging, builds the in-process reference store/validator/TLS
/// collaborators, wires [`EdgeState`], and starts the QUIC duplex endpoint
/// alongside the HTTP proxy listener and the periodic stats flush.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_edge=info".into()),
        )
        .init();

    let config = EdgeConfig::default();
    let store = Arc::new(MemoryStore::new());
    let validator = Arc::new(MemoryTokenValidator::new());
    let tls: Arc<dyn TlsConfigProvider> = if config.tls.enabled {
        Arc::new(
            DevTlsConfigProvider::self_signed(&config.domain).expect("failed to generate a self-signed dev certificate"),
        )
    } else {
        Arc::new(DevTlsConfigProvider::disabled())
    };

    let http_port = config.http_port;
    let grpc_port = config.grpc_port;

    let state = EdgeState::new(config, store, validator, tls)
        .await
        .expect("failed to build edge server state");

    tokio::spawn(Manager::run_stats_flush(state.manager.clone()));

    let quic_server_config = build_quic_server_config(state.tls.as_ref());
    let duplex = state.duplex.clone();
    let duplex_addr = SocketAddr::from(([0, 0, 0, 0], grpc_port));
    tokio::spawn(async move {
        if let Err(e) = duplex.run(duplex_addr, quic_server_config).await {
            tracing::error!(error = %e, "duplex service exited");
        }
    });

    let app = Router::new()
        .fallback(tunnel_edge::http_proxy::handle)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.http_proxy);

    let http_addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    info!(%http_addr, %duplex_addr, "tunnel edge server listening");

    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .expect("failed to bind the http proxy listener");
    axum::serve(listener, app).await.expect("http proxy server stopped unexpectedly");
}

/// Builds the QUIC server config this process accepts duplex connections
/// with, from the TLS provider's rustls config. Dev mode always runs with
/// TLS enabled (QUIC requires it); `tls.enabled = false` just means the
/// cert is self-signed rather than externally provisioned.
fn build_quic_server_config(tls: &dyn TlsConfigProvider) -> quinn::ServerConfig {
    let rustls_config = tls
        .server_config()
        .unwrap_or_else(|| {
            DevTlsConfigProvider::self_signed("localhost")
                .expect("failed to generate a fallback self-signed dev certificate")
                .server_config()
                .expect("self-signed provider always yields a server config")
        });
    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(rustls_config)
        .expect("rustls server config must carry ALPN protocols for quic");
    quinn::ServerConfig::with_crypto(Arc::new(quic_crypto))
}
