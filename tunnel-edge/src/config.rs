//! Configuration shape (spec.md §6). Loading a config file or environment
//! variables is out of scope (spec.md §1) — this crate only declares the
//! struct a caller fills in and hands to [`crate::EdgeState::new`], in the
//! `#[serde(default)]`-per-section style `nomadflow-core::config` uses so
//! a caller *can* feed it through `serde` if they want to, without this
//! crate doing the file/env parsing itself.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsSection {
    pub enabled: bool,
    pub cert_file: String,
    pub key_file: String,
    pub auto_cert: bool,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_file: String::new(),
            key_file: String::new(),
            auto_cert: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunnelsSection {
    pub max_per_user: u32,
    pub idle_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for TunnelsSection {
    fn default() -> Self {
        Self {
            max_per_user: 10,
            idle_timeout_secs: 300,
            heartbeat_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpLogLevel {
    Silent,
    Error,
    Warn,
    Info,
}

impl Default for HttpLogLevel {
    fn default() -> Self {
        HttpLogLevel::Info
    }
}

/// Every option spec.md §6 names, and nothing else — this crate reads this
/// struct, it never parses a file or environment variable to produce one.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub grpc_port: u16,
    pub http_port: u16,
    pub https_port: u16,
    pub api_port: u16,
    pub domain: String,
    pub tcp_port_start: u16,
    pub tcp_port_end: u16,
    pub tls: TlsSection,
    pub tunnels: TunnelsSection,
    pub http_log_level: HttpLogLevel,
    pub max_request_logs_per_tunnel: u64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            grpc_port: 4443,
            http_port: 80,
            https_port: 443,
            api_port: 8080,
            domain: "tunnel.example.com".to_string(),
            tcp_port_start: 20000,
            tcp_port_end: 20100,
            tls: TlsSection::default(),
            tunnels: TunnelsSection::default(),
            http_log_level: HttpLogLevel::default(),
            max_request_logs_per_tunnel: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_a_non_empty_port_range() {
        let cfg = EdgeConfig::default();
        assert!(cfg.tcp_port_start <= cfg.tcp_port_end);
    }
}
