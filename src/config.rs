//! Configuration for the proxy.

use crate::cluster::UpstreamProtocol;
use serde::{Deserialize, Serialize};
use std::env;

/// Proxy configuration loaded at startup.
///
/// Immutable after initialization. Configuration can be loaded from
/// environment variables or defaults.
///
/// # Environment Variables
///
/// * `PROXY_LISTEN_ADDR` - Address to listen on (default: "127.0.0.1:3000")
/// * `PROXY_ADMIN_ADDR` - Admin endpoint address (default: "127.0.0.1:9090")
/// * `PROXY_UPSTREAM_PROTOCOL` - Upstream protocol family: `rpc_family`,
///   `http1` or `http2` (default: "http1")
/// * `PROXY_BUFFER_LIMIT` - Per-stream request replay buffer cap in bytes,
///   0 disables the cap (default: 4194304)
/// * `PROXY_ROUTES` - Path to a TOML routing config file (optional)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address to listen on for incoming connections.
    pub listen_addr: String,

    /// Address to serve admin endpoints on.
    pub admin_addr: String,

    /// Protocol family spoken to upstream clusters.
    pub upstream_protocol: UpstreamProtocol,

    /// Per-stream cap on the buffered request body kept for retries,
    /// in bytes. Zero disables the cap.
    pub buffer_limit: u32,

    /// Path to a routing config file, if any.
    pub routes_path: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".to_string(),
            admin_addr: "127.0.0.1:9090".to_string(),
            upstream_protocol: UpstreamProtocol::Http1,
            buffer_limit: 4 * 1024 * 1024,
            routes_path: None,
        }
    }
}

impl ProxyConfig {
    /// Loads configuration from environment variables with fallback to
    /// defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let listen_addr = env::var("PROXY_LISTEN_ADDR").unwrap_or(defaults.listen_addr);
        let admin_addr = env::var("PROXY_ADMIN_ADDR").unwrap_or(defaults.admin_addr);

        let upstream_protocol = match env::var("PROXY_UPSTREAM_PROTOCOL").ok().as_deref() {
            Some("rpc_family") => UpstreamProtocol::RpcFamily,
            Some("http2") => UpstreamProtocol::Http2,
            Some(_) | None => UpstreamProtocol::Http1,
        };

        let buffer_limit = env::var("PROXY_BUFFER_LIMIT")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(defaults.buffer_limit);

        let routes_path = env::var("PROXY_ROUTES").ok();

        Self {
            listen_addr,
            admin_addr,
            upstream_protocol,
            buffer_limit,
            routes_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.admin_addr, "127.0.0.1:9090");
        assert_eq!(config.upstream_protocol, UpstreamProtocol::Http1);
        assert!(config.buffer_limit > 0);
    }

    #[test]
    fn test_from_env_fallbacks() {
        let config = ProxyConfig::from_env();
        assert!(!config.listen_addr.is_empty());
        assert!(!config.admin_addr.is_empty());
    }
}
