//! Daemon configuration

use anyhow::Result;
use morph_protocol::{TemplateWeight, default_weights};
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    /// Shared listening socket and admission
    #[serde(default)]
    pub server: ServerConfig,

    /// Local WireGuard endpoint
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Session lifetime
    #[serde(default)]
    pub session: SessionConfig,

    /// Control channel and packet security
    #[serde(default)]
    pub security: SecurityConfig,

    /// Per-IP rate limits
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Templates accepted in handshakes; weight 0 or absent disables one
    #[serde(default)]
    pub template: TemplateConfig,

    /// Accounting API
    #[serde(default)]
    pub accounting: AccountingConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl DaemonConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Shared handshake socket
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Name reported to the accounting API
    #[serde(default = "default_host_name")]
    pub host_name: String,

    /// Public address reported to the accounting API
    #[serde(default = "default_host_ip")]
    pub host_ip: String,

    /// Admission limit, further handshakes get `server_full`
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 12301))
}

fn default_host_name() -> String {
    "morph-relay".to_string()
}

fn default_host_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_max_sessions() -> usize {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            host_name: default_host_name(),
            host_ip: default_host_ip(),
            max_sessions: default_max_sessions(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Where decoded packets are delivered, and the only source treated as
    /// tunnel traffic on session sockets
    #[serde(default = "default_local_address")]
    pub local_address: SocketAddr,
}

fn default_local_address() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 51820))
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            local_address: default_local_address(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Inactivity timeout, also the check interval
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Traffic report interval
    #[serde(default = "default_traffic_flush_secs")]
    pub traffic_flush_secs: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_traffic_flush_secs() -> u64 {
    60
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn traffic_flush_interval(&self) -> Duration {
        Duration::from_secs(self.traffic_flush_secs.max(1))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            traffic_flush_secs: default_traffic_flush_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Pre-shared control channel password
    #[serde(default = "default_password")]
    pub password: String,

    /// Wrap data packets in the secure envelope
    #[serde(default = "default_true")]
    pub packet_security: bool,

    /// Accepted clock skew for envelope timestamps
    #[serde(default = "default_max_packet_age")]
    pub max_packet_age_secs: u64,
}

fn default_password() -> String {
    "morph".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_packet_age() -> u64 {
    morph_crypto::DEFAULT_MAX_AGE_SECS
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            password: default_password(),
            packet_security: true,
            max_packet_age_secs: default_max_packet_age(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Handshakes per window per source IP
    #[serde(default = "default_handshakes")]
    pub handshakes: u32,

    #[serde(default = "default_handshake_window")]
    pub handshake_window_secs: u64,

    /// Datagrams per window per source IP
    #[serde(default = "default_packets")]
    pub packets: u32,

    #[serde(default = "default_packet_window")]
    pub packet_window_ms: u64,
}

fn default_handshakes() -> u32 {
    10
}

fn default_handshake_window() -> u64 {
    60
}

fn default_packets() -> u32 {
    1000
}

fn default_packet_window() -> u64 {
    1000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            handshakes: default_handshakes(),
            handshake_window_secs: default_handshake_window(),
            packets: default_packets(),
            packet_window_ms: default_packet_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateConfig {
    #[serde(default = "default_weights")]
    pub weights: Vec<TemplateWeight>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            weights: default_weights(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountingConfig {
    /// Base URL of the accounting API; log-only accounting when unset
    #[serde(default)]
    pub api_url: Option<String>,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Prometheus bind address
    #[serde(default = "default_prometheus_bind")]
    pub prometheus_bind: SocketAddr,

    #[serde(default)]
    pub prometheus_enabled: bool,
}

fn default_prometheus_bind() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 9090))
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_bind: default_prometheus_bind(),
            prometheus_enabled: false,
        }
    }
}
