//! Client configuration

use anyhow::Result;
use morph_protocol::{TemplateWeight, default_weights};
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// Relay endpoint and credentials
    #[serde(default)]
    pub server: ServerConfig,

    /// Local WireGuard side
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Obfuscation parameters offered in the handshake
    #[serde(default)]
    pub obfuscation: ObfuscationConfig,

    /// Carrier template choice
    #[serde(default)]
    pub template: TemplateConfig,

    /// Handshake retries and heartbeat
    #[serde(default)]
    pub timing: TimingConfig,
}

impl ClientConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: ClientConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Shared handshake socket of the relay
    #[serde(default = "default_server_address")]
    pub address: SocketAddr,

    #[serde(default = "default_user_id")]
    pub user_id: String,

    /// Base64 control key as published by the relay
    #[serde(default)]
    pub control_key: Option<String>,

    /// Pre-shared password, used when no control key is given
    #[serde(default = "default_password")]
    pub password: String,
}

fn default_server_address() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 12301))
}

fn default_user_id() -> String {
    "anonymous".to_string()
}

fn default_password() -> String {
    "morph".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
            user_id: default_user_id(),
            control_key: None,
            password: default_password(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Local WireGuard interface; only datagrams from here are tunnelled
    #[serde(default = "default_local_address")]
    pub local_address: SocketAddr,

    /// Address WireGuard uses as its peer endpoint
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

fn default_local_address() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 51820))
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 51821))
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            local_address: default_local_address(),
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObfuscationConfig {
    /// Session key; random per run when unset
    #[serde(default)]
    pub key: Option<u64>,

    #[serde(default = "default_layer")]
    pub layer: u8,

    #[serde(default = "default_padding_max")]
    pub padding_max: u8,
}

fn default_layer() -> u8 {
    3
}

fn default_padding_max() -> u8 {
    8
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            key: None,
            layer: default_layer(),
            padding_max: default_padding_max(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateConfig {
    /// Fixed template; weighted random choice when unset
    #[serde(default)]
    pub id: Option<u8>,

    #[serde(default = "default_weights")]
    pub weights: Vec<TemplateWeight>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            id: None,
            weights: default_weights(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_handshake_interval")]
    pub handshake_interval_ms: u64,

    /// Handshake re-sends before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
}

fn default_handshake_interval() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    5
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

impl TimingConfig {
    pub fn handshake_interval(&self) -> Duration {
        Duration::from_millis(self.handshake_interval_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            handshake_interval_ms: default_handshake_interval(),
            max_retries: default_max_retries(),
            heartbeat_interval_ms: default_heartbeat_interval(),
        }
    }
}
