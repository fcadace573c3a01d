//! Traffic and client-count reporting
//!
//! Reporting is fire-and-forget: failures are logged and never affect the
//! relay.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::AccountingConfig;

#[async_trait]
pub trait Accounting: Send + Sync {
    /// Bytes relayed for a user since the last report
    async fn report_traffic(&self, user_id: &str, bytes: u64);

    async fn increment_client_count(&self, host: &str);

    async fn decrement_client_count(&self, host: &str);

    /// Announce this relay and its control key
    async fn publish_server_info(&self, host: &str, ip: &str, port: u16, encryption_info: &str);
}

/// Accounting that only logs
#[derive(Debug, Default)]
pub struct LogAccounting;

#[async_trait]
impl Accounting for LogAccounting {
    async fn report_traffic(&self, user_id: &str, bytes: u64) {
        info!("Traffic for user {}: {} bytes", user_id, bytes);
    }

    async fn increment_client_count(&self, host: &str) {
        debug!("Client count +1 on {}", host);
    }

    async fn decrement_client_count(&self, host: &str) {
        debug!("Client count -1 on {}", host);
    }

    async fn publish_server_info(&self, host: &str, ip: &str, port: u16, _encryption_info: &str) {
        info!("Server {} available at {}:{}", host, ip, port);
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TrafficReport<'a> {
    user_id: &'a str,
    traffic: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HostReport<'a> {
    host_name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfo<'a> {
    host_name: &'a str,
    host_ip: &'a str,
    port: u16,
    encryption_info: &'a str,
}

/// Accounting backed by an HTTP JSON API
pub struct HttpAccounting {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAccounting {
    pub fn new(base_url: impl Into<String>) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) {
        let url = format!("{}/{}", self.base_url, path);
        match self.client.post(&url).json(body).send().await {
            Ok(resp) if resp.status().is_success() => debug!("POST {} ok", url),
            Ok(resp) => warn!("POST {} returned {}", url, resp.status()),
            Err(e) => warn!("POST {} failed: {}", url, e),
        }
    }
}

#[async_trait]
impl Accounting for HttpAccounting {
    async fn report_traffic(&self, user_id: &str, bytes: u64) {
        self.post(
            "traffic",
            &TrafficReport {
                user_id,
                traffic: bytes,
            },
        )
        .await;
    }

    async fn increment_client_count(&self, host: &str) {
        self.post("clients/add", &HostReport { host_name: host }).await;
    }

    async fn decrement_client_count(&self, host: &str) {
        self.post("clients/sub", &HostReport { host_name: host }).await;
    }

    async fn publish_server_info(&self, host: &str, ip: &str, port: u16, encryption_info: &str) {
        self.post(
            "servers",
            &ServerInfo {
                host_name: host,
                host_ip: ip,
                port,
                encryption_info,
            },
        )
        .await;
    }
}

/// Pick the accounting backend from configuration
pub fn from_config(config: &AccountingConfig) -> anyhow::Result<Box<dyn Accounting>> {
    match &config.api_url {
        Some(url) => {
            info!("Reporting accounting to {}", url);
            Ok(Box::new(HttpAccounting::new(url.clone())?))
        }
        None => Ok(Box::new(LogAccounting)),
    }
}
