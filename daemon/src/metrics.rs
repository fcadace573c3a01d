//! Prometheus metrics

use crate::config::MonitoringConfig;
use prometheus::{IntCounter, IntGauge, Opts, Registry};
use std::sync::LazyLock;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Global metrics registry
static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Relay metrics
pub struct Metrics {
    // Counters
    pub handshakes: IntCounter,
    pub handshakes_rejected: IntCounter,
    pub packets_in: IntCounter,
    pub packets_out: IntCounter,
    pub packets_dropped: IntCounter,
    pub bytes_relayed: IntCounter,

    // Gauges
    pub active_sessions: IntGauge,
}

fn counter(name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    // A second Metrics instance keeps working unregistered
    REGISTRY.register(Box::new(counter.clone())).ok();
    Ok(counter)
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let active_sessions = IntGauge::with_opts(Opts::new(
            "morph_active_sessions",
            "Number of live sessions",
        ))?;
        REGISTRY.register(Box::new(active_sessions.clone())).ok();

        Ok(Self {
            handshakes: counter("morph_handshakes_total", "Handshakes accepted")?,
            handshakes_rejected: counter(
                "morph_handshakes_rejected_total",
                "Handshakes rejected (invalid, rate limited, full, bind failure)",
            )?,
            packets_in: counter("morph_packets_in_total", "Datagrams received from clients")?,
            packets_out: counter("morph_packets_out_total", "Datagrams sent to clients")?,
            packets_dropped: counter("morph_packets_dropped_total", "Datagrams dropped")?,
            bytes_relayed: counter("morph_bytes_relayed_total", "Bytes relayed in both directions")?,
            active_sessions,
        })
    }
}

/// Start the metrics server
pub fn start_server(config: &MonitoringConfig) -> JoinHandle<()> {
    let bind = config.prometheus_bind;
    let enabled = config.prometheus_enabled;

    tokio::spawn(async move {
        if !enabled {
            info!("Prometheus metrics disabled");
            return;
        }

        use bytes::Bytes;
        use http_body_util::Full;
        use hyper::{Response, server::conn::http1, service::service_fn};
        use hyper_util::rt::TokioIo;

        let listener = match tokio::net::TcpListener::bind(bind).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind metrics server: {}", e);
                return;
            }
        };

        info!("Prometheus metrics server listening on {}", bind);

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    error!("Metrics accept error: {}", e);
                    continue;
                }
            };

            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|_req| async {
                    let body = render();
                    let mut response = Response::new(Full::new(Bytes::from(body)));
                    response.headers_mut().insert(
                        hyper::header::CONTENT_TYPE,
                        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                    );
                    Ok::<_, std::convert::Infallible>(response)
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Metrics connection error: {}", e);
                }
            });
        }
    })
}

/// Text exposition of the registry
pub fn render() -> Vec<u8> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    buffer
}
