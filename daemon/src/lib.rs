//! Morph relay daemon
//!
//! Accepts handshakes on a shared UDP socket, gives every client a
//! dedicated socket and relays de-obfuscated packets to the local
//! WireGuard endpoint.

pub mod accounting;
pub mod config;
pub mod metrics;
pub mod rate_limit;
pub mod relay;
pub mod session;

pub use accounting::{Accounting, HttpAccounting, LogAccounting};
pub use config::DaemonConfig;
pub use metrics::Metrics;
pub use relay::{CloseReason, Relay};
