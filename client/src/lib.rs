//! Morph Client Library
//!
//! Handshakes with a relay, then carries local WireGuard packets through
//! the obfuscation pipeline. Host applications drive [`Client::run`] and
//! follow its [`ClientEvent`] stream.

pub mod config;
mod endpoint;

pub use config::ClientConfig;
pub use endpoint::{Client, ClientError, ClientEvent};
