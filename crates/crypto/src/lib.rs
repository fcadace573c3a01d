//! Morph Crypto - packet security and control channel encryption
//!
//! This crate provides:
//! - HKDF-SHA256 session key derivation
//! - Secure packet envelope (AES-128-CTR client ID, HMAC-SHA256 tag,
//!   timestamp and sequence checks)
//! - HMAC-SHA256 with constant-time comparison
//! - AES-256-GCM control channel cipher keyed by a pre-shared password

mod control_cipher;
mod envelope;
mod hmac_auth;
mod session_keys;

pub use control_cipher::*;
pub use envelope::*;
pub use hmac_auth::*;
pub use session_keys::*;
