//! Morph Obfuscation - reversible byte transforms for tunnel packets
//!
//! This crate provides:
//! - Deterministic key stream (xorshift) shared by both peers
//! - Registry of 11 reversible transforms
//! - Permutation tables for layers 1-4
//! - Per-packet obfuscation engine with masked header and padding

mod engine;
mod error;
mod functions;
mod keystream;
mod permutations;

pub use engine::*;
pub use error::*;
pub use functions::*;
pub use keystream::*;
pub use permutations::*;
