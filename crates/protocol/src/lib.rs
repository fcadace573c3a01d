//! Morph Protocol - carrier templates and control messages
//!
//! This crate defines:
//! - `ClientId`: the 16-byte session identifier
//! - `ProtocolTemplate`: 12 carrier protocol mimics behind one interface
//! - `TemplateSelector`: weighted random template choice
//! - `ControlMessage`: handshake, replies and control literals

mod client_id;
mod control;
pub mod template;

pub use client_id::*;
pub use control::*;
pub use template::{
    HeaderId, ProtocolTemplate, TEMPLATE_IDS, Template, TemplateError, TemplateParams, TemplateSelector,
    TemplateWeight, default_weights, peek_header_id,
};
