//! Control channel messages
//!
//! Control messages travel encrypted over the shared listening socket.
//! Handshakes and replies are JSON; `close`, `inactivity` and `server_full`
//! are bare string literals.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client_id::ClientId;
use crate::template::TemplateParams;

/// Heartbeat payload, sent templated but not obfuscated
pub const HEARTBEAT: [u8; 1] = [0x01];

pub const CLOSE: &str = "close";
pub const INACTIVITY: &str = "inactivity";
pub const SERVER_FULL: &str = "server_full";

/// Length of the per-session HKDF salt
pub const SESSION_SALT_LEN: usize = 32;

/// Whether a decapsulated payload is a heartbeat
pub fn is_heartbeat(payload: &[u8]) -> bool {
    payload == HEARTBEAT
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("Client ID must be 16 bytes, got {0}")]
    InvalidClientId(usize),

    #[error("Malformed control message: {0}")]
    Malformed(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Session salt must be 32 bytes, got {0}")]
    InvalidSalt(usize),
}

/// Handshake sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub key: u64,
    pub obfuscation_layer: u8,
    #[serde(alias = "randomPadding")]
    pub random_padding_max: u8,
    #[serde(alias = "fnInitor")]
    pub fn_initiator: u64,
    pub user_id: String,
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
    pub template_id: u8,
    #[serde(default)]
    pub template_params: TemplateParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connected,
    Reconnected,
}

/// Server reply to a handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeReply {
    pub port: u16,
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
    pub status: SessionStatus,
    /// Base64 HKDF salt, only on a fresh session with packet security
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_nonce: Option<u32>,
}

impl HandshakeReply {
    pub fn connected(
        port: u16,
        client_id: ClientId,
        salt: Option<[u8; SESSION_SALT_LEN]>,
        server_nonce: Option<u32>,
    ) -> Self {
        Self {
            port,
            client_id,
            status: SessionStatus::Connected,
            session_salt: salt.map(|s| BASE64.encode(s)),
            server_nonce,
        }
    }

    pub fn reconnected(port: u16, client_id: ClientId) -> Self {
        Self {
            port,
            client_id,
            status: SessionStatus::Reconnected,
            session_salt: None,
            server_nonce: None,
        }
    }

    /// Decode the session salt, if present
    pub fn salt(&self) -> Result<Option<[u8; SESSION_SALT_LEN]>, ControlError> {
        let Some(encoded) = &self.session_salt else {
            return Ok(None);
        };
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| ControlError::Encoding(e.to_string()))?;
        let salt: [u8; SESSION_SALT_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ControlError::InvalidSalt(bytes.len()))?;
        Ok(Some(salt))
    }
}

/// Any decrypted control channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Handshake(HandshakeRequest),
    Reply(HandshakeReply),
    Close,
    Inactivity,
    ServerFull,
}

impl ControlMessage {
    /// Parse decrypted control bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, ControlError> {
        match bytes {
            b"close" => return Ok(Self::Close),
            b"inactivity" => return Ok(Self::Inactivity),
            b"server_full" => return Ok(Self::ServerFull),
            _ => {}
        }

        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| ControlError::Malformed(e.to_string()))?;

        // Replies carry a port, handshakes carry the obfuscation key
        let parsed = if value.get("port").is_some() {
            serde_json::from_value(value).map(Self::Reply)
        } else {
            serde_json::from_value(value).map(Self::Handshake)
        };

        parsed.map_err(|e| ControlError::Malformed(e.to_string()))
    }

    /// Serialize for encryption
    pub fn to_bytes(&self) -> Result<Vec<u8>, ControlError> {
        let bytes = match self {
            Self::Handshake(req) => {
                serde_json::to_vec(req).map_err(|e| ControlError::Malformed(e.to_string()))?
            }
            Self::Reply(reply) => {
                serde_json::to_vec(reply).map_err(|e| ControlError::Malformed(e.to_string()))?
            }
            Self::Close => CLOSE.as_bytes().to_vec(),
            Self::Inactivity => INACTIVITY.as_bytes().to_vec(),
            Self::ServerFull => SERVER_FULL.as_bytes().to_vec(),
        };
        Ok(bytes)
    }
}
