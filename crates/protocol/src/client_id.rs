//! 16-byte client identifier

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::control::ControlError;

/// Length of a client identifier in bytes
pub const CLIENT_ID_LEN: usize = 16;

/// Client identifier: random UUIDv4 bytes chosen by the client
///
/// Printed and keyed as hex, carried as base64 in control JSON.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId([u8; CLIENT_ID_LEN]);

impl ClientId {
    /// Fresh random identifier
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    pub const fn from_bytes(bytes: [u8; CLIENT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice, which must be exactly 16 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ControlError> {
        let arr: [u8; CLIENT_ID_LEN] = bytes
            .try_into()
            .map_err(|_| ControlError::InvalidClientId(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, ControlError> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| ControlError::Encoding(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; CLIENT_ID_LEN] {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientId({})", self)
    }
}

impl Serialize for ClientId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}
