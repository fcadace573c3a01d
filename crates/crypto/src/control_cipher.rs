//! AES-256-GCM control channel cipher

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Ciphertext too short")]
    CiphertextTooShort,
}

/// Derive the control key from a pre-shared password using SHA256
pub fn derive_control_key(password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"MORPH-CONTROL-KEY-DERIVE");
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Cipher for handshakes and control literals on the shared socket
#[derive(Clone)]
pub struct ControlCipher {
    cipher: Aes256Gcm,
    key: [u8; 32],
}

impl ControlCipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(key: [u8; 32]) -> Self {
        let cipher = Aes256Gcm::new(&key.into());
        Self { cipher, key }
    }

    pub fn from_password(password: &str) -> Self {
        Self::new(derive_control_key(password))
    }

    /// Build from the base64 form published with the server info
    pub fn from_encoded_key(encoded: &str) -> Result<Self, CipherError> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CipherError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self::new(key))
    }

    pub fn encoded_key(&self) -> String {
        BASE64.encode(self.key)
    }

    pub fn key_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// Encrypt data with a random nonce
    /// Returns: nonce (12 bytes) || ciphertext
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CipherError::EncryptionFailed)?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(result)
    }

    /// Decrypt data (expects nonce || ciphertext)
    ///
    /// Data packets fail here, which is how the relay tells them apart from
    /// control traffic.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        if data.len() < NONCE_LEN {
            return Err(CipherError::CiphertextTooShort);
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CipherError::DecryptionFailed)
    }
}

impl std::fmt::Debug for ControlCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ControlCipher(..)")
    }
}
