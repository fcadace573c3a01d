//! Per-session key derivation

use hkdf::Hkdf;
use sha2::Sha256;

use crate::envelope::SecurityError;

const SESSION_KEY_INFO: &[u8] = b"morph-session-key";
const HMAC_KEY_INFO: &[u8] = b"morph-hmac-key";

/// Keys protecting one session's data packets
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    /// AES-128-CTR key concealing the client ID
    pub session_key: [u8; 16],
    /// HMAC-SHA256 key for the packet tag
    pub hmac_key: [u8; 32],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

/// Derive session keys with HKDF-SHA256
pub fn derive_session_keys(shared_secret: &[u8], salt: &[u8]) -> Result<SessionKeys, SecurityError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);

    let mut session_key = [0u8; 16];
    hk.expand(SESSION_KEY_INFO, &mut session_key)
        .map_err(|_| SecurityError::KeyDerivation)?;

    let mut hmac_key = [0u8; 32];
    hk.expand(HMAC_KEY_INFO, &mut hmac_key)
        .map_err(|_| SecurityError::KeyDerivation)?;

    Ok(SessionKeys {
        session_key,
        hmac_key,
    })
}

/// Shared secret both peers feed into HKDF: control key, then the
/// obfuscation key big-endian
pub fn session_secret(control_key: &[u8; 32], obfuscation_key: u64) -> [u8; 40] {
    let mut secret = [0u8; 40];
    secret[..32].copy_from_slice(control_key);
    secret[32..].copy_from_slice(&obfuscation_key.to_be_bytes());
    secret
}

/// Random 32-byte salt for a new session
pub fn generate_salt() -> [u8; 32] {
    use rand::RngCore;

    let mut salt = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_session_keys(b"secret", &[1; 32]).unwrap();
        let b = derive_session_keys(b"secret", &[1; 32]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_salt_changes_keys() {
        let a = derive_session_keys(b"secret", &[1; 32]).unwrap();
        let b = derive_session_keys(b"secret", &[2; 32]).unwrap();
        assert_ne!(a.session_key, b.session_key);
        assert_ne!(a.hmac_key, b.hmac_key);
    }

    #[test]
    fn test_keys_are_independent() {
        let keys = derive_session_keys(b"secret", &[1; 32]).unwrap();
        assert_ne!(&keys.session_key[..], &keys.hmac_key[..16]);
    }

    #[test]
    fn test_session_secret_layout() {
        let secret = session_secret(&[0xAA; 32], 0x0102_0304_0506_0708);
        assert_eq!(&secret[..32], &[0xAA; 32]);
        assert_eq!(&secret[32..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_ne!(session_secret(&[0xAA; 32], 1), session_secret(&[0xAA; 32], 2));
    }

    #[test]
    fn test_generated_salts_differ() {
        assert_ne!(generate_salt(), generate_salt());
    }
}
