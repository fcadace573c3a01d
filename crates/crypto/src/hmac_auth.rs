//! HMAC-SHA256 packet authentication

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length of a packet tag
pub const TAG_LEN: usize = 32;

/// HMAC-SHA256 authenticator over a sequence of packet fields
pub struct HmacAuthenticator {
    secret: [u8; 32],
}

impl HmacAuthenticator {
    /// Create a new authenticator with the given secret
    pub fn new(secret: [u8; 32]) -> Self {
        Self { secret }
    }

    /// Compute HMAC over the concatenation of `parts`
    pub fn compute(&self, parts: &[&[u8]]) -> [u8; TAG_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC can take key of any size");
        for part in parts {
            mac.update(part);
        }
        mac.finalize().into_bytes().into()
    }

    /// Verify HMAC in constant time
    pub fn verify(&self, parts: &[&[u8]], expected: &[u8]) -> bool {
        let computed = self.compute(parts);
        constant_time_compare(&computed, expected)
    }
}

/// Constant-time comparison, length mismatch fails without short-circuiting on content
#[inline]
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
