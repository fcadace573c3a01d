//! Deterministic key stream shared by both peers
//!
//! Both ends of a session only exchange small integer seeds (`key` and
//! `fnInitiator`). Everything derived from them (key material, header mask,
//! substitution table, random byte) comes out of this generator, so the
//! output must stay bit-for-bit stable across platforms and releases.

/// Length of the key material fed to the keyed transforms
pub const KEY_MATERIAL_LEN: usize = 32;

/// Fallback state, xorshift must never be seeded with zero
const NONZERO_STATE: u64 = 0x9E37_79B9_7F4A_7C15;

/// xorshift64 generator
#[derive(Debug, Clone)]
pub struct KeyStream {
    state: u64,
}

impl KeyStream {
    /// Create a stream from a session seed
    pub fn new(seed: u64) -> Self {
        // splitmix64 finalizer spreads small seeds over the whole state
        let mut z = seed.wrapping_add(NONZERO_STATE);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;

        Self {
            state: if z == 0 { NONZERO_STATE } else { z },
        }
    }

    /// Next 64-bit word
    pub fn next_u64(&mut self) -> u64 {
        let mut state = self.state;
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        self.state = state;
        state
    }

    /// Next byte
    pub fn next_u8(&mut self) -> u8 {
        (self.next_u64() & 0xFF) as u8
    }

    /// Uniform-enough index in `0..=max` for table shuffling
    pub fn next_index(&mut self, max: usize) -> usize {
        (self.next_u64() % (max as u64 + 1)) as usize
    }

    /// Fill a buffer with stream bytes
    pub fn fill(&mut self, out: &mut [u8]) {
        for b in out.iter_mut() {
            *b = self.next_u8();
        }
    }
}

/// Key material for the keyed transforms, derived from the session key
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial([u8; KEY_MATERIAL_LEN]);

impl KeyMaterial {
    /// Derive key material and the 16-bit header mask from a session key
    pub fn derive(key: u64) -> (Self, u16) {
        let mut stream = KeyStream::new(key);
        let mask = (stream.next_u64() & 0xFFFF) as u16;
        let mut bytes = [0u8; KEY_MATERIAL_LEN];
        stream.fill(&mut bytes);
        (Self(bytes), mask)
    }

    /// Build from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_MATERIAL_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_MATERIAL_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}
