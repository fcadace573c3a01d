//! The fixed registry of reversible byte transforms
//!
//! Every transform works in place and has an exact inverse for any input
//! length, including zero. Nine of them depend only on the position, the
//! data and the session key material. `Substitution` and `AddRandomValue`
//! additionally need per-session working data ([`Initializers`]); calling
//! them without it is a contract violation and returns an error instead of
//! silently passing the data through.

use crate::error::ObfuscationError;
use crate::keystream::{KeyMaterial, KeyStream};

/// Number of transforms in the registry
pub const FUNCTION_COUNT: usize = 11;

/// A registry transform, identified by its stable index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObfuscationFn {
    BitwiseRotationXor = 0,
    SwapNeighbors = 1,
    ReverseBuffer = 2,
    HalfSwap = 3,
    CircularShift = 4,
    XorWithKey = 5,
    BitwiseNot = 6,
    ReverseBits = 7,
    ShiftBits = 8,
    Substitution = 9,
    AddRandomValue = 10,
}

impl ObfuscationFn {
    pub const ALL: [ObfuscationFn; FUNCTION_COUNT] = [
        Self::BitwiseRotationXor,
        Self::SwapNeighbors,
        Self::ReverseBuffer,
        Self::HalfSwap,
        Self::CircularShift,
        Self::XorWithKey,
        Self::BitwiseNot,
        Self::ReverseBits,
        Self::ShiftBits,
        Self::Substitution,
        Self::AddRandomValue,
    ];

    /// Look up a transform by registry index
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::BitwiseRotationXor => "BitwiseRotationXor",
            Self::SwapNeighbors => "SwapNeighbors",
            Self::ReverseBuffer => "ReverseBuffer",
            Self::HalfSwap => "HalfSwap",
            Self::CircularShift => "CircularShift",
            Self::XorWithKey => "XorWithKey",
            Self::BitwiseNot => "BitwiseNot",
            Self::ReverseBits => "ReverseBits",
            Self::ShiftBits => "ShiftBits",
            Self::Substitution => "Substitution",
            Self::AddRandomValue => "AddRandomValue",
        }
    }

    /// Whether the transform consumes session initializer data
    pub fn requires_initializer(self) -> bool {
        matches!(self, Self::Substitution | Self::AddRandomValue)
    }

    /// Apply the transform in place
    pub fn apply(
        self,
        buf: &mut [u8],
        key: &KeyMaterial,
        init: &Initializers,
    ) -> Result<(), ObfuscationError> {
        let key = key.as_bytes();
        match self {
            Self::BitwiseRotationXor => {
                let len = buf.len();
                for (i, b) in buf.iter_mut().enumerate() {
                    let shift = (i % 8) as u32 + 1;
                    *b = b.rotate_left(shift) ^ key[rotation_key_index(i, len, key.len())];
                }
            }
            Self::SwapNeighbors => swap_neighbors(buf),
            Self::ReverseBuffer => buf.reverse(),
            Self::HalfSwap => {
                let mid = buf.len() / 2;
                buf.rotate_left(mid);
            }
            Self::CircularShift => buf.iter_mut().for_each(|b| *b = b.rotate_left(1)),
            Self::XorWithKey => xor_with_key(buf, key),
            Self::BitwiseNot => buf.iter_mut().for_each(|b| *b = !*b),
            Self::ReverseBits => buf.iter_mut().for_each(|b| *b = b.reverse_bits()),
            Self::ShiftBits => buf.iter_mut().for_each(|b| *b = b.rotate_left(2)),
            Self::Substitution => {
                let table = init.substitution(self)?;
                buf.iter_mut().for_each(|b| *b = table.forward[*b as usize]);
            }
            Self::AddRandomValue => {
                let value = init.random_value(self)?;
                buf.iter_mut().for_each(|b| *b = b.wrapping_add(value));
            }
        }
        Ok(())
    }

    /// Undo [`ObfuscationFn::apply`] in place
    pub fn invert(
        self,
        buf: &mut [u8],
        key: &KeyMaterial,
        init: &Initializers,
    ) -> Result<(), ObfuscationError> {
        let key = key.as_bytes();
        match self {
            Self::BitwiseRotationXor => {
                let len = buf.len();
                for (i, b) in buf.iter_mut().enumerate() {
                    let shift = (i % 8) as u32 + 1;
                    *b = (*b ^ key[rotation_key_index(i, len, key.len())]).rotate_right(shift);
                }
            }
            Self::SwapNeighbors => swap_neighbors(buf),
            Self::ReverseBuffer => buf.reverse(),
            Self::HalfSwap => {
                // rotate_right is the true inverse, also for odd lengths
                let mid = buf.len() / 2;
                buf.rotate_right(mid);
            }
            Self::CircularShift => buf.iter_mut().for_each(|b| *b = b.rotate_right(1)),
            Self::XorWithKey => xor_with_key(buf, key),
            Self::BitwiseNot => buf.iter_mut().for_each(|b| *b = !*b),
            Self::ReverseBits => buf.iter_mut().for_each(|b| *b = b.reverse_bits()),
            Self::ShiftBits => buf.iter_mut().for_each(|b| *b = b.rotate_right(2)),
            Self::Substitution => {
                let table = init.substitution(self)?;
                buf.iter_mut().for_each(|b| *b = table.inverse[*b as usize]);
            }
            Self::AddRandomValue => {
                let value = init.random_value(self)?;
                buf.iter_mut().for_each(|b| *b = b.wrapping_sub(value));
            }
        }
        Ok(())
    }
}

#[inline]
fn rotation_key_index(i: usize, len: usize, key_len: usize) -> usize {
    ((i + len - 1) % len) % key_len
}

#[inline]
fn swap_neighbors(buf: &mut [u8]) {
    for pair in buf.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

#[inline]
fn xor_with_key(buf: &mut [u8], key: &[u8]) {
    for (b, k) in buf.iter_mut().zip(key.iter().cycle()) {
        *b ^= *k;
    }
}

/// A byte substitution table together with its inverse
#[derive(Clone, PartialEq, Eq)]
pub struct SubstitutionTable {
    forward: [u8; 256],
    inverse: [u8; 256],
}

impl SubstitutionTable {
    /// Validate a caller-supplied table; it must be a bijection over bytes
    pub fn new(forward: [u8; 256]) -> Result<Self, ObfuscationError> {
        let mut inverse = [0u8; 256];
        let mut seen = [false; 256];

        for (i, &v) in forward.iter().enumerate() {
            if seen[v as usize] {
                return Err(ObfuscationError::InvalidSubstitutionTable);
            }
            seen[v as usize] = true;
            inverse[v as usize] = i as u8;
        }

        Ok(Self { forward, inverse })
    }

    /// Fisher-Yates shuffle of the identity table driven by the seed
    pub fn from_seed(stream: &mut KeyStream) -> Self {
        let mut forward = [0u8; 256];
        for (i, v) in forward.iter_mut().enumerate() {
            *v = i as u8;
        }
        for i in (1..256).rev() {
            let j = stream.next_index(i);
            forward.swap(i, j);
        }

        let mut inverse = [0u8; 256];
        for (i, &v) in forward.iter().enumerate() {
            inverse[v as usize] = i as u8;
        }

        Self { forward, inverse }
    }

    pub fn forward(&self) -> &[u8; 256] {
        &self.forward
    }
}

impl std::fmt::Debug for SubstitutionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SubstitutionTable(..)")
    }
}

/// Per-session working data for the initializer-dependent transforms
#[derive(Debug, Clone, Default)]
pub struct Initializers {
    substitution: Option<SubstitutionTable>,
    random_value: Option<u8>,
}

impl Initializers {
    /// Initializers derived from the `fnInitiator` seed exchanged at handshake
    pub fn from_seed(seed: u64) -> Self {
        let mut stream = KeyStream::new(seed);
        let substitution = SubstitutionTable::from_seed(&mut stream);
        let random_value = stream.next_u8();

        Self {
            substitution: Some(substitution),
            random_value: Some(random_value),
        }
    }

    /// No initializer data at all
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_substitution(mut self, table: SubstitutionTable) -> Self {
        self.substitution = Some(table);
        self
    }

    pub fn with_random_value(mut self, value: u8) -> Self {
        self.random_value = Some(value);
        self
    }

    pub fn substitution_table(&self) -> Option<&SubstitutionTable> {
        self.substitution.as_ref()
    }

    pub fn value(&self) -> Option<u8> {
        self.random_value
    }

    fn substitution(&self, f: ObfuscationFn) -> Result<&SubstitutionTable, ObfuscationError> {
        self.substitution
            .as_ref()
            .ok_or(ObfuscationError::MissingInitializer(f.name()))
    }

    fn random_value(&self, f: ObfuscationFn) -> Result<u8, ObfuscationError> {
        self.random_value
            .ok_or(ObfuscationError::MissingInitializer(f.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> (KeyMaterial, Initializers) {
        let (key, _) = KeyMaterial::derive(123);
        (key, Initializers::from_seed(12345).with_random_value(0x5A))
    }

    fn roundtrip(f: ObfuscationFn, original: &[u8]) {
        let (key, init) = fixtures();
        let mut buf = original.to_vec();

        f.apply(&mut buf, &key, &init).unwrap();
        f.invert(&mut buf, &key, &init).unwrap();

        assert_eq!(buf, original, "{} failed for len {}", f.name(), original.len());
    }

    #[test]
    fn test_every_function_inverts() {
        let sizes = [0usize, 1, 2, 3, 7, 92, 148, 1500];
        for f in ObfuscationFn::ALL {
            for &size in &sizes {
                let data: Vec<u8> = (0..size).map(|i| (i * 31 + 7) as u8).collect();
                roundtrip(f, &data);
            }
        }
    }

    #[test]
    fn test_functions_change_data() {
        let (key, init) = fixtures();
        let original: Vec<u8> = (0..148).map(|i| i as u8).collect();

        for f in ObfuscationFn::ALL {
            let mut buf = original.clone();
            f.apply(&mut buf, &key, &init).unwrap();
            assert_ne!(buf, original, "{} left data unchanged", f.name());
        }
    }

    #[test]
    fn test_half_swap_odd_length() {
        let (key, init) = fixtures();
        let mut buf = vec![1, 2, 3, 4, 5];

        ObfuscationFn::HalfSwap.apply(&mut buf, &key, &init).unwrap();
        assert_eq!(buf, vec![3, 4, 5, 1, 2]);

        ObfuscationFn::HalfSwap.invert(&mut buf, &key, &init).unwrap();
        assert_eq!(buf, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_swap_neighbors_keeps_odd_tail() {
        let (key, init) = fixtures();
        let mut buf = vec![1, 2, 3, 4, 5];

        ObfuscationFn::SwapNeighbors.apply(&mut buf, &key, &init).unwrap();
        assert_eq!(buf, vec![2, 1, 4, 3, 5]);
    }

    #[test]
    fn test_fixed_bit_transforms() {
        let (key, init) = fixtures();

        let mut buf = vec![0b1000_0001];
        ObfuscationFn::CircularShift.apply(&mut buf, &key, &init).unwrap();
        assert_eq!(buf, vec![0b0000_0011]);

        let mut buf = vec![0b1100_0001];
        ObfuscationFn::ShiftBits.apply(&mut buf, &key, &init).unwrap();
        assert_eq!(buf, vec![0b0000_0111]);

        let mut buf = vec![0b0000_0001];
        ObfuscationFn::ReverseBits.apply(&mut buf, &key, &init).unwrap();
        assert_eq!(buf, vec![0b1000_0000]);

        let mut buf = vec![0x0F];
        ObfuscationFn::BitwiseNot.apply(&mut buf, &key, &init).unwrap();
        assert_eq!(buf, vec![0xF0]);
    }

    #[test]
    fn test_substitution_table_is_bijection() {
        let init = Initializers::from_seed(795656);
        let table = init.substitution_table().unwrap();

        let mut seen = [false; 256];
        for &v in table.forward() {
            assert!(!seen[v as usize], "value {} appears twice", v);
            seen[v as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_invalid_substitution_table_rejected() {
        let mut table = [0u8; 256];
        for (i, v) in table.iter_mut().enumerate() {
            *v = i as u8;
        }
        table[1] = 0;

        assert_eq!(
            SubstitutionTable::new(table).unwrap_err(),
            ObfuscationError::InvalidSubstitutionTable
        );
    }

    #[test]
    fn test_missing_initializer_fails_loudly() {
        let (key, _) = fixtures();
        let empty = Initializers::empty();
        let mut buf = vec![1, 2, 3];

        let err = ObfuscationFn::Substitution
            .apply(&mut buf, &key, &empty)
            .unwrap_err();
        assert_eq!(err, ObfuscationError::MissingInitializer("Substitution"));

        let err = ObfuscationFn::AddRandomValue
            .invert(&mut buf, &key, &empty)
            .unwrap_err();
        assert_eq!(err, ObfuscationError::MissingInitializer("AddRandomValue"));

        // Untouched on failure
        assert_eq!(buf, vec![1, 2, 3]);
    }

    #[test]
    fn test_add_random_value_wraps() {
        let (key, _) = fixtures();
        let init = Initializers::empty().with_random_value(200);
        let mut buf = vec![100, 55, 56];

        ObfuscationFn::AddRandomValue.apply(&mut buf, &key, &init).unwrap();
        assert_eq!(buf, vec![44, 255, 0]);
    }

    #[test]
    fn test_initializers_are_deterministic() {
        let a = Initializers::from_seed(12345);
        let b = Initializers::from_seed(12345);

        assert_eq!(a.substitution_table(), b.substitution_table());
        assert_eq!(a.value(), b.value());
    }

    #[test]
    fn test_index_lookup() {
        for (i, f) in ObfuscationFn::ALL.iter().enumerate() {
            assert_eq!(ObfuscationFn::from_index(i as u8), Some(*f));
            assert_eq!(f.index() as usize, i);
        }
        assert_eq!(ObfuscationFn::from_index(11), None);
    }
}
