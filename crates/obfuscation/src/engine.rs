//! Per-packet obfuscation engine
//!
//! Framed layout: `[h0][h1][pad][transformed payload][pad random bytes]`.
//! `h0,h1` encode the combo index masked with the session key, `pad` is the
//! number of trailing padding bytes.

use crate::error::ObfuscationError;
use crate::functions::Initializers;
use crate::keystream::KeyMaterial;
use crate::permutations::{MAX_LAYER, functions_for, total_combinations};

/// Bytes in front of the transformed payload
pub const HEADER_LEN: usize = 3;

/// Obfuscation parameters negotiated for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObfuscationParams {
    pub key: u64,
    pub layer: u8,
    pub padding_max: u8,
    pub fn_initiator: u64,
}

impl ObfuscationParams {
    pub fn validate(&self) -> Result<(), ObfuscationError> {
        if self.layer == 0 || self.layer > MAX_LAYER {
            return Err(ObfuscationError::InvalidLayer(self.layer));
        }
        Ok(())
    }

    /// Fresh random parameters, as a client generates them
    pub fn random(layer: u8, padding_max: u8) -> Self {
        Self {
            key: fastrand::u64(..),
            layer,
            padding_max,
            fn_initiator: fastrand::u64(..),
        }
    }
}

/// Recover the combo index from the two header bytes
///
/// Pure function of the header, the session key and the layer.
pub fn combo_index(header: [u8; 2], key: u64, layer: u8) -> Result<usize, ObfuscationError> {
    let (_, mask) = KeyMaterial::derive(key);
    combo_index_masked(header, mask, layer)
}

fn combo_index_masked(header: [u8; 2], mask: u16, layer: u8) -> Result<usize, ObfuscationError> {
    let total = total_combinations(layer)?;
    let value = u16::from_be_bytes(header) ^ mask;
    Ok(value as usize % total)
}

/// Encode a combo index as header bytes
fn encode_combo(combo: usize, total: usize, mask: u16) -> [u8; 2] {
    // Any multiple of total added keeps the residue; spread the header values
    let max_k = (u16::MAX as usize - combo) / total;
    let k = fastrand::usize(0..=max_k);
    let value = (combo + k * total) as u16;
    (value ^ mask).to_be_bytes()
}

/// Session obfuscator, immutable once built
#[derive(Debug, Clone)]
pub struct Obfuscator {
    params: ObfuscationParams,
    key: KeyMaterial,
    mask: u16,
    total: usize,
    initializers: Initializers,
}

impl Obfuscator {
    pub fn new(params: ObfuscationParams) -> Result<Self, ObfuscationError> {
        Self::with_initializers(params, Initializers::from_seed(params.fn_initiator))
    }

    /// Build with explicit initializer data
    pub fn with_initializers(
        params: ObfuscationParams,
        initializers: Initializers,
    ) -> Result<Self, ObfuscationError> {
        params.validate()?;
        let (key, mask) = KeyMaterial::derive(params.key);
        let total = total_combinations(params.layer)?;

        Ok(Self {
            params,
            key,
            mask,
            total,
            initializers,
        })
    }

    pub fn params(&self) -> &ObfuscationParams {
        &self.params
    }

    /// Obfuscate a plaintext packet
    pub fn obfuscate(&self, data: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let combo = fastrand::usize(0..self.total);
        let functions = functions_for(self.params.layer, combo)?;
        let pad = fastrand::u8(0..=self.params.padding_max);
        let header = encode_combo(combo, self.total, self.mask);

        let mut out = Vec::with_capacity(HEADER_LEN + data.len() + pad as usize);
        out.extend_from_slice(&header);
        out.push(pad);
        out.extend_from_slice(data);

        let body = &mut out[HEADER_LEN..];
        for f in &functions {
            f.apply(body, &self.key, &self.initializers)?;
        }

        out.extend((0..pad).map(|_| fastrand::u8(..)));
        Ok(out)
    }

    /// Reverse [`Obfuscator::obfuscate`]
    pub fn deobfuscate(&self, framed: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
        if framed.is_empty() {
            return Ok(Vec::new());
        }
        if framed.len() < HEADER_LEN {
            return Err(ObfuscationError::FrameTooShort(framed.len()));
        }

        let combo = combo_index_masked([framed[0], framed[1]], self.mask, self.params.layer)?;
        let padding = framed[2] as usize;
        let available = framed.len() - HEADER_LEN;
        if padding > available {
            return Err(ObfuscationError::CorruptPadding { padding, available });
        }

        let mut body = framed[HEADER_LEN..framed.len() - padding].to_vec();
        let functions = functions_for(self.params.layer, combo)?;
        for f in functions.iter().rev() {
            f.invert(&mut body, &self.key, &self.initializers)?;
        }

        Ok(body)
    }
}
