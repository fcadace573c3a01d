//! Secure packet envelope
//!
//! `[encrypted client ID 16][seq u32 BE][ts u32 BE][tag 32][payload]`
//!
//! The client ID is AES-128-CTR encrypted with the sequence number as IV,
//! so the same client looks different on every packet. The tag covers
//! everything except itself.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::hmac_auth::{HmacAuthenticator, TAG_LEN};
use crate::session_keys::SessionKeys;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Envelope bytes in front of the payload
pub const ENVELOPE_HEADER_LEN: usize = 16 + 4 + 4 + TAG_LEN;

/// Default tolerated clock skew / packet age in seconds
pub const DEFAULT_MAX_AGE_SECS: u64 = 300;

const WRAP_THRESHOLD: u32 = 0x8000_0000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("Envelope too short: {0} bytes")]
    TooShort(usize),

    #[error("Stale timestamp {timestamp} (now {now})")]
    StaleTimestamp { timestamp: u32, now: u64 },

    #[error("Duplicate sequence {0}")]
    DuplicateSequence(u32),

    #[error("Sequence {sequence} not after {last}")]
    OutOfOrder { sequence: u32, last: u32 },

    #[error("Packet tag mismatch")]
    InvalidTag,

    #[error("Key derivation failed")]
    KeyDerivation,
}

/// A validated inbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurePacket {
    pub client_id: [u8; 16],
    pub payload: Vec<u8>,
    pub sequence: u32,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn sequence_iv(sequence: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..4].copy_from_slice(&sequence.to_be_bytes());
    iv
}

fn apply_cid_keystream(keys: &SessionKeys, sequence: u32, buf: &mut [u8; 16]) {
    let iv = sequence_iv(sequence);
    let mut cipher = Aes128Ctr::new(&keys.session_key.into(), &iv.into());
    cipher.apply_keystream(buf);
}

/// Check an inbound sequence number against the last accepted one
pub fn validate_sequence(sequence: u32, last: u32) -> Result<(), SecurityError> {
    if sequence == last {
        return Err(SecurityError::DuplicateSequence(sequence));
    }
    if last > WRAP_THRESHOLD && sequence < WRAP_THRESHOLD {
        // counter wrapped around
        return Ok(());
    }
    if sequence > last {
        Ok(())
    } else {
        Err(SecurityError::OutOfOrder { sequence, last })
    }
}

/// Wrap a payload in a secure envelope
pub fn encapsulate_secure(
    client_id: &[u8; 16],
    payload: &[u8],
    sequence: u32,
    keys: &SessionKeys,
) -> Vec<u8> {
    encapsulate_secure_at(client_id, payload, sequence, keys, unix_now() as u32)
}

fn encapsulate_secure_at(
    client_id: &[u8; 16],
    payload: &[u8],
    sequence: u32,
    keys: &SessionKeys,
    timestamp: u32,
) -> Vec<u8> {
    let mut encrypted_cid = *client_id;
    apply_cid_keystream(keys, sequence, &mut encrypted_cid);

    let seq = sequence.to_be_bytes();
    let ts = timestamp.to_be_bytes();
    let tag = HmacAuthenticator::new(keys.hmac_key).compute(&[&encrypted_cid, &seq, &ts, payload]);

    let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
    out.extend_from_slice(&encrypted_cid);
    out.extend_from_slice(&seq);
    out.extend_from_slice(&ts);
    out.extend_from_slice(&tag);
    out.extend_from_slice(payload);
    out
}

/// Validate and open a secure envelope
///
/// Checks run in order: length, timestamp, sequence, tag. The client ID is
/// only decrypted once the tag matched.
pub fn decapsulate_secure(
    envelope: &[u8],
    keys: &SessionKeys,
    last_sequence: u32,
    max_age_secs: u64,
) -> Result<SecurePacket, SecurityError> {
    decapsulate_secure_at(envelope, keys, last_sequence, max_age_secs, unix_now())
}

fn decapsulate_secure_at(
    envelope: &[u8],
    keys: &SessionKeys,
    last_sequence: u32,
    max_age_secs: u64,
    now: u64,
) -> Result<SecurePacket, SecurityError> {
    if envelope.len() < ENVELOPE_HEADER_LEN {
        return Err(SecurityError::TooShort(envelope.len()));
    }

    let (encrypted_cid, rest) = envelope.split_at(16);
    let (seq, rest) = rest.split_at(4);
    let (ts, rest) = rest.split_at(4);
    let (tag, payload) = rest.split_at(TAG_LEN);

    let sequence = u32::from_be_bytes([seq[0], seq[1], seq[2], seq[3]]);
    let timestamp = u32::from_be_bytes([ts[0], ts[1], ts[2], ts[3]]);

    if now.abs_diff(timestamp as u64) > max_age_secs {
        return Err(SecurityError::StaleTimestamp { timestamp, now });
    }

    validate_sequence(sequence, last_sequence)?;

    let auth = HmacAuthenticator::new(keys.hmac_key);
    if !auth.verify(&[encrypted_cid, seq, ts, payload], tag) {
        return Err(SecurityError::InvalidTag);
    }

    let mut client_id = [0u8; 16];
    client_id.copy_from_slice(encrypted_cid);
    apply_cid_keystream(keys, sequence, &mut client_id);

    Ok(SecurePacket {
        client_id,
        payload: payload.to_vec(),
        sequence,
    })
}
