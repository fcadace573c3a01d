//! Bilibili live streaming packets (ID 11)
//!
//! `["BLIV"][room 4][user 8][timestamp u32]`

use super::{
    ClientIdField, HeaderId, Template, TemplateParams, client_id_fields_match, header_id_at,
};
use crate::client_id::ClientId;

const HEADER_LEN: usize = 20;
const CLIENT_ID_FIELDS: &[ClientIdField] = &[(4, 0..12)];
const MAGIC: &[u8; 4] = b"BLIV";

pub(super) fn header_id(packet: &[u8]) -> Option<HeaderId> {
    if !packet.starts_with(MAGIC) {
        return None;
    }
    header_id_at(packet, HEADER_LEN, 4..8)
}

#[derive(Debug, Clone)]
pub struct BilibiliTemplate {
    timestamp: u32,
}

impl BilibiliTemplate {
    pub fn new(params: &TemplateParams) -> Self {
        Self {
            timestamp: params.timestamp(),
        }
    }
}

impl Template for BilibiliTemplate {
    fn id(&self) -> u8 {
        11
    }

    fn name(&self) -> &'static str {
        "Bilibili"
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn encapsulate(&self, payload: &[u8], client_id: &ClientId) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.extend_from_slice(MAGIC);
        packet.extend_from_slice(&client_id.as_bytes()[..12]);
        packet.extend_from_slice(&self.timestamp.to_be_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    fn decapsulate<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]> {
        if packet.len() < HEADER_LEN || !packet.starts_with(MAGIC) {
            return None;
        }
        Some(&packet[HEADER_LEN..])
    }

    fn extract_header_id(&self, packet: &[u8]) -> Option<HeaderId> {
        header_id(packet)
    }

    fn carries_client_id(&self, packet: &[u8], client_id: &ClientId) -> bool {
        client_id_fields_match(packet, client_id, CLIENT_ID_FIELDS)
    }

    fn params(&self) -> TemplateParams {
        TemplateParams {
            initial_ts: Some(self.timestamp),
            ..Default::default()
        }
    }

    fn update_state(&mut self) {
        self.timestamp = self.timestamp.wrapping_add(1);
    }
}
