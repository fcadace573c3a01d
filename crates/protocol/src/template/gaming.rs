//! Generic game engine packets (ID 3)
//!
//! `["GAME"][session 4][seq u16][type 1..=5][flags]`

use super::{
    ClientIdField, HeaderId, Template, TemplateParams, client_id_fields_match, header_id_at,
    random_message_type,
};
use crate::client_id::ClientId;

const HEADER_LEN: usize = 12;
const CLIENT_ID_FIELDS: &[ClientIdField] = &[(4, 0..4)];
const MAGIC: &[u8; 4] = b"GAME";

pub(super) fn header_id(packet: &[u8]) -> Option<HeaderId> {
    if !packet.starts_with(MAGIC) {
        return None;
    }
    header_id_at(packet, HEADER_LEN, 4..8)
}

#[derive(Debug, Clone)]
pub struct GamingTemplate {
    sequence: u16,
}

impl GamingTemplate {
    pub fn new(params: &TemplateParams) -> Self {
        Self {
            sequence: params.seq16(),
        }
    }
}

impl Template for GamingTemplate {
    fn id(&self) -> u8 {
        3
    }

    fn name(&self) -> &'static str {
        "Generic Gaming"
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn encapsulate(&self, payload: &[u8], client_id: &ClientId) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.extend_from_slice(MAGIC);
        packet.extend_from_slice(&client_id.as_bytes()[..4]);
        packet.extend_from_slice(&self.sequence.to_be_bytes());
        packet.push(random_message_type());
        packet.push(fastrand::u8(..));
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
            initial_seq: Some(self.sequence as u32),
            ..Default::default()
        }
    }

    fn update_state(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
    }
}
