//! QUIC short header packets (ID 1)
//!
//! `[flags 0x40|spin][DCID 8][packet number u16]`

use super::{
    ClientIdField, HeaderId, Template, TemplateParams, client_id_fields_match, header_id_at,
};
use crate::client_id::ClientId;

const HEADER_LEN: usize = 11;
const CLIENT_ID_FIELDS: &[ClientIdField] = &[(1, 0..8)];

fn is_short_header(packet: &[u8]) -> bool {
    packet.first().is_some_and(|flags| flags & 0xC0 == 0x40)
}

pub(super) fn header_id(packet: &[u8]) -> Option<HeaderId> {
    if !is_short_header(packet) {
        return None;
    }
    header_id_at(packet, HEADER_LEN, 1..9)
}

#[derive(Debug, Clone)]
pub struct QuicTemplate {
    packet_number: u16,
}

impl QuicTemplate {
    pub fn new(params: &TemplateParams) -> Self {
        Self {
            packet_number: params.seq16(),
        }
    }
}

impl Template for QuicTemplate {
    fn id(&self) -> u8 {
        1
    }

    fn name(&self) -> &'static str {
        "QUIC"
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn encapsulate(&self, payload: &[u8], client_id: &ClientId) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.push(0x40 | fastrand::u8(0..16));
        packet.extend_from_slice(&client_id.as_bytes()[..8]);
        packet.extend_from_slice(&self.packet_number.to_be_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    fn decapsulate<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]> {
        if packet.len() < HEADER_LEN || !is_short_header(packet) {
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
            initial_seq: Some(self.packet_number as u32),
            ..Default::default()
        }
    }

    fn update_state(&mut self) {
        self.packet_number = self.packet_number.wrapping_add(1);
    }
}
