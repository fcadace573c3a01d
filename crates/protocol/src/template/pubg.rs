//! PUBG / Unreal Engine packets (ID 7)
//!
//! `[zero u32][seq u32][connection GUID 8][packet type u32][channel GUID 8]`

use super::{
    ClientIdField, HeaderId, Template, TemplateParams, client_id_fields_match, header_id_at,
};
use crate::client_id::ClientId;

const HEADER_LEN: usize = 28;
const CLIENT_ID_FIELDS: &[ClientIdField] = &[(8, 0..8), (20, 8..16)];
const DEFAULT_PACKET_TYPE: u32 = 1;

fn has_marker(packet: &[u8]) -> bool {
    packet.len() >= 4 && packet[..4] == [0, 0, 0, 0]
}

pub(super) fn header_id(packet: &[u8]) -> Option<HeaderId> {
    if !has_marker(packet) {
        return None;
    }
    header_id_at(packet, HEADER_LEN, 8..16)
}

#[derive(Debug, Clone)]
pub struct PubgTemplate {
    sequence: u32,
    packet_type: u32,
}

impl PubgTemplate {
    pub fn new(params: &TemplateParams) -> Self {
        Self {
            sequence: params.seq32(),
            packet_type: params.packet_type.unwrap_or(DEFAULT_PACKET_TYPE),
        }
    }
}

impl Template for PubgTemplate {
    fn id(&self) -> u8 {
        7
    }

    fn name(&self) -> &'static str {
        "PUBG"
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn encapsulate(&self, payload: &[u8], client_id: &ClientId) -> Vec<u8> {
        let cid = client_id.as_bytes();
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.extend_from_slice(&[0; 4]);
        packet.extend_from_slice(&self.sequence.to_be_bytes());
        packet.extend_from_slice(&cid[..8]);
        packet.extend_from_slice(&self.packet_type.to_be_bytes());
        packet.extend_from_slice(&cid[8..]);
        packet.extend_from_slice(payload);
        packet
    }

    fn decapsulate<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]> {
        if packet.len() < HEADER_LEN || !has_marker(packet) {
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
            initial_seq: Some(self.sequence),
            packet_type: Some(self.packet_type),
            ..Default::default()
        }
    }

    fn update_state(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
    }
}
