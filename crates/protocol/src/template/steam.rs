//! Steam / Source engine connectionless packets (ID 9)
//!
//! `[0xFFFFFFFF]['T'][challenge 4][SteamID 8][reserved 4]`

use super::{
    ClientIdField, HeaderId, Template, TemplateParams, client_id_fields_match, header_id_at,
};
use crate::client_id::ClientId;

const HEADER_LEN: usize = 21;
const CLIENT_ID_FIELDS: &[ClientIdField] = &[(5, 8..12), (9, 0..8), (17, 12..16)];
const CONNECTIONLESS: [u8; 4] = [0xFF; 4];
const QUERY_TYPE: u8 = b'T';

fn is_connectionless(packet: &[u8]) -> bool {
    packet.len() >= 5 && packet[..4] == CONNECTIONLESS && packet[4] == QUERY_TYPE
}

pub(super) fn header_id(packet: &[u8]) -> Option<HeaderId> {
    if !is_connectionless(packet) {
        return None;
    }
    header_id_at(packet, HEADER_LEN, 9..17)
}

#[derive(Debug, Clone, Default)]
pub struct SteamTemplate;

impl SteamTemplate {
    pub fn new(_params: &TemplateParams) -> Self {
        Self
    }
}

impl Template for SteamTemplate {
    fn id(&self) -> u8 {
        9
    }

    fn name(&self) -> &'static str {
        "Steam"
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn encapsulate(&self, payload: &[u8], client_id: &ClientId) -> Vec<u8> {
        let cid = client_id.as_bytes();
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.extend_from_slice(&CONNECTIONLESS);
        packet.push(QUERY_TYPE);
        packet.extend_from_slice(&cid[8..12]);
        packet.extend_from_slice(&cid[..8]);
        packet.extend_from_slice(&cid[12..]);
        packet.extend_from_slice(payload);
        packet
    }

    fn decapsulate<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]> {
        if packet.len() < HEADER_LEN || !is_connectionless(packet) {
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
        TemplateParams::default()
    }

    fn update_state(&mut self) {}
}
