//! Douyin (TikTok China) streaming packets (ID 12)
//!
//! `["DYTD"][device 8][session 8][seq u16]`

use super::{
    ClientIdField, HeaderId, Template, TemplateParams, client_id_fields_match, header_id_at,
};
use crate::client_id::ClientId;

const HEADER_LEN: usize = 22;
const CLIENT_ID_FIELDS: &[ClientIdField] = &[(4, 0..16)];
const MAGIC: &[u8; 4] = b"DYTD";

pub(super) fn header_id(packet: &[u8]) -> Option<HeaderId> {
    if !packet.starts_with(MAGIC) {
        return None;
    }
    header_id_at(packet, HEADER_LEN, 4..12)
}

#[derive(Debug, Clone)]
pub struct DouyinTemplate {
    sequence: u16,
}

impl DouyinTemplate {
    pub fn new(params: &TemplateParams) -> Self {
        Self {
            sequence: params.seq16(),
        }
    }
}

impl Template for DouyinTemplate {
    fn id(&self) -> u8 {
        12
    }

    fn name(&self) -> &'static str {
        "Douyin"
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn encapsulate(&self, payload: &[u8], client_id: &ClientId) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.extend_from_slice(MAGIC);
        packet.extend_from_slice(client_id.as_bytes());
        packet.extend_from_slice(&self.sequence.to_be_bytes());
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
