//! RakNet datagrams (ID 10)
//!
//! `[0x80|n][GUID 8][seq u16][reliability][message index u16]
//! [order index u16][channel 0][extended GUID 8]`

use super::{
    ClientIdField, HeaderId, Template, TemplateParams, client_id_fields_match, header_id_at,
};
use crate::client_id::ClientId;

const HEADER_LEN: usize = 25;
const CLIENT_ID_FIELDS: &[ClientIdField] = &[(1, 0..8), (17, 8..16)];
const RELIABLE_ORDERED: u8 = 2;

fn is_datagram(packet: &[u8]) -> bool {
    packet.first().is_some_and(|id| id & 0xF0 == 0x80)
}

pub(super) fn header_id(packet: &[u8]) -> Option<HeaderId> {
    if !is_datagram(packet) {
        return None;
    }
    header_id_at(packet, HEADER_LEN, 1..9)
}

#[derive(Debug, Clone)]
pub struct RaknetTemplate {
    sequence: u16,
    reliability: u8,
    message_index: u16,
    order_index: u16,
}

impl RaknetTemplate {
    pub fn new(params: &TemplateParams) -> Self {
        Self {
            sequence: params.seq16(),
            reliability: params.reliability.unwrap_or(RELIABLE_ORDERED),
            message_index: params.message_index.unwrap_or(0),
            order_index: params.order_index.unwrap_or(0),
        }
    }
}

impl Template for RaknetTemplate {
    fn id(&self) -> u8 {
        10
    }

    fn name(&self) -> &'static str {
        "RakNet"
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn encapsulate(&self, payload: &[u8], client_id: &ClientId) -> Vec<u8> {
        let cid = client_id.as_bytes();
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.push(0x80 | fastrand::u8(0..16));
        packet.extend_from_slice(&cid[..8]);
        packet.extend_from_slice(&self.sequence.to_be_bytes());
        packet.push(self.reliability);
        packet.extend_from_slice(&self.message_index.to_be_bytes());
        packet.extend_from_slice(&self.order_index.to_be_bytes());
        packet.push(0);
        packet.extend_from_slice(&cid[8..]);
        packet.extend_from_slice(payload);
        packet
    }

    fn decapsulate<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]> {
        if packet.len() < HEADER_LEN || !is_datagram(packet) {
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
            reliability: Some(self.reliability),
            message_index: Some(self.message_index),
            order_index: Some(self.order_index),
            ..Default::default()
        }
    }

    fn update_state(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
        self.message_index = self.message_index.wrapping_add(1);
        self.order_index = self.order_index.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_advance_together() {
        let mut template = RaknetTemplate::new(&TemplateParams {
            initial_seq: Some(1),
            message_index: Some(u16::MAX),
            order_index: Some(7),
            ..Default::default()
        });
        template.update_state();

        let params = template.params();
        assert_eq!(params.initial_seq, Some(2));
        assert_eq!(params.message_index, Some(0));
        assert_eq!(params.order_index, Some(8));
        assert_eq!(params.reliability, Some(RELIABLE_ORDERED));
    }
}
