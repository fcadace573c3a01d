//! WebRTC data channel, DTLS 1.2 record with connection ID (ID 4)
//!
//! `[type 0x19][version 0xFEFD][epoch u16][seq 48][CID 4][length u16]`

use super::{
    ClientIdField, HeaderId, Template, TemplateParams, client_id_fields_match, header_id_at,
};
use crate::client_id::ClientId;

const HEADER_LEN: usize = 17;
const CLIENT_ID_FIELDS: &[ClientIdField] = &[(11, 0..4)];
const CONTENT_TYPE_TLS12_CID: u8 = 0x19;
const VERSION_DTLS12: [u8; 2] = [0xFE, 0xFD];
const SEQ_MASK: u64 = 0xFFFF_FFFF_FFFF;

fn is_record(packet: &[u8]) -> bool {
    packet.len() >= 3 && packet[0] == CONTENT_TYPE_TLS12_CID && packet[1..3] == VERSION_DTLS12
}

pub(super) fn header_id(packet: &[u8]) -> Option<HeaderId> {
    if !is_record(packet) {
        return None;
    }
    header_id_at(packet, HEADER_LEN, 11..15)
}

#[derive(Debug, Clone)]
pub struct DtlsTemplate {
    epoch: u16,
    sequence: u64,
}

impl DtlsTemplate {
    pub fn new(params: &TemplateParams) -> Self {
        Self {
            epoch: params.epoch.unwrap_or(1),
            sequence: params.seq32() as u64,
        }
    }
}

impl Template for DtlsTemplate {
    fn id(&self) -> u8 {
        4
    }

    fn name(&self) -> &'static str {
        "WebRTC DTLS"
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn encapsulate(&self, payload: &[u8], client_id: &ClientId) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.push(CONTENT_TYPE_TLS12_CID);
        packet.extend_from_slice(&VERSION_DTLS12);
        packet.extend_from_slice(&self.epoch.to_be_bytes());
        packet.extend_from_slice(&self.sequence.to_be_bytes()[2..8]);
        packet.extend_from_slice(&client_id.as_bytes()[..4]);
        packet.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    fn decapsulate<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]> {
        if packet.len() < HEADER_LEN || !is_record(packet) {
            return None;
        }
        let length = u16::from_be_bytes([packet[15], packet[16]]) as usize;
        if length != packet.len() - HEADER_LEN {
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
            epoch: Some(self.epoch),
            ..Default::default()
        }
    }

    fn update_state(&mut self) {
        self.sequence = (self.sequence + 1) & SEQ_MASK;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_header() {
        let template = DtlsTemplate::new(&TemplateParams {
            initial_seq: Some(0x0102_0304),
            epoch: Some(2),
            ..Default::default()
        });
        let packet = template.encapsulate(&[0; 300], &ClientId::from_bytes([5; 16]));

        assert_eq!(packet[0], 0x19);
        assert_eq!(&packet[1..3], &[0xFE, 0xFD]);
        assert_eq!(&packet[3..5], &[0, 2]);
        assert_eq!(&packet[5..11], &[0, 0, 1, 2, 3, 4]);
        assert_eq!(&packet[11..15], &[5; 4]);
        assert_eq!(&packet[15..17], &300u16.to_be_bytes());
    }
}
