//! KCP data segments (ID 2)
//!
//! `[conv 4][cmd 0x51][frg 0][wnd u16 LE][ts u32 LE][sn u32 LE][una u32 LE][len u32 LE]`

use super::{
    ClientIdField, HeaderId, Template, TemplateParams, client_id_fields_match, header_id_at,
};
use crate::client_id::ClientId;

const HEADER_LEN: usize = 24;
const CLIENT_ID_FIELDS: &[ClientIdField] = &[(0, 0..4)];
const CMD_PUSH: u8 = 0x51;
const WINDOW: u16 = 256;

pub(super) fn header_id(packet: &[u8]) -> Option<HeaderId> {
    if packet.get(4) != Some(&CMD_PUSH) {
        return None;
    }
    header_id_at(packet, HEADER_LEN, 0..4)
}

#[derive(Debug, Clone)]
pub struct KcpTemplate {
    sn: u32,
    ts: u32,
}

impl KcpTemplate {
    pub fn new(params: &TemplateParams) -> Self {
        Self {
            sn: params.seq32(),
            ts: params.timestamp(),
        }
    }
}

impl Template for KcpTemplate {
    fn id(&self) -> u8 {
        2
    }

    fn name(&self) -> &'static str {
        "KCP"
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn encapsulate(&self, payload: &[u8], client_id: &ClientId) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.extend_from_slice(&client_id.as_bytes()[..4]);
        packet.push(CMD_PUSH);
        packet.push(0);
        packet.extend_from_slice(&WINDOW.to_le_bytes());
        packet.extend_from_slice(&self.ts.to_le_bytes());
        packet.extend_from_slice(&self.sn.to_le_bytes());
        packet.extend_from_slice(&self.sn.saturating_sub(1).to_le_bytes());
        packet.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    fn decapsulate<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]> {
        if packet.len() < HEADER_LEN || packet[4] != CMD_PUSH {
            return None;
        }
        let len = u32::from_le_bytes([packet[20], packet[21], packet[22], packet[23]]) as usize;
        if len != packet.len() - HEADER_LEN {
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
            initial_seq: Some(self.sn),
            initial_ts: Some(self.ts),
            ..Default::default()
        }
    }

    fn update_state(&mut self) {
        self.sn = self.sn.wrapping_add(1);
        // KCP clocks tick in 10ms intervals
        self.ts = self.ts.wrapping_add(fastrand::u32(10..=30));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_fields() {
        let template = KcpTemplate::new(&TemplateParams {
            initial_seq: Some(5),
            initial_ts: Some(1000),
            ..Default::default()
        });
        let cid = ClientId::from_bytes([3; 16]);
        let packet = template.encapsulate(&[9; 10], &cid);

        assert_eq!(&packet[0..4], &[3; 4]);
        assert_eq!(packet[4], 0x51);
        assert_eq!(packet[5], 0);
        assert_eq!(&packet[6..8], &256u16.to_le_bytes());
        assert_eq!(&packet[8..12], &1000u32.to_le_bytes());
        assert_eq!(&packet[12..16], &5u32.to_le_bytes());
        assert_eq!(&packet[16..20], &4u32.to_le_bytes());
        assert_eq!(&packet[20..24], &10u32.to_le_bytes());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let template = KcpTemplate::new(&TemplateParams::default());
        let mut packet = template.encapsulate(&[1, 2, 3], &ClientId::from_bytes([0; 16]));
        packet.push(0);
        assert_eq!(template.decapsulate(&packet), None);
    }

    #[test]
    fn test_timestamp_advances() {
        let mut template = KcpTemplate::new(&TemplateParams {
            initial_ts: Some(0),
            ..Default::default()
        });
        template.update_state();
        let ts = template.params().initial_ts.unwrap();
        assert!((10..=30).contains(&ts));
    }
}
