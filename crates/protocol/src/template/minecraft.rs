//! Minecraft protocol packets (ID 5)
//!
//! `[packet id 0..=0x0F][VarInt length, 3 bytes][UUID 16]`. The VarInt
//! counts the UUID plus the payload.

use super::{
    ClientIdField, HeaderId, Template, TemplateParams, client_id_fields_match, header_id_at,
};
use crate::client_id::{CLIENT_ID_LEN, ClientId};

const HEADER_LEN: usize = 20;
const CLIENT_ID_FIELDS: &[ClientIdField] = &[(4, 0..16)];
const MAX_PACKET_ID: u8 = 0x0F;

/// Fixed-width VarInt, continuation bits set on the first two bytes
fn encode_varint3(value: u32) -> [u8; 3] {
    [
        (value & 0x7F) as u8 | 0x80,
        ((value >> 7) & 0x7F) as u8 | 0x80,
        ((value >> 14) & 0x7F) as u8,
    ]
}

fn decode_varint3(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < 3 || bytes[0] & 0x80 == 0 || bytes[1] & 0x80 == 0 || bytes[2] & 0x80 != 0 {
        return None;
    }
    Some((bytes[0] & 0x7F) as u32 | ((bytes[1] & 0x7F) as u32) << 7 | (bytes[2] as u32) << 14)
}

pub(super) fn header_id(packet: &[u8]) -> Option<HeaderId> {
    if packet.first().is_none_or(|id| *id > MAX_PACKET_ID) {
        return None;
    }
    header_id_at(packet, HEADER_LEN, 4..12)
}

#[derive(Debug, Clone, Default)]
pub struct MinecraftTemplate;

impl MinecraftTemplate {
    pub fn new(_params: &TemplateParams) -> Self {
        Self
    }
}

impl Template for MinecraftTemplate {
    fn id(&self) -> u8 {
        5
    }

    fn name(&self) -> &'static str {
        "Minecraft"
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn encapsulate(&self, payload: &[u8], client_id: &ClientId) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.push(fastrand::u8(0..=MAX_PACKET_ID));
        packet.extend_from_slice(&encode_varint3((CLIENT_ID_LEN + payload.len()) as u32));
        packet.extend_from_slice(client_id.as_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    fn decapsulate<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]> {
        if packet.len() < HEADER_LEN || packet[0] > MAX_PACKET_ID {
            return None;
        }
        let length = decode_varint3(&packet[1..4])? as usize;
        if length != packet.len() - 4 {
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
