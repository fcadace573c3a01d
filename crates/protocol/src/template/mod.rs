//! Carrier protocol templates
//!
//! A template wraps an obfuscated payload in a fixed-size header that looks
//! like a real carrier protocol on the wire. Each header carries some bytes
//! of the client identifier in a protocol-native field (connection ID,
//! conversation ID, GUID, ...); that field doubles as the header ID used by
//! the relay to find the session without decrypting anything.

mod bilibili;
mod douyin;
mod dtls;
mod fortnite;
mod gaming;
mod kcp;
mod minecraft;
mod moba;
mod pubg;
mod quic;
mod raknet;
mod selector;
mod steam;

pub use bilibili::BilibiliTemplate;
pub use douyin::DouyinTemplate;
pub use dtls::DtlsTemplate;
pub use fortnite::FortniteTemplate;
pub use gaming::GamingTemplate;
pub use kcp::KcpTemplate;
pub use minecraft::MinecraftTemplate;
pub use moba::MobaTemplate;
pub use pubg::PubgTemplate;
pub use quic::QuicTemplate;
pub use raknet::RaknetTemplate;
pub use selector::{TemplateSelector, TemplateWeight, default_weights};
pub use steam::SteamTemplate;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client_id::ClientId;

/// Template IDs in wire order
pub const TEMPLATE_IDS: std::ops::RangeInclusive<u8> = 1..=12;

/// Longest header ID carried by any template
pub const MAX_HEADER_ID_LEN: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Unknown template ID: {0}")]
    UnknownTemplate(u8),

    #[error("Template weights must select at least one template")]
    NoSelectableTemplate,
}

/// Protocol-native identifier extracted from a header (4 or 8 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeaderId {
    len: u8,
    bytes: [u8; MAX_HEADER_ID_LEN],
}

impl HeaderId {
    /// Copy up to 8 bytes
    pub fn from_slice(src: &[u8]) -> Option<Self> {
        if src.is_empty() || src.len() > MAX_HEADER_ID_LEN {
            return None;
        }
        let mut bytes = [0u8; MAX_HEADER_ID_LEN];
        bytes[..src.len()].copy_from_slice(src);
        Some(Self {
            len: src.len() as u8,
            bytes,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl std::fmt::Debug for HeaderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HeaderId({})", hex::encode(self.as_bytes()))
    }
}

/// Negotiated template counters, exchanged in the handshake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_seq: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_ts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliability: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_type: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u16>,
}

impl TemplateParams {
    /// 16-bit starting sequence, random when not negotiated
    pub(crate) fn seq16(&self) -> u16 {
        self.initial_seq
            .map(|s| s as u16)
            .unwrap_or_else(|| fastrand::u16(..))
    }

    /// 32-bit starting sequence, random in the low 16 bits when not negotiated
    pub(crate) fn seq32(&self) -> u32 {
        self.initial_seq
            .unwrap_or_else(|| fastrand::u16(..) as u32)
    }

    pub(crate) fn timestamp(&self) -> u32 {
        self.initial_ts.unwrap_or_else(|| fastrand::u32(..))
    }
}

/// Uniform template interface
pub trait Template {
    fn id(&self) -> u8;

    fn name(&self) -> &'static str;

    /// Fixed header size in bytes
    fn header_len(&self) -> usize;

    /// Prepend the carrier header to a payload
    fn encapsulate(&self, payload: &[u8], client_id: &ClientId) -> Vec<u8>;

    /// Strip the carrier header, rejecting packets that do not look like ours
    fn decapsulate<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]>;

    /// Protocol-native identifier used for session lookup
    fn extract_header_id(&self, packet: &[u8]) -> Option<HeaderId>;

    /// Whether every client ID field of the header holds `client_id`'s bytes
    fn carries_client_id(&self, packet: &[u8], client_id: &ClientId) -> bool;

    /// Current counters, for the handshake
    fn params(&self) -> TemplateParams;

    /// Advance counters after a packet is sent
    fn update_state(&mut self);
}

/// Closed set of template implementations
#[derive(Debug, Clone)]
pub enum ProtocolTemplate {
    Quic(QuicTemplate),
    Kcp(KcpTemplate),
    Gaming(GamingTemplate),
    Dtls(DtlsTemplate),
    Minecraft(MinecraftTemplate),
    Fortnite(FortniteTemplate),
    Pubg(PubgTemplate),
    Moba(MobaTemplate),
    Steam(SteamTemplate),
    Raknet(RaknetTemplate),
    Bilibili(BilibiliTemplate),
    Douyin(DouyinTemplate),
}

impl ProtocolTemplate {
    /// Factory by template ID
    pub fn create(id: u8, params: &TemplateParams) -> Result<Self, TemplateError> {
        let template = match id {
            1 => Self::Quic(QuicTemplate::new(params)),
            2 => Self::Kcp(KcpTemplate::new(params)),
            3 => Self::Gaming(GamingTemplate::new(params)),
            4 => Self::Dtls(DtlsTemplate::new(params)),
            5 => Self::Minecraft(MinecraftTemplate::new(params)),
            6 => Self::Fortnite(FortniteTemplate::new(params)),
            7 => Self::Pubg(PubgTemplate::new(params)),
            8 => Self::Moba(MobaTemplate::new(params)),
            9 => Self::Steam(SteamTemplate::new(params)),
            10 => Self::Raknet(RaknetTemplate::new(params)),
            11 => Self::Bilibili(BilibiliTemplate::new(params)),
            12 => Self::Douyin(DouyinTemplate::new(params)),
            other => return Err(TemplateError::UnknownTemplate(other)),
        };
        Ok(template)
    }

    pub fn as_template(&self) -> &dyn Template {
        match self {
            Self::Quic(t) => t,
            Self::Kcp(t) => t,
            Self::Gaming(t) => t,
            Self::Dtls(t) => t,
            Self::Minecraft(t) => t,
            Self::Fortnite(t) => t,
            Self::Pubg(t) => t,
            Self::Moba(t) => t,
            Self::Steam(t) => t,
            Self::Raknet(t) => t,
            Self::Bilibili(t) => t,
            Self::Douyin(t) => t,
        }
    }

    pub fn as_template_mut(&mut self) -> &mut dyn Template {
        match self {
            Self::Quic(t) => t,
            Self::Kcp(t) => t,
            Self::Gaming(t) => t,
            Self::Dtls(t) => t,
            Self::Minecraft(t) => t,
            Self::Fortnite(t) => t,
            Self::Pubg(t) => t,
            Self::Moba(t) => t,
            Self::Steam(t) => t,
            Self::Raknet(t) => t,
            Self::Bilibili(t) => t,
            Self::Douyin(t) => t,
        }
    }

    pub fn id(&self) -> u8 {
        self.as_template().id()
    }

    pub fn name(&self) -> &'static str {
        self.as_template().name()
    }

    pub fn encapsulate(&self, payload: &[u8], client_id: &ClientId) -> Vec<u8> {
        self.as_template().encapsulate(payload, client_id)
    }

    pub fn decapsulate<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]> {
        self.as_template().decapsulate(packet)
    }

    pub fn extract_header_id(&self, packet: &[u8]) -> Option<HeaderId> {
        self.as_template().extract_header_id(packet)
    }

    pub fn carries_client_id(&self, packet: &[u8], client_id: &ClientId) -> bool {
        self.as_template().carries_client_id(packet, client_id)
    }

    pub fn params(&self) -> TemplateParams {
        self.as_template().params()
    }

    pub fn update_state(&mut self) {
        self.as_template_mut().update_state()
    }
}

/// Header ID of a packet for a given template, without a template instance
pub fn peek_header_id(template_id: u8, packet: &[u8]) -> Option<HeaderId> {
    match template_id {
        1 => quic::header_id(packet),
        2 => kcp::header_id(packet),
        3 => gaming::header_id(packet),
        4 => dtls::header_id(packet),
        5 => minecraft::header_id(packet),
        6 => fortnite::header_id(packet),
        7 => pubg::header_id(packet),
        8 => moba::header_id(packet),
        9 => steam::header_id(packet),
        10 => raknet::header_id(packet),
        11 => bilibili::header_id(packet),
        12 => douyin::header_id(packet),
        _ => None,
    }
}

/// Random byte in `1..=5`, used for message type fields
pub(crate) fn random_message_type() -> u8 {
    fastrand::u8(1..=5)
}

/// Client ID bytes stored in a header: packet offset, client ID byte range
pub(crate) type ClientIdField = (usize, std::ops::Range<usize>);

pub(crate) fn client_id_fields_match(
    packet: &[u8],
    client_id: &ClientId,
    fields: &[ClientIdField],
) -> bool {
    let cid = client_id.as_bytes();
    fields.iter().all(|(offset, range)| {
        packet.get(*offset..*offset + range.len()) == Some(&cid[range.clone()])
    })
}

/// Header ID at a fixed offset, once the packet holds a full header
pub(crate) fn header_id_at(
    packet: &[u8],
    header_len: usize,
    range: std::ops::Range<usize>,
) -> Option<HeaderId> {
    if packet.len() < header_len {
        return None;
    }
    HeaderId::from_slice(&packet[range])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_id() -> ClientId {
        ClientId::from_bytes([
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0x0f,
        ])
    }

    fn payloads() -> Vec<Vec<u8>> {
        vec![
            vec![],
            vec![0x01],
            (0..92).collect(),
            (0..148).map(|i| i as u8).collect(),
            (0..1500).map(|i| (i % 251) as u8).collect(),
        ]
    }

    #[test]
    fn test_roundtrip_every_template() {
        for id in TEMPLATE_IDS {
            let mut template = ProtocolTemplate::create(id, &TemplateParams::default()).unwrap();
            assert_eq!(template.id(), id);

            for payload in payloads() {
                let packet = template.encapsulate(&payload, &client_id());
                assert_eq!(
                    packet.len(),
                    template.as_template().header_len() + payload.len(),
                    "{} header size",
                    template.name()
                );
                assert_eq!(
                    template.decapsulate(&packet),
                    Some(payload.as_slice()),
                    "{} roundtrip",
                    template.name()
                );
                template.update_state();
            }
        }
    }

    #[test]
    fn test_short_packets_rejected() {
        for id in TEMPLATE_IDS {
            let template = ProtocolTemplate::create(id, &TemplateParams::default()).unwrap();
            let packet = template.encapsulate(&[1, 2, 3], &client_id());
            let header_len = template.as_template().header_len();

            assert_eq!(template.decapsulate(&packet[..header_len - 1]), None);
            assert_eq!(template.extract_header_id(&packet[..header_len - 1]), None);
        }
    }

    #[test]
    fn test_header_id_carries_client_bytes() {
        for id in TEMPLATE_IDS {
            let template = ProtocolTemplate::create(id, &TemplateParams::default()).unwrap();
            let packet = template.encapsulate(b"payload", &client_id());
            let header_id = template.extract_header_id(&packet).unwrap();

            let bytes = header_id.as_bytes();
            assert!(bytes.len() == 4 || bytes.len() == 8);
            assert_eq!(bytes, &client_id().as_bytes()[..bytes.len()], "{}", template.name());
            assert_eq!(peek_header_id(id, &packet), Some(header_id));
        }
    }

    #[test]
    fn test_templates_reject_each_other() {
        // Templates with an explicit marker must not accept a foreign all-zero packet
        let zeros = vec![0u8; 64];
        for id in [1u8, 2, 3, 4, 6, 8, 9, 10, 11, 12] {
            let template = ProtocolTemplate::create(id, &TemplateParams::default()).unwrap();
            assert_eq!(template.decapsulate(&zeros), None, "{}", template.name());
        }
    }

    #[test]
    fn test_tampered_marker_rejected() {
        // (template, byte offset, replacement) per marker field
        let tampered: [(u8, usize, fn(u8) -> u8); 16] = [
            (1, 0, |flags| flags & 0x3F),
            (1, 0, |flags| flags | 0x80),
            (2, 4, |_| 0x52),
            (3, 0, |_| b'X'),
            (4, 0, |_| 0x17),
            (4, 2, |_| 0xFF),
            (5, 0, |id| id | 0x10),
            (6, 3, |_| b'X'),
            (7, 0, |_| 0x01),
            (8, 1, |_| b'X'),
            (9, 0, |_| 0xFE),
            (9, 4, |_| b'U'),
            (10, 0, |id| id & 0x7F),
            (11, 2, |_| b'X'),
            (12, 0, |_| b'X'),
            (12, 3, |_| b'X'),
        ];

        let mut covered = std::collections::BTreeSet::new();
        for (id, offset, tamper) in tampered {
            covered.insert(id);
            let template = ProtocolTemplate::create(id, &TemplateParams::default()).unwrap();
            let mut packet = template.encapsulate(b"tunnel payload", &client_id());
            assert!(template.decapsulate(&packet).is_some());

            packet[offset] = tamper(packet[offset]);
            assert_eq!(
                template.decapsulate(&packet),
                None,
                "{} byte {}",
                template.name(),
                offset
            );
            assert_eq!(template.extract_header_id(&packet), None);
        }
        assert!(covered.into_iter().eq(TEMPLATE_IDS));
    }

    #[test]
    fn test_carried_client_id() {
        let foreign = ClientId::from_bytes([0xEE; 16]);
        for id in TEMPLATE_IDS {
            let template = ProtocolTemplate::create(id, &TemplateParams::default()).unwrap();
            let packet = template.encapsulate(&[0x01], &client_id());

            assert!(template.carries_client_id(&packet, &client_id()), "{}", template.name());
            assert!(!template.carries_client_id(&packet, &foreign), "{}", template.name());

            // The header ID prefix is always among the checked bytes
            let mut first = *client_id().as_bytes();
            first[0] ^= 0xFF;
            assert!(!template.carries_client_id(&packet, &ClientId::from_bytes(first)));
        }
    }

    #[test]
    fn test_full_client_id_checked() {
        for id in [5u8, 6, 7, 9, 10, 12] {
            let template = ProtocolTemplate::create(id, &TemplateParams::default()).unwrap();
            let packet = template.encapsulate(b"data", &client_id());

            let mut last = *client_id().as_bytes();
            last[15] ^= 0xFF;
            assert!(
                !template.carries_client_id(&packet, &ClientId::from_bytes(last)),
                "{}",
                template.name()
            );
        }
    }

    #[test]
    fn test_carried_client_id_short_packet() {
        for id in TEMPLATE_IDS {
            let template = ProtocolTemplate::create(id, &TemplateParams::default()).unwrap();
            assert!(!template.carries_client_id(&[], &client_id()));
        }
    }

    #[test]
    fn test_unknown_template() {
        assert_eq!(
            ProtocolTemplate::create(0, &TemplateParams::default()).unwrap_err(),
            TemplateError::UnknownTemplate(0)
        );
        assert_eq!(
            ProtocolTemplate::create(13, &TemplateParams::default()).unwrap_err(),
            TemplateError::UnknownTemplate(13)
        );
        assert_eq!(peek_header_id(13, &[0u8; 64]), None);
    }

    #[test]
    fn test_params_reproduce_counters() {
        for id in TEMPLATE_IDS {
            let mut sender = ProtocolTemplate::create(id, &TemplateParams::default()).unwrap();
            sender.update_state();

            let receiver = ProtocolTemplate::create(id, &sender.params()).unwrap();
            assert_eq!(receiver.params(), sender.params(), "{}", sender.name());
        }
    }

    #[test]
    fn test_params_json() {
        let params = TemplateParams {
            initial_seq: Some(10),
            message_index: Some(3),
            ..Default::default()
        };
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"{"initialSeq":10,"messageIndex":3}"#);
    }
}
