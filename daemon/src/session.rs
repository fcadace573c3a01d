//! Per-client sessions and the session table

use dashmap::DashMap;
use morph_crypto::{SecurityError, SessionKeys, decapsulate_secure, encapsulate_secure};
use morph_obfuscation::{ObfuscationError, Obfuscator};
use morph_protocol::{ClientId, HeaderId, ProtocolTemplate, is_heartbeat};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::info;

/// Header index key: template ID plus the header ID it yields
pub type HeaderKey = (u8, HeaderId);

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Security check failed: {0}")]
    Security(#[from] SecurityError),

    #[error("Client ID in packet does not match the session")]
    ClientIdMismatch,

    #[error("Template rejected packet")]
    Template,

    #[error("Obfuscation error: {0}")]
    Obfuscation(#[from] ObfuscationError),
}

/// Result of an accepted inbound packet
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Heartbeat,
    /// Deobfuscated tunnel packet
    Data(Vec<u8>),
}

/// Everything a session is built from, once the handshake is validated
pub struct SessionSetup {
    pub client_id: ClientId,
    pub user_id: String,
    pub obfuscator: Obfuscator,
    pub template: ProtocolTemplate,
    pub keys: Option<SessionKeys>,
    pub server_nonce: u32,
    pub remote: SocketAddr,
}

struct SessionState {
    remote: SocketAddr,
    template: ProtocolTemplate,
    last_sequence: u32,
    packet_sequence: u32,
    last_seen: Instant,
    traffic: u64,
}

/// One admitted client
pub struct Session {
    client_id: ClientId,
    user_id: String,
    obfuscator: Obfuscator,
    keys: Option<SessionKeys>,
    header_key: Option<HeaderKey>,
    socket: Arc<UdpSocket>,
    port: u16,
    state: Mutex<SessionState>,
    task: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
}

impl Session {
    pub fn new(setup: SessionSetup, socket: Arc<UdpSocket>) -> std::io::Result<Self> {
        let port = socket.local_addr()?.port();

        let template_id = setup.template.id();
        let header_key = setup
            .template
            .extract_header_id(&setup.template.encapsulate(&[], &setup.client_id))
            .map(|id| (template_id, id));

        Ok(Self {
            client_id: setup.client_id,
            user_id: setup.user_id,
            obfuscator: setup.obfuscator,
            keys: setup.keys,
            header_key,
            socket,
            port,
            state: Mutex::new(SessionState {
                remote: setup.remote,
                template: setup.template,
                last_sequence: setup.server_nonce,
                packet_sequence: setup.server_nonce,
                last_seen: Instant::now(),
                traffic: 0,
            }),
            task: Mutex::new(None),
            closing: AtomicBool::new(false),
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Dedicated socket port, as sent in the handshake reply
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    pub fn header_key(&self) -> Option<HeaderKey> {
        self.header_key
    }

    pub fn remote(&self) -> SocketAddr {
        self.state.lock().remote
    }

    /// Client moved: record the new address and mark it seen
    pub fn set_remote(&self, remote: SocketAddr) {
        let mut state = self.state.lock();
        if state.remote != remote {
            info!(
                "Client {} migrated from {} to {}",
                self.client_id, state.remote, remote
            );
            state.remote = remote;
        }
        state.last_seen = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_seen.elapsed()
    }

    pub fn add_traffic(&self, bytes: usize) {
        self.state.lock().traffic += bytes as u64;
    }

    /// Read and reset the traffic counter
    pub fn take_traffic(&self) -> u64 {
        std::mem::take(&mut self.state.lock().traffic)
    }

    /// Whether the packet would be accepted, without changing any state
    pub fn accepts(&self, packet: &[u8], max_age_secs: u64) -> bool {
        let state = self.state.lock();
        let templated = match &self.keys {
            Some(keys) => match decapsulate_secure(packet, keys, state.last_sequence, max_age_secs) {
                Ok(secure) if secure.client_id == *self.client_id.as_bytes() => secure.payload,
                _ => return false,
            },
            None => packet.to_vec(),
        };
        state.template.decapsulate(&templated).is_some()
            && state.template.carries_client_id(&templated, &self.client_id)
    }

    /// Validate and unwrap a packet from the client
    ///
    /// Security, template and client ID checks run under the session lock;
    /// a packet failing them never moves the remote address or last-seen
    /// time. Deobfuscation runs after the lock is released.
    pub fn inbound(
        &self,
        packet: &[u8],
        from: SocketAddr,
        max_age_secs: u64,
    ) -> Result<Inbound, PacketError> {
        let obfuscated = {
            let mut state = self.state.lock();

            let templated = match &self.keys {
                Some(keys) => {
                    let secure =
                        decapsulate_secure(packet, keys, state.last_sequence, max_age_secs)?;
                    if secure.client_id != *self.client_id.as_bytes() {
                        return Err(PacketError::ClientIdMismatch);
                    }
                    state.last_sequence = secure.sequence;
                    secure.payload
                }
                None => packet.to_vec(),
            };

            let payload = state
                .template
                .decapsulate(&templated)
                .ok_or(PacketError::Template)?;
            if !state.template.carries_client_id(&templated, &self.client_id) {
                return Err(PacketError::ClientIdMismatch);
            }

            if state.remote != from {
                info!(
                    "Client {} migrated from {} to {}",
                    self.client_id, state.remote, from
                );
                state.remote = from;
            }
            state.last_seen = Instant::now();

            if is_heartbeat(payload) {
                return Ok(Inbound::Heartbeat);
            }
            payload.to_vec()
        };

        Ok(Inbound::Data(self.obfuscator.deobfuscate(&obfuscated)?))
    }

    /// Wrap a tunnel packet for the client, returning it with its destination
    pub fn outbound(&self, packet: &[u8]) -> Result<(Vec<u8>, SocketAddr), PacketError> {
        let obfuscated = self.obfuscator.obfuscate(packet)?;

        let mut state = self.state.lock();
        let mut wire = state.template.encapsulate(&obfuscated, &self.client_id);
        if let Some(keys) = &self.keys {
            let sequence = state.packet_sequence;
            state.packet_sequence = sequence.wrapping_add(1);
            wire = encapsulate_secure(self.client_id.as_bytes(), &wire, sequence, keys);
        }
        state.template.update_state();

        Ok((wire, state.remote))
    }

    pub fn set_task(&self, handle: JoinHandle<()>) {
        *self.task.lock() = Some(handle);
    }

    /// Stop the session task; its socket stops being read
    pub fn abort_task(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Claim the right to close this session; true for the first caller only
    pub fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }
}

/// Live sessions keyed by client ID, with the header ID index
#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<ClientId, Arc<Session>>,
    header_index: DashMap<HeaderKey, ClientId>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        if let Some(key) = session.header_key() {
            self.header_index.insert(key, *session.client_id());
        }
        self.sessions.insert(*session.client_id(), session);
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Arc<Session>> {
        self.sessions.get(client_id).map(|s| s.value().clone())
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.sessions.contains_key(client_id)
    }

    /// Session indexed under a header key
    pub fn lookup_header(&self, key: &HeaderKey) -> Option<Arc<Session>> {
        let client_id = *self.header_index.get(key)?.value();
        self.get(&client_id)
    }

    /// Abort the session task, then drop the entry and its index key
    pub fn remove(&self, client_id: &ClientId) -> Option<Arc<Session>> {
        if let Some(session) = self.get(client_id) {
            session.abort_task();
        }

        let (_, session) = self.sessions.remove(client_id)?;
        if let Some(key) = session.header_key() {
            self.header_index.remove_if(&key, |_, indexed| indexed == client_id);
        }
        Some(session)
    }

    /// Session whose current remote address is `addr`
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<Arc<Session>> {
        self.sessions
            .iter()
            .find(|entry| entry.value().remote() == addr)
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Cloned handles, so callers can await without holding shard locks
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn indexed_headers(&self) -> usize {
        self.header_index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_crypto::{ENVELOPE_HEADER_LEN, derive_session_keys};
    use morph_obfuscation::ObfuscationParams;
    use morph_protocol::{HEARTBEAT, TemplateParams};

    const CID: ClientId = ClientId::from_bytes([
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f,
    ]);

    fn params() -> ObfuscationParams {
        ObfuscationParams {
            key: 0xDEAD_BEEF,
            layer: 3,
            padding_max: 8,
            fn_initiator: 42,
        }
    }

    fn keys() -> SessionKeys {
        derive_session_keys(b"secret", &[3; 32]).unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn session(keys: Option<SessionKeys>, nonce: u32) -> Session {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        Session::new(
            SessionSetup {
                client_id: CID,
                user_id: "user".to_string(),
                obfuscator: Obfuscator::new(params()).unwrap(),
                template: ProtocolTemplate::create(2, &TemplateParams::default()).unwrap(),
                keys,
                server_nonce: nonce,
                remote: addr(1000),
            },
            socket,
        )
        .unwrap()
    }

    /// What the client puts on the wire
    fn client_packet(payload: &[u8], obfuscate: bool, sequence: Option<u32>) -> Vec<u8> {
        let template = ProtocolTemplate::create(2, &TemplateParams::default()).unwrap();
        let body = if obfuscate {
            Obfuscator::new(params()).unwrap().obfuscate(payload).unwrap()
        } else {
            payload.to_vec()
        };
        let templated = template.encapsulate(&body, &CID);
        match sequence {
            Some(seq) => encapsulate_secure(CID.as_bytes(), &templated, seq, &keys()),
            None => templated,
        }
    }

    #[tokio::test]
    async fn test_header_key_is_client_id_prefix() {
        let session = session(None, 0).await;
        let (template_id, header_id) = session.header_key().unwrap();
        assert_eq!(template_id, 2);
        assert_eq!(header_id.as_bytes(), &CID.as_bytes()[..4]);
    }

    #[tokio::test]
    async fn test_inbound_data_and_migration() {
        let session = session(Some(keys()), 100).await;

        let packet = client_packet(b"wireguard", true, Some(101));
        let result = session.inbound(&packet, addr(2000), 300).unwrap();
        assert_eq!(result, Inbound::Data(b"wireguard".to_vec()));
        assert_eq!(session.remote(), addr(2000));

        // Replay of the same sequence
        assert!(matches!(
            session.inbound(&packet, addr(2000), 300),
            Err(PacketError::Security(SecurityError::DuplicateSequence(101)))
        ));
    }

    #[tokio::test]
    async fn test_inbound_heartbeat() {
        let session = session(Some(keys()), 7).await;
        let packet = client_packet(&HEARTBEAT, false, Some(8));
        assert_eq!(
            session.inbound(&packet, addr(1000), 300).unwrap(),
            Inbound::Heartbeat
        );
    }

    #[tokio::test]
    async fn test_accepts_does_not_commit() {
        let session = session(Some(keys()), 7).await;
        let packet = client_packet(b"x", true, Some(8));

        assert!(session.accepts(&packet, 300));
        assert!(session.accepts(&packet, 300));
        assert!(session.inbound(&packet, addr(1000), 300).is_ok());
        assert!(!session.accepts(&packet, 300));
    }

    #[tokio::test]
    async fn test_inbound_without_security() {
        let session = session(None, 0).await;
        let packet = client_packet(b"plain", true, None);
        assert_eq!(
            session.inbound(&packet, addr(1000), 300).unwrap(),
            Inbound::Data(b"plain".to_vec())
        );

        assert!(matches!(
            session.inbound(&[0u8; 10], addr(1000), 300),
            Err(PacketError::Template)
        ));
    }

    #[tokio::test]
    async fn test_foreign_client_id_rejected_without_security() {
        let session = session(None, 0).await;
        let template = ProtocolTemplate::create(2, &TemplateParams::default()).unwrap();
        let foreign = template.encapsulate(&HEARTBEAT, &ClientId::from_bytes([0xEE; 16]));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.accepts(&foreign, 300));
        assert!(matches!(
            session.inbound(&foreign, addr(6666), 300),
            Err(PacketError::ClientIdMismatch)
        ));
        assert_eq!(session.remote(), addr(1000));
        assert!(session.idle_for() >= Duration::from_millis(20));

        let own = client_packet(&HEARTBEAT, false, None);
        assert!(session.accepts(&own, 300));
        assert_eq!(
            session.inbound(&own, addr(1000), 300).unwrap(),
            Inbound::Heartbeat
        );
    }

    #[tokio::test]
    async fn test_outbound_sequence_and_traffic() {
        let keys = keys();
        let session = session(Some(keys.clone()), 50).await;

        let (first, to) = session.outbound(b"reply").unwrap();
        let (second, _) = session.outbound(b"reply").unwrap();
        assert_eq!(to, addr(1000));

        let a = decapsulate_secure(&first, &keys, 49, 300).unwrap();
        let b = decapsulate_secure(&second, &keys, a.sequence, 300).unwrap();
        assert_eq!(a.sequence, 50);
        assert_eq!(b.sequence, 51);
        assert_eq!(a.client_id, *CID.as_bytes());
        assert!(first.len() > ENVELOPE_HEADER_LEN);

        session.add_traffic(first.len());
        assert_eq!(session.take_traffic(), first.len() as u64);
        assert_eq!(session.take_traffic(), 0);
    }

    #[tokio::test]
    async fn test_table_insert_remove() {
        let table = SessionTable::new();
        let session = Arc::new(session(None, 0).await);
        let key = session.header_key().unwrap();

        table.insert(session.clone());
        assert_eq!(table.len(), 1);
        assert!(table.lookup_header(&key).is_some());
        assert!(table.find_by_addr(addr(1000)).is_some());
        assert!(table.find_by_addr(addr(1001)).is_none());

        let handle = tokio::spawn(std::future::pending::<()>());
        session.set_task(handle);

        assert!(table.remove(&CID).is_some());
        assert!(table.is_empty());
        assert_eq!(table.indexed_headers(), 0);
        assert!(table.remove(&CID).is_none());
    }

    #[tokio::test]
    async fn test_close_claimed_once() {
        let session = session(None, 0).await;
        assert!(session.begin_close());
        assert!(!session.begin_close());
    }
}
