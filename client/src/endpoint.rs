//! Client endpoint
//!
//! One UDP socket faces both the local WireGuard interface and the relay.
//! The client re-sends its handshake until the relay answers, then relays
//! tunnel packets through the obfuscation pipeline and keeps the session
//! alive with heartbeats.

use morph_crypto::{
    ControlCipher, DEFAULT_MAX_AGE_SECS, SessionKeys, decapsulate_secure, derive_session_keys,
    encapsulate_secure, session_secret,
};
use morph_obfuscation::{ObfuscationParams, Obfuscator};
use morph_protocol::{
    ClientId, ControlMessage, HEARTBEAT, HandshakeReply, HandshakeRequest, ProtocolTemplate,
    SessionStatus, TemplateParams, TemplateSelector,
};
use std::future::Future;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, interval_at};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;

const MAX_DATAGRAM: usize = 65_535;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Relay did not answer the handshake")]
    MaxRetries,

    #[error("Relay is full")]
    ServerFull,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

fn failed(e: impl std::fmt::Display) -> ClientError {
    ClientError::ConnectionFailed(e.to_string())
}

/// Lifecycle notifications for a host application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    Connected { port: u16 },
    Reconnected { port: u16 },
    /// The relay expired the session
    Inactive,
    Stopped,
}

/// Negotiated path to the relay's dedicated socket
struct Link {
    server: SocketAddr,
    keys: Option<SessionKeys>,
    send_sequence: u32,
    recv_last: u32,
}

enum Transition {
    Connected,
    /// Handshake again right away
    Resend,
}

pub struct Client {
    config: ClientConfig,
    socket: UdpSocket,
    cipher: ControlCipher,
    obfuscator: Obfuscator,
    template: ProtocolTemplate,
    request: HandshakeRequest,
    link: Option<Link>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl Client {
    /// Pick session parameters and bind the local socket
    pub async fn new(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        let cipher = match &config.server.control_key {
            Some(encoded) => ControlCipher::from_encoded_key(encoded).map_err(failed)?,
            None => ControlCipher::from_password(&config.server.password),
        };

        let mut params =
            ObfuscationParams::random(config.obfuscation.layer, config.obfuscation.padding_max);
        if let Some(key) = config.obfuscation.key {
            params.key = key;
        }
        let obfuscator = Obfuscator::new(params).map_err(failed)?;

        let template_id = match config.template.id {
            Some(id) => id,
            None => TemplateSelector::new(config.template.weights.clone())
                .map_err(failed)?
                .select(),
        };
        let template =
            ProtocolTemplate::create(template_id, &TemplateParams::default()).map_err(failed)?;

        let request = HandshakeRequest {
            key: params.key,
            obfuscation_layer: params.layer,
            random_padding_max: params.padding_max,
            fn_initiator: params.fn_initiator,
            user_id: config.server.user_id.clone(),
            client_id: ClientId::random(),
            template_id,
            template_params: template.params(),
            public_key: None,
        };

        let socket = UdpSocket::bind(config.tunnel.listen)
            .await
            .map_err(failed)?;
        info!(
            "Client {} listening on {} with template {}",
            request.client_id,
            socket.local_addr().map_err(failed)?,
            template.name()
        );

        let (events, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                config,
                socket,
                cipher,
                obfuscator,
                template,
                request,
                link: None,
                events,
            },
            rx,
        ))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn client_id(&self) -> ClientId {
        self.request.client_id
    }

    pub fn template_id(&self) -> u8 {
        self.template.id()
    }

    /// Handshake and relay until `shutdown` resolves or the session fails
    ///
    /// `close` is sent to the relay on every exit path.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), ClientError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let retry = self.config.timing.handshake_interval();
        let mut handshake_timer = Some(interval_at(Instant::now() + retry, retry));
        let mut heartbeat_timer: Option<Interval> = None;
        let mut attempts = 0u32;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        self.send_handshake().await;

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Client stopping");
                    break Ok(());
                }
                _ = tick(&mut handshake_timer) => {
                    if attempts >= self.config.timing.max_retries {
                        break Err(ClientError::MaxRetries);
                    }
                    attempts += 1;
                    debug!("Handshake retry {}", attempts);
                    self.send_handshake().await;
                }
                _ = tick(&mut heartbeat_timer) => self.send_heartbeat().await,
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            debug!("Receive error: {}", e);
                            continue;
                        }
                    };
                    match self.handle_datagram(&buf[..len], from).await {
                        Ok(Some(Transition::Connected)) => {
                            handshake_timer = None;
                            let every = self.config.timing.heartbeat_interval();
                            heartbeat_timer = Some(interval_at(Instant::now() + every, every));
                        }
                        Ok(Some(Transition::Resend)) => self.send_handshake().await,
                        Ok(None) => {}
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        self.send_close().await;
        let _ = self.events.send(ClientEvent::Stopped);
        result
    }

    async fn handle_datagram(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
    ) -> Result<Option<Transition>, ClientError> {
        if from == self.config.tunnel.local_address {
            self.send_to_relay(datagram).await;
            return Ok(None);
        }

        if from == self.config.server.address {
            return match self.cipher.decrypt(datagram) {
                Ok(plaintext) => self.handle_control(&plaintext),
                Err(e) => {
                    debug!("Undecryptable datagram from relay: {}", e);
                    Ok(None)
                }
            };
        }

        if self.link.as_ref().is_some_and(|link| link.server == from) {
            self.deliver(datagram).await;
        } else {
            debug!("Datagram from unknown peer {}", from);
        }
        Ok(None)
    }

    fn handle_control(&mut self, plaintext: &[u8]) -> Result<Option<Transition>, ClientError> {
        match ControlMessage::parse(plaintext) {
            Ok(ControlMessage::Reply(reply)) => self.on_reply(reply),
            Ok(ControlMessage::ServerFull) => {
                warn!("Relay refused the session: server full");
                Err(ClientError::ServerFull)
            }
            Ok(ControlMessage::Inactivity) => {
                warn!("Relay closed the session for inactivity");
                let _ = self.events.send(ClientEvent::Inactive);
                Err(ClientError::ConnectionFailed(
                    "session expired after inactivity".to_string(),
                ))
            }
            Ok(other) => {
                debug!("Ignoring control message {:?}", other);
                Ok(None)
            }
            Err(e) => {
                warn!("Malformed control message: {}", e);
                Ok(None)
            }
        }
    }

    fn on_reply(&mut self, reply: HandshakeReply) -> Result<Option<Transition>, ClientError> {
        if reply.client_id != self.request.client_id {
            warn!("Reply for foreign client {}", reply.client_id);
            return Ok(None);
        }

        let server = SocketAddr::new(self.config.server.address.ip(), reply.port);

        match (reply.status, self.link.as_mut()) {
            (SessionStatus::Connected, Some(_)) => {
                debug!("Duplicate connected reply");
                Ok(None)
            }
            (SessionStatus::Connected, None) => {
                let keys = match reply.salt().map_err(failed)? {
                    Some(salt) => {
                        let secret = session_secret(self.cipher.key_bytes(), self.request.key);
                        Some(derive_session_keys(&secret, &salt).map_err(failed)?)
                    }
                    None => None,
                };
                let nonce = reply.server_nonce.unwrap_or(0);

                info!(
                    "Connected to relay port {} (packet security {})",
                    reply.port,
                    if keys.is_some() { "on" } else { "off" }
                );
                self.link = Some(Link {
                    server,
                    keys,
                    send_sequence: nonce.wrapping_add(1),
                    recv_last: nonce.wrapping_sub(1),
                });
                let _ = self.events.send(ClientEvent::Connected { port: reply.port });
                Ok(Some(Transition::Connected))
            }
            (SessionStatus::Reconnected, Some(link)) => {
                info!("Reconnected to relay port {}", reply.port);
                link.server = server;
                let _ = self.events.send(ClientEvent::Reconnected { port: reply.port });
                Ok(Some(Transition::Connected))
            }
            (SessionStatus::Reconnected, None) => {
                // The connected reply was lost, so the keys for this client
                // ID are gone; the relay expires that session on its own
                self.request.client_id = ClientId::random();
                warn!(
                    "Relay resumed a session we hold no keys for, retrying as {}",
                    self.request.client_id
                );
                Ok(Some(Transition::Resend))
            }
        }
    }

    /// Tunnel to relay
    async fn send_to_relay(&mut self, packet: &[u8]) {
        let Some(link) = self.link.as_mut() else {
            debug!("Not connected yet, dropping tunnel packet");
            return;
        };

        let obfuscated = match self.obfuscator.obfuscate(packet) {
            Ok(o) => o,
            Err(e) => {
                warn!("Failed to obfuscate tunnel packet: {}", e);
                return;
            }
        };

        let wire = seal(&self.template, link, &self.request.client_id, &obfuscated);
        let to = link.server;
        self.template.update_state();

        if let Err(e) = self.socket.send_to(&wire, to).await {
            warn!("Failed to send to relay {}: {}", to, e);
        }
    }

    async fn send_heartbeat(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };

        let wire = seal(&self.template, link, &self.request.client_id, &HEARTBEAT);
        let to = link.server;
        self.template.update_state();

        match self.socket.send_to(&wire, to).await {
            Ok(_) => debug!("Heartbeat sent to {}", to),
            Err(e) => warn!("Failed to send heartbeat: {}", e),
        }
    }

    /// Relay to tunnel
    async fn deliver(&mut self, datagram: &[u8]) {
        let Some(link) = self.link.as_mut() else {
            return;
        };

        let templated = match &link.keys {
            Some(keys) => {
                match decapsulate_secure(datagram, keys, link.recv_last, DEFAULT_MAX_AGE_SECS) {
                    Ok(secure) if secure.client_id == *self.request.client_id.as_bytes() => {
                        link.recv_last = secure.sequence;
                        secure.payload
                    }
                    Ok(_) => {
                        warn!("Relay packet carries a foreign client ID");
                        return;
                    }
                    Err(e) => {
                        warn!("Dropped relay packet: {}", e);
                        return;
                    }
                }
            }
            None => datagram.to_vec(),
        };

        let Some(obfuscated) = self.template.decapsulate(&templated) else {
            warn!("Relay packet does not match template {}", self.template.name());
            return;
        };
        if !self
            .template
            .carries_client_id(&templated, &self.request.client_id)
        {
            warn!("Relay packet carries a foreign client ID");
            return;
        }

        let packet = match self.obfuscator.deobfuscate(obfuscated) {
            Ok(p) if !p.is_empty() => p,
            Ok(_) => return,
            Err(e) => {
                warn!("Failed to deobfuscate relay packet: {}", e);
                return;
            }
        };

        if let Err(e) = self
            .socket
            .send_to(&packet, self.config.tunnel.local_address)
            .await
        {
            warn!("Failed to forward to tunnel: {}", e);
        }
    }

    async fn send_control(&self, message: &ControlMessage) {
        let sealed = match message
            .to_bytes()
            .map_err(failed)
            .and_then(|bytes| self.cipher.encrypt(&bytes).map_err(failed))
        {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to encode control message: {}", e);
                return;
            }
        };

        if let Err(e) = self.socket.send_to(&sealed, self.config.server.address).await {
            warn!("Failed to reach relay {}: {}", self.config.server.address, e);
        }
    }

    async fn send_handshake(&self) {
        info!("Sending handshake to {}", self.config.server.address);
        self.send_control(&ControlMessage::Handshake(self.request.clone()))
            .await;
    }

    async fn send_close(&self) {
        self.send_control(&ControlMessage::Close).await;
    }
}

/// Template, then the secure envelope when negotiated
fn seal(
    template: &ProtocolTemplate,
    link: &mut Link,
    client_id: &ClientId,
    payload: &[u8],
) -> Vec<u8> {
    let templated = template.encapsulate(payload, client_id);
    match &link.keys {
        Some(keys) => {
            let sequence = link.send_sequence;
            link.send_sequence = sequence.wrapping_add(1);
            encapsulate_secure(client_id.as_bytes(), &templated, sequence, keys)
        }
        None => templated,
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_crypto::generate_salt;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    struct FakeRelay {
        socket: UdpSocket,
        cipher: ControlCipher,
    }

    impl FakeRelay {
        async fn new() -> Self {
            Self {
                socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
                cipher: ControlCipher::from_password("test"),
            }
        }

        async fn recv(&self) -> (ControlMessage, SocketAddr) {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            let (len, from) = timeout(Duration::from_secs(3), self.socket.recv_from(&mut buf))
                .await
                .expect("relay received nothing")
                .unwrap();
            let plain = self.cipher.decrypt(&buf[..len]).unwrap();
            (ControlMessage::parse(&plain).unwrap(), from)
        }

        async fn send(&self, message: &ControlMessage, to: SocketAddr) {
            let sealed = self.cipher.encrypt(&message.to_bytes().unwrap()).unwrap();
            self.socket.send_to(&sealed, to).await.unwrap();
        }
    }

    fn config(relay: &FakeRelay, tunnel: SocketAddr) -> ClientConfig {
        let mut config = ClientConfig::default();
        config.server.address = relay.socket.local_addr().unwrap();
        config.server.password = "test".to_string();
        config.tunnel.listen = "127.0.0.1:0".parse().unwrap();
        config.tunnel.local_address = tunnel;
        config.template.id = Some(1);
        config.timing.handshake_interval_ms = 2_000;
        config.timing.max_retries = 2;
        config
    }

    #[tokio::test]
    async fn test_max_retries() {
        let relay = FakeRelay::new().await;
        let mut config = config(&relay, "127.0.0.1:9".parse().unwrap());
        config.timing.handshake_interval_ms = 50;
        let (client, _events) = Client::new(config).await.unwrap();

        let result = client.run(std::future::pending()).await;
        assert_eq!(result, Err(ClientError::MaxRetries));

        // Initial handshake, two retries, then close
        for _ in 0..3 {
            assert!(matches!(relay.recv().await.0, ControlMessage::Handshake(_)));
        }
        assert_eq!(relay.recv().await.0, ControlMessage::Close);
    }

    #[tokio::test]
    async fn test_server_full() {
        let relay = FakeRelay::new().await;
        let (client, _events) = Client::new(config(&relay, "127.0.0.1:9".parse().unwrap()))
            .await
            .unwrap();
        let task = tokio::spawn(client.run(std::future::pending()));

        let (_, from) = relay.recv().await;
        relay.send(&ControlMessage::ServerFull, from).await;

        let result = timeout(Duration::from_secs(3), task).await.unwrap().unwrap();
        assert_eq!(result, Err(ClientError::ServerFull));
    }

    #[tokio::test]
    async fn test_connected_session_relays_both_ways() {
        let relay = FakeRelay::new().await;
        let dedicated = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tunnel = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (client, mut events) = Client::new(config(&relay, tunnel.local_addr().unwrap()))
            .await
            .unwrap();
        let client_addr = client.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(client.run(async {
            let _ = stop_rx.await;
        }));

        let (message, from) = relay.recv().await;
        let ControlMessage::Handshake(request) = message else {
            panic!("expected handshake");
        };
        assert_eq!(from, client_addr);
        assert_eq!(request.template_id, 1);

        let salt = generate_salt();
        let nonce = 1000;
        let reply = HandshakeReply::connected(
            dedicated.local_addr().unwrap().port(),
            request.client_id,
            Some(salt),
            Some(nonce),
        );
        relay.send(&ControlMessage::Reply(reply), from).await;
        assert_eq!(
            events.recv().await,
            Some(ClientEvent::Connected {
                port: dedicated.local_addr().unwrap().port()
            })
        );

        let keys = derive_session_keys(&session_secret(relay.cipher.key_bytes(), request.key), &salt)
            .unwrap();
        let obfuscator = Obfuscator::new(ObfuscationParams {
            key: request.key,
            layer: request.obfuscation_layer,
            padding_max: request.random_padding_max,
            fn_initiator: request.fn_initiator,
        })
        .unwrap();
        let template = ProtocolTemplate::create(1, &request.template_params).unwrap();

        // Tunnel to relay
        tunnel.send_to(b"outbound", client_addr).await.unwrap();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, _) = timeout(Duration::from_secs(3), dedicated.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let secure = decapsulate_secure(&buf[..len], &keys, nonce, 300).unwrap();
        assert_eq!(secure.sequence, nonce + 1);
        let plain = obfuscator
            .deobfuscate(template.decapsulate(&secure.payload).unwrap())
            .unwrap();
        assert_eq!(plain, b"outbound");

        // A template header naming another client is dropped
        let foreign = encapsulate_secure(
            request.client_id.as_bytes(),
            &template.encapsulate(
                &obfuscator.obfuscate(b"foreign").unwrap(),
                &ClientId::from_bytes([0xEE; 16]),
            ),
            nonce,
            &keys,
        );
        dedicated.send_to(&foreign, client_addr).await.unwrap();

        // Relay to tunnel
        let wire = encapsulate_secure(
            request.client_id.as_bytes(),
            &template.encapsulate(&obfuscator.obfuscate(b"inbound").unwrap(), &request.client_id),
            nonce + 1,
            &keys,
        );
        dedicated.send_to(&wire, client_addr).await.unwrap();
        let (len, _) = timeout(Duration::from_secs(3), tunnel.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"inbound");

        stop_tx.send(()).unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(relay.recv().await.0, ControlMessage::Close);
    }

    #[tokio::test]
    async fn test_stale_reconnect_switches_client_id() {
        let relay = FakeRelay::new().await;
        let (client, _events) = Client::new(config(&relay, "127.0.0.1:9".parse().unwrap()))
            .await
            .unwrap();
        let task = tokio::spawn(client.run(std::future::pending()));

        let (ControlMessage::Handshake(first), from) = relay.recv().await else {
            panic!("expected handshake");
        };
        relay
            .send(
                &ControlMessage::Reply(HandshakeReply::reconnected(4000, first.client_id)),
                from,
            )
            .await;

        let (ControlMessage::Handshake(second), _) = relay.recv().await else {
            panic!("expected handshake");
        };
        assert_ne!(second.client_id, first.client_id);
        task.abort();
    }
}
