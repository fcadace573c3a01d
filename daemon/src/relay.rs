//! Relay core
//!
//! One task serves the shared listening socket (control channel plus the
//! identified data path), each admitted session gets a dedicated socket
//! and a task that relays between it and the local tunnel endpoint.

use anyhow::{Context, Result};
use morph_crypto::{
    ControlCipher, ENVELOPE_HEADER_LEN, derive_session_keys, generate_salt, session_secret,
};
use morph_obfuscation::{ObfuscationParams, Obfuscator};
use morph_protocol::{
    ClientId, ControlMessage, HandshakeReply, HandshakeRequest, ProtocolTemplate, TEMPLATE_IDS,
    TemplateSelector, peek_header_id,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{Instant, interval, interval_at};
use tracing::{debug, error, info, warn};

use crate::accounting::Accounting;
use crate::config::DaemonConfig;
use crate::metrics::Metrics;
use crate::rate_limit::RateLimiter;
use crate::session::{Inbound, Session, SessionSetup, SessionTable};

const MAX_DATAGRAM: usize = 65_535;

/// Rate limiter cleanup period
const LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent `close`
    Client,
    Inactivity,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => f.write_str("client close"),
            Self::Inactivity => f.write_str("inactivity"),
        }
    }
}

pub struct Relay {
    config: DaemonConfig,
    socket: UdpSocket,
    cipher: ControlCipher,
    /// Templates clients may pick
    templates: TemplateSelector,
    sessions: SessionTable,
    handshake_limiter: RateLimiter,
    packet_limiter: RateLimiter,
    accounting: Arc<dyn Accounting>,
    metrics: Arc<Metrics>,
}

impl Relay {
    /// Bind the shared listening socket
    pub async fn bind(
        config: DaemonConfig,
        accounting: Arc<dyn Accounting>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(config.server.bind)
            .await
            .with_context(|| format!("binding {}", config.server.bind))?;

        let templates = TemplateSelector::new(config.template.weights.clone())
            .context("invalid template weights")?;

        let limits = &config.rate_limit;
        let handshake_limiter = RateLimiter::new(
            limits.handshakes,
            Duration::from_secs(limits.handshake_window_secs),
        );
        let packet_limiter =
            RateLimiter::new(limits.packets, Duration::from_millis(limits.packet_window_ms));

        Ok(Arc::new(Self {
            cipher: ControlCipher::from_password(&config.security.password),
            config,
            socket,
            templates,
            sessions: SessionTable::new(),
            handshake_limiter,
            packet_limiter,
            accounting,
            metrics,
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn control_cipher(&self) -> &ControlCipher {
        &self.cipher
    }

    /// Announce the relay, then serve until an I/O error on the shared socket
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let local = self.local_addr()?;
        info!("Relay listening on {}", local);

        self.accounting
            .publish_server_info(
                &self.config.server.host_name,
                &self.config.server.host_ip,
                local.port(),
                &self.cipher.encoded_key(),
            )
            .await;

        tokio::select! {
            _ = self.flush_loop() => Ok(()),
            _ = self.cleanup_loop() => Ok(()),
            result = self.serve() => result,
        }
    }

    async fn serve(self: &Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    // ICMP errors from earlier sends surface here
                    warn!("Shared socket receive error: {}", e);
                    continue;
                }
            };
            self.handle_datagram(&buf[..len], from).await;
        }
    }

    async fn flush_loop(&self) {
        let mut ticker = interval(self.config.session.traffic_flush_interval());
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.flush_traffic().await;
        }
    }

    async fn cleanup_loop(&self) {
        let mut ticker = interval(LIMITER_CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            self.handshake_limiter.cleanup();
            self.packet_limiter.cleanup();
        }
    }

    /// Report and reset every non-zero session traffic counter
    pub async fn flush_traffic(&self) {
        let sessions = self.sessions.snapshot();
        debug!("Flushing traffic for {} sessions", sessions.len());

        for session in sessions {
            let bytes = session.take_traffic();
            if bytes > 0 {
                self.accounting
                    .report_traffic(session.user_id(), bytes)
                    .await;
            }
        }
    }

    async fn handle_datagram(self: &Arc<Self>, datagram: &[u8], from: SocketAddr) {
        self.metrics.packets_in.inc();

        if !self.packet_limiter.check(from.ip()) {
            warn!("Packet rate limit exceeded for {}", from.ip());
            self.metrics.packets_dropped.inc();
            return;
        }

        let plaintext = match self.cipher.decrypt(datagram) {
            Ok(p) => p,
            Err(_) => {
                self.handle_shared_data(datagram, from).await;
                return;
            }
        };

        match ControlMessage::parse(&plaintext) {
            Ok(ControlMessage::Close) => self.handle_close(from),
            Ok(ControlMessage::Handshake(request)) => self.handle_handshake(request, from).await,
            Ok(other) => debug!("Ignoring {:?} from {}", other, from),
            Err(e) => {
                warn!("Malformed control message from {}: {}", from, e);
                self.metrics.packets_dropped.inc();
            }
        }
    }

    fn handle_close(self: &Arc<Self>, from: SocketAddr) {
        let Some(session) = self.sessions.find_by_addr(from) else {
            warn!("Close from unknown client {}", from);
            return;
        };

        let relay = self.clone();
        let client_id = *session.client_id();
        tokio::spawn(async move {
            relay.close_session(&client_id, CloseReason::Client).await;
        });
    }

    async fn handle_handshake(self: &Arc<Self>, request: HandshakeRequest, from: SocketAddr) {
        if !self.handshake_limiter.check(from.ip()) {
            warn!("Handshake rate limit exceeded for {}", from.ip());
            self.metrics.handshakes_rejected.inc();
            return;
        }

        info!(
            "Handshake from {} (client {}, user {}, template {})",
            from, request.client_id, request.user_id, request.template_id
        );

        if let Some(session) = self.sessions.get(&request.client_id) {
            info!("Client {} reconnecting from {}", request.client_id, from);
            session.set_remote(from);
            self.metrics.handshakes.inc();

            let reply = HandshakeReply::reconnected(session.port(), request.client_id);
            self.send_control(&ControlMessage::Reply(reply), from).await;
            return;
        }

        if self.sessions.len() >= self.config.server.max_sessions {
            warn!(
                "Session limit {} reached, refusing {}",
                self.config.server.max_sessions, from
            );
            self.metrics.handshakes_rejected.inc();
            self.send_control(&ControlMessage::ServerFull, from).await;
            return;
        }

        match self.admit(request, from).await {
            Ok(reply) => {
                self.metrics.handshakes.inc();
                self.send_control(&ControlMessage::Reply(reply), from).await;
            }
            Err(e) => {
                warn!("Rejected handshake from {}: {:#}", from, e);
                self.metrics.handshakes_rejected.inc();
            }
        }
    }

    /// Build and start a new session
    async fn admit(self: &Arc<Self>, request: HandshakeRequest, from: SocketAddr) -> Result<HandshakeReply> {
        anyhow::ensure!(
            self.templates.allows(request.template_id),
            "template {} is not enabled",
            request.template_id
        );

        let obfuscator = Obfuscator::new(ObfuscationParams {
            key: request.key,
            layer: request.obfuscation_layer,
            padding_max: request.random_padding_max,
            fn_initiator: request.fn_initiator,
        })?;
        let template = ProtocolTemplate::create(request.template_id, &request.template_params)?;

        let (keys, salt, nonce) = if self.config.security.packet_security {
            let salt = generate_salt();
            let secret = session_secret(self.cipher.key_bytes(), request.key);
            let keys = derive_session_keys(&secret, &salt)?;
            (Some(keys), Some(salt), Some(fastrand::u32(..)))
        } else {
            (None, None, None)
        };

        let socket = UdpSocket::bind((self.config.server.bind.ip(), 0))
            .await
            .context("binding session socket")?;

        let client_id = request.client_id;
        let session = Arc::new(Session::new(
            SessionSetup {
                client_id,
                user_id: request.user_id,
                obfuscator,
                template,
                keys,
                server_nonce: nonce.unwrap_or(0),
                remote: from,
            },
            Arc::new(socket),
        )?);

        self.sessions.insert(session.clone());
        let handle = tokio::spawn(self.clone().run_session(session.clone()));
        session.set_task(handle);
        self.metrics.active_sessions.set(self.sessions.len() as i64);

        let accounting = self.accounting.clone();
        let host = self.config.server.host_name.clone();
        tokio::spawn(async move {
            accounting.increment_client_count(&host).await;
        });

        info!(
            "Session for client {} on port {} ({} active)",
            client_id,
            session.port(),
            self.sessions.len()
        );

        Ok(HandshakeReply::connected(session.port(), client_id, salt, nonce))
    }

    /// Session task: dedicated socket plus the inactivity check
    async fn run_session(self: Arc<Self>, session: Arc<Session>) {
        let timeout = self.config.session.timeout();
        let mut check = interval_at(Instant::now() + timeout, timeout);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                result = session.socket().recv_from(&mut buf) => match result {
                    Ok((len, from)) => {
                        if from == self.config.tunnel.local_address {
                            self.relay_to_client(&session, &buf[..len]).await;
                        } else {
                            self.deliver(&session, &buf[..len], from).await;
                        }
                    }
                    Err(e) => debug!("Session socket error for {}: {}", session.client_id(), e),
                },
                _ = check.tick() => {
                    if session.idle_for() >= timeout {
                        info!("Client {} inactive", session.client_id());
                        // Closing aborts this task, so it runs on its own
                        let client_id = *session.client_id();
                        let relay = self.clone();
                        tokio::spawn(async move {
                            relay.close_session(&client_id, CloseReason::Inactivity).await;
                        });
                        return;
                    }
                }
            }
        }
    }

    /// Find the session a shared-socket data packet belongs to
    fn identify(&self, datagram: &[u8]) -> Option<Arc<Session>> {
        let max_age = self.config.security.max_packet_age_secs;
        let offset = if self.config.security.packet_security {
            ENVELOPE_HEADER_LEN
        } else {
            0
        };

        if let Some(templated) = datagram.get(offset..) {
            for template_id in TEMPLATE_IDS {
                let Some(header_id) = peek_header_id(template_id, templated) else {
                    continue;
                };
                if let Some(session) = self.sessions.lookup_header(&(template_id, header_id)) {
                    if session.accepts(datagram, max_age) {
                        return Some(session);
                    }
                }
            }
        }

        // Only an unambiguous match is accepted
        let mut matches = self
            .sessions
            .snapshot()
            .into_iter()
            .filter(|s| s.accepts(datagram, max_age));
        let found = matches.next()?;
        if matches.next().is_some() {
            warn!("Datagram matches several sessions, dropping");
            return None;
        }
        Some(found)
    }

    async fn handle_shared_data(&self, datagram: &[u8], from: SocketAddr) {
        match self.identify(datagram) {
            Some(session) => self.deliver(&session, datagram, from).await,
            None => {
                debug!("Unidentified datagram from {}", from);
                self.metrics.packets_dropped.inc();
            }
        }
    }

    /// Client to tunnel
    async fn deliver(&self, session: &Session, datagram: &[u8], from: SocketAddr) {
        let max_age = self.config.security.max_packet_age_secs;

        match session.inbound(datagram, from, max_age) {
            Ok(Inbound::Heartbeat) => debug!("Heartbeat from client {}", session.client_id()),
            Ok(Inbound::Data(packet)) => {
                if packet.is_empty() {
                    return;
                }
                if let Err(e) = session
                    .socket()
                    .send_to(&packet, self.config.tunnel.local_address)
                    .await
                {
                    warn!("Failed to forward to tunnel for {}: {}", session.client_id(), e);
                    return;
                }
                session.add_traffic(datagram.len());
                self.metrics.bytes_relayed.inc_by(datagram.len() as u64);
            }
            Err(e) => {
                warn!("Dropped packet for client {} from {}: {}", session.client_id(), from, e);
                self.metrics.packets_dropped.inc();
            }
        }
    }

    /// Tunnel to client
    async fn relay_to_client(&self, session: &Session, packet: &[u8]) {
        let (wire, to) = match session.outbound(packet) {
            Ok(r) => r,
            Err(e) => {
                error!("Failed to wrap packet for client {}: {}", session.client_id(), e);
                return;
            }
        };

        match session.socket().send_to(&wire, to).await {
            Ok(_) => {
                session.add_traffic(wire.len());
                self.metrics.packets_out.inc();
                self.metrics.bytes_relayed.inc_by(wire.len() as u64);
            }
            Err(e) => warn!("Failed to send to client {} at {}: {}", session.client_id(), to, e),
        }
    }

    /// Tear a session down; later callers for the same session are no-ops
    pub async fn close_session(&self, client_id: &ClientId, reason: CloseReason) {
        let Some(session) = self.sessions.get(client_id) else {
            return;
        };
        if !session.begin_close() {
            return;
        }

        info!("Closing session for client {} ({})", client_id, reason);

        // No relaying once the final traffic figure is taken
        session.abort_task();

        if reason == CloseReason::Inactivity {
            self.send_control(&ControlMessage::Inactivity, session.remote())
                .await;
        }

        let bytes = session.take_traffic();
        if bytes > 0 {
            self.accounting.report_traffic(session.user_id(), bytes).await;
        }
        self.accounting
            .decrement_client_count(&self.config.server.host_name)
            .await;

        self.sessions.remove(client_id);
        self.metrics.active_sessions.set(self.sessions.len() as i64);
    }

    fn seal(&self, message: &ControlMessage) -> Result<Vec<u8>> {
        let bytes = message.to_bytes()?;
        Ok(self.cipher.encrypt(&bytes)?)
    }

    async fn send_control(&self, message: &ControlMessage, to: SocketAddr) {
        let sealed = match self.seal(message) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to encode control message: {:#}", e);
                return;
            }
        };

        if let Err(e) = self.socket.send_to(&sealed, to).await {
            warn!("Failed to send control message to {}: {}", to, e);
        }
    }
}
