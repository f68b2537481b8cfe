//! Session lifecycle management
//!
//! The [`SessionManager`] is the only writer of the session table. It turns
//! raw datagrams into session events, runs each session through
//! `Handshaking -> Established -> Disconnecting -> Closed`, and collects the
//! packets every session wants to send.
//!
//! ## Handshake
//! An untagged `ConnectionRequest` from an unknown address allocates an id
//! and a random token and answers with `ConnectionAccepted`. The accept is
//! repeated until the first packet carrying the session tag arrives, which
//! establishes the session. A handshake that never completes is dropped
//! silently after the handshake timeout.
//!
//! ## Liveness
//! Any packet from the peer renews the session. When the server itself has
//! been quiet for the keep-alive interval it sends a `KeepAlive`, and a peer
//! that stays silent for the idle timeout is disconnected.
//!
//! ## Address rebinding
//! A packet from an unfamiliar address is attributed to a session only when
//! it carries the session's token and a payload sequence the session would
//! accept as new. Rebinds are rate limited per session and per source IP.

use crate::config::ServerConfig;
use crate::session::{CloseReason, RebindLimiter, Session, SessionIdAllocator, SessionState};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{
    decode, ChannelKind, DenyReason, MuxStats, Packet, PacketBody, SendError, SessionId,
    SessionTag, PROTOCOL_VERSION,
};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::Instant;

/// Copies of the server-initiated `Disconnect` sent when closing a session
pub const DISCONNECT_REDUNDANCY: usize = 3;

/// Something the simulation needs to hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Established(SessionId),
    Message {
        session: SessionId,
        channel: ChannelKind,
        payload: Vec<u8>,
    },
    Closed {
        session: SessionId,
        reason: CloseReason,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub opened: u64,
    pub closed: u64,
    pub malformed: u64,
    pub protocol_violations: u64,
    pub refused: u64,
    pub rebinds: u64,
    pub rebinds_refused: u64,
}

pub struct SessionManager {
    config: ServerConfig,
    sessions: BTreeMap<SessionId, Session>,
    by_addr: HashMap<SocketAddr, SessionId>,
    ids: SessionIdAllocator,
    rebinds: RebindLimiter,
    rng: StdRng,
    events: Vec<SessionEvent>,
    outgoing: Vec<(SocketAddr, Packet)>,
    stats: SessionStats,
    retired_mux: MuxStats,
}

impl SessionManager {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Manager whose tokens come from the given generator
    pub fn with_rng(config: ServerConfig, rng: StdRng) -> Self {
        Self {
            ids: SessionIdAllocator::new(config.session_cooldown),
            rebinds: RebindLimiter::new(config.rebind_interval),
            sessions: BTreeMap::new(),
            by_addr: HashMap::new(),
            rng,
            events: Vec::new(),
            outgoing: Vec::new(),
            stats: SessionStats::default(),
            retired_mux: MuxStats::default(),
            config,
        }
    }

    /// Decodes one datagram and applies it. Never fails: bad input is counted and dropped.
    pub fn handle_datagram(&mut self, addr: SocketAddr, bytes: &[u8], now: Instant) {
        let packet = match decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.malformed += 1;
                debug!("Dropping datagram from {}: {}", addr, e);
                return;
            }
        };

        if packet.header.version != PROTOCOL_VERSION {
            if let PacketBody::ConnectionRequest { .. } = packet.body {
                info!(
                    "Refusing {}: protocol version {} (expected {})",
                    addr, packet.header.version, PROTOCOL_VERSION
                );
                self.deny(addr, DenyReason::VersionMismatch);
            } else {
                self.stats.protocol_violations += 1;
            }
            return;
        }

        match packet.header.session {
            None => self.handle_untagged(addr, packet.body, now),
            Some(tag) => self.handle_tagged(addr, tag, packet.body, now),
        }
    }

    fn handle_untagged(&mut self, addr: SocketAddr, body: PacketBody, now: Instant) {
        let PacketBody::ConnectionRequest { nonce } = body else {
            self.stats.protocol_violations += 1;
            debug!("Untagged {} packet from {}", body.kind(), addr);
            return;
        };

        if let Some(existing) = self
            .by_addr
            .get(&addr)
            .and_then(|id| self.sessions.get_mut(id))
        {
            match existing.state {
                SessionState::Handshaking if existing.client_nonce == nonce => {
                    let accept = accept_packet(existing);
                    existing.last_accept_sent = now;
                    existing.last_sent = now;
                    self.outgoing.push((addr, accept));
                    return;
                }
                // Late copy of the request that opened this session
                SessionState::Established if existing.client_nonce == nonce => return,
                // An untagged request proves nothing, so it never ends a live session
                SessionState::Established => {
                    self.stats.protocol_violations += 1;
                    debug!(
                        "Ignoring new handshake from {} while {} is established",
                        addr, existing.id
                    );
                    return;
                }
                SessionState::Handshaking => {
                    info!("Session {} replaced by a new handshake from {}", existing.id, addr);
                    existing.begin_disconnect(CloseReason::Replaced);
                }
                SessionState::Disconnecting | SessionState::Closed => {}
            }
            self.by_addr.remove(&addr);
        }

        if self.active() >= self.config.max_sessions {
            warn!("Server full, refusing {}", addr);
            self.deny(addr, DenyReason::ServerFull);
            return;
        }
        let Some(id) = self.ids.allocate(now) else {
            warn!("Session ids exhausted, refusing {}", addr);
            self.deny(addr, DenyReason::ServerFull);
            return;
        };

        let token = self.rng.gen();
        let session = Session::new(id, token, addr, nonce, self.config.mux.clone(), now);
        self.outgoing.push((addr, accept_packet(&session)));
        self.sessions.insert(id, session);
        self.by_addr.insert(addr, id);
        self.stats.opened += 1;
        info!("Session {} handshaking with {}", id, addr);
    }

    fn handle_tagged(&mut self, addr: SocketAddr, tag: SessionTag, body: PacketBody, now: Instant) {
        let Some(session) = self.sessions.get_mut(&tag.id) else {
            self.stats.protocol_violations += 1;
            debug!("Packet from {} for unknown session {}", addr, tag.id);
            return;
        };
        if session.token != tag.token {
            self.stats.protocol_violations += 1;
            debug!("Packet from {} with wrong token for {}", addr, tag.id);
            return;
        }
        if !matches!(
            session.state,
            SessionState::Handshaking | SessionState::Established
        ) {
            return;
        }

        if session.addr != addr {
            let allowed = rebind_allowed(session, &body, now, &self.config)
                && !self.by_addr.contains_key(&addr)
                && self.rebinds.allow(addr.ip(), now);
            if !allowed {
                self.stats.rebinds_refused += 1;
                debug!("Refused rebind of {} from {} to {}", session.id, session.addr, addr);
                return;
            }
            info!("Session {} rebound from {} to {}", session.id, session.addr, addr);
            self.by_addr.remove(&session.addr);
            self.by_addr.insert(addr, session.id);
            session.addr = addr;
            session.last_rebind = Some(now);
            self.stats.rebinds += 1;
        }

        session.last_seen = now;

        if session.state == SessionState::Handshaking {
            match body {
                PacketBody::Disconnect => {
                    session.begin_disconnect(CloseReason::PeerDisconnect);
                    return;
                }
                PacketBody::ConnectionRequest { .. }
                | PacketBody::ConnectionAccepted { .. }
                | PacketBody::ConnectionDenied { .. } => {
                    self.stats.protocol_violations += 1;
                    return;
                }
                _ => {
                    session.establish(now);
                    self.events.push(SessionEvent::Established(session.id));
                    info!("Session {} established with {}", session.id, addr);
                }
            }
        }

        match body {
            PacketBody::Payload(payload) => {
                session.mux.receive_payload(payload);
                for delivery in session.mux.drain_delivered() {
                    self.events.push(SessionEvent::Message {
                        session: session.id,
                        channel: delivery.channel,
                        payload: delivery.payload,
                    });
                }
            }
            PacketBody::Ack { channel, ack } => session.mux.receive_ack(channel, ack),
            PacketBody::KeepAlive | PacketBody::DisconnectAck => {}
            PacketBody::Disconnect => {
                info!("Session {} disconnected by peer", session.id);
                session.begin_disconnect(CloseReason::PeerDisconnect);
            }
            PacketBody::ConnectionRequest { .. }
            | PacketBody::ConnectionAccepted { .. }
            | PacketBody::ConnectionDenied { .. } => {
                self.stats.protocol_violations += 1;
            }
        }
    }

    /// Advances timers: handshake retries and timeouts, idle timeouts, and
    /// the teardown of every session marked for disconnect.
    pub fn update(&mut self, now: Instant) {
        for session in self.sessions.values_mut() {
            match session.state {
                SessionState::Handshaking => {
                    if now.duration_since(session.created_at) >= self.config.handshake_timeout {
                        debug!("Session {} handshake timed out", session.id);
                        session.close_reason = Some(CloseReason::Timeout);
                        session.state = SessionState::Closed;
                    } else if now.duration_since(session.last_accept_sent)
                        >= self.config.handshake_resend_interval
                    {
                        self.outgoing.push((session.addr, accept_packet(session)));
                        session.last_accept_sent = now;
                        session.last_sent = now;
                    }
                }
                SessionState::Established => {
                    if now.duration_since(session.last_seen) >= self.config.idle_timeout {
                        info!("Session {} timed out", session.id);
                        session.begin_disconnect(CloseReason::Timeout);
                    }
                }
                SessionState::Disconnecting | SessionState::Closed => {}
            }

            if session.state == SessionState::Disconnecting {
                let tag = Some(session.tag());
                match session.close_reason {
                    Some(CloseReason::PeerDisconnect) => {
                        self.outgoing
                            .push((session.addr, Packet::new(tag, PacketBody::DisconnectAck)));
                    }
                    // The peer already abandoned this session
                    Some(CloseReason::Replaced) => {}
                    _ => {
                        for _ in 0..DISCONNECT_REDUNDANCY {
                            self.outgoing
                                .push((session.addr, Packet::new(tag, PacketBody::Disconnect)));
                        }
                    }
                }
                session.mux.abandon();
                session.state = SessionState::Closed;
            }
        }

        let closed: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| session.state == SessionState::Closed)
            .map(|session| session.id)
            .collect();
        for id in closed {
            self.remove(id, now);
        }

        self.rebinds.prune(now);
    }

    fn remove(&mut self, id: SessionId, now: Instant) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        if self.by_addr.get(&session.addr) == Some(&id) {
            self.by_addr.remove(&session.addr);
        }
        self.ids.release(id, now);
        self.retired_mux.merge(session.mux.stats());
        self.stats.closed += 1;

        let reason = session.close_reason.unwrap_or(CloseReason::Timeout);
        if let Some(established_at) = session.established_at {
            info!(
                "Session {} closed ({}) after {:.1}s",
                id,
                reason,
                now.duration_since(established_at).as_secs_f64()
            );
            self.events.push(SessionEvent::Closed {
                session: id,
                reason,
            });
        }
    }

    /// Queues a message for an established session.
    ///
    /// Sessions that are unknown, not yet established or already closing
    /// swallow the message without error.
    pub fn send(
        &mut self,
        id: SessionId,
        channel: ChannelKind,
        payload: &[u8],
    ) -> Result<(), SendError> {
        match self.sessions.get_mut(&id) {
            Some(session) if session.is_established() => session.mux.send(channel, payload),
            _ => Ok(()),
        }
    }

    /// Sends to every established session, returning the ones that refused the message
    pub fn broadcast(&mut self, channel: ChannelKind, payload: &[u8]) -> Vec<(SessionId, SendError)> {
        let mut failed = Vec::new();
        for session in self.sessions.values_mut() {
            if !session.is_established() {
                continue;
            }
            if let Err(e) = session.mux.send(channel, payload) {
                failed.push((session.id, e));
            }
        }
        failed
    }

    /// Marks a session for a server-initiated disconnect on the next update
    pub fn disconnect(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            if session.begin_disconnect(CloseReason::Kicked) {
                info!("Session {} kicked", id);
            }
        }
    }

    /// Collects everything to put on the wire now: control packets queued by
    /// the handshake and teardown, channel traffic, and keep-alives.
    pub fn flush(&mut self, now: Instant) -> Vec<(SocketAddr, Packet)> {
        let mut out = std::mem::take(&mut self.outgoing);

        for session in self.sessions.values_mut() {
            if !session.is_established() {
                continue;
            }
            let tag = Some(session.tag());
            match session.mux.poll_transmit(now) {
                Ok(bodies) if bodies.is_empty() => {
                    if now.duration_since(session.last_sent) >= self.config.keepalive_interval {
                        out.push((session.addr, Packet::new(tag, PacketBody::KeepAlive)));
                        session.last_sent = now;
                    }
                }
                Ok(bodies) => {
                    out.extend(
                        bodies
                            .into_iter()
                            .map(|body| (session.addr, Packet::new(tag, body))),
                    );
                    session.last_sent = now;
                }
                Err(e) => {
                    warn!("Session {} unreachable: {}", session.id, e);
                    session.begin_disconnect(CloseReason::Unreachable);
                }
            }
        }
        out
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn session_by_addr(&self, addr: SocketAddr) -> Option<&Session> {
        self.by_addr.get(&addr).and_then(|id| self.sessions.get(id))
    }

    /// Ids of established sessions, ascending
    pub fn established(&self) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|session| session.is_established())
            .map(|session| session.id)
            .collect()
    }

    /// Entries in the session table, whatever their state
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Channel counters summed over live and closed sessions
    pub fn mux_stats(&self) -> MuxStats {
        let mut total = self.retired_mux.clone();
        for session in self.sessions.values() {
            total.merge(session.mux.stats());
        }
        total
    }

    fn active(&self) -> usize {
        self.sessions
            .values()
            .filter(|session| {
                matches!(
                    session.state,
                    SessionState::Handshaking | SessionState::Established
                )
            })
            .count()
    }

    fn deny(&mut self, addr: SocketAddr, reason: DenyReason) {
        self.stats.refused += 1;
        self.outgoing
            .push((addr, Packet::new(None, PacketBody::ConnectionDenied { reason })));
    }
}

fn accept_packet(session: &Session) -> Packet {
    let tag = session.tag();
    Packet::new(
        Some(tag),
        PacketBody::ConnectionAccepted {
            session: tag,
            nonce: session.client_nonce,
        },
    )
}

/// Structural conditions for moving a session to a new address
fn rebind_allowed(session: &Session, body: &PacketBody, now: Instant, config: &ServerConfig) -> bool {
    if !session.is_established() {
        return false;
    }
    if let Some(last) = session.last_rebind {
        if now.duration_since(last) < config.rebind_interval {
            return false;
        }
    }
    match body {
        PacketBody::Payload(payload) => session.mux.is_expected(payload),
        _ => false,
    }
}
