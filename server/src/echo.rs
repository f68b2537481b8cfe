//! Built-in simulation used by the `server` binary
//!
//! Broadcasts a [`TickSnapshot`] on the unreliable channel every tick and
//! relays every reliable message to all sessions on the reliable-ordered
//! channel. Enough to exercise every path of the engine from a client.

use crate::scheduler::{Outbox, Simulation};
use crate::session::CloseReason;
use log::{error, info};
use shared::{ChannelKind, SessionId, TickSnapshot};
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct EchoSimulation {
    sessions: BTreeSet<SessionId>,
    relay: Vec<Vec<u8>>,
    relayed: u64,
}

impl EchoSimulation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionId> {
        self.sessions.iter()
    }

    /// Reliable messages relayed so far
    pub fn relayed(&self) -> u64 {
        self.relayed
    }
}

impl Simulation for EchoSimulation {
    fn on_session_established(&mut self, session: SessionId) {
        info!("{} joined", session);
        self.sessions.insert(session);
    }

    fn on_session_closed(&mut self, session: SessionId, reason: CloseReason) {
        info!("{} left ({})", session, reason);
        self.sessions.remove(&session);
    }

    fn on_message(&mut self, _session: SessionId, channel: ChannelKind, payload: &[u8]) {
        if channel.is_reliable() {
            self.relay.push(payload.to_vec());
        }
    }

    fn step(&mut self, tick: u64, _dt: Duration, outbox: &mut Outbox) {
        if self.sessions.is_empty() {
            self.relay.clear();
            return;
        }

        let snapshot = TickSnapshot {
            tick,
            sessions: self.sessions.iter().copied().collect(),
        };
        match snapshot.to_bytes() {
            Ok(bytes) => outbox.broadcast(ChannelKind::Unreliable, bytes),
            Err(e) => error!("Failed to encode snapshot for tick {}: {}", tick, e),
        }

        for message in self.relay.drain(..) {
            outbox.broadcast(ChannelKind::ReliableOrdered, message);
            self.relayed += 1;
        }
    }
}
