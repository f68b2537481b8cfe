//! Fixed-rate tick scheduler
//!
//! One call to [`TickScheduler::run_tick`] is one step of the authoritative
//! clock. The tick ingests every datagram received since the previous one,
//! advances session timers, hands events to the [`Simulation`] in a stable
//! order, steps the simulation exactly once, applies whatever it queued in
//! its [`Outbox`], and returns the encoded datagrams to put on the wire.
//!
//! A tick that takes longer than the tick duration is counted and logged; the next
//! one runs on schedule regardless.

use crate::session::CloseReason;
use crate::session_manager::{SessionEvent, SessionManager};
use crate::transport::Datagram;
use log::{error, warn};
use shared::{encode, ChannelKind, SessionId};
use std::time::{Duration, Instant};

/// The authoritative simulation driven by the scheduler.
///
/// Lifecycle callbacks and messages for a tick are delivered before that
/// tick's [`step`](Simulation::step).
pub trait Simulation {
    fn on_session_established(&mut self, _session: SessionId) {}

    fn on_session_closed(&mut self, _session: SessionId, _reason: CloseReason) {}

    fn on_message(&mut self, session: SessionId, channel: ChannelKind, payload: &[u8]);

    /// Advances the simulation by `dt`, queueing outbound traffic in `outbox`
    fn step(&mut self, tick: u64, dt: Duration, outbox: &mut Outbox);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SendTo {
        session: SessionId,
        channel: ChannelKind,
        payload: Vec<u8>,
    },
    Broadcast {
        channel: ChannelKind,
        payload: Vec<u8>,
    },
    Disconnect(SessionId),
}

/// Outbound requests collected during one simulation step
#[derive(Debug, Default)]
pub struct Outbox {
    commands: Vec<Command>,
}

impl Outbox {
    pub fn send_to(&mut self, session: SessionId, channel: ChannelKind, payload: impl Into<Vec<u8>>) {
        self.commands.push(Command::SendTo {
            session,
            channel,
            payload: payload.into(),
        });
    }

    /// Sends to every established session
    pub fn broadcast(&mut self, channel: ChannelKind, payload: impl Into<Vec<u8>>) {
        self.commands.push(Command::Broadcast {
            channel,
            payload: payload.into(),
        });
    }

    pub fn disconnect(&mut self, session: SessionId) {
        self.commands.push(Command::Disconnect(session));
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn drain(&mut self) -> std::vec::Drain<'_, Command> {
        self.commands.drain(..)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickStats {
    pub ticks: u64,
    pub overruns: u64,
    pub last_tick: Duration,
    pub worst_tick: Duration,
    pub messages_delivered: u64,
    pub dropped_sends: u64,
    pub encode_failures: u64,
}

pub struct TickScheduler<S> {
    sessions: SessionManager,
    simulation: S,
    tick_duration: Duration,
    tick: u64,
    outbox: Outbox,
    stats: TickStats,
}

impl<S: Simulation> TickScheduler<S> {
    pub fn new(sessions: SessionManager, simulation: S, tick_duration: Duration) -> Self {
        Self {
            sessions,
            simulation,
            tick_duration,
            tick: 0,
            outbox: Outbox::default(),
            stats: TickStats::default(),
        }
    }

    /// Runs one tick at `now` and returns the datagrams to send
    pub fn run_tick(
        &mut self,
        now: Instant,
        inbound: impl IntoIterator<Item = Datagram>,
    ) -> Vec<Datagram> {
        let started = Instant::now();

        for datagram in inbound {
            self.sessions
                .handle_datagram(datagram.addr, &datagram.payload, now);
        }
        self.sessions.update(now);
        self.deliver_events();

        self.tick += 1;
        self.simulation
            .step(self.tick, self.tick_duration, &mut self.outbox);
        self.apply_outbox();

        let mut outbound = Vec::new();
        for (addr, packet) in self.sessions.flush(now) {
            match encode(&packet) {
                Ok(payload) => outbound.push(Datagram { addr, payload }),
                Err(e) => {
                    self.stats.encode_failures += 1;
                    error!("Dropping packet to {}: {}", addr, e);
                }
            }
        }

        let elapsed = started.elapsed();
        self.stats.ticks += 1;
        self.stats.last_tick = elapsed;
        self.stats.worst_tick = self.stats.worst_tick.max(elapsed);
        if elapsed > self.tick_duration {
            self.stats.overruns += 1;
            warn!(
                "Tick {} overran: {:.2}ms > {:.2}ms",
                self.tick,
                elapsed.as_secs_f64() * 1000.0,
                self.tick_duration.as_secs_f64() * 1000.0
            );
        }

        outbound
    }

    /// Hands events to the simulation: establishments, then messages grouped
    /// by session and channel in arrival order, then closes.
    fn deliver_events(&mut self) {
        let mut established = Vec::new();
        let mut messages = Vec::new();
        let mut closed = Vec::new();
        for event in self.sessions.drain_events() {
            match event {
                SessionEvent::Established(id) => established.push(id),
                SessionEvent::Message {
                    session,
                    channel,
                    payload,
                } => messages.push((session, channel, payload)),
                SessionEvent::Closed { session, reason } => closed.push((session, reason)),
            }
        }

        established.sort();
        // Stable, so per-channel order survives
        messages.sort_by_key(|(session, channel, _)| (*session, *channel));
        closed.sort_by_key(|(session, _)| *session);

        for id in established {
            self.simulation.on_session_established(id);
        }
        self.stats.messages_delivered += messages.len() as u64;
        for (session, channel, payload) in messages {
            self.simulation.on_message(session, channel, &payload);
        }
        for (session, reason) in closed {
            self.simulation.on_session_closed(session, reason);
        }
    }

    fn apply_outbox(&mut self) {
        for command in self.outbox.drain() {
            match command {
                Command::SendTo {
                    session,
                    channel,
                    payload,
                } => {
                    if let Err(e) = self.sessions.send(session, channel, &payload) {
                        self.stats.dropped_sends += 1;
                        warn!("Dropping message for {}: {}", session, e);
                    }
                }
                Command::Broadcast { channel, payload } => {
                    for (session, e) in self.sessions.broadcast(channel, &payload) {
                        self.stats.dropped_sends += 1;
                        warn!("Dropping broadcast to {}: {}", session, e);
                    }
                }
                Command::Disconnect(session) => self.sessions.disconnect(session),
            }
        }
    }

    /// Number of ticks run so far
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    pub fn stats(&self) -> &TickStats {
        &self.stats
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn simulation(&self) -> &S {
        &self.simulation
    }

    pub fn simulation_mut(&mut self) -> &mut S {
        &mut self.simulation
    }
}
