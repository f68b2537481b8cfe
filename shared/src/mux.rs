//! Per-peer channel multiplexer
//!
//! A [`Multiplexer`] sits between whole application messages and the
//! [`PayloadPacket`]s exchanged with one peer. It owns the state of all three
//! channels: fragmentation on the way out, reassembly, duplicate suppression,
//! ordering and acknowledgement on the way in, and the retransmission
//! schedule for reliable traffic.
//!
//! The multiplexer never reads the clock. Callers pass `now` into
//! [`Multiplexer::poll_transmit`], which keeps time progression under the
//! control of whoever drives the tick.

use crate::channel::{
    Exhausted, Receipt, ReliableReceiver, ReliableSender, ResendPolicy, UnreliableDrop,
    UnreliableReceiver,
};
use crate::fragment::{fragment_count, split, Chunk, Reassembler};
use crate::protocol::{
    AckHeader, ChannelAck, ChannelKind, PacketBody, PayloadPacket, MAX_DATAGRAM_SIZE,
    PACKET_OVERHEAD,
};
use log::debug;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Tuning shared by every channel of a multiplexer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    /// Largest payload carried by one packet
    pub fragment_size: usize,
    /// Ceiling on a whole message, both outbound and reassembled
    pub max_message_size: usize,
    /// Delay before the first retransmission
    pub resend_base: Duration,
    /// Cap on the doubling retransmission delay
    pub resend_max: Duration,
    /// Transmissions of one packet before the peer counts as unreachable
    pub max_resend_attempts: u32,
    /// Span of unacknowledged packets allowed per reliable channel
    pub max_in_flight: u64,
    /// Chunks allowed to wait for the in-flight window per channel
    pub max_send_queue: usize,
    /// Partial unreliable messages kept at once
    pub max_unreliable_partials: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            fragment_size: 1024,
            max_message_size: 64 * 1024,
            resend_base: Duration::from_millis(100),
            resend_max: Duration::from_secs(2),
            max_resend_attempts: 10,
            max_in_flight: 256,
            max_send_queue: 4096,
            max_unreliable_partials: 8,
        }
    }
}

impl MuxConfig {
    pub fn resend_policy(&self) -> ResendPolicy {
        ResendPolicy {
            base: self.resend_base,
            max: self.resend_max,
            max_attempts: self.max_resend_attempts,
            max_in_flight: self.max_in_flight,
        }
    }

    /// Largest fragment size that still fits a datagram
    pub fn max_fragment_size() -> usize {
        MAX_DATAGRAM_SIZE - PACKET_OVERHEAD
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("send queue for the {0} channel is full")]
    QueueFull(ChannelKind),
}

/// A reliable packet went unacknowledged for its whole attempt budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{channel} packet {sequence} unacknowledged after {attempts} attempts")]
pub struct PeerUnreachable {
    pub channel: ChannelKind,
    pub sequence: u16,
    pub attempts: u32,
}

/// Running counters for one multiplexer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MuxStats {
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub packets_sent: u64,
    pub retransmits: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub out_of_window: u64,
    pub rejected_fragments: u64,
}

impl MuxStats {
    /// Sum of every counted drop
    pub fn dropped(&self) -> u64 {
        self.duplicates + self.stale + self.out_of_window + self.rejected_fragments
    }

    pub fn merge(&mut self, other: &MuxStats) {
        self.messages_sent += other.messages_sent;
        self.messages_delivered += other.messages_delivered;
        self.packets_sent += other.packets_sent;
        self.retransmits += other.retransmits;
        self.duplicates += other.duplicates;
        self.stale += other.stale;
        self.out_of_window += other.out_of_window;
        self.rejected_fragments += other.rejected_fragments;
    }
}

/// A complete message handed to the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub channel: ChannelKind,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct ReliableChannel {
    kind: ChannelKind,
    sender: ReliableSender,
    receiver: ReliableReceiver,
    reassembler: Reassembler,
}

impl ReliableChannel {
    fn new(kind: ChannelKind, receiver: ReliableReceiver, config: &MuxConfig) -> Self {
        let capacity = crate::channel::RECEIVE_WINDOW as usize;
        Self {
            kind,
            sender: ReliableSender::new(),
            receiver,
            reassembler: Reassembler::new(config.fragment_size, config.max_message_size, capacity),
        }
    }

    fn receive(
        &mut self,
        packet: PayloadPacket,
        delivered: &mut VecDeque<Delivery>,
        stats: &mut MuxStats,
    ) {
        let chunk = Chunk {
            fragment: packet.fragment,
            data: packet.data,
        };
        let chunks = match self.receiver.receive(packet.sequence, chunk) {
            Receipt::Accepted(chunks) => chunks,
            Receipt::Duplicate => {
                stats.duplicates += 1;
                return;
            }
            Receipt::OutOfWindow => {
                stats.out_of_window += 1;
                return;
            }
        };

        for chunk in chunks {
            let message = match chunk.fragment {
                None => Some(chunk.data),
                Some(header) => match self.reassembler.insert(header, chunk.data) {
                    Ok(message) => message,
                    Err(err) => {
                        debug!("Dropping {} fragment: {}", self.kind, err);
                        stats.rejected_fragments += 1;
                        None
                    }
                },
            };
            if let Some(payload) = message {
                stats.messages_delivered += 1;
                delivered.push_back(Delivery {
                    channel: self.kind,
                    payload,
                });
            }
        }
    }

    /// Queues due packets, each carrying this channel's ack. Returns the ack
    /// still owed when nothing went out to carry it.
    fn poll_transmit(
        &mut self,
        now: Instant,
        policy: &ResendPolicy,
        out: &mut Vec<PacketBody>,
        stats: &mut MuxStats,
    ) -> Result<Option<AckHeader>, PeerUnreachable> {
        let mut batch = Vec::new();
        let retransmits_before = self.sender.retransmits();
        self.sender
            .poll_transmit(now, policy, &mut batch)
            .map_err(|Exhausted { sequence, attempts }| PeerUnreachable {
                channel: self.kind,
                sequence,
                attempts,
            })?;
        stats.retransmits += self.sender.retransmits() - retransmits_before;

        let ack_pending = self.receiver.take_ack_pending();
        let ack = self.receiver.ack_header();
        if batch.is_empty() {
            return Ok(ack_pending.then_some(ack));
        }

        let carried = ChannelAck {
            channel: self.kind,
            ack,
        };
        for (sequence, chunk) in batch {
            out.push(PacketBody::Payload(PayloadPacket {
                channel: self.kind,
                sequence,
                ack: Some(carried),
                fragment: chunk.fragment,
                data: chunk.data,
            }));
        }
        Ok(None)
    }
}

/// All channel state for one peer
#[derive(Debug)]
pub struct Multiplexer {
    config: MuxConfig,
    unreliable_sequence: u16,
    unreliable_queue: Vec<(u16, Chunk)>,
    unreliable_rx: UnreliableReceiver,
    ordered: ReliableChannel,
    unordered: ReliableChannel,
    delivered: VecDeque<Delivery>,
    stats: MuxStats,
}

impl Multiplexer {
    pub fn new(config: MuxConfig) -> Self {
        let unreliable_rx = UnreliableReceiver::new(Reassembler::evicting(
            config.fragment_size,
            config.max_message_size,
            config.max_unreliable_partials,
        ));
        Self {
            ordered: ReliableChannel::new(
                ChannelKind::ReliableOrdered,
                ReliableReceiver::ordered(),
                &config,
            ),
            unordered: ReliableChannel::new(
                ChannelKind::ReliableUnordered,
                ReliableReceiver::unordered(),
                &config,
            ),
            unreliable_sequence: 0,
            unreliable_queue: Vec::new(),
            unreliable_rx,
            delivered: VecDeque::new(),
            stats: MuxStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub fn stats(&self) -> &MuxStats {
        &self.stats
    }

    /// Queues a message for the next [`poll_transmit`](Self::poll_transmit)
    pub fn send(&mut self, channel: ChannelKind, payload: &[u8]) -> Result<(), SendError> {
        if payload.len() > self.config.max_message_size {
            return Err(SendError::MessageTooLarge {
                size: payload.len(),
                limit: self.config.max_message_size,
            });
        }

        let needed = fragment_count(payload.len(), self.config.fragment_size);
        match channel {
            ChannelKind::Unreliable => {
                if self.unreliable_queue.len() + needed > self.config.max_send_queue {
                    return Err(SendError::QueueFull(channel));
                }
                let sequence = self.unreliable_sequence;
                self.unreliable_sequence = sequence.wrapping_add(1);
                for chunk in split(sequence, payload, self.config.fragment_size) {
                    self.unreliable_queue.push((sequence, chunk));
                }
            }
            ChannelKind::ReliableOrdered | ChannelKind::ReliableUnordered => {
                let fragment_size = self.config.fragment_size;
                let max_queue = self.config.max_send_queue;
                let reliable = self.reliable_mut(channel);
                if reliable.sender.queued() + needed > max_queue {
                    return Err(SendError::QueueFull(channel));
                }
                let message_id = reliable.sender.allocate_message_id();
                reliable
                    .sender
                    .push(split(message_id, payload, fragment_size));
            }
        }
        self.stats.messages_sent += 1;
        Ok(())
    }

    /// Feeds one inbound payload packet through its channel
    pub fn receive_payload(&mut self, packet: PayloadPacket) {
        if let Some(carried) = packet.ack {
            self.receive_ack(carried.channel, carried.ack);
        }
        match packet.channel {
            ChannelKind::Unreliable => {
                let chunk = Chunk {
                    fragment: packet.fragment,
                    data: packet.data,
                };
                match self.unreliable_rx.receive(packet.sequence, chunk) {
                    Ok(Some(payload)) => {
                        self.stats.messages_delivered += 1;
                        self.delivered.push_back(Delivery {
                            channel: ChannelKind::Unreliable,
                            payload,
                        });
                    }
                    Ok(None) => {}
                    Err(UnreliableDrop::Stale) => self.stats.stale += 1,
                    Err(UnreliableDrop::Rejected(err)) => {
                        debug!("Dropping unreliable fragment: {}", err);
                        self.stats.rejected_fragments += 1;
                    }
                }
            }
            ChannelKind::ReliableOrdered => {
                self.ordered
                    .receive(packet, &mut self.delivered, &mut self.stats)
            }
            ChannelKind::ReliableUnordered => {
                self.unordered
                    .receive(packet, &mut self.delivered, &mut self.stats)
            }
        }
    }

    /// Applies a standalone ack; acks for the unreliable channel are meaningless and ignored
    pub fn receive_ack(&mut self, channel: ChannelKind, ack: AckHeader) {
        if channel.is_reliable() {
            self.reliable_mut(channel).sender.acknowledge(ack);
        }
    }

    /// True if a payload packet from this peer would be accepted as new.
    ///
    /// Used as the structural check before trusting a packet from an
    /// unfamiliar address.
    pub fn is_expected(&self, packet: &PayloadPacket) -> bool {
        match packet.channel {
            ChannelKind::Unreliable => self.unreliable_rx.is_newer(packet.sequence),
            ChannelKind::ReliableOrdered => self.ordered.receiver.would_accept(packet.sequence),
            ChannelKind::ReliableUnordered => {
                self.unordered.receiver.would_accept(packet.sequence)
            }
        }
    }

    /// Takes every message completed since the last call, in arrival order
    pub fn drain_delivered(&mut self) -> impl Iterator<Item = Delivery> + '_ {
        self.delivered.drain(..)
    }

    /// Produces the packets to send now: queued unreliable traffic, due
    /// retransmissions, newly admitted reliable packets and pending acks.
    ///
    /// An ack owed by a reliable channel with nothing to send rides on an
    /// unreliable packet of the same flush; only when none is left does it
    /// go out as a standalone `Ack`.
    pub fn poll_transmit(&mut self, now: Instant) -> Result<Vec<PacketBody>, PeerUnreachable> {
        let mut unreliable: Vec<PayloadPacket> = self
            .unreliable_queue
            .drain(..)
            .map(|(sequence, chunk)| PayloadPacket {
                channel: ChannelKind::Unreliable,
                sequence,
                ack: None,
                fragment: chunk.fragment,
                data: chunk.data,
            })
            .collect();

        let policy = self.config.resend_policy();
        let mut reliable = Vec::new();
        let owed = [
            (
                ChannelKind::ReliableOrdered,
                self.ordered
                    .poll_transmit(now, &policy, &mut reliable, &mut self.stats)?,
            ),
            (
                ChannelKind::ReliableUnordered,
                self.unordered
                    .poll_transmit(now, &policy, &mut reliable, &mut self.stats)?,
            ),
        ];

        let mut carriers = unreliable.iter_mut();
        let mut standalone = Vec::new();
        for (channel, ack) in owed {
            let Some(ack) = ack else { continue };
            match carriers.next() {
                Some(packet) => packet.ack = Some(ChannelAck { channel, ack }),
                None => standalone.push(PacketBody::Ack { channel, ack }),
            }
        }

        let mut out: Vec<PacketBody> = unreliable.into_iter().map(PacketBody::Payload).collect();
        out.extend(reliable);
        out.extend(standalone);
        self.stats.packets_sent += out.len() as u64;
        Ok(out)
    }

    /// True while reliable data is queued or unacknowledged
    pub fn has_pending_reliable(&self) -> bool {
        !self.ordered.sender.is_idle() || !self.unordered.sender.is_idle()
    }

    /// Drops all outbound state; nothing already sent will be retried
    pub fn abandon(&mut self) {
        self.unreliable_queue.clear();
        self.ordered.sender.abandon();
        self.unordered.sender.abandon();
    }

    fn reliable_mut(&mut self, channel: ChannelKind) -> &mut ReliableChannel {
        match channel {
            ChannelKind::ReliableUnordered => &mut self.unordered,
            _ => &mut self.ordered,
        }
    }
}
