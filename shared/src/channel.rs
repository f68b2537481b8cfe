//! Per-channel sequencing, acknowledgement and retransmission state
//!
//! Reliable channels number every packet. Internally those numbers are kept
//! as unwrapped `u64` indices so that ordering and windowing never need
//! modular arithmetic; only the low 16 bits travel on the wire.

use crate::fragment::{Chunk, Reassembler};
use crate::protocol::AckHeader;
use crate::sequence::{sequence_distance, sequence_greater_than};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// How far ahead of the cumulative ack a reliable receiver buffers packets
pub const RECEIVE_WINDOW: u64 = 1024;

/// Retransmission tuning for reliable senders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
    pub max_in_flight: u64,
}

impl ResendPolicy {
    /// Delay before transmission number `attempt + 1`, doubling from `base` up to `max`
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1 << exponent).min(self.max)
    }
}

/// A reliable packet hit its attempt budget without being acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted {
    pub sequence: u16,
    pub attempts: u32,
}

#[derive(Debug)]
struct InFlight {
    chunk: Chunk,
    attempts: u32,
    next_send: Instant,
}

/// Sending half of a reliable channel
#[derive(Debug, Default)]
pub struct ReliableSender {
    next_index: u64,
    next_message_id: u16,
    queue: VecDeque<Chunk>,
    in_flight: BTreeMap<u64, InFlight>,
    retransmits: u64,
}

impl ReliableSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = id.wrapping_add(1);
        id
    }

    pub fn push(&mut self, chunks: impl IntoIterator<Item = Chunk>) {
        self.queue.extend(chunks);
    }

    /// Chunks waiting for a slot in the in-flight window
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    pub fn retransmits(&self) -> u64 {
        self.retransmits
    }

    /// Forgets everything not yet acknowledged
    pub fn abandon(&mut self) {
        self.queue.clear();
        self.in_flight.clear();
    }

    /// Applies a peer's ack, returning how many in-flight packets it released
    pub fn acknowledge(&mut self, ack: AckHeader) -> usize {
        let behind = (self.next_index as u16).wrapping_sub(ack.ack) as u64;
        if behind > self.next_index || behind > RECEIVE_WINDOW {
            return 0;
        }
        let cumulative = self.next_index - behind;

        let before = self.in_flight.len();
        self.in_flight = self.in_flight.split_off(&cumulative);
        for bit in 0..32u64 {
            if ack.bits & (1 << bit) != 0 {
                self.in_flight.remove(&(cumulative + 1 + bit));
            }
        }
        before - self.in_flight.len()
    }

    /// Emits due retransmissions, then admits queued chunks into the window.
    ///
    /// A due packet that has already used its whole attempt budget stops the
    /// poll with [`Exhausted`].
    pub fn poll_transmit(
        &mut self,
        now: Instant,
        policy: &ResendPolicy,
        out: &mut Vec<(u16, Chunk)>,
    ) -> Result<(), Exhausted> {
        for (&index, pending) in self.in_flight.iter_mut() {
            if pending.next_send > now {
                continue;
            }
            if pending.attempts >= policy.max_attempts {
                return Err(Exhausted {
                    sequence: index as u16,
                    attempts: pending.attempts,
                });
            }
            pending.attempts += 1;
            pending.next_send = now + policy.delay(pending.attempts);
            self.retransmits += 1;
            out.push((index as u16, pending.chunk.clone()));
        }

        while !self.queue.is_empty() {
            let oldest = self
                .in_flight
                .keys()
                .next()
                .copied()
                .unwrap_or(self.next_index);
            if self.next_index - oldest >= policy.max_in_flight {
                break;
            }
            let Some(chunk) = self.queue.pop_front() else {
                break;
            };
            let index = self.next_index;
            self.next_index += 1;
            out.push((index as u16, chunk.clone()));
            self.in_flight.insert(
                index,
                InFlight {
                    chunk,
                    attempts: 1,
                    next_send: now + policy.delay(1),
                },
            );
        }
        Ok(())
    }
}

/// Outcome of handing one packet to a receiver
#[derive(Debug, PartialEq, Eq)]
pub enum Receipt {
    /// New packet; the chunks are now deliverable, in delivery order
    Accepted(Vec<Chunk>),
    /// Already seen; nothing to deliver
    Duplicate,
    /// Too far ahead of the cumulative ack to buffer
    OutOfWindow,
}

/// Receiving half of a reliable channel
#[derive(Debug)]
pub struct ReliableReceiver {
    ordered: bool,
    next_expected: u64,
    /// Packets past a gap. Ordered channels keep the chunk until the gap fills;
    /// unordered channels only remember that the index arrived.
    ahead: BTreeMap<u64, Option<Chunk>>,
    ack_pending: bool,
}

impl ReliableReceiver {
    pub fn ordered() -> Self {
        Self::with_ordering(true)
    }

    pub fn unordered() -> Self {
        Self::with_ordering(false)
    }

    fn with_ordering(ordered: bool) -> Self {
        Self {
            ordered,
            next_expected: 0,
            ahead: BTreeMap::new(),
            ack_pending: false,
        }
    }

    fn index_of(&self, sequence: u16) -> Option<u64> {
        let delta = sequence_distance(self.next_expected as u16, sequence);
        if delta < 0 {
            return None;
        }
        Some(self.next_expected + delta as u64)
    }

    /// True if `sequence` is new and inside the receive window
    pub fn would_accept(&self, sequence: u16) -> bool {
        match self.index_of(sequence) {
            Some(index) => {
                index - self.next_expected < RECEIVE_WINDOW && !self.ahead.contains_key(&index)
            }
            None => false,
        }
    }

    pub fn receive(&mut self, sequence: u16, chunk: Chunk) -> Receipt {
        // Every receipt, duplicates included, gets acknowledged on the next flush
        self.ack_pending = true;

        let Some(index) = self.index_of(sequence) else {
            return Receipt::Duplicate;
        };
        if index - self.next_expected >= RECEIVE_WINDOW {
            return Receipt::OutOfWindow;
        }
        if self.ahead.contains_key(&index) {
            return Receipt::Duplicate;
        }

        let mut released = Vec::new();
        if index != self.next_expected {
            if self.ordered {
                self.ahead.insert(index, Some(chunk));
            } else {
                self.ahead.insert(index, None);
                released.push(chunk);
            }
            return Receipt::Accepted(released);
        }

        released.push(chunk);
        self.next_expected += 1;
        while let Some(buffered) = self.ahead.remove(&self.next_expected) {
            released.extend(buffered);
            self.next_expected += 1;
        }
        Receipt::Accepted(released)
    }

    pub fn ack_header(&self) -> AckHeader {
        let mut bits = 0u32;
        for (&index, _) in self.ahead.range(self.next_expected + 1..self.next_expected + 33) {
            bits |= 1 << (index - self.next_expected - 1);
        }
        AckHeader {
            ack: self.next_expected as u16,
            bits,
        }
    }

    /// Returns whether anything arrived since the last call, clearing the flag
    pub fn take_ack_pending(&mut self) -> bool {
        std::mem::take(&mut self.ack_pending)
    }

    pub fn buffered(&self) -> usize {
        self.ahead.len()
    }
}

/// Why an unreliable packet produced no message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnreliableDrop {
    /// Not newer than the last delivered message
    Stale,
    /// Fragment refused by the reassembler
    Rejected(crate::fragment::FragmentError),
}

/// Receiving half of the unreliable channel.
///
/// The wire sequence is the message sequence; fragments of one message share
/// it. A message is only delivered if it is newer than every message
/// delivered before it.
#[derive(Debug)]
pub struct UnreliableReceiver {
    last_delivered: Option<u16>,
    reassembler: Reassembler,
}

impl UnreliableReceiver {
    pub fn new(reassembler: Reassembler) -> Self {
        Self {
            last_delivered: None,
            reassembler,
        }
    }

    pub fn is_newer(&self, sequence: u16) -> bool {
        self.last_delivered
            .map_or(true, |last| sequence_greater_than(sequence, last))
    }

    pub fn receive(&mut self, sequence: u16, chunk: Chunk) -> Result<Option<Vec<u8>>, UnreliableDrop> {
        if !self.is_newer(sequence) {
            return Err(UnreliableDrop::Stale);
        }

        let message = match chunk.fragment {
            None => chunk.data,
            Some(mut header) => {
                header.message_id = sequence;
                match self.reassembler.insert(header, chunk.data) {
                    Ok(Some(message)) => message,
                    Ok(None) => return Ok(None),
                    Err(err) => return Err(UnreliableDrop::Rejected(err)),
                }
            }
        };

        self.last_delivered = Some(sequence);
        self.reassembler
            .discard_where(|id| !sequence_greater_than(id, sequence));
        Ok(Some(message))
    }

    pub fn last_delivered(&self) -> Option<u16> {
        self.last_delivered
    }

    pub fn partials(&self) -> usize {
        self.reassembler.len()
    }
}
