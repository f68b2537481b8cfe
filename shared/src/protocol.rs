//! Wire format shared by the server and its clients
//!
//! Every datagram carries exactly one [`Packet`]: a fixed header followed by a
//! tagged [`PacketBody`]. Encoding goes through bincode with a hard byte limit,
//! so decoding arbitrary input either yields a packet or a [`DecodeError`] and
//! never allocates more than one datagram's worth of payload.

use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifies this protocol on the wire; datagrams carrying another id are foreign
pub const PROTOCOL_ID: u64 = 0x7365_7373_696f_6e31;
/// Current protocol revision, checked during the handshake
pub const PROTOCOL_VERSION: u16 = 1;
/// Default UDP port the server listens on
pub const DEFAULT_PORT: u16 = 7777;
/// Largest datagram either side will send or accept
pub const MAX_DATAGRAM_SIZE: usize = 1400;
/// Upper bound on the encoded size of everything in a payload packet except its data
pub const PACKET_OVERHEAD: usize = 64;

/// Locally assigned identifier of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Session id plus the random token handed out in the accept packet.
///
/// Both must match for a packet to be attributed to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionTag {
    pub id: SessionId,
    pub token: u64,
}

/// Delivery policy of a logical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Delivered immediately, stale and duplicate messages dropped
    Unreliable,
    /// Retransmitted until acknowledged, delivered in send order
    ReliableOrdered,
    /// Retransmitted until acknowledged, delivered as soon as complete
    ReliableUnordered,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [
        ChannelKind::Unreliable,
        ChannelKind::ReliableOrdered,
        ChannelKind::ReliableUnordered,
    ];

    pub fn is_reliable(self) -> bool {
        !matches!(self, ChannelKind::Unreliable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Unreliable => "unreliable",
            ChannelKind::ReliableOrdered => "reliable-ordered",
            ChannelKind::ReliableUnordered => "reliable-unordered",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cumulative acknowledgement with a selective bitfield.
///
/// `ack` is the next sequence the receiver expects, so everything before it
/// has arrived. Bit `i` of `bits` reports sequence `ack + 1 + i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AckHeader {
    pub ack: u16,
    pub bits: u32,
}

/// Receive state of one reliable channel, carried on a payload packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAck {
    pub channel: ChannelKind,
    pub ack: AckHeader,
}

/// Position of one fragment inside a larger message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentHeader {
    pub message_id: u16,
    pub index: u16,
    pub count: u16,
}

/// Application data travelling on one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadPacket {
    pub channel: ChannelKind,
    pub sequence: u16,
    /// Reliable packets carry their own channel's receive state. An
    /// unreliable packet may carry that of a reliable channel owing an ack.
    pub ack: Option<ChannelAck>,
    /// Present when the message spans more than one packet
    pub fragment: Option<FragmentHeader>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    ServerFull,
    VersionMismatch,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::ServerFull => f.write_str("server full"),
            DenyReason::VersionMismatch => f.write_str("protocol version mismatch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketBody {
    ConnectionRequest { nonce: u64 },
    ConnectionAccepted { session: SessionTag, nonce: u64 },
    ConnectionDenied { reason: DenyReason },
    Payload(PayloadPacket),
    Ack { channel: ChannelKind, ack: AckHeader },
    KeepAlive,
    Disconnect,
    DisconnectAck,
}

impl PacketBody {
    pub fn kind(&self) -> &'static str {
        match self {
            PacketBody::ConnectionRequest { .. } => "connection-request",
            PacketBody::ConnectionAccepted { .. } => "connection-accepted",
            PacketBody::ConnectionDenied { .. } => "connection-denied",
            PacketBody::Payload(_) => "payload",
            PacketBody::Ack { .. } => "ack",
            PacketBody::KeepAlive => "keep-alive",
            PacketBody::Disconnect => "disconnect",
            PacketBody::DisconnectAck => "disconnect-ack",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    pub protocol_id: u64,
    pub version: u16,
    /// Absent until the handshake has assigned a session
    pub session: Option<SessionTag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: PacketBody,
}

impl Packet {
    /// Builds a packet stamped with the current protocol id and version
    pub fn new(session: Option<SessionTag>, body: PacketBody) -> Self {
        Self {
            header: PacketHeader {
                protocol_id: PROTOCOL_ID,
                version: PROTOCOL_VERSION,
                session,
            },
            body,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("datagram is empty")]
    Empty,
    #[error("datagram of {0} bytes exceeds the datagram size limit")]
    Oversized(usize),
    #[error("malformed packet: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("foreign protocol id {0:#018x}")]
    ForeignProtocol(u64),
}

#[derive(Debug, Error)]
#[error("failed to encode {kind} packet: {source}")]
pub struct EncodeError {
    pub kind: &'static str,
    #[source]
    pub source: bincode::Error,
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_DATAGRAM_SIZE as u64)
        .reject_trailing_bytes()
}

/// Serializes a packet, failing if it would not fit in one datagram
pub fn encode(packet: &Packet) -> Result<Vec<u8>, EncodeError> {
    wire_options().serialize(packet).map_err(|source| EncodeError {
        kind: packet.body.kind(),
        source,
    })
}

/// Parses one datagram. Total over arbitrary input: never panics.
pub fn decode(bytes: &[u8]) -> Result<Packet, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(DecodeError::Oversized(bytes.len()));
    }

    let packet: Packet = wire_options().deserialize(bytes)?;
    if packet.header.protocol_id != PROTOCOL_ID {
        return Err(DecodeError::ForeignProtocol(packet.header.protocol_id));
    }
    Ok(packet)
}
