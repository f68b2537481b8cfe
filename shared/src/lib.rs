//! Protocol and channel machinery shared by the server and its clients
//!
//! Everything here is synchronous and clock-free: callers own the socket and
//! pass the current [`Instant`](std::time::Instant) in, so the same code runs
//! inside the server's tick loop, the headless client and deterministic tests.

pub mod channel;
pub mod fragment;
pub mod mux;
pub mod protocol;
pub mod sequence;
pub mod snapshot;

pub use mux::{Delivery, Multiplexer, MuxConfig, MuxStats, PeerUnreachable, SendError};
pub use protocol::{
    decode, encode, AckHeader, ChannelAck, ChannelKind, DecodeError, DenyReason, EncodeError,
    Packet, PacketBody, PayloadPacket, SessionId, SessionTag, DEFAULT_PORT, MAX_DATAGRAM_SIZE,
    PACKET_OVERHEAD, PROTOCOL_VERSION,
};
pub use snapshot::TickSnapshot;
