//! Per-tick state snapshot broadcast by the built-in echo simulation

use crate::protocol::SessionId;
use bincode::Options;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSnapshot {
    pub tick: u64,
    /// Established sessions at the time of the tick, ascending
    pub sessions: Vec<SessionId>,
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

impl TickSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        options().serialize(self)
    }

    /// Parses a snapshot, bounding allocation by the size of the input
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        options()
            .with_limit(bytes.len() as u64)
            .deserialize(bytes)
    }
}
