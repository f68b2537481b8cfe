//! Message fragmentation and bounded reassembly

use crate::protocol::FragmentHeader;
use std::collections::HashMap;
use thiserror::Error;

/// One packet's worth of a message, before a sequence number is attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub fragment: Option<FragmentHeader>,
    pub data: Vec<u8>,
}

/// Number of packets a message of `len` bytes occupies
pub fn fragment_count(len: usize, fragment_size: usize) -> usize {
    if len <= fragment_size {
        1
    } else {
        len.div_ceil(fragment_size)
    }
}

/// Splits a message into chunks of at most `fragment_size` bytes.
///
/// Messages that fit in one chunk carry no fragment header.
pub fn split(message_id: u16, payload: &[u8], fragment_size: usize) -> Vec<Chunk> {
    if payload.len() <= fragment_size {
        return vec![Chunk {
            fragment: None,
            data: payload.to_vec(),
        }];
    }

    let count = fragment_count(payload.len(), fragment_size) as u16;
    payload
        .chunks(fragment_size)
        .enumerate()
        .map(|(index, data)| Chunk {
            fragment: Some(FragmentHeader {
                message_id,
                index: index as u16,
                count,
            }),
            data: data.to_vec(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentError {
    #[error("fragment index {index} out of range for count {count}")]
    InvalidIndex { index: u16, count: u16 },
    #[error("message of at least {claimed} bytes exceeds the {ceiling} byte ceiling")]
    TooLarge { claimed: usize, ceiling: usize },
    #[error("fragment of {0} bytes exceeds the fragment size")]
    OversizedFragment(usize),
    #[error("fragment count changed mid-message for message {0}")]
    CountMismatch(u16),
    #[error("reassembly capacity of {0} messages reached")]
    Exhausted(usize),
}

#[derive(Debug)]
struct Partial {
    count: u16,
    received: u16,
    size: usize,
    fragments: Vec<Option<Vec<u8>>>,
    arrival: u64,
}

/// Collects fragments per message id until a message is complete.
///
/// Memory is bounded twice over: a message whose claimed size exceeds the
/// ceiling is refused before any buffer is created, and at most `capacity`
/// messages are in progress at once.
#[derive(Debug)]
pub struct Reassembler {
    fragment_size: usize,
    max_message_size: usize,
    capacity: usize,
    evict_oldest: bool,
    pending: HashMap<u16, Partial>,
    arrivals: u64,
}

impl Reassembler {
    /// A reassembler that refuses new messages once `capacity` are in progress
    pub fn new(fragment_size: usize, max_message_size: usize, capacity: usize) -> Self {
        Self {
            fragment_size,
            max_message_size,
            capacity,
            evict_oldest: false,
            pending: HashMap::new(),
            arrivals: 0,
        }
    }

    /// A reassembler that makes room by dropping the oldest partial message
    pub fn evicting(fragment_size: usize, max_message_size: usize, capacity: usize) -> Self {
        Self {
            evict_oldest: true,
            ..Self::new(fragment_size, max_message_size, capacity)
        }
    }

    /// Adds one fragment, returning the whole message once its last piece arrives
    pub fn insert(
        &mut self,
        header: FragmentHeader,
        data: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, FragmentError> {
        if header.count == 0 || header.index >= header.count {
            return Err(FragmentError::InvalidIndex {
                index: header.index,
                count: header.count,
            });
        }
        if data.len() > self.fragment_size {
            return Err(FragmentError::OversizedFragment(data.len()));
        }

        // Smallest size the sender could mean with this many fragments
        let claimed = (header.count as usize - 1) * self.fragment_size + 1;
        if claimed > self.max_message_size {
            return Err(FragmentError::TooLarge {
                claimed,
                ceiling: self.max_message_size,
            });
        }

        if !self.pending.contains_key(&header.message_id) {
            if self.pending.len() >= self.capacity {
                if !self.evict_oldest {
                    return Err(FragmentError::Exhausted(self.capacity));
                }
                self.evict_one();
            }
            self.arrivals += 1;
            self.pending.insert(
                header.message_id,
                Partial {
                    count: header.count,
                    received: 0,
                    size: 0,
                    fragments: vec![None; header.count as usize],
                    arrival: self.arrivals,
                },
            );
        }

        let Some(partial) = self.pending.get_mut(&header.message_id) else {
            return Ok(None);
        };

        if partial.count != header.count {
            self.pending.remove(&header.message_id);
            return Err(FragmentError::CountMismatch(header.message_id));
        }

        let slot = &mut partial.fragments[header.index as usize];
        if slot.is_some() {
            return Ok(None);
        }

        partial.size += data.len();
        if partial.size > self.max_message_size {
            let claimed = partial.size;
            self.pending.remove(&header.message_id);
            return Err(FragmentError::TooLarge {
                claimed,
                ceiling: self.max_message_size,
            });
        }

        *slot = Some(data);
        partial.received += 1;
        if partial.received < partial.count {
            return Ok(None);
        }

        let Some(partial) = self.pending.remove(&header.message_id) else {
            return Ok(None);
        };
        let mut message = Vec::with_capacity(partial.size);
        for fragment in partial.fragments.into_iter().flatten() {
            message.extend_from_slice(&fragment);
        }
        Ok(Some(message))
    }

    /// Drops every partial message for which `stale` returns true
    pub fn discard_where(&mut self, mut stale: impl FnMut(u16) -> bool) {
        self.pending.retain(|id, _| !stale(*id));
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Number of messages currently being reassembled
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn evict_one(&mut self) {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, partial)| partial.arrival)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            self.pending.remove(&id);
        }
    }
}
