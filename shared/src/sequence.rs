//! Wraparound-safe arithmetic for 16-bit sequence numbers

/// Half of the sequence space; differences above this are treated as wrapped.
const HALF_RANGE: u16 = 32768;

/// Returns true if `s1` is newer than `s2`, accounting for wraparound
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= HALF_RANGE)) || ((s1 < s2) && (s2 - s1 > HALF_RANGE))
}

/// Returns true if `s1` is older than `s2`, accounting for wraparound
pub fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

/// Signed distance from `from` to `to` on the wrapped sequence ring
///
/// Positive when `to` is ahead of `from`. The result is always in
/// `-32768..=32767`.
pub fn sequence_distance(from: u16, to: u16) -> i32 {
    to.wrapping_sub(from) as i16 as i32
}
