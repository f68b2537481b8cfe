//! Session records and the bookkeeping that outlives individual sessions

use shared::{Multiplexer, MuxConfig, SessionId, SessionTag};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accept sent, waiting for the first tagged packet
    Handshaking,
    Established,
    /// Farewell packets go out on the next update, then the session closes
    Disconnecting,
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The peer sent a disconnect
    PeerDisconnect,
    /// Nothing heard from the peer within the idle timeout
    Timeout,
    /// A reliable packet ran out of retransmission attempts
    Unreachable,
    /// The simulation asked for the disconnect
    Kicked,
    /// The same address started a new handshake
    Replaced,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::PeerDisconnect => "peer_disconnect",
            CloseReason::Timeout => "timeout",
            CloseReason::Unreachable => "unreachable",
            CloseReason::Kicked => "kicked",
            CloseReason::Replaced => "replaced",
        }
    }

    /// Whether the server has to tell the peer, rather than answer it
    pub fn server_initiated(self) -> bool {
        !matches!(self, CloseReason::PeerDisconnect)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One remote peer as seen by the session manager
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub token: u64,
    pub addr: SocketAddr,
    pub state: SessionState,
    pub created_at: Instant,
    /// Set once the first tagged packet arrives
    pub established_at: Option<Instant>,
    pub last_seen: Instant,
    pub last_sent: Instant,
    pub last_accept_sent: Instant,
    /// Nonce of the connection request that created this session
    pub client_nonce: u64,
    pub close_reason: Option<CloseReason>,
    pub last_rebind: Option<Instant>,
    pub mux: Multiplexer,
}

impl Session {
    pub fn new(
        id: SessionId,
        token: u64,
        addr: SocketAddr,
        client_nonce: u64,
        mux_config: MuxConfig,
        now: Instant,
    ) -> Self {
        Self {
            id,
            token,
            addr,
            state: SessionState::Handshaking,
            created_at: now,
            established_at: None,
            last_seen: now,
            last_sent: now,
            last_accept_sent: now,
            client_nonce,
            close_reason: None,
            last_rebind: None,
            mux: Multiplexer::new(mux_config),
        }
    }

    pub fn tag(&self) -> SessionTag {
        SessionTag {
            id: self.id,
            token: self.token,
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    pub fn establish(&mut self, now: Instant) {
        self.state = SessionState::Established;
        self.established_at = Some(now);
    }

    /// Moves to `Disconnecting` unless the session is already on its way out.
    /// The first reason wins.
    pub fn begin_disconnect(&mut self, reason: CloseReason) -> bool {
        match self.state {
            SessionState::Handshaking | SessionState::Established => {
                self.state = SessionState::Disconnecting;
                self.close_reason = Some(reason);
                true
            }
            SessionState::Disconnecting | SessionState::Closed => false,
        }
    }
}

/// Hands out session ids, holding released ones back for a cooldown
#[derive(Debug)]
pub struct SessionIdAllocator {
    next: u32,
    cooldown: Duration,
    released: VecDeque<(SessionId, Instant)>,
}

impl SessionIdAllocator {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            next: 1,
            cooldown,
            released: VecDeque::new(),
        }
    }

    /// Reuses the oldest id whose cooldown has passed, otherwise mints a new one
    pub fn allocate(&mut self, now: Instant) -> Option<SessionId> {
        if let Some(&(id, released_at)) = self.released.front() {
            if now.duration_since(released_at) >= self.cooldown {
                self.released.pop_front();
                return Some(id);
            }
        }
        if self.next == u32::MAX {
            return None;
        }
        let id = SessionId(self.next);
        self.next += 1;
        Some(id)
    }

    pub fn release(&mut self, id: SessionId, now: Instant) {
        self.released.push_back((id, now));
    }

    /// Ids still waiting out their cooldown
    pub fn cooling_down(&self) -> usize {
        self.released.len()
    }
}

/// Per source IP limit on address rebinds
#[derive(Debug)]
pub struct RebindLimiter {
    interval: Duration,
    last: HashMap<IpAddr, Instant>,
}

impl RebindLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: HashMap::new(),
        }
    }

    /// Records a rebind from `ip` if it is allowed at `now`
    pub fn allow(&mut self, ip: IpAddr, now: Instant) -> bool {
        if let Some(&previous) = self.last.get(&ip) {
            if now.duration_since(previous) < self.interval {
                return false;
            }
        }
        self.last.insert(ip, now);
        true
    }

    /// Forgets addresses whose interval has passed
    pub fn prune(&mut self, now: Instant) {
        let interval = self.interval;
        self.last
            .retain(|_, previous| now.duration_since(*previous) < interval);
    }

    pub fn tracked(&self) -> usize {
        self.last.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let mut ids = SessionIdAllocator::new(Duration::from_secs(10));
        let now = Instant::now();
        assert_eq!(ids.allocate(now), Some(SessionId(1)));
        assert_eq!(ids.allocate(now), Some(SessionId(2)));
    }

    #[test]
    fn test_released_id_waits_for_cooldown() {
        let mut ids = SessionIdAllocator::new(Duration::from_secs(10));
        let start = Instant::now();
        let first = ids.allocate(start).unwrap();
        ids.release(first, start);

        assert_eq!(ids.allocate(start + Duration::from_secs(5)), Some(SessionId(2)));
        assert_eq!(ids.cooling_down(), 1);
        assert_eq!(ids.allocate(start + Duration::from_secs(10)), Some(first));
        assert_eq!(ids.cooling_down(), 0);
    }

    #[test]
    fn test_rebind_limiter() {
        let mut limiter = RebindLimiter::new(Duration::from_secs(2));
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let start = Instant::now();

        assert!(limiter.allow(ip, start));
        assert!(!limiter.allow(ip, start + Duration::from_secs(1)));
        assert!(limiter.allow(other, start + Duration::from_secs(1)));
        assert!(limiter.allow(ip, start + Duration::from_secs(2)));

        limiter.prune(start + Duration::from_secs(10));
        assert_eq!(limiter.tracked(), 0);
    }

    #[test]
    fn test_first_close_reason_wins() {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 5000));
        let mut session = Session::new(
            SessionId(1),
            7,
            addr,
            9,
            MuxConfig::default(),
            Instant::now(),
        );
        assert!(session.begin_disconnect(CloseReason::Timeout));
        assert!(!session.begin_disconnect(CloseReason::Kicked));
        assert_eq!(session.close_reason, Some(CloseReason::Timeout));
        assert_eq!(session.state, SessionState::Disconnecting);
        assert_eq!(CloseReason::PeerDisconnect.to_string(), "peer_disconnect");
    }
}
