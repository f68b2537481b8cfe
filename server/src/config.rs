//! Server configuration
//!
//! All timing and capacity knobs of the engine live here. The binary maps its
//! command-line flags onto a [`ServerConfig`]; tests build one directly with
//! struct update syntax over [`ServerConfig::default`].

use shared::channel::RECEIVE_WINDOW;
use shared::{MuxConfig, DEFAULT_PORT, MAX_DATAGRAM_SIZE, PACKET_OVERHEAD};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

/// Tunables for one server instance
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the UDP socket binds to
    pub bind_addr: SocketAddr,
    /// Simulation steps per second
    pub tick_rate: u32,
    /// Handshaking plus established sessions allowed at once
    pub max_sessions: usize,
    /// How long a session may stay in the handshake before it is dropped
    pub handshake_timeout: Duration,
    /// Interval between repeated connection accepts during the handshake
    pub handshake_resend_interval: Duration,
    /// Silence after which an established session is timed out
    pub idle_timeout: Duration,
    /// Outbound silence after which a keep-alive is sent
    pub keepalive_interval: Duration,
    /// Time a released session id waits before it can be handed out again
    pub session_cooldown: Duration,
    /// Minimum time between address rebinds, per session and per source IP
    pub rebind_interval: Duration,
    /// Capacity of the transport's inbound datagram queue
    pub inbound_queue: usize,
    /// Capacity of the transport's outbound datagram queue
    pub outbound_queue: usize,
    /// Channel tuning applied to every session
    pub mux: MuxConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            tick_rate: 60,
            max_sessions: 64,
            handshake_timeout: Duration::from_secs(5),
            handshake_resend_interval: Duration::from_millis(250),
            idle_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(1),
            session_cooldown: Duration::from_secs(10),
            rebind_interval: Duration::from_secs(2),
            inbound_queue: 8192,
            outbound_queue: 8192,
            mux: MuxConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("tick rate must be between 1 and 1000, got {0}")]
    TickRate(u32),
    #[error("max sessions must be at least 1")]
    NoSessions,
    #[error("fragment size {fragment_size} plus packet overhead exceeds {limit} bytes")]
    FragmentSize { fragment_size: usize, limit: usize },
    #[error("message ceiling {0} is smaller than one fragment")]
    MessageCeiling(usize),
    #[error("in-flight window {window} exceeds the receive window of {limit}")]
    InFlightWindow { window: u64, limit: u64 },
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("keep-alive interval must be shorter than the idle timeout")]
    KeepAlive,
    #[error("{name} of {value:?} exceeds the {limit:?} ceiling")]
    TooLong {
        name: &'static str,
        value: Duration,
        limit: Duration,
    },
}

/// Ceiling for retransmission and keep-alive intervals
pub const MAX_INTERVAL: Duration = Duration::from_secs(60);
/// Ceiling for timeouts and cooldowns
pub const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

impl ServerConfig {
    /// Fixed duration of one simulation step
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    /// Rejects values that would break the engine's invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return Err(ConfigError::TickRate(self.tick_rate));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::NoSessions);
        }

        let mux = &self.mux;
        if mux.fragment_size == 0 {
            return Err(ConfigError::Zero("fragment size"));
        }
        if mux.fragment_size + PACKET_OVERHEAD > MAX_DATAGRAM_SIZE {
            return Err(ConfigError::FragmentSize {
                fragment_size: mux.fragment_size,
                limit: MAX_DATAGRAM_SIZE,
            });
        }
        if mux.max_message_size < mux.fragment_size {
            return Err(ConfigError::MessageCeiling(mux.max_message_size));
        }
        // Fragment counts travel as u16
        if mux.max_message_size.div_ceil(mux.fragment_size) > u16::MAX as usize {
            return Err(ConfigError::MessageCeiling(mux.max_message_size));
        }
        if mux.max_in_flight == 0 {
            return Err(ConfigError::Zero("in-flight window"));
        }
        if mux.max_in_flight > RECEIVE_WINDOW {
            return Err(ConfigError::InFlightWindow {
                window: mux.max_in_flight,
                limit: RECEIVE_WINDOW,
            });
        }
        if mux.max_resend_attempts == 0 {
            return Err(ConfigError::Zero("resend attempts"));
        }
        if mux.resend_base.is_zero() {
            return Err(ConfigError::Zero("resend base"));
        }
        if mux.max_unreliable_partials == 0 {
            return Err(ConfigError::Zero("unreliable reassembly slots"));
        }
        if self.inbound_queue == 0 || self.outbound_queue == 0 {
            return Err(ConfigError::Zero("queue capacity"));
        }
        // Timers are added to `Instant`s every tick and must not overflow
        let timers = [
            ("resend base", mux.resend_base, MAX_INTERVAL),
            ("resend max", mux.resend_max, MAX_INTERVAL),
            ("keep-alive interval", self.keepalive_interval, MAX_INTERVAL),
            ("handshake resend interval", self.handshake_resend_interval, MAX_INTERVAL),
            ("handshake timeout", self.handshake_timeout, MAX_TIMEOUT),
            ("idle timeout", self.idle_timeout, MAX_TIMEOUT),
            ("session cooldown", self.session_cooldown, MAX_TIMEOUT),
            ("rebind interval", self.rebind_interval, MAX_TIMEOUT),
        ];
        for (name, value, limit) in timers {
            if value > limit {
                return Err(ConfigError::TooLong { name, value, limit });
            }
        }
        if self.keepalive_interval >= self.idle_timeout {
            return Err(ConfigError::KeepAlive);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 7777);
        assert_eq!(config.max_sessions, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tick_duration() {
        let config = ServerConfig {
            tick_rate: 60,
            ..Default::default()
        };
        assert_approx_eq!(config.tick_duration().as_secs_f64(), 1.0 / 60.0, 1e-9);

        let config = ServerConfig {
            tick_rate: 20,
            ..Default::default()
        };
        assert_approx_eq!(config.tick_duration().as_secs_f64(), 0.05, 1e-9);
    }

    #[test]
    fn test_fragment_size_must_fit_datagram() {
        let mut config = ServerConfig::default();
        config.mux.fragment_size = MAX_DATAGRAM_SIZE - PACKET_OVERHEAD;
        assert!(config.validate().is_ok());

        config.mux.fragment_size += 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::FragmentSize { .. })
        ));
    }

    #[test]
    fn test_rejects_inconsistent_values() {
        let config = ServerConfig {
            tick_rate: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::TickRate(0)));

        let config = ServerConfig {
            keepalive_interval: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::KeepAlive));

        let mut config = ServerConfig::default();
        config.mux.max_in_flight = RECEIVE_WINDOW + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InFlightWindow { .. })
        ));

        let mut config = ServerConfig::default();
        config.mux.max_message_size = 16;
        assert_eq!(config.validate(), Err(ConfigError::MessageCeiling(16)));
    }

    #[test]
    fn test_rejects_timers_that_overflow_instants() {
        let mut config = ServerConfig::default();
        config.mux.resend_base = Duration::from_millis(u64::MAX);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooLong {
                name: "resend base",
                ..
            })
        ));

        let mut config = ServerConfig::default();
        config.mux.resend_max = MAX_INTERVAL + Duration::from_millis(1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooLong {
                name: "resend max",
                ..
            })
        ));

        let config = ServerConfig {
            keepalive_interval: Duration::from_secs(u64::MAX),
            idle_timeout: Duration::from_secs(u64::MAX),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooLong {
                name: "keep-alive interval",
                ..
            })
        ));

        let mut config = ServerConfig::default();
        config.mux.resend_max = MAX_INTERVAL;
        config.session_cooldown = MAX_TIMEOUT;
        assert!(config.validate().is_ok());
    }
}
