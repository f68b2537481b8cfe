//! Server runtime tying the transport to the tick scheduler

use crate::config::{ConfigError, ServerConfig};
use crate::scheduler::{Simulation, TickScheduler};
use crate::session_manager::SessionManager;
use crate::transport::{Transport, TransportError, TransportSnapshot};
use log::{debug, info};
use std::net::SocketAddr;
use std::time::Instant;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Main server: one socket, one session table, one simulation
pub struct Server<S> {
    transport: Transport,
    scheduler: TickScheduler<S>,
    tick_rate: u64,
}

impl<S: Simulation> Server<S> {
    /// Validates the configuration and binds the socket
    pub async fn bind(config: ServerConfig, simulation: S) -> Result<Self, ServerError> {
        config.validate()?;
        let transport =
            Transport::bind(config.bind_addr, config.inbound_queue, config.outbound_queue).await?;

        let tick_rate = config.tick_rate as u64;
        let tick_duration = config.tick_duration();
        let scheduler = TickScheduler::new(SessionManager::new(config), simulation, tick_duration);

        Ok(Self {
            transport,
            scheduler,
            tick_rate,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Runs one tick against whatever the transport has queued
    pub fn tick(&mut self, now: Instant) {
        let inbound = self.transport.drain();
        for datagram in self.scheduler.run_tick(now, inbound) {
            self.transport.send(datagram.addr, datagram.payload);
        }

        if self.scheduler.tick() % self.tick_rate == 0 {
            self.log_summary();
        }
    }

    /// Ticks at the configured rate forever. Late ticks are skipped, not bunched.
    pub async fn run(&mut self) {
        let mut ticker = interval(self.scheduler.tick_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Server running at {} Hz on {}",
            self.tick_rate,
            self.local_addr()
        );

        loop {
            ticker.tick().await;
            self.tick(Instant::now());
        }
    }

    pub fn scheduler(&self) -> &TickScheduler<S> {
        &self.scheduler
    }

    pub fn simulation(&self) -> &S {
        self.scheduler.simulation()
    }

    pub fn transport_stats(&self) -> TransportSnapshot {
        self.transport.stats()
    }

    fn log_summary(&self) {
        let ticks = self.scheduler.stats();
        let sessions = self.scheduler.sessions();
        let session_stats = sessions.stats();
        let mux = sessions.mux_stats();
        let transport = self.transport.stats();
        debug!(
            "Tick {}: {} sessions, worst tick {:.2}ms, {} overruns | rx {} tx {} dropped {} | \
             delivered {} retransmits {} duplicates {} stale {} | malformed {} violations {} refused {}",
            self.scheduler.tick(),
            sessions.len(),
            ticks.worst_tick.as_secs_f64() * 1000.0,
            ticks.overruns,
            transport.received,
            transport.sent,
            transport.oversized + transport.inbound_dropped + transport.outbound_dropped,
            mux.messages_delivered,
            mux.retransmits,
            mux.duplicates,
            mux.stale,
            session_stats.malformed,
            session_stats.protocol_violations,
            session_stats.refused,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Outbox;
    use shared::{decode, encode, ChannelKind, Packet, PacketBody, SessionId};
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio_test::assert_ok;

    #[derive(Default)]
    struct Idle;

    impl Simulation for Idle {
        fn on_message(&mut self, _: SessionId, _: ChannelKind, _: &[u8]) {}
        fn step(&mut self, _: u64, _: Duration, _: &mut Outbox) {}
    }

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_refused_before_bind() {
        let config = ServerConfig {
            tick_rate: 0,
            ..local_config()
        };
        let result = Server::bind(config, Idle).await;
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_handshake_over_loopback() {
        let mut server = assert_ok!(Server::bind(local_config(), Idle).await);
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = encode(&Packet::new(None, PacketBody::ConnectionRequest { nonce: 5 })).unwrap();
        client.send_to(&request, server.local_addr()).await.unwrap();

        let mut buffer = [0u8; 1500];
        let reply = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                server.tick(Instant::now());
                if let Ok(Ok((len, _))) =
                    tokio::time::timeout(Duration::from_millis(20), client.recv_from(&mut buffer))
                        .await
                {
                    return decode(&buffer[..len]).unwrap();
                }
            }
        })
        .await
        .unwrap();

        match reply.body {
            PacketBody::ConnectionAccepted { session, nonce } => {
                assert_eq!(session.id, SessionId(1));
                assert_eq!(nonce, 5);
            }
            other => panic!("expected accept, got {:?}", other),
        }
        assert_eq!(server.scheduler().sessions().len(), 1);
        assert!(server.transport_stats().received >= 1);
    }
}
