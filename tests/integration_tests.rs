//! Integration tests running the server and headless clients over loopback UDP
//!
//! Each test starts a real server on an ephemeral port, drives it from a
//! background task at its configured tick rate, and talks to it through
//! `client::network::Client` or a raw socket.

use client::network::{Client, ClientConfig, ClientError, ClientEvent, DisconnectReason};
use server::config::ServerConfig;
use server::network::Server;
use server::scheduler::{Outbox, Simulation};
use server::session::CloseReason;
use shared::{
    encode, ChannelKind, DenyReason, Packet, PacketBody, SessionId, SessionTag, TickSnapshot,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_test::assert_ok;

#[derive(Debug, Default)]
struct Record {
    established: Vec<SessionId>,
    messages: Vec<(SessionId, ChannelKind, Vec<u8>)>,
    closed: Vec<(SessionId, CloseReason, Instant)>,
}

/// Records every callback. Messages starting with `echo:` are sent back to
/// their sender; `kick` disconnects the sender.
#[derive(Default)]
struct RecordingSimulation {
    record: Arc<Mutex<Record>>,
    live: Vec<SessionId>,
    replies: Vec<(SessionId, Vec<u8>)>,
    kicks: Vec<SessionId>,
}

impl Simulation for RecordingSimulation {
    fn on_session_established(&mut self, session: SessionId) {
        self.live.push(session);
        self.record.lock().unwrap().established.push(session);
    }

    fn on_session_closed(&mut self, session: SessionId, reason: CloseReason) {
        self.live.retain(|id| *id != session);
        self.record
            .lock()
            .unwrap()
            .closed
            .push((session, reason, Instant::now()));
    }

    fn on_message(&mut self, session: SessionId, channel: ChannelKind, payload: &[u8]) {
        if payload.starts_with(b"echo:") {
            self.replies.push((session, payload.to_vec()));
        } else if payload == b"kick" {
            self.kicks.push(session);
        }
        self.record
            .lock()
            .unwrap()
            .messages
            .push((session, channel, payload.to_vec()));
    }

    fn step(&mut self, tick: u64, _dt: Duration, outbox: &mut Outbox) {
        if self.live.is_empty() {
            return;
        }
        let snapshot = TickSnapshot {
            tick,
            sessions: self.live.clone(),
        };
        outbox.broadcast(ChannelKind::Unreliable, snapshot.to_bytes().unwrap());
        for (session, payload) in self.replies.drain(..) {
            outbox.send_to(session, ChannelKind::ReliableOrdered, payload);
        }
        for session in self.kicks.drain(..) {
            outbox.disconnect(session);
        }
    }
}

struct RunningServer {
    addr: SocketAddr,
    record: Arc<Mutex<Record>>,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Server<RecordingSimulation>>,
}

impl RunningServer {
    async fn start(config: ServerConfig) -> Self {
        let simulation = RecordingSimulation::default();
        let record = simulation.record.clone();
        let mut server = Server::bind(config, simulation).await.unwrap();
        let addr = server.local_addr();
        let (stop, mut stopped) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(server.scheduler().tick_duration());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => server.tick(Instant::now()),
                    _ = &mut stopped => return server,
                }
            }
        });

        Self {
            addr,
            record,
            stop,
            handle,
        }
    }

    async fn stop(self) -> Server<RecordingSimulation> {
        let _ = self.stop.send(());
        self.handle.await.unwrap()
    }

    async fn wait_for(&self, within: Duration, condition: impl Fn(&Record) -> bool) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if condition(&self.record.lock().unwrap()) {
                return true;
            }
            sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

fn local_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    }
}

fn client_config(loss: f64, seed: u64) -> ClientConfig {
    ClientConfig {
        simulated_loss: loss,
        seed: Some(seed),
        ..Default::default()
    }
}

/// Updates the client until `done` holds for the collected events or time runs out
async fn pump_until(
    client: &mut Client,
    within: Duration,
    done: impl Fn(&[ClientEvent]) -> bool,
) -> Vec<ClientEvent> {
    let deadline = Instant::now() + within;
    let mut events = Vec::new();
    while Instant::now() < deadline {
        client.update(Duration::from_millis(5)).await.unwrap();
        events.extend(client.drain_events());
        if done(&events) {
            break;
        }
    }
    events
}

fn snapshot_ticks(events: &[ClientEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|event| match event {
            ClientEvent::Message {
                channel: ChannelKind::Unreliable,
                payload,
            } => Some(TickSnapshot::from_bytes(payload).unwrap().tick),
            _ => None,
        })
        .collect()
}

fn reliable_payloads(events: &[ClientEvent]) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|event| match event {
            ClientEvent::Message {
                channel: ChannelKind::ReliableOrdered,
                payload,
            } => Some(payload.clone()),
            _ => None,
        })
        .collect()
}

/// SESSION LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    /// Join, exchange traffic under 10% inbound loss, then leave
    #[tokio::test]
    async fn full_session_under_loss() {
        let server = RunningServer::start(local_config()).await;
        let mut client = Client::new(server.addr, client_config(0.1, 7)).await.unwrap();

        let id = assert_ok!(client.connect(Duration::from_secs(2)).await);
        assert_eq!(id, SessionId(1));

        client.send(ChannelKind::ReliableOrdered, b"join").unwrap();
        let expected: Vec<Vec<u8>> = (0..20)
            .map(|i| format!("echo:{}", i).into_bytes())
            .collect();
        for payload in &expected {
            client.send(ChannelKind::ReliableOrdered, payload).unwrap();
        }

        let events = pump_until(&mut client, Duration::from_secs(5), |events| {
            reliable_payloads(events).len() == expected.len() && snapshot_ticks(events).len() >= 30
        })
        .await;

        assert_eq!(reliable_payloads(&events), expected);

        let ticks = snapshot_ticks(&events);
        assert!(ticks.len() >= 30, "only {} snapshots arrived", ticks.len());
        assert!(ticks.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(client.stats().simulated_drops > 0);

        {
            let record = server.record.lock().unwrap();
            assert_eq!(record.established, vec![SessionId(1)]);
            let joins = record
                .messages
                .iter()
                .filter(|(session, channel, payload)| {
                    *session == SessionId(1)
                        && *channel == ChannelKind::ReliableOrdered
                        && payload == b"join"
                })
                .count();
            assert_eq!(joins, 1);
            assert_eq!(record.messages.len(), 1 + expected.len());
        }

        let left_at = Instant::now();
        client.disconnect().await.unwrap();
        assert!(
            server
                .wait_for(Duration::from_secs(1), |record| !record.closed.is_empty())
                .await
        );
        let (session, reason, closed_at) = server.record.lock().unwrap().closed[0];
        assert_eq!(session, SessionId(1));
        assert_eq!(reason, CloseReason::PeerDisconnect);
        assert!(closed_at.duration_since(left_at) < Duration::from_millis(250));

        let server = server.stop().await;
        assert!(server.scheduler().sessions().is_empty());
        assert_eq!(server.scheduler().sessions().stats().closed, 1);
    }

    /// The simulation disconnects a session and the client hears about it
    #[tokio::test]
    async fn kicked_session_receives_disconnect() {
        let server = RunningServer::start(local_config()).await;
        let mut client = Client::new(server.addr, client_config(0.0, 1)).await.unwrap();
        assert_ok!(client.connect(Duration::from_secs(2)).await);

        assert_ok!(client.send(ChannelKind::ReliableUnordered, b"kick"));
        let events = pump_until(&mut client, Duration::from_secs(2), |events| {
            events
                .iter()
                .any(|event| matches!(event, ClientEvent::Disconnected(_)))
        })
        .await;

        assert!(events.contains(&ClientEvent::Disconnected(DisconnectReason::Server)));
        assert!(!client.is_connected());
        assert!(
            server
                .wait_for(Duration::from_secs(1), |record| !record.closed.is_empty())
                .await
        );
        assert_eq!(server.record.lock().unwrap().closed[0].1, CloseReason::Kicked);
        server.stop().await;
    }

    /// Capacity counts handshakes; a closed session frees its slot but not its id
    #[tokio::test]
    async fn server_full_denies_then_admits() {
        let config = ServerConfig {
            max_sessions: 1,
            ..local_config()
        };
        let server = RunningServer::start(config).await;

        let mut first = Client::new(server.addr, client_config(0.0, 1)).await.unwrap();
        assert_eq!(
            first.connect(Duration::from_secs(2)).await.unwrap(),
            SessionId(1)
        );

        let mut second = Client::new(server.addr, client_config(0.0, 2)).await.unwrap();
        let denied = second.connect(Duration::from_secs(2)).await;
        assert!(matches!(
            denied,
            Err(ClientError::Denied(DenyReason::ServerFull))
        ));

        first.disconnect().await.unwrap();
        assert!(
            server
                .wait_for(Duration::from_secs(1), |record| record.closed.len() == 1)
                .await
        );

        assert_eq!(
            second.connect(Duration::from_secs(2)).await.unwrap(),
            SessionId(2)
        );

        let server = server.stop().await;
        assert!(server.scheduler().sessions().stats().refused >= 1);
    }
}

/// HOSTILE INPUT TESTS
mod hostile_input_tests {
    use super::*;

    /// Garbage, empty and forged datagrams are dropped without disturbing real peers
    #[tokio::test]
    async fn malformed_datagrams_are_counted_and_ignored() {
        let server = RunningServer::start(local_config()).await;
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        raw.send_to(b"", server.addr).await.unwrap();
        raw.send_to(b"definitely not a packet", server.addr)
            .await
            .unwrap();
        raw.send_to(&[0xff; 1500], server.addr).await.unwrap();
        let forged = Packet::new(
            Some(SessionTag {
                id: SessionId(1),
                token: 0,
            }),
            PacketBody::KeepAlive,
        );
        raw.send_to(&encode(&forged).unwrap(), server.addr)
            .await
            .unwrap();

        let mut client = Client::new(server.addr, client_config(0.0, 3)).await.unwrap();
        assert_eq!(
            client.connect(Duration::from_secs(2)).await.unwrap(),
            SessionId(1)
        );
        client.send(ChannelKind::ReliableOrdered, b"hello").unwrap();
        pump_until(&mut client, Duration::from_millis(300), |_| false).await;

        let server = server.stop().await;
        let transport = server.transport_stats();
        assert_eq!(transport.empty, 1);
        assert_eq!(transport.oversized, 1);

        let sessions = server.scheduler().sessions();
        assert_eq!(sessions.stats().malformed, 1);
        assert_eq!(sessions.stats().protocol_violations, 1);
        assert_eq!(sessions.established(), vec![SessionId(1)]);

        let record = server.simulation().record.lock().unwrap();
        assert_eq!(record.established, vec![SessionId(1)]);
        assert_eq!(record.messages.len(), 1);
    }
}
