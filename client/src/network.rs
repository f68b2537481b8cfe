use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{
    decode, encode, ChannelKind, DenyReason, EncodeError, Multiplexer, MuxConfig, MuxStats,
    Packet, PacketBody, SendError, SessionId, SessionTag, MAX_DATAGRAM_SIZE,
};
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub mux: MuxConfig,
    /// Delay between connection request retries
    pub request_interval: Duration,
    pub keepalive_interval: Duration,
    /// Silence from the server after which the client gives up
    pub idle_timeout: Duration,
    /// Probability of discarding each inbound datagram, for testing under loss
    pub simulated_loss: f64,
    /// Seed for nonces and simulated loss; random when `None`
    pub seed: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mux: MuxConfig::default(),
            request_interval: Duration::from_millis(250),
            keepalive_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(5),
            simulated_loss: 0.0,
            seed: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("connection denied: {0}")]
    Denied(DenyReason),
    #[error("timed out waiting for the server")]
    Timeout,
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Send(#[from] SendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server sent a disconnect
    Server,
    /// Nothing heard from the server within the idle timeout
    Timeout,
    /// A reliable packet went unacknowledged for its whole attempt budget
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Message {
        channel: ChannelKind,
        payload: Vec<u8>,
    },
    Disconnected(DisconnectReason),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub received: u64,
    pub simulated_drops: u64,
    pub malformed: u64,
    pub foreign: u64,
}

/// Headless client endpoint speaking the server's protocol
pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    config: ClientConfig,
    rng: StdRng,
    tag: Option<SessionTag>,
    connected: bool,
    mux: Multiplexer,
    last_sent: Instant,
    last_received: Instant,
    events: VecDeque<ClientEvent>,
    stats: ClientStats,
}

impl Client {
    pub async fn new(server_addr: SocketAddr, config: ClientConfig) -> Result<Self, ClientError> {
        let bind_addr: SocketAddr = if server_addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let now = Instant::now();

        Ok(Client {
            socket,
            server_addr,
            mux: Multiplexer::new(config.mux.clone()),
            config,
            rng,
            tag: None,
            connected: false,
            last_sent: now,
            last_received: now,
            events: VecDeque::new(),
            stats: ClientStats::default(),
        })
    }

    /// Runs the handshake, retrying the request until accepted, denied or out of time
    pub async fn connect(&mut self, within: Duration) -> Result<SessionId, ClientError> {
        info!("Connecting to {}...", self.server_addr);
        let nonce: u64 = self.rng.gen();
        let deadline = Instant::now() + within;
        let mut buffer = [0u8; 2048];

        while Instant::now() < deadline {
            self.send_packet(&Packet::new(None, PacketBody::ConnectionRequest { nonce }))
                .await?;

            let retry_at = (Instant::now() + self.config.request_interval).min(deadline);
            while let Some(wait) = retry_at.checked_duration_since(Instant::now()) {
                let Ok(received) = timeout(wait, self.socket.recv_from(&mut buffer)).await else {
                    break;
                };
                let (len, from) = received?;
                if from != self.server_addr {
                    continue;
                }
                let Ok(packet) = decode(&buffer[..len]) else {
                    continue;
                };
                match packet.body {
                    PacketBody::ConnectionAccepted { session, nonce: echoed } if echoed == nonce => {
                        info!("Connected as {}", session.id);
                        let now = Instant::now();
                        self.tag = Some(session);
                        self.connected = true;
                        self.last_received = now;
                        // Any tagged packet completes the handshake on the server
                        self.send_packet(&Packet::new(Some(session), PacketBody::KeepAlive))
                            .await?;
                        return Ok(session.id);
                    }
                    PacketBody::ConnectionDenied { reason } => {
                        warn!("Connection denied: {}", reason);
                        return Err(ClientError::Denied(reason));
                    }
                    _ => {}
                }
            }
        }
        Err(ClientError::Timeout)
    }

    /// Queues a message for the next [`update`](Self::update)
    pub fn send(&mut self, channel: ChannelKind, payload: &[u8]) -> Result<(), ClientError> {
        if !self.connected {
            return Err(ClientError::NotConnected);
        }
        self.mux.send(channel, payload)?;
        Ok(())
    }

    /// Waits up to `wait` for traffic, processes everything that arrived,
    /// then transmits pending packets, retransmissions and keep-alives.
    pub async fn update(&mut self, wait: Duration) -> Result<(), ClientError> {
        if !self.connected {
            return Ok(());
        }

        let mut buffer = [0u8; 2048];
        if let Ok(received) = timeout(wait, self.socket.recv_from(&mut buffer)).await {
            let (len, from) = received?;
            self.handle_datagram(from, &buffer[..len], Instant::now()).await?;
        }
        loop {
            match self.socket.try_recv_from(&mut buffer) {
                Ok((len, from)) => {
                    self.handle_datagram(from, &buffer[..len], Instant::now())
                        .await?
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        if !self.connected {
            return Ok(());
        }
        let now = Instant::now();
        if now.duration_since(self.last_received) >= self.config.idle_timeout {
            warn!("Server silent for {:?}, giving up", self.config.idle_timeout);
            self.drop_connection(DisconnectReason::Timeout);
            return Ok(());
        }
        self.transmit(now).await
    }

    async fn transmit(&mut self, now: Instant) -> Result<(), ClientError> {
        let bodies = match self.mux.poll_transmit(now) {
            Ok(bodies) => bodies,
            Err(e) => {
                warn!("Server unreachable: {}", e);
                self.drop_connection(DisconnectReason::Unreachable);
                return Ok(());
            }
        };

        if bodies.is_empty() {
            if now.duration_since(self.last_sent) >= self.config.keepalive_interval {
                self.send_packet(&Packet::new(self.tag, PacketBody::KeepAlive))
                    .await?;
            }
            return Ok(());
        }
        for body in bodies {
            self.send_packet(&Packet::new(self.tag, body)).await?;
        }
        Ok(())
    }

    async fn handle_datagram(
        &mut self,
        from: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) -> Result<(), ClientError> {
        if from != self.server_addr {
            self.stats.foreign += 1;
            return Ok(());
        }
        if self.config.simulated_loss > 0.0 && self.rng.gen_bool(self.config.simulated_loss) {
            self.stats.simulated_drops += 1;
            return Ok(());
        }
        let packet = match decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.malformed += 1;
                debug!("Dropping datagram: {}", e);
                return Ok(());
            }
        };
        if packet.header.session != self.tag || !self.connected {
            return Ok(());
        }

        self.stats.received += 1;
        self.last_received = now;
        match packet.body {
            PacketBody::Payload(payload) => {
                self.mux.receive_payload(payload);
                for delivery in self.mux.drain_delivered() {
                    self.events.push_back(ClientEvent::Message {
                        channel: delivery.channel,
                        payload: delivery.payload,
                    });
                }
            }
            PacketBody::Ack { channel, ack } => self.mux.receive_ack(channel, ack),
            PacketBody::Disconnect => {
                info!("Disconnected by server");
                self.send_packet(&Packet::new(self.tag, PacketBody::DisconnectAck))
                    .await?;
                self.drop_connection(DisconnectReason::Server);
            }
            _ => {}
        }
        Ok(())
    }

    /// Tells the server we are leaving. Best effort: nothing is awaited.
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        if !self.connected {
            return Ok(());
        }
        self.send_packet(&Packet::new(self.tag, PacketBody::Disconnect))
            .await?;
        self.connected = false;
        self.mux.abandon();
        info!("Disconnected");
        Ok(())
    }

    fn drop_connection(&mut self, reason: DisconnectReason) {
        self.connected = false;
        self.mux.abandon();
        self.events.push_back(ClientEvent::Disconnected(reason));
    }

    async fn send_packet(&mut self, packet: &Packet) -> Result<(), ClientError> {
        let data = encode(packet)?;
        debug_assert!(data.len() <= MAX_DATAGRAM_SIZE);
        self.socket.send_to(&data, self.server_addr).await?;
        self.last_sent = Instant::now();
        Ok(())
    }

    pub fn poll_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        self.events.drain(..).collect()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.tag.map(|tag| tag.id)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    pub fn mux_stats(&self) -> &MuxStats {
        self.mux.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    async fn fake_server() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    async fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buffer = [0u8; 2048];
        let (len, from) = timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        (decode(&buffer[..len]).unwrap(), from)
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (_server, addr) = fake_server().await;
        let mut client = Client::new(addr, ClientConfig::default()).await.unwrap();
        assert!(matches!(
            client.send(ChannelKind::ReliableOrdered, b"x"),
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_times_out_without_server() {
        let (_server, addr) = fake_server().await;
        let config = ClientConfig {
            request_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let mut client = Client::new(addr, config).await.unwrap();
        let result = client.connect(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ClientError::Timeout)));
    }

    #[tokio::test]
    async fn test_denied_connection() {
        let (server, addr) = fake_server().await;
        let mut client = Client::new(addr, ClientConfig::default()).await.unwrap();

        let responder = tokio::spawn(async move {
            let (_, from) = recv_packet(&server).await;
            let deny = Packet::new(
                None,
                PacketBody::ConnectionDenied {
                    reason: DenyReason::ServerFull,
                },
            );
            server.send_to(&encode(&deny).unwrap(), from).await.unwrap();
        });

        let result = client.connect(Duration::from_secs(2)).await;
        assert!(matches!(
            result,
            Err(ClientError::Denied(DenyReason::ServerFull))
        ));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_disconnect_is_acknowledged() {
        let (server, addr) = fake_server().await;
        let mut client = Client::new(addr, ClientConfig::default()).await.unwrap();
        let tag = SessionTag {
            id: SessionId(1),
            token: 99,
        };

        let responder = tokio::spawn(async move {
            let (request, from) = recv_packet(&server).await;
            let PacketBody::ConnectionRequest { nonce } = request.body else {
                panic!("expected request");
            };
            let accept = Packet::new(
                Some(tag),
                PacketBody::ConnectionAccepted {
                    session: tag,
                    nonce,
                },
            );
            server.send_to(&encode(&accept).unwrap(), from).await.unwrap();

            let (keepalive, _) = recv_packet(&server).await;
            assert_eq!(keepalive.header.session, Some(tag));

            let disconnect = Packet::new(Some(tag), PacketBody::Disconnect);
            server
                .send_to(&encode(&disconnect).unwrap(), from)
                .await
                .unwrap();
            let (ack, _) = recv_packet(&server).await;
            assert_eq!(ack.body, PacketBody::DisconnectAck);
        });

        let session = assert_ok!(client.connect(Duration::from_secs(2)).await);
        assert_eq!(session, SessionId(1));
        while client.is_connected() {
            assert_ok!(client.update(Duration::from_millis(50)).await);
        }
        assert_eq!(
            client.drain_events(),
            vec![ClientEvent::Disconnected(DisconnectReason::Server)]
        );
        responder.await.unwrap();
    }
}
