//! Datagram transport
//!
//! Owns the UDP socket. A receive task and a send task move raw datagrams
//! between the socket and two bounded queues; the tick loop only ever touches
//! the queues, so socket readiness never blocks a simulation step. The
//! transport knows nothing about sessions or packet contents.

use log::{debug, error, info, warn};
use shared::MAX_DATAGRAM_SIZE;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// Raw bytes plus the remote end they came from or go to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub addr: SocketAddr,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Counters updated by the socket tasks
#[derive(Debug, Default)]
pub struct TransportStats {
    pub received: AtomicU64,
    pub oversized: AtomicU64,
    pub empty: AtomicU64,
    pub inbound_dropped: AtomicU64,
    pub sent: AtomicU64,
    pub outbound_dropped: AtomicU64,
    pub send_failures: AtomicU64,
}

/// Plain copy of [`TransportStats`] at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportSnapshot {
    pub received: u64,
    pub oversized: u64,
    pub empty: u64,
    pub inbound_dropped: u64,
    pub sent: u64,
    pub outbound_dropped: u64,
    pub send_failures: u64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            received: self.received.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
            inbound_dropped: self.inbound_dropped.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            outbound_dropped: self.outbound_dropped.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

pub struct Transport {
    local_addr: SocketAddr,
    inbound_rx: mpsc::Receiver<Datagram>,
    outbound_tx: mpsc::Sender<Datagram>,
    stats: Arc<TransportStats>,
    receiver_task: JoinHandle<()>,
    sender_task: JoinHandle<()>,
}

impl Transport {
    /// Binds the socket and starts the I/O tasks. Bind failure is the only fatal error.
    pub async fn bind(
        addr: SocketAddr,
        inbound_capacity: usize,
        outbound_capacity: usize,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;
        info!("Listening on udp://{}", local_addr);

        let socket = Arc::new(socket);
        let stats = Arc::new(TransportStats::default());
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_capacity);

        let receiver_task = tokio::spawn(receive_loop(
            Arc::clone(&socket),
            inbound_tx,
            Arc::clone(&stats),
        ));
        let sender_task = tokio::spawn(send_loop(socket, outbound_rx, Arc::clone(&stats)));

        Ok(Self {
            local_addr,
            inbound_rx,
            outbound_tx,
            stats,
            receiver_task,
            sender_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queues a datagram for sending without waiting. A full queue drops it.
    pub fn send(&self, addr: SocketAddr, payload: Vec<u8>) {
        match self.outbound_tx.try_send(Datagram { addr, payload }) {
            Ok(()) => {}
            Err(TrySendError::Full(datagram)) => {
                self.stats.outbound_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Outbound queue full, dropping datagram to {}", datagram.addr);
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Next inbound datagram, or `None` when nothing is waiting
    pub fn receive(&mut self) -> Option<Datagram> {
        self.inbound_rx.try_recv().ok()
    }

    /// Takes every datagram currently waiting
    pub fn drain(&mut self) -> Vec<Datagram> {
        let mut datagrams = Vec::new();
        while let Some(datagram) = self.receive() {
            datagrams.push(datagram);
        }
        datagrams
    }

    pub fn stats(&self) -> TransportSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.receiver_task.abort();
        self.sender_task.abort();
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    inbound_tx: mpsc::Sender<Datagram>,
    stats: Arc<TransportStats>,
) {
    // Anything longer than the datagram limit is detected by filling past it
    let mut buffer = [0u8; 2048];

    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, addr)) => {
                stats.received.fetch_add(1, Ordering::Relaxed);
                if len == 0 {
                    stats.empty.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if len > MAX_DATAGRAM_SIZE {
                    stats.oversized.fetch_add(1, Ordering::Relaxed);
                    debug!("Dropping {} byte datagram from {}", len, addr);
                    continue;
                }

                let datagram = Datagram {
                    addr,
                    payload: buffer[..len].to_vec(),
                };
                match inbound_tx.try_send(datagram) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        stats.inbound_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            Err(e) => {
                // ICMP port unreachable surfaces here on some platforms
                warn!("Error receiving datagram: {}", e);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    mut outbound_rx: mpsc::Receiver<Datagram>,
    stats: Arc<TransportStats>,
) {
    while let Some(datagram) = outbound_rx.recv().await {
        match socket.send_to(&datagram.payload, datagram.addr).await {
            Ok(_) => {
                stats.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.send_failures.fetch_add(1, Ordering::Relaxed);
                error!("Failed to send datagram to {}: {}", datagram.addr, e);
            }
        }
    }
}
