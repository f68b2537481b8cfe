use clap::Parser;
use client::network::{Client, ClientConfig, ClientEvent};
use log::{info, warn};
use shared::{ChannelKind, TickSnapshot};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short, long, default_value = "127.0.0.1:7777")]
    server: SocketAddr,

    /// Seconds to stay connected
    #[arg(short, long, default_value = "10")]
    duration: u64,

    /// Fraction of inbound datagrams to drop, between 0 and 1
    #[arg(short, long, default_value = "0.0")]
    loss: f64,

    /// Reliable message sent right after joining
    #[arg(short, long, default_value = "join")]
    message: String,
}

#[derive(Debug, Default)]
struct ProbeReport {
    snapshots: u64,
    out_of_order: u64,
    last_tick: Option<u64>,
    reliable: u64,
}

impl ProbeReport {
    fn record(&mut self, channel: ChannelKind, payload: &[u8]) {
        match channel {
            ChannelKind::Unreliable => match TickSnapshot::from_bytes(payload) {
                Ok(snapshot) => {
                    if self.last_tick.is_some_and(|last| snapshot.tick <= last) {
                        self.out_of_order += 1;
                    }
                    self.last_tick = Some(snapshot.tick);
                    self.snapshots += 1;
                }
                Err(e) => warn!("Undecodable snapshot: {}", e),
            },
            _ => self.reliable += 1,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = ClientConfig {
        simulated_loss: args.loss.clamp(0.0, 1.0),
        ..Default::default()
    };

    let mut client = Client::new(args.server, config).await?;
    let session = client.connect(Duration::from_secs(5)).await?;
    client.send(ChannelKind::ReliableOrdered, args.message.as_bytes())?;

    let mut report = ProbeReport::default();
    let deadline = Instant::now() + Duration::from_secs(args.duration);
    'probe: while Instant::now() < deadline {
        client.update(Duration::from_millis(16)).await?;
        while let Some(event) = client.poll_event() {
            match event {
                ClientEvent::Message { channel, payload } => report.record(channel, &payload),
                ClientEvent::Disconnected(reason) => {
                    warn!("Lost session {}: {:?}", session, reason);
                    break 'probe;
                }
            }
        }
    }
    client.disconnect().await?;

    info!(
        "{}: {} snapshots (last tick {:?}, {} out of order), {} reliable messages, {} simulated drops",
        session,
        report.snapshots,
        report.last_tick,
        report.out_of_order,
        report.reliable,
        client.stats().simulated_drops
    );
    let mux = client.mux_stats();
    info!(
        "Channels: {} packets sent, {} retransmits, {} dropped",
        mux.packets_sent,
        mux.retransmits,
        mux.dropped()
    );

    Ok(())
}
