use clap::Parser;
use log::info;
use server::config::ServerConfig;
use server::echo::EchoSimulation;
use server::network::Server;
use shared::{MuxConfig, DEFAULT_PORT};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// IP address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// UDP port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Simulation ticks per second
    #[arg(short, long, default_value = "60")]
    tick_rate: u32,

    /// Maximum concurrent sessions, handshakes included
    #[arg(short, long, default_value = "64")]
    max_clients: usize,

    /// Seconds a handshake may stay incomplete
    #[arg(long, default_value = "5")]
    handshake_timeout: u64,

    /// Milliseconds between re-sent connection accepts
    #[arg(long, default_value = "250")]
    handshake_resend_ms: u64,

    /// Seconds of silence before a session is dropped
    #[arg(long, default_value = "5")]
    idle_timeout: u64,

    /// Milliseconds without outbound traffic before a keep-alive is sent
    #[arg(long, default_value = "1000")]
    keepalive_ms: u64,

    /// Seconds before a released session id may be reused
    #[arg(long, default_value = "10")]
    session_cooldown: u64,

    /// Milliseconds a session or source IP must wait between address changes
    #[arg(long, default_value = "2000")]
    rebind_interval_ms: u64,

    /// Capacity of each of the inbound and outbound datagram queues
    #[arg(long, default_value = "8192")]
    queue_capacity: usize,

    /// Largest payload per packet in bytes
    #[arg(long, default_value = "1024")]
    fragment_size: usize,

    /// Largest message in bytes
    #[arg(long, default_value = "65536")]
    max_message_size: usize,

    /// Initial retransmission delay in milliseconds
    #[arg(long, default_value = "100")]
    resend_base_ms: u64,

    /// Cap on the retransmission delay in milliseconds
    #[arg(long, default_value = "2000")]
    resend_max_ms: u64,

    /// Transmissions of a reliable packet before the peer counts as unreachable
    #[arg(long, default_value = "10")]
    max_resend_attempts: u32,

    /// Reliable packets allowed in flight per channel
    #[arg(long, default_value = "256")]
    max_in_flight: u64,

    /// Reliable packets queued behind the in-flight window per channel
    #[arg(long, default_value = "4096")]
    max_send_queue: usize,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            bind_addr: SocketAddr::new(self.host, self.port),
            tick_rate: self.tick_rate,
            max_sessions: self.max_clients,
            handshake_timeout: Duration::from_secs(self.handshake_timeout),
            handshake_resend_interval: Duration::from_millis(self.handshake_resend_ms),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            keepalive_interval: Duration::from_millis(self.keepalive_ms),
            session_cooldown: Duration::from_secs(self.session_cooldown),
            rebind_interval: Duration::from_millis(self.rebind_interval_ms),
            inbound_queue: self.queue_capacity,
            outbound_queue: self.queue_capacity,
            mux: MuxConfig {
                fragment_size: self.fragment_size,
                max_message_size: self.max_message_size,
                resend_base: Duration::from_millis(self.resend_base_ms),
                resend_max: Duration::from_millis(self.resend_max_ms),
                max_resend_attempts: self.max_resend_attempts,
                max_in_flight: self.max_in_flight,
                max_send_queue: self.max_send_queue,
                ..defaults.mux.clone()
            },
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = Args::parse().into_config();
    info!(
        "Starting server on {} at {} Hz, max {} sessions",
        config.bind_addr, config.tick_rate, config.max_sessions
    );

    let mut server = Server::bind(config, EchoSimulation::new()).await?;

    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
