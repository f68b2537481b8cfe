//! # Session Server Library
//!
//! A headless, authoritative server engine that talks to its peers over UDP.
//! It owns everything between the socket and the simulation: datagram I/O,
//! per-peer sessions, reliable and unreliable channels, and the fixed-rate
//! tick that drives the simulation. The simulation itself plugs in through
//! the [`scheduler::Simulation`] trait.
//!
//! ## Architecture
//!
//! ### Transport (`transport`)
//! One UDP socket served by a receive task and a send task. Datagrams flow
//! through bounded queues, so a slow socket never stalls a tick and a flood
//! of input is dropped and counted rather than buffered without limit.
//!
//! ### Sessions (`session`, `session_manager`)
//! Every peer gets a locally assigned [`shared::SessionId`] plus a random
//! token. The session manager is the single owner of the session table and
//! handles the handshake, liveness, address rebinding and teardown. Each
//! session carries its own [`shared::Multiplexer`] with three channels:
//! unreliable, reliable-ordered and reliable-unordered.
//!
//! ### Tick Scheduler (`scheduler`)
//! Runs at a fixed rate. Each tick ingests queued datagrams, advances
//! session timers, delivers events to the simulation in a stable
//! per-session, per-channel order, steps the simulation once, and flushes
//! outbound traffic. Retransmissions and keep-alives are driven from the
//! tick, with the tick's timestamp as the only clock.
//!
//! ### Runtime (`network`)
//! [`network::Server`] binds the transport and drives the scheduler from a
//! `tokio` interval. Ticks that run late are skipped, never bunched up.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::echo::EchoSimulation;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::bind(ServerConfig::default(), EchoSimulation::new()).await?;
//!     server.run().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod echo;
pub mod network;
pub mod scheduler;
pub mod session;
pub mod session_manager;
pub mod transport;
