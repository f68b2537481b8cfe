//! # Session Client Library
//!
//! A headless peer for the session server. It performs the handshake,
//! carries messages over the same three channels the server offers and
//! keeps the session alive, without any rendering or input handling.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! [`network::Client`] owns a UDP socket and a [`shared::Multiplexer`].
//! Callers drive it by calling [`network::Client::update`] in a loop and
//! draining the resulting [`network::ClientEvent`]s.
//!
//! Inbound loss can be simulated through
//! [`network::ClientConfig::simulated_loss`], which makes the client a
//! convenient harness for exercising the server's reliability paths.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{Client, ClientConfig};
//! use shared::ChannelKind;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = "127.0.0.1:7777".parse()?;
//!     let mut client = Client::new(server, ClientConfig::default()).await?;
//!     client.connect(Duration::from_secs(5)).await?;
//!     client.send(ChannelKind::ReliableOrdered, b"join")?;
//!     client.update(Duration::from_millis(16)).await?;
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod network;
