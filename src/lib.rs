//! # dhcpwire
//!
//! A DHCPv4 wire codec and server loop implementing the message format of
//! RFC 2131 and the option encoding of RFC 2132.
//!
//! ## Features
//!
//! - Strict decoding of client messages into an immutable [`DhcpMessage`]
//! - Ordered option container with typed accessors ([`DhcpOptions`])
//! - OFFER/ACK/NAK builders that copy the protocol-mandated header fields
//! - A UDP server that dispatches DISCOVER, REQUEST, DECLINE, RELEASE and
//!   INFORM to a pluggable [`DhcpHandler`]
//! - An in-memory reference policy ([`Leases`])
//!
//! Address policy is never decided by the server itself: every offer and
//! every ACK/NAK comes from the handler.
//!
//! ## Quick Start
//!
//! ```no_run
//! use dhcpwire::{Config, DhcpServer, Leases};
//!
//! #[tokio::main]
//! async fn main() -> dhcpwire::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let server = DhcpServer::from_config(&config, Leases::new(config.clone()));
//!     server.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`DhcpOptions`] - Option TLV codec (RFC 2132)
//! - [`DhcpMessage`] / [`DhcpPacket`] - Decoded request and outgoing packet
//! - [`build_offer`] / [`build_request_reply`] - Reply construction
//! - [`DhcpServer`] - Socket ownership, dispatch and reply delivery
//! - [`Config`] - Server address and pool settings

pub mod config;
pub mod error;
pub mod handler;
pub mod lease;
pub mod options;
pub mod packet;
pub mod reply;
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
pub use handler::{DhcpHandler, Offer, RequestDecision};
pub use lease::{Lease, Leases};
pub use options::{DhcpOptions, MessageType, OptionCode};
pub use packet::{DhcpMessage, DhcpPacket};
pub use reply::{build_offer, build_request_reply};
pub use server::DhcpServer;
