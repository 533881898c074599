//! The callback surface between the server loop and the embedding
//! application.
//!
//! The server owns the socket and the protocol rules; everything that needs
//! policy (which address to hand out, for how long, whether to refuse) is
//! asked of a [`DhcpHandler`]. Callbacks for one server instance are invoked
//! one at a time from its receive task, except [`DhcpHandler::on_response_sent`]
//! and send failures reported through [`DhcpHandler::on_socket_error`], which
//! run on the per-response send tasks.

use std::net::Ipv4Addr;

use tracing::{error, warn};

use crate::error::Error;
use crate::packet::{DhcpMessage, DhcpPacket};

/// Answer to a DISCOVER: offer `address` for `lease_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offer {
    pub address: Ipv4Addr,
    pub lease_seconds: u32,
}

/// Answer to a REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestDecision {
    /// Confirm `address` for `lease_seconds`.
    Ack { address: Ipv4Addr, lease_seconds: u32 },
    /// Refuse, with a human readable reason sent in the Message option.
    Nak { message: String },
}

/// Decision logic and notifications supplied by the embedding application.
///
/// Only [`on_discover`](Self::on_discover) and
/// [`on_request`](Self::on_request) are required. Returning `None` from
/// either sends no reply. The error callbacks log through `tracing` by
/// default.
pub trait DhcpHandler: Send + Sync + 'static {
    /// Called for each DISCOVER. `Some` is answered with an OFFER.
    fn on_discover(&self, message: &DhcpMessage) -> Option<Offer>;

    /// Called for each REQUEST that names this server or no server at all.
    /// REQUESTs carrying another server's identifier never get here.
    fn on_request(&self, message: &DhcpMessage) -> Option<RequestDecision>;

    /// Called when a client reports its assigned address is already in use.
    fn on_decline(&self, _message: &DhcpMessage) {}

    /// Called when a client gives up its lease.
    fn on_release(&self, _message: &DhcpMessage) {}

    /// Called for an INFORM. No reply is sent.
    fn on_inform(&self, _message: &DhcpMessage) {}

    /// Called after an OFFER, ACK or NAK has been written to the socket,
    /// with the packet as sent (subnet mask and server identifier included).
    fn on_response_sent(&self, _response: &DhcpPacket) {}

    /// Called for socket failures. When raised by the receive path the
    /// server has already stopped itself.
    fn on_socket_error(&self, error: &Error) {
        error!("DHCP socket error: {}", error);
    }

    /// Called for undecodable or rejected datagrams and contract violations.
    /// The server keeps running.
    fn on_message_error(&self, error: &Error) {
        warn!("DHCP message error: {}", error);
    }
}
