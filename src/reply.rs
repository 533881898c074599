//! Construction of OFFER, ACK and NAK replies (RFC 2131 §4.3.1, §4.3.2).
//!
//! Each builder takes the client's decoded message and a policy decision and
//! returns a fresh [`DhcpPacket`]. Both copy the same header fields from the
//! request:
//!
//! - `htype` and `hlen` (hardware type/length)
//! - `xid` (transaction ID)
//! - `flags` (broadcast flag)
//! - `giaddr` (relay agent address)
//! - `chaddr` (client hardware address)
//!
//! The server identifier and subnet mask options are added later by the
//! server, which knows its own address.

use crate::error::{Error, Result};
use crate::handler::{Offer, RequestDecision};
use crate::options::{MessageType, OptionCode};
use crate::packet::{BOOTREPLY, DhcpMessage, DhcpPacket};

fn ensure_source_type(source: &DhcpMessage, expected: MessageType, reply: &str) -> Result<()> {
    if source.message_type() == expected {
        return Ok(());
    }

    Err(Error::Contract(format!(
        "{} can only answer {}, got {} from {}",
        reply,
        expected,
        source.message_type(),
        source.format_mac()
    )))
}

fn reply_to(source: &DhcpMessage, message_type: MessageType) -> DhcpPacket {
    let mut reply = DhcpPacket::new(BOOTREPLY, message_type);
    reply.htype = source.htype();
    reply.hlen = source.hlen();
    reply.xid = source.xid();
    reply.flags = source.flags();
    reply.giaddr = source.giaddr();
    reply.chaddr = source.chaddr();
    reply
}

/// Builds the OFFER answering a DISCOVER.
///
/// Sets `yiaddr` to the offered address and the lease time option. `ciaddr`,
/// `siaddr`, `sname` and `file` are left empty.
///
/// # Errors
///
/// Returns [`Error::Contract`] if `source` is not a DISCOVER.
pub fn build_offer(source: &DhcpMessage, offer: &Offer) -> Result<DhcpPacket> {
    ensure_source_type(source, MessageType::Discover, "OFFER")?;

    let mut reply = reply_to(source, MessageType::Offer);
    reply.yiaddr = offer.address;
    reply
        .options
        .set_u32(OptionCode::IpAddressLeaseTime, offer.lease_seconds);

    Ok(reply)
}

/// Builds the ACK or NAK answering a REQUEST.
///
/// An ACK echoes the client's `ciaddr`, sets `yiaddr` to the assigned
/// address and carries the lease time. A NAK carries only the reason in the
/// Message option; all addresses stay 0.0.0.0.
///
/// # Errors
///
/// Returns [`Error::Contract`] if `source` is not a REQUEST.
pub fn build_request_reply(source: &DhcpMessage, decision: &RequestDecision) -> Result<DhcpPacket> {
    ensure_source_type(source, MessageType::Request, "ACK/NAK")?;

    let reply = match decision {
        RequestDecision::Ack {
            address,
            lease_seconds,
        } => {
            let mut reply = reply_to(source, MessageType::Ack);
            reply.ciaddr = source.ciaddr();
            reply.yiaddr = *address;
            reply
                .options
                .set_u32(OptionCode::IpAddressLeaseTime, *lease_seconds);
            reply
        }
        RequestDecision::Nak { message } => {
            let mut reply = reply_to(source, MessageType::Nak);
            reply.options.set_string(OptionCode::Message, message);
            reply
        }
    };

    Ok(reply)
}
