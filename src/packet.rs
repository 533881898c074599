//! DHCP packet parsing and encoding per RFC 2131.
//!
//! A DHCP packet consists of a fixed 236-byte header followed by a 4-byte
//! magic cookie and variable-length options. Two shapes are used:
//!
//! - [`DhcpMessage`] is a decoded datagram. It is read-only and always
//!   satisfies the wire invariants (valid cookie, well-formed options, a
//!   known DHCP message type).
//! - [`DhcpPacket`] is an outgoing record with public fields. Nothing is
//!   checked until [`DhcpPacket::encode`] runs.
//!
//! # Packet Structure
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     op (1)    |   htype (1)   |   hlen (1)    |   hops (1)    |
//! +---------------+---------------+---------------+---------------+
//! |                            xid (4)                            |
//! +-------------------------------+-------------------------------+
//! |           secs (2)            |           flags (2)           |
//! +-------------------------------+-------------------------------+
//! |                          ciaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          yiaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          siaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          giaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          chaddr (16)                          |
//! +---------------------------------------------------------------+
//! |                          sname (64)                           |
//! +---------------------------------------------------------------+
//! |                          file (128)                           |
//! +---------------------------------------------------------------+
//! |                    magic cookie (4) = 99.130.83.99            |
//! +---------------------------------------------------------------+
//! |                          options (variable)                   |
//! +---------------------------------------------------------------+
//! ```
//!
//! # References
//!
//! - RFC 2131: Dynamic Host Configuration Protocol

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::options::{DhcpOptions, MessageType, OptionCode, ascii_until_null};

/// DHCP magic cookie that identifies DHCP packets (vs BOOTP).
pub const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Bytes of `chaddr` that carry the hardware address; the rest is padding.
pub const HARDWARE_ADDRESS_SIZE: usize = 6;

const DHCP_OP_HTYPE_HLEN_HOPS_SIZE: usize = 4;
const DHCP_XID_SIZE: usize = 4;
const DHCP_SECS_SIZE: usize = 2;
const DHCP_FLAGS_SIZE: usize = 2;
const DHCP_CIADDR_SIZE: usize = 4;
const DHCP_YIADDR_SIZE: usize = 4;
const DHCP_SIADDR_SIZE: usize = 4;
const DHCP_GIADDR_SIZE: usize = 4;
const DHCP_CHADDR_SIZE: usize = 16;
const DHCP_SNAME_SIZE: usize = 64;
const DHCP_FILE_SIZE: usize = 128;

const DHCP_CHADDR_OFFSET: usize = DHCP_OP_HTYPE_HLEN_HOPS_SIZE
    + DHCP_XID_SIZE
    + DHCP_SECS_SIZE
    + DHCP_FLAGS_SIZE
    + DHCP_CIADDR_SIZE
    + DHCP_YIADDR_SIZE
    + DHCP_SIADDR_SIZE
    + DHCP_GIADDR_SIZE;

const DHCP_SNAME_OFFSET: usize = DHCP_CHADDR_OFFSET + DHCP_CHADDR_SIZE;

const DHCP_FILE_OFFSET: usize = DHCP_SNAME_OFFSET + DHCP_SNAME_SIZE;

const DHCP_MAGIC_COOKIE_OFFSET: usize = DHCP_FILE_OFFSET + DHCP_FILE_SIZE;

/// Size of the fixed header portion including magic cookie.
const DHCP_FIXED_HEADER_SIZE: usize = DHCP_MAGIC_COOKIE_OFFSET + DHCP_MAGIC_COOKIE.len();

/// Smallest datagram accepted by [`DhcpMessage::decode`].
///
/// The fixed header and cookie, plus room for the mandatory message type
/// option (3 bytes) and the `End` marker.
pub const DHCP_MIN_MESSAGE_SIZE: usize = DHCP_FIXED_HEADER_SIZE + 4;

/// Minimum DHCP packet size per RFC 2131 §2.
///
/// DHCP requires packets to be at least 300 bytes for compatibility
/// with BOOTP relay agents.
const DHCP_MIN_PACKET_SIZE: usize = 300;

/// Initial capacity for packet encoding buffer.
///
/// 576 bytes is the minimum MTU that all hosts must accept per RFC 791.
const DHCP_ENCODE_CAPACITY: usize = 576;

/// BOOTP/DHCP operation code for client requests.
pub const BOOTREQUEST: u8 = 1;

/// BOOTP/DHCP operation code for server replies.
pub const BOOTREPLY: u8 = 2;

/// Hardware type for Ethernet (most common).
pub const HTYPE_ETHERNET: u8 = 1;

/// Hardware address length for Ethernet (6 bytes).
pub const HLEN_ETHERNET: u8 = 6;

/// Broadcast bit of the `flags` field.
const BROADCAST_FLAG: u16 = 0x8000;

fn read_ipv4(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    )
}

fn write_fixed_string(packet: &mut Vec<u8>, value: &str, size: usize, field: &str) -> Result<()> {
    if !value.is_ascii() {
        return Err(Error::Encode(format!("{} {:?} is not ASCII", field, value)));
    }
    if value.len() >= size {
        return Err(Error::Encode(format!(
            "{} is {} bytes, must be shorter than {}",
            field,
            value.len(),
            size
        )));
    }

    packet.extend_from_slice(value.as_bytes());
    packet.resize(packet.len() + size - value.len(), 0);
    Ok(())
}

fn format_mac(chaddr: &[u8; HARDWARE_ADDRESS_SIZE]) -> String {
    chaddr
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

/// A decoded DHCP message.
///
/// Produced only by [`decode`](Self::decode), so every instance carries a
/// valid magic cookie, well-formed options and a known message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    op: u8,
    htype: u8,
    hlen: u8,
    hops: u8,
    xid: u32,
    secs: u16,
    flags: u16,
    ciaddr: Ipv4Addr,
    yiaddr: Ipv4Addr,
    siaddr: Ipv4Addr,
    giaddr: Ipv4Addr,
    chaddr: [u8; HARDWARE_ADDRESS_SIZE],
    sname: String,
    file: String,
    options: DhcpOptions,
    message_type: MessageType,
}

impl DhcpMessage {
    /// Decodes a DHCP message from raw bytes.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw datagram bytes received from the network
    ///
    /// # Errors
    ///
    /// - [`Error::PacketTooShort`] if the datagram is shorter than 244 bytes
    /// - [`Error::InvalidMagicCookie`] if the cookie is not 99.130.83.99
    /// - any option decode error from [`DhcpOptions::decode`]
    /// - [`Error::OptionSize`] or [`Error::InvalidPacket`] if the message
    ///   type option is malformed or unknown
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < DHCP_MIN_MESSAGE_SIZE {
            return Err(Error::PacketTooShort {
                length: data.len(),
                minimum: DHCP_MIN_MESSAGE_SIZE,
            });
        }

        let mut magic_cookie = [0u8; 4];
        magic_cookie.copy_from_slice(&data[DHCP_MAGIC_COOKIE_OFFSET..DHCP_FIXED_HEADER_SIZE]);
        if magic_cookie != DHCP_MAGIC_COOKIE {
            return Err(Error::InvalidMagicCookie(magic_cookie));
        }

        let mut chaddr = [0u8; HARDWARE_ADDRESS_SIZE];
        chaddr.copy_from_slice(&data[DHCP_CHADDR_OFFSET..DHCP_CHADDR_OFFSET + HARDWARE_ADDRESS_SIZE]);

        let sname = ascii_until_null(&data[DHCP_SNAME_OFFSET..DHCP_SNAME_OFFSET + DHCP_SNAME_SIZE]);
        let file = ascii_until_null(&data[DHCP_FILE_OFFSET..DHCP_FILE_OFFSET + DHCP_FILE_SIZE]);

        let options = DhcpOptions::decode(data, DHCP_FIXED_HEADER_SIZE)?;
        let message_type = options.message_type()?;

        Ok(Self {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: read_ipv4(data, 12),
            yiaddr: read_ipv4(data, 16),
            siaddr: read_ipv4(data, 20),
            giaddr: read_ipv4(data, 24),
            chaddr,
            sname,
            file,
            options,
            message_type,
        })
    }

    /// Operation code: [`BOOTREQUEST`] (1) or [`BOOTREPLY`] (2).
    pub fn op(&self) -> u8 {
        self.op
    }

    pub fn htype(&self) -> u8 {
        self.htype
    }

    pub fn hlen(&self) -> u8 {
        self.hlen
    }

    pub fn hops(&self) -> u8 {
        self.hops
    }

    /// Transaction ID chosen by the client, echoed in replies.
    pub fn xid(&self) -> u32 {
        self.xid
    }

    pub fn secs(&self) -> u16 {
        self.secs
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Client IP address (set by client in BOUND/RENEWING/REBINDING states).
    pub fn ciaddr(&self) -> Ipv4Addr {
        self.ciaddr
    }

    pub fn yiaddr(&self) -> Ipv4Addr {
        self.yiaddr
    }

    pub fn siaddr(&self) -> Ipv4Addr {
        self.siaddr
    }

    /// Relay agent address. Anything but 0.0.0.0 means the message was relayed.
    pub fn giaddr(&self) -> Ipv4Addr {
        self.giaddr
    }

    /// Client hardware address (the first 6 bytes of `chaddr`).
    pub fn chaddr(&self) -> [u8; HARDWARE_ADDRESS_SIZE] {
        self.chaddr
    }

    pub fn sname(&self) -> &str {
        &self.sname
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn options(&self) -> &DhcpOptions {
        &self.options
    }

    /// The DHCP message type (Option 53), always present on a decoded message.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Returns the requested IP address (Option 50) if present.
    ///
    /// Clients include this in DISCOVER to request a specific IP,
    /// and in REQUEST to confirm the offered IP.
    pub fn requested_ip(&self) -> Result<Option<Ipv4Addr>> {
        self.options.get_ipv4(OptionCode::RequestedIpAddress)
    }

    /// Returns the server identifier (Option 54) if present.
    ///
    /// Clients include this in REQUEST to indicate which server's
    /// offer they are accepting.
    pub fn server_identifier(&self) -> Result<Option<Ipv4Addr>> {
        self.options.get_ipv4(OptionCode::ServerIdentifier)
    }

    /// Returns the client identifier (Option 61) if present.
    pub fn client_identifier(&self) -> Option<&[u8]> {
        self.options.get(OptionCode::ClientIdentifier)
    }

    /// Returns the client hostname (Option 12) if present.
    pub fn hostname(&self) -> Option<String> {
        self.options.get_string(OptionCode::HostName).ok().flatten()
    }

    /// Returns a unique client identifier for lease tracking.
    ///
    /// Uses Option 61 (Client Identifier) if present, otherwise
    /// constructs an identifier from hardware type + hardware address.
    pub fn client_id(&self) -> Vec<u8> {
        if let Some(id) = self.client_identifier() {
            id.to_vec()
        } else {
            let mut id = vec![self.htype];
            id.extend_from_slice(&self.chaddr);
            id
        }
    }

    /// Formats the client hardware address as "aa:bb:cc:dd:ee:ff".
    pub fn format_mac(&self) -> String {
        format_mac(&self.chaddr)
    }

    /// Returns true if the broadcast flag (bit 15) is set.
    pub fn is_broadcast(&self) -> bool {
        (self.flags & BROADCAST_FLAG) != 0
    }

    /// Copies this message into an editable [`DhcpPacket`].
    pub fn to_packet(&self) -> DhcpPacket {
        DhcpPacket {
            op: self.op,
            htype: self.htype,
            hlen: self.hlen,
            hops: self.hops,
            xid: self.xid,
            secs: self.secs,
            flags: self.flags,
            ciaddr: self.ciaddr,
            yiaddr: self.yiaddr,
            siaddr: self.siaddr,
            giaddr: self.giaddr,
            chaddr: self.chaddr,
            sname: self.sname.clone(),
            file: self.file.clone(),
            options: self.options.clone(),
        }
    }
}

/// An outgoing DHCP packet.
///
/// Fields are public so response builders (and tests) can fill them in
/// directly. Validation happens in [`encode`](Self::encode).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    /// Operation code: [`BOOTREQUEST`] (1) or [`BOOTREPLY`] (2).
    pub op: u8,

    /// Hardware address type. [`HTYPE_ETHERNET`] (1) for Ethernet.
    pub htype: u8,

    /// Hardware address length. [`HLEN_ETHERNET`] (6) for Ethernet.
    pub hlen: u8,

    /// Hop count, incremented by relay agents.
    pub hops: u8,

    /// Transaction ID chosen by client, echoed in replies.
    pub xid: u32,

    /// Seconds elapsed since client began address acquisition.
    pub secs: u16,

    /// Flags. Bit 15 (0x8000) = broadcast flag.
    pub flags: u16,

    /// Client IP address.
    pub ciaddr: Ipv4Addr,

    /// "Your" IP address - the address being assigned to the client.
    pub yiaddr: Ipv4Addr,

    /// Next server IP address.
    pub siaddr: Ipv4Addr,

    /// Relay agent IP address.
    pub giaddr: Ipv4Addr,

    /// Client hardware address, written as 6 bytes plus 10 bytes of padding.
    pub chaddr: [u8; HARDWARE_ADDRESS_SIZE],

    /// Server host name. ASCII, at most 63 bytes.
    pub sname: String,

    /// Boot file name. ASCII, at most 127 bytes.
    pub file: String,

    /// DHCP options, written in insertion order.
    pub options: DhcpOptions,
}

impl DhcpPacket {
    /// Creates an Ethernet packet with the given opcode and message type and
    /// every other field zeroed.
    pub fn new(op: u8, message_type: MessageType) -> Self {
        Self {
            op,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid: 0,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: [0; HARDWARE_ADDRESS_SIZE],
            sname: String::new(),
            file: String::new(),
            options: DhcpOptions::new(message_type),
        }
    }

    /// Returns the DHCP message type (Option 53).
    pub fn message_type(&self) -> Result<MessageType> {
        self.options.message_type()
    }

    /// Formats the client hardware address as "aa:bb:cc:dd:ee:ff".
    pub fn format_mac(&self) -> String {
        format_mac(&self.chaddr)
    }

    /// Encodes the packet to bytes for transmission.
    ///
    /// Options are written in TLV format followed by the `End` marker, and
    /// the buffer is zero-padded to at least 300 bytes (RFC 2131 §2).
    ///
    /// # Errors
    ///
    /// - [`Error::MissingMessageType`] if option 53 is absent
    /// - [`Error::Encode`] if `sname`/`file` are not ASCII or do not fit
    ///   their field with a terminating null, or if the options cannot be
    ///   encoded (see [`DhcpOptions::encode`])
    pub fn encode(&self) -> Result<Vec<u8>> {
        if !self.options.contains(OptionCode::DhcpMessageType) {
            return Err(Error::MissingMessageType);
        }
        let options = self.options.encode()?;

        let mut packet = Vec::with_capacity(DHCP_ENCODE_CAPACITY);

        packet.push(self.op);
        packet.push(self.htype);
        packet.push(self.hlen);
        packet.push(self.hops);

        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());

        packet.extend_from_slice(&self.ciaddr.octets());
        packet.extend_from_slice(&self.yiaddr.octets());
        packet.extend_from_slice(&self.siaddr.octets());
        packet.extend_from_slice(&self.giaddr.octets());

        packet.extend_from_slice(&self.chaddr);
        packet.resize(DHCP_SNAME_OFFSET, 0);

        write_fixed_string(&mut packet, &self.sname, DHCP_SNAME_SIZE, "server name")?;
        write_fixed_string(&mut packet, &self.file, DHCP_FILE_SIZE, "boot file name")?;

        packet.extend_from_slice(&DHCP_MAGIC_COOKIE);

        packet.extend_from_slice(&options);
        packet.push(OptionCode::End as u8);

        if packet.len() < DHCP_MIN_PACKET_SIZE {
            packet.resize(DHCP_MIN_PACKET_SIZE, 0);
        }

        Ok(packet)
    }
}
