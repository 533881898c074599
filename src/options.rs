//! DHCP options as defined in RFC 2132.
//!
//! DHCP uses options to convey configuration parameters between servers and clients.
//! Each option has a code (1 byte), length (1 byte), and variable-length data.
//!
//! Options are held in [`DhcpOptions`], an ordered code-to-bytes container
//! with typed accessors layered on top. Values are stored raw, so options this
//! crate has no name for survive a decode/encode cycle untouched.
//!
//! # Terminator
//!
//! [`DhcpOptions::encode`] emits the stored entries only. The `End` marker is
//! written by [`DhcpPacket::encode`](crate::DhcpPacket::encode), and
//! [`DhcpOptions::decode`] stops at `End` or at the end of the buffer,
//! whichever comes first.
//!
//! # References
//!
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Maximum length of a single option value (the length field is one byte).
pub const MAX_OPTION_LENGTH: usize = 255;

/// DHCP option codes as defined in RFC 2132.
///
/// Codes without a variant can still be stored and read through the raw
/// `u8` accessors of [`DhcpOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OptionCode {
    /// Padding (no operation). Carries no length or data.
    Pad = 0,
    /// Subnet mask (RFC 2132 §3.3).
    SubnetMask = 1,
    /// Time offset from UTC in seconds (RFC 2132 §3.4).
    TimeOffset = 2,
    /// Router/gateway addresses (RFC 2132 §3.5).
    Router = 3,
    /// Time server addresses (RFC 2132 §3.6).
    TimeServer = 4,
    /// IEN 116 name server addresses (RFC 2132 §3.7).
    NameServer = 5,
    /// DNS server addresses (RFC 2132 §3.8).
    DomainNameServer = 6,
    /// Log server addresses (RFC 2132 §3.9).
    LogServer = 7,
    /// Client hostname (RFC 2132 §3.14).
    HostName = 12,
    /// Boot file size in 512-octet blocks (RFC 2132 §3.15).
    BootFileSize = 13,
    /// Domain name for DNS resolution (RFC 2132 §3.17).
    DomainName = 15,
    /// Root disk path (RFC 2132 §3.19).
    RootPath = 17,
    /// IP forwarding enable/disable (RFC 2132 §4.1).
    IpForwarding = 19,
    /// Default IP time-to-live (RFC 2132 §4.5).
    DefaultIpTtl = 23,
    /// Interface MTU (RFC 2132 §5.1).
    InterfaceMtu = 26,
    /// Broadcast address (RFC 2132 §5.3).
    BroadcastAddress = 28,
    /// Static routes (RFC 2132 §5.8).
    StaticRoute = 33,
    /// ARP cache timeout (RFC 2132 §6.2).
    ArpCacheTimeout = 35,
    /// NIS domain name (RFC 2132 §8.1).
    NisDomain = 40,
    /// NTP server addresses (RFC 2132 §8.3).
    NtpServers = 42,
    /// Vendor specific information (RFC 2132 §8.4).
    VendorSpecific = 43,
    /// NetBIOS over TCP/IP name servers (RFC 2132 §8.5).
    NetbiosNameServer = 44,
    /// NetBIOS over TCP/IP node type (RFC 2132 §8.7).
    NetbiosNodeType = 46,
    /// Requested IP address (RFC 2132 §9.1).
    RequestedIpAddress = 50,
    /// IP address lease time in seconds (RFC 2132 §9.2).
    IpAddressLeaseTime = 51,
    /// Option overload (RFC 2132 §9.3).
    OptionOverload = 52,
    /// DHCP message type (RFC 2132 §9.6).
    DhcpMessageType = 53,
    /// Server identifier (RFC 2132 §9.7).
    ServerIdentifier = 54,
    /// Parameter request list (RFC 2132 §9.8).
    ParameterRequestList = 55,
    /// Human readable error text, sent with NAK (RFC 2132 §9.9).
    Message = 56,
    /// Maximum DHCP message size (RFC 2132 §9.10).
    MaxDhcpMessageSize = 57,
    /// Renewal time T1 (RFC 2132 §9.11).
    RenewalTime = 58,
    /// Rebinding time T2 (RFC 2132 §9.12).
    RebindingTime = 59,
    /// Vendor class identifier (RFC 2132 §9.13).
    VendorClassIdentifier = 60,
    /// Client identifier (RFC 2132 §9.14).
    ClientIdentifier = 61,
    /// TFTP server name (RFC 2132 §9.4).
    TftpServerName = 66,
    /// Boot file name (RFC 2132 §9.5).
    BootfileName = 67,
    /// End of options marker.
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            2 => Ok(Self::TimeOffset),
            3 => Ok(Self::Router),
            4 => Ok(Self::TimeServer),
            5 => Ok(Self::NameServer),
            6 => Ok(Self::DomainNameServer),
            7 => Ok(Self::LogServer),
            12 => Ok(Self::HostName),
            13 => Ok(Self::BootFileSize),
            15 => Ok(Self::DomainName),
            17 => Ok(Self::RootPath),
            19 => Ok(Self::IpForwarding),
            23 => Ok(Self::DefaultIpTtl),
            26 => Ok(Self::InterfaceMtu),
            28 => Ok(Self::BroadcastAddress),
            33 => Ok(Self::StaticRoute),
            35 => Ok(Self::ArpCacheTimeout),
            40 => Ok(Self::NisDomain),
            42 => Ok(Self::NtpServers),
            43 => Ok(Self::VendorSpecific),
            44 => Ok(Self::NetbiosNameServer),
            46 => Ok(Self::NetbiosNodeType),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::IpAddressLeaseTime),
            52 => Ok(Self::OptionOverload),
            53 => Ok(Self::DhcpMessageType),
            54 => Ok(Self::ServerIdentifier),
            55 => Ok(Self::ParameterRequestList),
            56 => Ok(Self::Message),
            57 => Ok(Self::MaxDhcpMessageSize),
            58 => Ok(Self::RenewalTime),
            59 => Ok(Self::RebindingTime),
            60 => Ok(Self::VendorClassIdentifier),
            61 => Ok(Self::ClientIdentifier),
            66 => Ok(Self::TftpServerName),
            67 => Ok(Self::BootfileName),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

impl From<OptionCode> for u8 {
    fn from(code: OptionCode) -> u8 {
        code as u8
    }
}

/// DHCP message types (Option 53) as defined in RFC 2132 §9.6.
///
/// These values indicate the purpose of a DHCP message in the protocol exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Client broadcast to locate servers.
    Discover = 1,
    /// Server response to DISCOVER with IP offer.
    Offer = 2,
    /// Client request for offered parameters.
    Request = 3,
    /// Client indicates address is already in use.
    Decline = 4,
    /// Server acknowledgement with configuration.
    Ack = 5,
    /// Server negative acknowledgement.
    Nak = 6,
    /// Client releases IP address.
    Release = 7,
    /// Client requests config without IP allocation.
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// Decodes ASCII bytes up to the first null, replacing anything above 0x7f
/// with `?`.
pub(crate) fn ascii_until_null(data: &[u8]) -> String {
    let end = data.iter().position(|byte| *byte == 0).unwrap_or(data.len());
    data[..end]
        .iter()
        .map(|byte| if byte.is_ascii() { *byte as char } else { '?' })
        .collect()
}

/// An ordered set of DHCP options keyed by option code.
///
/// Each code appears at most once. Insertion order is kept and is the order
/// used on the wire. Decoded option sets always carry a DHCP Message Type;
/// option sets built for outgoing packets are only checked when encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpOptions {
    entries: Vec<(u8, Vec<u8>)>,
}

impl DhcpOptions {
    /// Creates an option set seeded with the given message type.
    pub fn new(message_type: MessageType) -> Self {
        let mut options = Self::default();
        options.set_message_type(message_type);
        options
    }

    /// Scans the TLV option stream in `data` starting at `start`.
    ///
    /// Stops at the `End` code or at the end of the buffer. `Pad` codes are
    /// skipped.
    ///
    /// # Errors
    ///
    /// - [`Error::TruncatedOption`] if a length byte is missing or claims
    ///   more bytes than remain
    /// - [`Error::DuplicateOption`] if a code appears twice
    /// - [`Error::MissingMessageType`] if no option 53 was found
    pub fn decode(data: &[u8], start: usize) -> Result<Self> {
        let mut options = Self::default();
        let mut seen = [false; 256];
        let mut index = start;

        while index < data.len() {
            let code = data[index];

            if code == OptionCode::Pad as u8 {
                index += 1;
                continue;
            }

            if code == OptionCode::End as u8 {
                break;
            }

            if index + 1 >= data.len() {
                return Err(Error::TruncatedOption {
                    code,
                    offset: index,
                });
            }

            let length = data[index + 1] as usize;

            if index + 2 + length > data.len() {
                return Err(Error::TruncatedOption {
                    code,
                    offset: index,
                });
            }

            if seen[code as usize] {
                return Err(Error::DuplicateOption(code));
            }
            seen[code as usize] = true;

            options
                .entries
                .push((code, data[index + 2..index + 2 + length].to_vec()));

            index += 2 + length;
        }

        if !seen[OptionCode::DhcpMessageType as usize] {
            return Err(Error::MissingMessageType);
        }

        Ok(options)
    }

    /// Encodes the stored entries as `(code, length, value)` triplets in
    /// insertion order. No `End` marker is appended.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encode`] if a `Pad` or `End` entry is stored, or if a
    /// value is longer than 255 bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let capacity = self
            .entries
            .iter()
            .map(|(_, value)| value.len() + 2)
            .sum();
        let mut encoded = Vec::with_capacity(capacity);

        for (code, value) in &self.entries {
            if *code == OptionCode::Pad as u8 || *code == OptionCode::End as u8 {
                return Err(Error::Encode(format!(
                    "option code {} is a wire control marker, not data",
                    code
                )));
            }
            if value.len() > MAX_OPTION_LENGTH {
                return Err(Error::Encode(format!(
                    "option {} value is {} bytes (maximum {})",
                    code,
                    value.len(),
                    MAX_OPTION_LENGTH
                )));
            }
            encoded.push(*code);
            encoded.push(value.len() as u8);
            encoded.extend_from_slice(value);
        }

        Ok(encoded)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, code: impl Into<u8>) -> bool {
        self.get(code).is_some()
    }

    /// Returns the raw value stored for `code`.
    pub fn get(&self, code: impl Into<u8>) -> Option<&[u8]> {
        let code = code.into();
        self.entries
            .iter()
            .find(|(stored, _)| *stored == code)
            .map(|(_, value)| value.as_slice())
    }

    /// Iterates over `(code, value)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.entries
            .iter()
            .map(|(code, value)| (*code, value.as_slice()))
    }

    /// Stores `value` under `code`.
    ///
    /// An existing entry keeps its position and has its value replaced.
    pub fn set(&mut self, code: impl Into<u8>, value: Vec<u8>) {
        let code = code.into();
        match self.entries.iter_mut().find(|(stored, _)| *stored == code) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((code, value)),
        }
    }

    /// Removes and returns the value stored for `code`.
    pub fn remove(&mut self, code: impl Into<u8>) -> Option<Vec<u8>> {
        let code = code.into();
        let position = self.entries.iter().position(|(stored, _)| *stored == code)?;
        Some(self.entries.remove(position).1)
    }

    pub fn set_u8(&mut self, code: impl Into<u8>, value: u8) {
        self.set(code, vec![value]);
    }

    pub fn set_u16(&mut self, code: impl Into<u8>, value: u16) {
        self.set(code, value.to_be_bytes().to_vec());
    }

    pub fn set_u32(&mut self, code: impl Into<u8>, value: u32) {
        self.set(code, value.to_be_bytes().to_vec());
    }

    pub fn set_ipv4(&mut self, code: impl Into<u8>, value: Ipv4Addr) {
        self.set(code, value.octets().to_vec());
    }

    /// Stores `value` as raw bytes without a trailing null.
    pub fn set_string(&mut self, code: impl Into<u8>, value: &str) {
        self.set(code, value.as_bytes().to_vec());
    }

    pub fn set_message_type(&mut self, message_type: MessageType) {
        self.set_u8(OptionCode::DhcpMessageType, message_type as u8);
    }

    fn get_exact<const N: usize>(&self, code: impl Into<u8>) -> Result<Option<[u8; N]>> {
        let code = code.into();
        let Some(value) = self.get(code) else {
            return Ok(None);
        };
        let bytes: [u8; N] = value.try_into().map_err(|_| Error::OptionSize {
            code,
            expected: N,
            actual: value.len(),
        })?;
        Ok(Some(bytes))
    }

    /// Reads a one-byte option.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OptionSize`] if the stored value is not exactly 1 byte.
    pub fn get_u8(&self, code: impl Into<u8>) -> Result<Option<u8>> {
        Ok(self.get_exact::<1>(code)?.map(|bytes| bytes[0]))
    }

    /// Reads a big-endian 16-bit option.
    pub fn get_u16(&self, code: impl Into<u8>) -> Result<Option<u16>> {
        Ok(self.get_exact::<2>(code)?.map(u16::from_be_bytes))
    }

    /// Reads a big-endian 32-bit option.
    pub fn get_u32(&self, code: impl Into<u8>) -> Result<Option<u32>> {
        Ok(self.get_exact::<4>(code)?.map(u32::from_be_bytes))
    }

    /// Reads a 4-byte IPv4 address option.
    pub fn get_ipv4(&self, code: impl Into<u8>) -> Result<Option<Ipv4Addr>> {
        Ok(self.get_exact::<4>(code)?.map(Ipv4Addr::from))
    }

    /// Reads an ASCII string option, truncated at the first embedded null.
    pub fn get_string(&self, code: impl Into<u8>) -> Result<Option<String>> {
        Ok(self.get(code).map(ascii_until_null))
    }

    /// Returns the DHCP message type (Option 53).
    ///
    /// # Errors
    ///
    /// - [`Error::MissingMessageType`] if option 53 is absent
    /// - [`Error::OptionSize`] if it is not exactly one byte
    /// - [`Error::InvalidPacket`] if the value is not a known message type
    pub fn message_type(&self) -> Result<MessageType> {
        let value = self
            .get_u8(OptionCode::DhcpMessageType)?
            .ok_or(Error::MissingMessageType)?;
        MessageType::try_from(value)
            .map_err(|value| Error::InvalidPacket(format!("Unknown message type: {}", value)))
    }
}
