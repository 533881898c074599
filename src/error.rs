//! Error types for the DHCP wire codec and server loop.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. Errors fall into three groups:
//!
//! - decode errors, raised for a malformed datagram and never fatal to the
//!   server (see [`Error::is_decode_error`]);
//! - contract errors, raised when the embedding application asks the core to
//!   build or send something the protocol forbids (see
//!   [`Error::is_contract_error`]);
//! - transport errors, raised by the socket.

/// Errors that can occur while decoding, encoding or serving DHCP messages.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config file).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The datagram is shorter than the smallest possible DHCP message.
    #[error("Packet too short: {length} bytes (minimum {minimum})")]
    PacketTooShort { length: usize, minimum: usize },

    /// The four bytes after the fixed header are not 99.130.83.99.
    #[error("Invalid magic cookie: {0:?}")]
    InvalidMagicCookie([u8; 4]),

    /// An option's length byte is missing or claims more bytes than remain.
    #[error("Option {code} truncated at offset {offset}")]
    TruncatedOption { code: u8, offset: usize },

    /// The same option code appears more than once.
    #[error("Duplicate option {0}")]
    DuplicateOption(u8),

    /// The option set carries no DHCP Message Type (option 53).
    #[error("Missing DHCP message type option")]
    MissingMessageType,

    /// A typed option read found a value of the wrong width.
    #[error("Option {code} has {actual} bytes, expected {expected}")]
    OptionSize {
        code: u8,
        expected: usize,
        actual: usize,
    },

    /// Malformed DHCP packet received.
    ///
    /// Covers protocol violations not listed above, such as an unknown
    /// message type value.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// A well-formed message this server does not accept.
    ///
    /// Raised for relayed messages, BOOTREPLY opcodes, and message types a
    /// client never sends to a server.
    #[error("Message rejected: {0}")]
    Rejected(String),

    /// A packet cannot be serialized as it stands.
    ///
    /// Raised for stored `Pad`/`End` entries, option values over 255 bytes,
    /// and server-name or boot-file strings that do not fit their field.
    #[error("Cannot encode packet: {0}")]
    Encode(String),

    /// The embedding application violated a protocol rule.
    ///
    /// For example, building an OFFER from a REQUEST, or asking the server
    /// to transmit a DISCOVER.
    #[error("Contract violation: {0}")]
    Contract(String),

    /// No free address is left in the pool.
    #[error("IP address pool exhausted")]
    PoolExhausted,

    /// The address lies outside the configured pool.
    #[error("Address {0} is outside the pool")]
    AddressOutOfRange(std::net::Ipv4Addr),

    /// The address is leased, offered to another client, or declined.
    #[error("Address {0} is not available")]
    AddressUnavailable(std::net::Ipv4Addr),

    /// The client holds no lease.
    #[error("No lease for client {0}")]
    LeaseNotFound(String),

    /// Invalid server configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) when the
    /// configuration contains invalid values (e.g., pool_start > pool_end).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67 without administrator privileges,
    /// or when the configured address is not assigned to any interface.
    #[error("Socket error: {0}")]
    Socket(String),
}

impl Error {
    /// Returns true for errors caused by a malformed datagram.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::PacketTooShort { .. }
                | Self::InvalidMagicCookie(_)
                | Self::TruncatedOption { .. }
                | Self::DuplicateOption(_)
                | Self::MissingMessageType
                | Self::OptionSize { .. }
                | Self::InvalidPacket(_)
        )
    }

    /// Returns true for well-formed messages the server refused.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Returns true for errors caused by the embedding application.
    pub fn is_contract_error(&self) -> bool {
        matches!(self, Self::Contract(_) | Self::Encode(_))
    }
}

/// A specialized Result type for DHCP operations.
pub type Result<T> = std::result::Result<T, Error>;
