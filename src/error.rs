//! Error types for the DHCP server.
//!
//! One bad packet never kills the server: every failure in the request path
//! resolves to a logged drop, and the taxonomy below exists so call sites can
//! tell the cases apart.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Error type for server operations.
#[derive(Debug, Error)]
pub enum DhcpError {
    /// Failed to bind or configure the listening socket.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Inbound datagram could not be parsed as DHCPv4.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A reply could not be assembled from the request.
    #[error("failed to build reply: {0}")]
    Build(String),

    /// Failed to write a reply to the peer.
    #[error("failed to send DHCP reply: {0}")]
    Send(#[source] io::Error),

    /// Other socket errors.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Rejection reasons from the wire codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Shorter than the fixed header plus magic cookie.
    #[error("datagram too short for a DHCPv4 message: {len} bytes")]
    Truncated { len: usize },

    /// The four bytes after the header are not the DHCP magic cookie.
    #[error("magic cookie mismatch")]
    BadMagicCookie,

    /// The op header is neither BootRequest nor BootReply.
    #[error("invalid op code {0}")]
    InvalidOpcode(u8),

    /// An option TLV claims more bytes than the datagram holds.
    #[error("option {code} runs past the end of the datagram")]
    OptionOverrun { code: u8 },

    /// Option 53 is mandatory in every DHCP message.
    #[error("message type (option 53) missing")]
    MissingMessageType,
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, DhcpError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_error_display() {
        let err = ParseError::Truncated { len: 12 };
        assert_eq!(
            err.to_string(),
            "datagram too short for a DHCPv4 message: 12 bytes"
        );

        let err = ParseError::OptionOverrun { code: 60 };
        assert_eq!(err.to_string(), "option 60 runs past the end of the datagram");

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 67);
        let io_err = io::Error::new(io::ErrorKind::AddrInUse, "address in use");
        let err = DhcpError::BindFailed {
            addr,
            source: io_err,
        };
        assert!(err.to_string().contains("failed to bind"));
    }

    #[test]
    fn test_parse_error_converts() {
        let err: DhcpError = ParseError::BadMagicCookie.into();
        assert_eq!(err.to_string(), "magic cookie mismatch");
    }
}
