//! Subscription tokens.
//!
//! A token is everything a client needs to subscribe to one stream: the
//! server endpoint and the stream id. Tokens are immutable and have a fixed
//! little-endian wire form so producers can hand them to out-of-process
//! clients through whatever side channel they already have.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::types::StreamId;

/// Wire size of a serialized token: stream id (8) + address kind (1) +
/// address (16, IPv4 in the leading 4 bytes) + port (2).
pub const TOKEN_WIRE_SIZE: usize = 27;

const KIND_V4: u8 = 4;
const KIND_V6: u8 = 6;

/// Everything a client needs to subscribe to one stream. The protocol is
/// always TCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    stream_id: StreamId,
    endpoint: SocketAddr,
}

impl Token {
    pub fn new(stream_id: StreamId, endpoint: SocketAddr) -> Self {
        Self {
            stream_id,
            endpoint,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port()
    }

    /// Serialize to the fixed wire form.
    pub fn to_bytes(&self) -> [u8; TOKEN_WIRE_SIZE] {
        let mut out = [0u8; TOKEN_WIRE_SIZE];
        out[..8].copy_from_slice(&self.stream_id.get().to_le_bytes());
        match self.endpoint.ip() {
            IpAddr::V4(v4) => {
                out[8] = KIND_V4;
                out[9..13].copy_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                out[8] = KIND_V6;
                out[9..25].copy_from_slice(&v6.octets());
            }
        }
        out[25..27].copy_from_slice(&self.endpoint.port().to_le_bytes());
        out
    }

    /// Deserialize from the fixed wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError> {
        if bytes.len() != TOKEN_WIRE_SIZE {
            return Err(TokenError::WrongSize(bytes.len()));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[..8]);
        let stream_id = StreamId::new(u64::from_le_bytes(id));

        let ip = match bytes[8] {
            KIND_V4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&bytes[9..13]);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            KIND_V6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes[9..25]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => return Err(TokenError::BadAddressKind(other)),
        };
        let port = u16::from_le_bytes([bytes[25], bytes[26]]);

        Ok(Self {
            stream_id,
            endpoint: SocketAddr::new(ip, port),
        })
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream {} @ {}", self.stream_id, self.endpoint)
    }
}

/// Errors decoding a token from bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    WrongSize(usize),
    BadAddressKind(u8),
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenError::WrongSize(n) => {
                write!(f, "token must be {TOKEN_WIRE_SIZE} bytes, got {n}")
            }
            TokenError::BadAddressKind(k) => write!(f, "unknown address kind {k}"),
        }
    }
}

impl std::error::Error for TokenError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trip() {
        let token = Token::new(
            StreamId::new(42),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 2000),
        );
        let bytes = token.to_bytes();
        assert_eq!(Token::from_bytes(&bytes).unwrap(), token);
    }

    #[test]
    fn v6_round_trip() {
        let token = Token::new(
            StreamId::new(u64::MAX),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 65535),
        );
        let bytes = token.to_bytes();
        assert_eq!(Token::from_bytes(&bytes).unwrap(), token);
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert_eq!(Token::from_bytes(&[0u8; 5]), Err(TokenError::WrongSize(5)));

        let token = Token::new(
            StreamId::new(1),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1),
        );
        let mut bytes = token.to_bytes();
        bytes[8] = 9;
        assert_eq!(Token::from_bytes(&bytes), Err(TokenError::BadAddressKind(9)));
    }
}
