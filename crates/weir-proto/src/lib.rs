//! # WEIR Proto
//!
//! Wire protocol for the packet-flow framework: 2-byte little-endian length
//! framing with channel adapters ([`FrameEncoder`], [`FrameDecoder`]), the
//! relay/control header, and peer identifiers.
//!
//! The framing layer turns a packet channel into a byte stream and back so
//! packets can ride any reliable stream transport. The relay header routes
//! framed packets between peers: a one-byte kind tag followed by the peer
//! identifier the frame concerns.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::fmt;

pub mod error;
pub mod framing;
pub mod header;

pub use error::{DecodeError, HeaderError, ProtoError};
pub use framing::{FrameDecoder, FrameEncoder, decode_len, encode_frame_into, encoded_len};
pub use header::{HeaderKind, OriginStamper, RELAY_HEADER_SIZE, RelayHeader};

/// Largest payload a length-prefixed frame can carry.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Size of the frame length prefix on the wire.
pub const LEN_PREFIX_SIZE: usize = 2;

/// Peer identifier carried in relay headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u16);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
