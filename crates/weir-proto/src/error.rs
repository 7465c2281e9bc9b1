//! Error types for the wire protocol.

use thiserror::Error;

use crate::MAX_PAYLOAD;

/// Errors surfaced while constructing protocol adapters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    /// The input MTU cannot be represented in a 2-byte length prefix.
    #[error("input MTU {0} exceeds the maximum framed payload of {MAX_PAYLOAD} bytes")]
    MtuTooLarge(usize),
}

/// Protocol errors detected while decoding a frame stream.
///
/// Reported through the decoder's error callback, not as a `Result`: the
/// byte stream keeps flowing and the decoder resynchronizes by discarding
/// its accumulation state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// A length prefix declared a payload larger than the receive MTU.
    #[error("declared frame length {len} exceeds receive MTU {max}")]
    FrameTooLarge {
        /// The declared payload length.
        len: usize,
        /// The decoder's maximum accepted payload.
        max: usize,
    },
}

/// Errors from parsing a relay header.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// Fewer bytes than a complete header.
    #[error("relay header truncated at {0} bytes")]
    Truncated(usize),

    /// The kind tag matched no known header kind.
    #[error("unknown header kind {0:#04x}")]
    InvalidKind(u8),
}
