//! Error types for the relay router.

use thiserror::Error;
use weir_proto::PeerId;

/// Errors from router construction and peer management.
///
/// Frame-level conditions (unknown peer on submit, queue overflow, oversize
/// frames) are never errors: the frame is dropped and counted, as the data
/// plane must keep moving.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
    /// A configuration field failed validation.
    #[error("invalid router configuration: {0}")]
    InvalidConfig(&'static str),

    /// The named peer is not registered in the relevant role.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// The peer is already registered in that role.
    #[error("peer {0} already registered")]
    DuplicatePeer(PeerId),

    /// The sink already has an output attached.
    #[error("sink {0} already has an output attached")]
    AlreadyAttached(PeerId),

    /// The sink has no output attached.
    #[error("sink {0} has no output attached")]
    NotAttached(PeerId),
}
