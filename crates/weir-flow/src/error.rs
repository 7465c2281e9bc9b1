//! Error types for the flow framework.

use thiserror::Error;

/// Errors surfaced while constructing flow components.
///
/// Runtime capacity pressure is never an error in this crate — bounded
/// buffers apply their drop/backpressure policy silently. Only invalid
/// configuration at construction time is reported.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlowError {
    /// A buffer or ring was requested with zero capacity.
    #[error("invalid capacity: {0}")]
    InvalidCapacity(usize),

    /// The requested ring size overflows address arithmetic.
    #[error("buffer capacity overflows for {packets} packets of mtu {mtu}")]
    CapacityOverflow {
        /// Requested packet count.
        packets: usize,
        /// Per-packet maximum transfer unit.
        mtu: usize,
    },
}
