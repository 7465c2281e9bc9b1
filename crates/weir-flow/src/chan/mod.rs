//! Channel contracts: single-operation producer/consumer handshakes.
//!
//! Four channel types, all sharing the same state machine:
//!
//! | type                     | initiator        | payload        |
//! |--------------------------|------------------|----------------|
//! | [`packet_pass`]          | producer (push)  | whole packets  |
//! | [`packet_recv`]          | consumer (pull)  | whole packets  |
//! | [`stream_pass`]          | producer (push)  | byte chunks    |
//! | [`stream_recv`]          | consumer (pull)  | byte chunks    |
//!
//! Stream channels allow partial acceptance: the notified side may take
//! fewer bytes than offered (or produce fewer than requested), and the
//! initiator re-offers or re-requests the remainder.

pub mod packet_pass;
pub mod packet_recv;
pub mod stream_pass;
pub mod stream_recv;

/// Handshake state of a channel.
///
/// `Completing` covers the window between a grant being completed and the
/// deferred done callback actually running; the channel is still not free
/// for the next operation during that window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChanState {
    Idle,
    Busy,
    CancelPending,
    Completing,
}
