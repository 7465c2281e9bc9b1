//! # WEIR Flow
//!
//! Channel contracts and buffering adapters for single-threaded packet
//! pipelines.
//!
//! This crate provides:
//! - Push- and pull-style packet channels with a strict one-operation
//!   handshake and cooperative cancellation
//! - Push- and pull-style byte-stream channels with partial acceptance
//! - Buffering adapters: a contiguous-chunk ring bridge, a single-packet
//!   double buffer, a live attach/detach connector, and an inactivity
//!   monitor
//!
//! ## Channel model
//!
//! A channel connects an initiating half (a sender or receiver handle) to a
//! handler on the far side. Buffers move by ownership: the initiator moves a
//! `Vec<u8>` in, the handler receives a single-use grant, and completing the
//! grant hands a buffer back through the initiator's done callback so
//! allocations can be recycled. At most one operation is outstanding per
//! channel at any time; a second operation before the previous done callback
//! is a caller bug, checked with `debug_assert!`.
//!
//! All completions are dispatched through [`weir_reactor::Reactor::defer`],
//! so a done callback never runs inside the operation that triggered it and
//! call stacks stay bounded no matter how many stages complete back-to-back.
//!
//! Everything here is single-threaded: channels and adapters are `Rc`-based
//! and must stay on the thread driving their reactor.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chan;
pub mod connector;
pub mod error;
pub mod monitor;
pub mod packet_buffer;
pub mod ring;
pub mod single_buffer;

pub use chan::packet_pass::{PacketSendHandler, PacketSender, SendGrant, SendToken};
pub use chan::packet_recv::{PacketReceiver, PacketRecvHandler, RecvGrant, RecvToken};
pub use chan::stream_pass::{StreamSendGrant, StreamSendHandler, StreamSender};
pub use chan::stream_recv::{StreamFillGrant, StreamReceiver, StreamRecvHandler};
pub use connector::PacketConnector;
pub use error::FlowError;
pub use monitor::InactivityMonitor;
pub use packet_buffer::PacketBuffer;
pub use ring::ChunkRing;
pub use single_buffer::SinglePacketBuffer;
