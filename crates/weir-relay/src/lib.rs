//! # WEIR Relay
//!
//! Peer relay router: accepts frames submitted for (source, sink) peer
//! pairs, queues them in bounded per-pair flows, and delivers them to each
//! sink's attached packet output in sink-wide arrival order.
//!
//! The router is deliberately lossy under pressure: full queues drop their
//! oldest frame, unroutable frames are dropped outright, and a sink
//! detaching mid-delivery loses the frame in flight. Every drop is counted
//! in [`RouterStats`]. Flows that have been empty and silent for the
//! configured window are freed by a periodic sweep.
//!
//! Like the rest of the framework, the router is single-threaded and driven
//! entirely by its [`weir_reactor::Reactor`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod router;

pub use config::RouterConfig;
pub use error::RelayError;
pub use router::{RelayRouter, RouterStats};
