//! # WEIR Reactor
//!
//! Event-loop abstraction the WEIR core is driven by.
//!
//! The core never blocks and never spawns threads: every completion is a
//! callback dispatched by a reactor, and every timeout is a reactor timer.
//! This crate defines the [`Reactor`] trait consumed by the rest of the
//! workspace and provides [`StepReactor`], a deterministic single-threaded
//! implementation with a manually advanced clock.
//!
//! Completions queued with [`Reactor::defer`] run on a later loop iteration,
//! never inside the call that queued them. This keeps call stacks bounded
//! when several pipeline stages complete back-to-back and guarantees that a
//! channel's done callback never runs inside the operation that triggered it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod step;

pub use step::StepReactor;

use std::time::Duration;

/// A unit of deferred work, run at most once from the reactor loop.
pub type Job = Box<dyn FnOnce() + 'static>;

/// Opaque handle to a scheduled timer.
///
/// Keys are unique for the lifetime of the reactor; cancelling a key whose
/// timer already fired (or was already cancelled) is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

impl TimerKey {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub(crate) fn id(self) -> u64 {
        self.0
    }
}

/// The event loop the core runs on.
///
/// Implementations are single-threaded: jobs and timer callbacks run on the
/// thread driving the reactor, in FIFO order for jobs and deadline order for
/// timers. All core components hold the reactor as `Rc<dyn Reactor>`.
pub trait Reactor {
    /// Queue `job` to run on a later loop iteration.
    fn defer(&self, job: Job);

    /// Schedule `job` to run once, `after` the current virtual time.
    fn set_timer(&self, after: Duration, job: Job) -> TimerKey;

    /// Cancel a scheduled timer. No-op if it already fired or was cancelled.
    fn cancel_timer(&self, key: TimerKey);

    /// Monotonic virtual time since the reactor was created.
    fn now(&self) -> Duration;
}
