//! Deterministic manually-driven reactor.
//!
//! [`StepReactor`] owns a job queue and a timer table keyed by virtual time.
//! Nothing runs until the caller drives it: [`StepReactor::run_pending`]
//! drains the job queue, [`StepReactor::advance`] moves the virtual clock
//! forward and fires due timers in deadline order, draining jobs between
//! firings. Tests across the workspace use it to make every interleaving
//! reproducible; embedders can drive it from their own poll loop.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use crate::{Job, Reactor, TimerKey};

/// Deterministic single-threaded reactor with a virtual clock.
pub struct StepReactor {
    jobs: RefCell<VecDeque<Job>>,
    /// Timers ordered by `(deadline, id)`; the id breaks deadline ties FIFO.
    timers: RefCell<BTreeMap<(Duration, u64), Job>>,
    /// Reverse index for cancellation.
    deadlines: RefCell<HashMap<u64, Duration>>,
    next_id: Cell<u64>,
    clock: Cell<Duration>,
}

impl StepReactor {
    /// Create a reactor with an empty queue and the clock at zero.
    pub fn new() -> Self {
        Self {
            jobs: RefCell::new(VecDeque::new()),
            timers: RefCell::new(BTreeMap::new()),
            deadlines: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
            clock: Cell::new(Duration::ZERO),
        }
    }

    /// Drain the deferred-job queue, including jobs queued by running jobs.
    pub fn run_pending(&self) {
        loop {
            let job = self.jobs.borrow_mut().pop_front();
            match job {
                Some(job) => job(),
                None => break,
            }
        }
    }

    /// Advance the virtual clock by `by`, firing due timers in deadline
    /// order and draining deferred jobs after each firing.
    ///
    /// Timers set by timer callbacks fire within the same call when their
    /// deadline falls inside the advanced window.
    pub fn advance(&self, by: Duration) {
        self.run_pending();
        let target = self.clock.get() + by;
        loop {
            let due = {
                let timers = self.timers.borrow();
                match timers.keys().next().copied() {
                    Some(key) if key.0 <= target => Some(key),
                    _ => None,
                }
            };
            let Some(key) = due else { break };
            let job = self.timers.borrow_mut().remove(&key);
            self.deadlines.borrow_mut().remove(&key.1);
            self.clock.set(key.0);
            if let Some(job) = job {
                tracing::trace!(at = ?key.0, id = key.1, "timer fired");
                job();
            }
            self.run_pending();
        }
        self.clock.set(target);
    }

    /// Number of jobs currently queued.
    pub fn pending_jobs(&self) -> usize {
        self.jobs.borrow().len()
    }

    /// Number of timers currently scheduled.
    pub fn pending_timers(&self) -> usize {
        self.timers.borrow().len()
    }
}

impl Default for StepReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor for StepReactor {
    fn defer(&self, job: Job) {
        self.jobs.borrow_mut().push_back(job);
    }

    fn set_timer(&self, after: Duration, job: Job) -> TimerKey {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let deadline = self.clock.get() + after;
        self.timers.borrow_mut().insert((deadline, id), job);
        self.deadlines.borrow_mut().insert(id, deadline);
        tracing::trace!(?after, id, "timer set");
        TimerKey::new(id)
    }

    fn cancel_timer(&self, key: TimerKey) {
        if let Some(deadline) = self.deadlines.borrow_mut().remove(&key.id()) {
            self.timers.borrow_mut().remove(&(deadline, key.id()));
            tracing::trace!(id = key.id(), "timer cancelled");
        }
    }

    fn now(&self) -> Duration {
        self.clock.get()
    }
}
