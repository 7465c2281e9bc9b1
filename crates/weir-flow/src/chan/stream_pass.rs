//! Push-style byte-stream channel.
//!
//! Like the packet variant, but the consumer may accept only a prefix of an
//! offered chunk: [`StreamSendGrant::complete`] takes the accepted length
//! (at least one byte), and the producer's done callback receives
//! `(buffer, accepted)` so the producer can re-offer the remainder. This
//! models a reliable byte-stream transport underneath packet framing.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use weir_reactor::Reactor;

use super::ChanState;

type DoneFn = Box<dyn FnMut(Vec<u8>, usize)>;

/// Consumer side of a push-style stream channel.
pub trait StreamSendHandler: 'static {
    /// A chunk has been offered. The handler owns the grant until it
    /// completes it, accepting between 1 and `data().len()` bytes.
    fn on_chunk(&mut self, grant: StreamSendGrant);
}

struct Shared {
    reactor: Rc<dyn Reactor>,
    state: Cell<ChanState>,
    handler: Rc<RefCell<dyn StreamSendHandler>>,
    done: RefCell<Option<DoneFn>>,
    done_set: Cell<bool>,
}

/// Producer half of a push-style stream channel.
pub struct StreamSender {
    shared: Rc<Shared>,
}

impl StreamSender {
    /// Create a channel over `handler` and return the producer half.
    pub fn new(reactor: Rc<dyn Reactor>, handler: Rc<RefCell<dyn StreamSendHandler>>) -> Self {
        Self {
            shared: Rc::new(Shared {
                reactor,
                state: Cell::new(ChanState::Idle),
                handler,
                done: RefCell::new(None),
                done_set: Cell::new(false),
            }),
        }
    }

    /// Install the completion callback (`buffer, accepted`). Must be called
    /// exactly once, before the first [`StreamSender::send`].
    pub fn set_done(&self, done: impl FnMut(Vec<u8>, usize) + 'static) {
        debug_assert!(!self.shared.done_set.get(), "done handler already set");
        *self.shared.done.borrow_mut() = Some(Box::new(done));
        self.shared.done_set.set(true);
    }

    /// True when no operation is outstanding.
    pub fn is_idle(&self) -> bool {
        self.shared.state.get() == ChanState::Idle
    }

    /// Offer a non-empty chunk to the consumer. The channel must be idle.
    pub fn send(&self, chunk: Vec<u8>) {
        let shared = &self.shared;
        debug_assert!(shared.done_set.get(), "send before done handler set");
        debug_assert_eq!(shared.state.get(), ChanState::Idle, "second send while busy");
        debug_assert!(!chunk.is_empty(), "empty stream chunk");
        shared.state.set(ChanState::Busy);
        let shared = Rc::clone(shared);
        self.shared.reactor.defer(Box::new(move || {
            let handler = Rc::clone(&shared.handler);
            let grant = StreamSendGrant {
                shared: Rc::clone(&shared),
                chunk,
                completed: false,
            };
            handler.borrow_mut().on_chunk(grant);
        }));
    }
}

/// Single-use lease on an offered chunk, held by the consumer.
///
/// The grant may be stored and completed later; withholding completion is
/// how a full consumer applies backpressure.
pub struct StreamSendGrant {
    shared: Rc<Shared>,
    chunk: Vec<u8>,
    completed: bool,
}

impl StreamSendGrant {
    /// The offered bytes.
    pub fn data(&self) -> &[u8] {
        &self.chunk
    }

    /// Accept `accepted` bytes (1..=len) and hand the buffer back.
    pub fn complete(mut self, accepted: usize) {
        debug_assert!(accepted >= 1, "must accept at least one byte");
        debug_assert!(accepted <= self.chunk.len(), "accepted more than offered");
        let chunk = std::mem::take(&mut self.chunk);
        self.completed = true;
        let shared = Rc::clone(&self.shared);
        let state = shared.state.get();
        debug_assert!(
            matches!(state, ChanState::Busy | ChanState::CancelPending),
            "done without a pending send"
        );
        shared.state.set(ChanState::Completing);
        let reactor = Rc::clone(&shared.reactor);
        reactor.defer(Box::new(move || {
            shared.state.set(ChanState::Idle);
            let mut done = shared.done.borrow_mut();
            if let Some(cb) = done.as_mut() {
                cb(chunk, accepted);
            }
        }));
    }
}

impl Drop for StreamSendGrant {
    fn drop(&mut self) {
        debug_assert!(self.completed, "stream grant dropped without completing");
    }
}
