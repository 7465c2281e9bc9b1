//! Pull-style byte-stream channel.
//!
//! The consumer requests up to `max` bytes into a recycled buffer; the
//! producer fills between 1 and `max` bytes and completes. Producing fewer
//! bytes than requested is normal; the consumer issues further requests for
//! the rest.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use weir_reactor::Reactor;

use super::ChanState;

type DoneFn = Box<dyn FnMut(Vec<u8>)>;

/// Producer side of a pull-style stream channel.
pub trait StreamRecvHandler: 'static {
    /// The consumer has requested bytes. The handler owns the grant until
    /// it completes it; it may store the grant until data is available.
    fn on_fill(&mut self, grant: StreamFillGrant);
}

struct Shared {
    reactor: Rc<dyn Reactor>,
    state: Cell<ChanState>,
    handler: Rc<RefCell<dyn StreamRecvHandler>>,
    done: RefCell<Option<DoneFn>>,
    done_set: Cell<bool>,
}

/// Consumer half of a pull-style stream channel.
pub struct StreamReceiver {
    shared: Rc<Shared>,
}

impl StreamReceiver {
    /// Create a channel over `handler` and return the consumer half.
    pub fn new(reactor: Rc<dyn Reactor>, handler: Rc<RefCell<dyn StreamRecvHandler>>) -> Self {
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

    /// Install the completion callback. Must be called exactly once, before
    /// the first [`StreamReceiver::recv`].
    pub fn set_done(&self, done: impl FnMut(Vec<u8>) + 'static) {
        debug_assert!(!self.shared.done_set.get(), "done handler already set");
        *self.shared.done.borrow_mut() = Some(Box::new(done));
        self.shared.done_set.set(true);
    }

    /// True when no operation is outstanding.
    pub fn is_idle(&self) -> bool {
        self.shared.state.get() == ChanState::Idle
    }

    /// Request up to `max` bytes (at least 1) into `buffer` (must be
    /// empty). The channel must be idle.
    pub fn recv(&self, buffer: Vec<u8>, max: usize) {
        let shared = &self.shared;
        debug_assert!(shared.done_set.get(), "recv before done handler set");
        debug_assert_eq!(shared.state.get(), ChanState::Idle, "second recv while busy");
        debug_assert!(buffer.is_empty(), "recv buffer must be empty");
        debug_assert!(max >= 1, "must request at least one byte");
        shared.state.set(ChanState::Busy);
        let shared = Rc::clone(shared);
        self.shared.reactor.defer(Box::new(move || {
            let handler = Rc::clone(&shared.handler);
            let grant = StreamFillGrant {
                shared: Rc::clone(&shared),
                buffer,
                max,
                completed: false,
            };
            handler.borrow_mut().on_fill(grant);
        }));
    }
}

/// Single-use lease on a requested byte range, held by the producer.
pub struct StreamFillGrant {
    shared: Rc<Shared>,
    buffer: Vec<u8>,
    max: usize,
    completed: bool,
}

impl StreamFillGrant {
    /// The most bytes the producer may write.
    pub fn max(&self) -> usize {
        self.max
    }

    /// The buffer to fill.
    pub fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }

    /// Deliver the filled buffer (1..=max bytes) to the consumer.
    pub fn complete(mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.completed = true;
        debug_assert!(!buffer.is_empty(), "must produce at least one byte");
        debug_assert!(buffer.len() <= self.max, "produced more than requested");
        debug_assert_eq!(self.shared.state.get(), ChanState::Busy, "done without a pending recv");
        self.shared.state.set(ChanState::Completing);
        let shared = Rc::clone(&self.shared);
        let reactor = Rc::clone(&shared.reactor);
        reactor.defer(Box::new(move || {
            shared.state.set(ChanState::Idle);
            let mut done = shared.done.borrow_mut();
            if let Some(cb) = done.as_mut() {
                cb(buffer);
            }
        }));
    }
}

impl Drop for StreamFillGrant {
    fn drop(&mut self) {
        debug_assert!(self.completed, "stream fill grant dropped without completing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_reactor::StepReactor;

    /// Serves a fixed byte sequence, at most `burst` bytes per fill.
    struct Feeder {
        data: Vec<u8>,
        off: usize,
        burst: usize,
        parked: Option<StreamFillGrant>,
    }

    impl StreamRecvHandler for Feeder {
        fn on_fill(&mut self, mut grant: StreamFillGrant) {
            let n = grant.max().min(self.burst).min(self.data.len() - self.off);
            if n == 0 {
                self.parked = Some(grant);
                return;
            }
            grant.buffer_mut().extend_from_slice(&self.data[self.off..self.off + n]);
            self.off += n;
            grant.complete();
        }
    }

    #[test]
    fn test_short_fills_accumulate() {
        let reactor = Rc::new(StepReactor::new());
        let feeder = Rc::new(RefCell::new(Feeder {
            data: (0u8..20).collect(),
            off: 0,
            burst: 7,
            parked: None,
        }));
        let receiver = Rc::new(StreamReceiver::new(reactor.clone(), feeder.clone()));
        let got = Rc::new(RefCell::new(Vec::new()));
        let g2 = got.clone();
        let r2 = Rc::clone(&receiver);
        receiver.set_done(move |mut buf| {
            g2.borrow_mut().extend_from_slice(&buf);
            if g2.borrow().len() < 20 {
                buf.clear();
                r2.recv(buf, 64);
            }
        });

        receiver.recv(Vec::new(), 64);
        reactor.run_pending();
        assert_eq!(*got.borrow(), (0u8..20).collect::<Vec<_>>());
        assert!(feeder.borrow().parked.is_none());
    }
}
