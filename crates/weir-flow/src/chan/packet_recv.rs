//! Pull-style packet channel.
//!
//! The consumer holds a [`PacketReceiver`] and requests one packet with
//! [`PacketReceiver::recv`], moving in an empty buffer for the producer to
//! fill. The producer's [`PacketRecvHandler`] receives a [`RecvGrant`],
//! fills the buffer (len <= MTU) and completes; the filled buffer arrives
//! back through the consumer's done callback.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use weir_reactor::Reactor;

use super::ChanState;

type DoneFn = Box<dyn FnMut(Vec<u8>)>;

/// Producer side of a pull-style packet channel.
pub trait PacketRecvHandler: 'static {
    /// The consumer has requested a packet. The handler owns the grant
    /// until it completes it.
    fn on_recv(&mut self, grant: RecvGrant);
}

struct Shared {
    reactor: Rc<dyn Reactor>,
    mtu: usize,
    state: Cell<ChanState>,
    handler: Rc<RefCell<dyn PacketRecvHandler>>,
    done: RefCell<Option<DoneFn>>,
    done_set: Cell<bool>,
}

/// Consumer half of a pull-style packet channel.
pub struct PacketReceiver {
    shared: Rc<Shared>,
}

impl PacketReceiver {
    /// Create a channel over `handler` and return the consumer half.
    pub fn new(
        reactor: Rc<dyn Reactor>,
        mtu: usize,
        handler: Rc<RefCell<dyn PacketRecvHandler>>,
    ) -> Self {
        Self {
            shared: Rc::new(Shared {
                reactor,
                mtu,
                state: Cell::new(ChanState::Idle),
                handler,
                done: RefCell::new(None),
                done_set: Cell::new(false),
            }),
        }
    }

    /// Install the completion callback. Must be called exactly once, before
    /// the first [`PacketReceiver::recv`]. The callback receives the filled
    /// buffer.
    pub fn set_done(&self, done: impl FnMut(Vec<u8>) + 'static) {
        debug_assert!(!self.shared.done_set.get(), "done handler already set");
        *self.shared.done.borrow_mut() = Some(Box::new(done));
        self.shared.done_set.set(true);
    }

    /// Maximum packet length this channel carries.
    pub fn mtu(&self) -> usize {
        self.shared.mtu
    }

    /// True when no operation is outstanding.
    pub fn is_idle(&self) -> bool {
        self.shared.state.get() == ChanState::Idle
    }

    /// Request one packet into `buffer` (must be empty; capacity is
    /// recycled). The channel must be idle.
    pub fn recv(&self, buffer: Vec<u8>) {
        let shared = &self.shared;
        debug_assert!(shared.done_set.get(), "recv before done handler set");
        debug_assert_eq!(shared.state.get(), ChanState::Idle, "second recv while busy");
        debug_assert!(buffer.is_empty(), "recv buffer must be empty");
        shared.state.set(ChanState::Busy);
        let shared = Rc::clone(shared);
        self.shared.reactor.defer(Box::new(move || {
            let handler = Rc::clone(&shared.handler);
            let grant = RecvGrant {
                shared: Rc::clone(&shared),
                buffer,
                completed: false,
            };
            handler.borrow_mut().on_recv(grant);
        }));
    }
}

/// Single-use lease on a requested packet slot, held by the producer.
pub struct RecvGrant {
    shared: Rc<Shared>,
    buffer: Vec<u8>,
    completed: bool,
}

impl RecvGrant {
    /// Declared MTU: the most the producer may write.
    pub fn mtu(&self) -> usize {
        self.shared.mtu
    }

    /// The buffer to fill.
    pub fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }

    /// Deliver the filled buffer to the consumer.
    pub fn complete(mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.completed = true;
        debug_assert!(buffer.len() <= self.shared.mtu, "packet exceeds channel MTU");
        complete(&self.shared, buffer);
    }

    /// Split into the buffer and a completion token, for producers that
    /// fill the buffer through another stage.
    pub fn into_parts(mut self) -> (Vec<u8>, RecvToken) {
        let buffer = std::mem::take(&mut self.buffer);
        self.completed = true;
        let token = RecvToken {
            shared: Rc::clone(&self.shared),
            completed: false,
        };
        (buffer, token)
    }
}

impl Drop for RecvGrant {
    fn drop(&mut self) {
        debug_assert!(self.completed, "recv grant dropped without completing");
    }
}

/// Deferred completion capability split off a [`RecvGrant`].
pub struct RecvToken {
    shared: Rc<Shared>,
    completed: bool,
}

impl RecvToken {
    /// Deliver `buffer` (len <= MTU) to the consumer.
    pub fn complete(mut self, buffer: Vec<u8>) {
        self.completed = true;
        debug_assert!(buffer.len() <= self.shared.mtu, "packet exceeds channel MTU");
        complete(&self.shared, buffer);
    }
}

impl Drop for RecvToken {
    fn drop(&mut self) {
        debug_assert!(self.completed, "recv token dropped without completing");
    }
}

fn complete(shared: &Rc<Shared>, buffer: Vec<u8>) {
    debug_assert_eq!(shared.state.get(), ChanState::Busy, "done without a pending recv");
    shared.state.set(ChanState::Completing);
    let shared = Rc::clone(shared);
    let reactor = Rc::clone(&shared.reactor);
    reactor.defer(Box::new(move || {
        shared.state.set(ChanState::Idle);
        let mut done = shared.done.borrow_mut();
        if let Some(cb) = done.as_mut() {
            cb(buffer);
        }
    }));
}
