//! Push-style packet channel.
//!
//! The producer holds a [`PacketSender`] and moves one owned packet in with
//! [`PacketSender::send`]; the consumer's [`PacketSendHandler`] receives a
//! [`SendGrant`] and processes the packet at its leisure. Completing the
//! grant returns a buffer to the producer's done callback, at which point
//! the producer may send again.
//!
//! Cancellation is cooperative and asynchronous: [`PacketSender::request_cancel`]
//! only asks the consumer (via [`PacketSendHandler::on_cancel`]) to complete
//! early; completion still arrives through the normal done callback and the
//! consumer is freed from any obligation of forward progress.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use weir_reactor::Reactor;

use super::ChanState;

type DoneFn = Box<dyn FnMut(Vec<u8>)>;

/// Consumer side of a push-style packet channel.
///
/// Methods are invoked from the reactor loop, never from inside the
/// producer's call.
pub trait PacketSendHandler: 'static {
    /// A packet has been offered. The handler owns the grant until it
    /// completes it (directly or via [`SendGrant::into_parts`]).
    fn on_packet(&mut self, grant: SendGrant);

    /// The producer requested cancellation of the outstanding operation.
    /// Only delivered while the operation is still pending, and only if
    /// [`PacketSendHandler::supports_cancel`] returns true.
    fn on_cancel(&mut self) {}

    /// Whether this consumer honors [`PacketSender::request_cancel`].
    fn supports_cancel(&self) -> bool {
        false
    }
}

struct Shared {
    reactor: Rc<dyn Reactor>,
    mtu: usize,
    state: Cell<ChanState>,
    cancellable: bool,
    handler: Rc<RefCell<dyn PacketSendHandler>>,
    done: RefCell<Option<DoneFn>>,
    done_set: Cell<bool>,
}

/// Producer half of a push-style packet channel.
pub struct PacketSender {
    shared: Rc<Shared>,
}

impl PacketSender {
    /// Create a channel over `handler` and return the producer half.
    pub fn new(
        reactor: Rc<dyn Reactor>,
        mtu: usize,
        handler: Rc<RefCell<dyn PacketSendHandler>>,
    ) -> Self {
        let cancellable = handler.borrow().supports_cancel();
        Self {
            shared: Rc::new(Shared {
                reactor,
                mtu,
                state: Cell::new(ChanState::Idle),
                cancellable,
                handler,
                done: RefCell::new(None),
                done_set: Cell::new(false),
            }),
        }
    }

    /// Install the completion callback. Must be called exactly once, before
    /// the first [`PacketSender::send`]. The callback receives a buffer for
    /// reuse; its contents are unspecified.
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

    /// Whether the consumer honors [`PacketSender::request_cancel`].
    pub fn supports_cancel(&self) -> bool {
        self.shared.cancellable
    }

    /// Offer `packet` (len <= MTU) to the consumer. The channel must be
    /// idle; a second send before the done callback is a caller bug.
    pub fn send(&self, packet: Vec<u8>) {
        let shared = &self.shared;
        debug_assert!(shared.done_set.get(), "send before done handler set");
        debug_assert_eq!(shared.state.get(), ChanState::Idle, "second send while busy");
        debug_assert!(packet.len() <= shared.mtu, "packet exceeds channel MTU");
        shared.state.set(ChanState::Busy);
        let shared = Rc::clone(shared);
        self.shared.reactor.defer(Box::new(move || {
            let handler = Rc::clone(&shared.handler);
            let grant = SendGrant {
                shared: Rc::clone(&shared),
                packet,
                completed: false,
            };
            handler.borrow_mut().on_packet(grant);
        }));
    }

    /// Ask the consumer to complete the outstanding operation early.
    /// No-op when the channel is idle or the completion is already on its
    /// way; the done callback still fires exactly once.
    pub fn request_cancel(&self) {
        let shared = &self.shared;
        debug_assert!(shared.cancellable, "consumer does not support cancel");
        if shared.state.get() != ChanState::Busy {
            return;
        }
        shared.state.set(ChanState::CancelPending);
        let shared = Rc::clone(shared);
        self.shared.reactor.defer(Box::new(move || {
            // The consumer may have completed in the meantime; only notify
            // while the operation is still pending.
            if shared.state.get() == ChanState::CancelPending {
                let handler = Rc::clone(&shared.handler);
                handler.borrow_mut().on_cancel();
            }
        }));
    }
}

/// Single-use lease on an offered packet, held by the consumer.
pub struct SendGrant {
    shared: Rc<Shared>,
    packet: Vec<u8>,
    completed: bool,
}

impl SendGrant {
    /// The offered packet bytes.
    pub fn data(&self) -> &[u8] {
        &self.packet
    }

    /// Declared MTU of the channel.
    pub fn mtu(&self) -> usize {
        self.shared.mtu
    }

    /// True once the producer has requested cancellation.
    pub fn is_cancel_requested(&self) -> bool {
        self.shared.state.get() == ChanState::CancelPending
    }

    /// Acknowledge the packet and hand the buffer back to the producer.
    pub fn complete(mut self) {
        let packet = std::mem::take(&mut self.packet);
        self.completed = true;
        complete(&self.shared, packet);
    }

    /// Split into the packet and a completion token, for adapters that
    /// forward the buffer elsewhere before acknowledging.
    pub fn into_parts(mut self) -> (Vec<u8>, SendToken) {
        let packet = std::mem::take(&mut self.packet);
        self.completed = true;
        let token = SendToken {
            shared: Rc::clone(&self.shared),
            completed: false,
        };
        (packet, token)
    }
}

impl Drop for SendGrant {
    fn drop(&mut self) {
        debug_assert!(self.completed, "send grant dropped without completing");
    }
}

/// Deferred completion capability split off a [`SendGrant`].
pub struct SendToken {
    shared: Rc<Shared>,
    completed: bool,
}

impl SendToken {
    /// True once the producer has requested cancellation.
    pub fn is_cancel_requested(&self) -> bool {
        self.shared.state.get() == ChanState::CancelPending
    }

    /// Acknowledge the operation, handing `buffer` back to the producer.
    /// The buffer need not be the granted allocation.
    pub fn complete(mut self, buffer: Vec<u8>) {
        self.completed = true;
        complete(&self.shared, buffer);
    }
}

impl Drop for SendToken {
    fn drop(&mut self) {
        debug_assert!(self.completed, "send token dropped without completing");
    }
}

fn complete(shared: &Rc<Shared>, buffer: Vec<u8>) {
    let state = shared.state.get();
    debug_assert!(
        matches!(state, ChanState::Busy | ChanState::CancelPending),
        "done without a pending send"
    );
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
