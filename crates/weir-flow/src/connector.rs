//! Live attach/detach output adapter.
//!
//! [`PacketConnector`] accepts pushed packets on a fixed input and forwards
//! each one to whichever output is currently attached. The output can be
//! swapped at any time, including while a packet is in flight:
//!
//! - With no output attached, an inbound packet simply waits; the producer
//!   stays blocked until an output appears and consumes it.
//! - Detaching while a packet is at the old output requests cancellation
//!   (when the old output supports it) and disowns the operation. When the
//!   old output eventually completes, the returned packet is treated as
//!   undelivered and re-offered to the current attachment.
//!
//! A generation counter distinguishes completions of the current
//! attachment from those of disowned ones.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::debug;
use weir_reactor::Reactor;

use crate::chan::packet_pass::{PacketSendHandler, PacketSender, SendGrant, SendToken};

struct Inflight {
    /// Upstream completion, owed once the packet is disposed of.
    token: SendToken,
    /// The packet bytes while not at an output.
    packet: Option<Vec<u8>>,
}

struct State {
    mtu: usize,
    inflight: Option<Inflight>,
    output: Option<PacketSender>,
    /// Bumped on detach; done callbacks from older attachments are stale.
    generation: u64,
}

/// Input side of the connector; consumes the upstream push channel.
struct InputSide {
    state: Weak<RefCell<State>>,
}

impl PacketSendHandler for InputSide {
    fn on_packet(&mut self, grant: SendGrant) {
        let Some(state) = self.state.upgrade() else {
            grant.complete();
            return;
        };
        let s = &mut *state.borrow_mut();
        debug_assert!(s.inflight.is_none(), "one packet at a time on the input");
        let (packet, token) = grant.into_parts();
        s.inflight = Some(Inflight { token, packet: Some(packet) });
        try_forward(s);
    }

    fn on_cancel(&mut self) {
        let Some(state) = self.state.upgrade() else { return };
        let s = &mut *state.borrow_mut();
        if let Some(mut inf) = s.inflight.take() {
            if let Some(packet) = inf.packet.take() {
                // Still waiting for an output: abort immediately.
                inf.token.complete(packet);
            } else {
                // At an output: relay the request if possible; completion
                // arrives through the output's done path either way.
                if let Some(out) = s.output.as_ref() {
                    if out.supports_cancel() {
                        out.request_cancel();
                    }
                }
                s.inflight = Some(inf);
            }
        }
    }

    fn supports_cancel(&self) -> bool {
        true
    }
}

/// Packet channel consumer whose downstream output can be swapped live.
pub struct PacketConnector {
    state: Rc<RefCell<State>>,
}

impl PacketConnector {
    /// Create a connector with no output attached. Returns the connector
    /// and the input-side sender for the upstream producer.
    pub fn new(reactor: Rc<dyn Reactor>, mtu: usize) -> (Self, PacketSender) {
        let state = Rc::new(RefCell::new(State {
            mtu,
            inflight: None,
            output: None,
            generation: 0,
        }));
        let input = PacketSender::new(
            reactor,
            mtu,
            Rc::new(RefCell::new(InputSide { state: Rc::downgrade(&state) })),
        );
        (Self { state }, input)
    }

    /// True while an output is attached.
    pub fn is_attached(&self) -> bool {
        self.state.borrow().output.is_some()
    }

    /// True while a packet is held or in flight.
    pub fn has_pending(&self) -> bool {
        self.state.borrow().inflight.is_some()
    }

    /// Attach `output` (idle, with no done callback installed yet). Any
    /// waiting packet is forwarded at once.
    pub fn attach_output(&self, output: PacketSender) {
        let s = &mut *self.state.borrow_mut();
        debug_assert!(s.output.is_none(), "output already attached");
        debug_assert!(output.mtu() >= s.mtu, "output MTU below connector MTU");
        let weak = Rc::downgrade(&self.state);
        let generation = s.generation;
        output.set_done(move |buf| {
            let Some(state) = weak.upgrade() else { return };
            let s = &mut *state.borrow_mut();
            if s.generation != generation {
                on_stale_done(s, buf);
                return;
            }
            if let Some(inf) = s.inflight.take() {
                inf.token.complete(buf);
            }
        });
        s.output = Some(output);
        debug!(waiting = s.inflight.is_some(), "connector output attached");
        try_forward(s);
    }

    /// Detach the current output. A packet in flight there is disowned and
    /// re-offered to the next attachment when the old output lets go of it.
    pub fn detach_output(&self) {
        let s = &mut *self.state.borrow_mut();
        debug_assert!(s.output.is_some(), "no output attached");
        s.generation += 1;
        if let Some(out) = s.output.take() {
            let in_flight = s.inflight.as_ref().is_some_and(|inf| inf.packet.is_none());
            debug!(in_flight, "connector output detached");
            if in_flight && out.supports_cancel() {
                out.request_cancel();
            }
        }
    }
}

fn try_forward(s: &mut State) {
    let Some(inf) = s.inflight.as_mut() else { return };
    let Some(out) = s.output.as_ref() else { return };
    let Some(packet) = inf.packet.take() else { return };
    out.send(packet);
}

/// A disowned output completed: the packet was not delivered.
fn on_stale_done(s: &mut State, buf: Vec<u8>) {
    if let Some(mut inf) = s.inflight.take() {
        if inf.token.is_cancel_requested() {
            inf.token.complete(buf);
        } else {
            inf.packet = Some(buf);
            s.inflight = Some(inf);
            try_forward(s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use weir_reactor::StepReactor;

    struct Collect {
        got: Rc<RefCell<Vec<Vec<u8>>>>,
    }

    impl PacketSendHandler for Collect {
        fn on_packet(&mut self, grant: SendGrant) {
            self.got.borrow_mut().push(grant.data().to_vec());
            grant.complete();
        }
    }

    struct Hold {
        held: Rc<RefCell<Option<SendGrant>>>,
    }

    impl PacketSendHandler for Hold {
        fn on_packet(&mut self, grant: SendGrant) {
            *self.held.borrow_mut() = Some(grant);
        }
        fn on_cancel(&mut self) {
            if let Some(grant) = self.held.borrow_mut().take() {
                grant.complete();
            }
        }
        fn supports_cancel(&self) -> bool {
            true
        }
    }

    fn collector(reactor: &Rc<StepReactor>) -> (PacketSender, Rc<RefCell<Vec<Vec<u8>>>>) {
        let got = Rc::new(RefCell::new(Vec::new()));
        let sender = PacketSender::new(
            reactor.clone(),
            64,
            Rc::new(RefCell::new(Collect { got: got.clone() })),
        );
        (sender, got)
    }

    #[test]
    fn test_forwards_when_attached() {
        let reactor = Rc::new(StepReactor::new());
        let (connector, input) = PacketConnector::new(reactor.clone(), 64);
        let (output, got) = collector(&reactor);
        connector.attach_output(output);
        let done = Rc::new(Cell::new(false));
        let d2 = done.clone();
        input.set_done(move |_| d2.set(true));

        input.send(vec![1, 2, 3]);
        reactor.run_pending();
        assert_eq!(*got.borrow(), vec![vec![1, 2, 3]]);
        assert!(done.get());
        assert!(!connector.has_pending());
    }

    #[test]
    fn test_packet_waits_for_attachment() {
        let reactor = Rc::new(StepReactor::new());
        let (connector, input) = PacketConnector::new(reactor.clone(), 64);
        let done = Rc::new(Cell::new(false));
        let d2 = done.clone();
        input.set_done(move |_| d2.set(true));

        input.send(vec![5]);
        reactor.run_pending();
        assert!(connector.has_pending());
        assert!(!done.get(), "no completion while detached");

        let (output, got) = collector(&reactor);
        connector.attach_output(output);
        reactor.run_pending();
        assert_eq!(*got.borrow(), vec![vec![5]]);
        assert!(done.get());
    }

    #[test]
    fn test_detach_reoffers_to_next_output() {
        let reactor = Rc::new(StepReactor::new());
        let (connector, input) = PacketConnector::new(reactor.clone(), 64);
        let held = Rc::new(RefCell::new(None));
        let slow = PacketSender::new(
            reactor.clone(),
            64,
            Rc::new(RefCell::new(Hold { held: held.clone() })),
        );
        connector.attach_output(slow);
        input.set_done(|_| {});

        input.send(vec![9, 9]);
        reactor.run_pending();
        assert!(held.borrow().is_some(), "packet in flight at the slow output");

        // Swap outputs while the packet is in flight. The detach relays a
        // cancel, the slow output lets go, and the packet lands at the
        // replacement instead.
        connector.detach_output();
        let (output, got) = collector(&reactor);
        connector.attach_output(output);
        reactor.run_pending();
        assert_eq!(*got.borrow(), vec![vec![9, 9]]);
        assert!(!connector.has_pending());
    }

    #[test]
    fn test_cancel_while_detached_completes_immediately() {
        let reactor = Rc::new(StepReactor::new());
        let (connector, input) = PacketConnector::new(reactor.clone(), 64);
        let done = Rc::new(Cell::new(false));
        let d2 = done.clone();
        input.set_done(move |_| d2.set(true));

        input.send(vec![1]);
        reactor.run_pending();
        input.request_cancel();
        reactor.run_pending();
        assert!(done.get());
        assert!(!connector.has_pending());
    }
}
