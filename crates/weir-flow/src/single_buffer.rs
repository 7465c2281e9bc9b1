//! Single-packet buffering bridge.
//!
//! [`SinglePacketBuffer`] joins a pull-style input to a push-style output
//! with no queueing at all: one buffer shuttles between the two channels,
//! so at any moment the packet is either being produced or being consumed.
//! This is the cheapest way to connect a pull source to a push sink when
//! the source can tolerate waiting for the sink.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::chan::packet_pass::PacketSender;
use crate::chan::packet_recv::PacketReceiver;

struct State {
    input: PacketReceiver,
    output: PacketSender,
}

/// Zero-queue bridge from a pull-style input to a push-style output.
pub struct SinglePacketBuffer {
    state: Rc<RefCell<State>>,
}

impl SinglePacketBuffer {
    /// Bridge `input` to `output`. Starts pulling immediately.
    pub fn new(input: PacketReceiver, output: PacketSender) -> Self {
        let mtu = input.mtu();
        debug_assert!(output.mtu() >= mtu, "output MTU below input MTU");
        let state = Rc::new(RefCell::new(State { input, output }));

        let weak: Weak<RefCell<State>> = Rc::downgrade(&state);
        state.borrow().input.set_done(move |packet| {
            let Some(state) = weak.upgrade() else { return };
            state.borrow().output.send(packet);
        });

        let weak = Rc::downgrade(&state);
        state.borrow().output.set_done(move |mut buffer| {
            let Some(state) = weak.upgrade() else { return };
            buffer.clear();
            state.borrow().input.recv(buffer);
        });

        state.borrow().input.recv(Vec::with_capacity(mtu));
        Self { state }
    }

    /// True when neither side has an operation outstanding.
    pub fn is_quiescent(&self) -> bool {
        let s = self.state.borrow();
        s.input.is_idle() && s.output.is_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use weir_reactor::StepReactor;

    use crate::chan::packet_pass::{PacketSendHandler, PacketSender, SendGrant};
    use crate::chan::packet_recv::{PacketRecvHandler, RecvGrant};

    struct Scripted {
        frames: VecDeque<Vec<u8>>,
        parked: Option<RecvGrant>,
    }

    impl PacketRecvHandler for Scripted {
        fn on_recv(&mut self, mut grant: RecvGrant) {
            match self.frames.pop_front() {
                Some(frame) => {
                    grant.buffer_mut().extend_from_slice(&frame);
                    grant.complete();
                }
                None => self.parked = Some(grant),
            }
        }
    }

    struct Collect {
        got: Rc<RefCell<Vec<Vec<u8>>>>,
    }

    impl PacketSendHandler for Collect {
        fn on_packet(&mut self, grant: SendGrant) {
            self.got.borrow_mut().push(grant.data().to_vec());
            grant.complete();
        }
    }

    #[test]
    fn test_shuttles_packets_one_at_a_time() {
        let reactor = Rc::new(StepReactor::new());
        let producer = Rc::new(RefCell::new(Scripted {
            frames: [vec![10u8], vec![20, 20]].into_iter().collect(),
            parked: None,
        }));
        let got = Rc::new(RefCell::new(Vec::new()));
        let input = PacketReceiver::new(reactor.clone(), 8, producer.clone());
        let output = PacketSender::new(reactor.clone(), 8, Rc::new(RefCell::new(Collect { got: got.clone() })));
        let bridge = SinglePacketBuffer::new(input, output);

        reactor.run_pending();
        assert_eq!(*got.borrow(), vec![vec![10], vec![20, 20]]);
        // The final receive is parked at the exhausted producer.
        assert!(producer.borrow().parked.is_some());
        assert!(!bridge.is_quiescent());
    }
}
