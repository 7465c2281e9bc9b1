//! Traffic inactivity monitor.
//!
//! [`InactivityMonitor`] sits transparently in a push-style packet path and
//! watches for silence: every packet that passes re-arms a timer, and when
//! the configured window elapses with no traffic the idle callback fires.
//! The callback keeps firing once per window for as long as the silence
//! lasts. Forwarding semantics are untouched; completion and cancellation
//! pass straight through.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use weir_reactor::{Reactor, TimerKey};

use crate::chan::packet_pass::{PacketSendHandler, PacketSender, SendGrant, SendToken};

type IdleFn = Box<dyn FnMut()>;

struct State {
    reactor: Rc<dyn Reactor>,
    output: PacketSender,
    window: Duration,
    timer: Option<TimerKey>,
    on_idle: Option<IdleFn>,
    /// Upstream completion for the packet currently at the output.
    pending: Option<SendToken>,
}

struct InputSide {
    state: Weak<RefCell<State>>,
    cancellable: bool,
}

impl PacketSendHandler for InputSide {
    fn on_packet(&mut self, grant: SendGrant) {
        let Some(state) = self.state.upgrade() else {
            grant.complete();
            return;
        };
        {
            let s = &mut *state.borrow_mut();
            debug_assert!(s.pending.is_none(), "one packet at a time on the input");
            if let Some(key) = s.timer.take() {
                s.reactor.cancel_timer(key);
            }
            let (packet, token) = grant.into_parts();
            s.pending = Some(token);
            s.output.send(packet);
        }
        arm(&state);
    }

    fn on_cancel(&mut self) {
        let Some(state) = self.state.upgrade() else { return };
        let s = state.borrow();
        if s.pending.is_some() && s.output.supports_cancel() {
            s.output.request_cancel();
        }
    }

    fn supports_cancel(&self) -> bool {
        self.cancellable
    }
}

/// Pass-through packet stage that reports traffic silence.
pub struct InactivityMonitor {
    state: Rc<RefCell<State>>,
}

impl InactivityMonitor {
    /// Wrap `output`, firing `on_idle` whenever `window` elapses without a
    /// packet. Returns the monitor and the input-side sender. The window
    /// opens immediately.
    pub fn new(
        reactor: Rc<dyn Reactor>,
        output: PacketSender,
        window: Duration,
        on_idle: impl FnMut() + 'static,
    ) -> (Self, PacketSender) {
        let cancellable = output.supports_cancel();
        let mtu = output.mtu();
        let state = Rc::new(RefCell::new(State {
            reactor: Rc::clone(&reactor),
            output,
            window,
            timer: None,
            on_idle: Some(Box::new(on_idle)),
            pending: None,
        }));

        let weak = Rc::downgrade(&state);
        state.borrow().output.set_done(move |buf| {
            let Some(state) = weak.upgrade() else { return };
            let token = state.borrow_mut().pending.take();
            if let Some(token) = token {
                token.complete(buf);
            }
        });

        let input = PacketSender::new(
            reactor,
            mtu,
            Rc::new(RefCell::new(InputSide { state: Rc::downgrade(&state), cancellable })),
        );
        arm(&state);
        (Self { state }, input)
    }
}

impl Drop for InactivityMonitor {
    fn drop(&mut self) {
        let s = self.state.borrow();
        if let Some(key) = s.timer {
            s.reactor.cancel_timer(key);
        }
    }
}

fn arm(state: &Rc<RefCell<State>>) {
    let weak = Rc::downgrade(state);
    let s = &mut *state.borrow_mut();
    let window = s.window;
    let reactor = Rc::clone(&s.reactor);
    s.timer = Some(reactor.set_timer(
        window,
        Box::new(move || {
            let Some(state) = weak.upgrade() else { return };
            tracing::debug!("inactivity window elapsed");
            let cb = {
                let s = &mut *state.borrow_mut();
                s.timer = None;
                s.on_idle.take()
            };
            // Call with no borrow held; the callback may tear things down.
            if let Some(mut cb) = cb {
                cb();
                state.borrow_mut().on_idle = Some(cb);
            }
            arm(&state);
        }),
    ));
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

    fn setup(
        reactor: &Rc<StepReactor>,
        window: Duration,
    ) -> (InactivityMonitor, PacketSender, Rc<RefCell<Vec<Vec<u8>>>>, Rc<Cell<u32>>) {
        let got = Rc::new(RefCell::new(Vec::new()));
        let output = PacketSender::new(
            reactor.clone(),
            32,
            Rc::new(RefCell::new(Collect { got: got.clone() })),
        );
        let idles = Rc::new(Cell::new(0u32));
        let i2 = idles.clone();
        let (monitor, input) =
            InactivityMonitor::new(reactor.clone(), output, window, move || i2.set(i2.get() + 1));
        input.set_done(|_| {});
        (monitor, input, got, idles)
    }

    #[test]
    fn test_fires_once_per_silent_window() {
        let reactor = Rc::new(StepReactor::new());
        let (_monitor, _input, _got, idles) = setup(&reactor, Duration::from_millis(100));
        reactor.advance(Duration::from_millis(250));
        assert_eq!(idles.get(), 2);
    }

    #[test]
    fn test_traffic_resets_the_window() {
        let reactor = Rc::new(StepReactor::new());
        let (_monitor, input, got, idles) = setup(&reactor, Duration::from_millis(100));

        reactor.advance(Duration::from_millis(60));
        input.send(vec![7]);
        reactor.run_pending();
        reactor.advance(Duration::from_millis(60));
        // 120ms of wall time, but never 100ms of silence.
        assert_eq!(idles.get(), 0);
        assert_eq!(*got.borrow(), vec![vec![7]]);

        reactor.advance(Duration::from_millis(40));
        assert_eq!(idles.get(), 1);
    }

    #[test]
    fn test_drop_cancels_the_timer() {
        let reactor = Rc::new(StepReactor::new());
        let (monitor, _input, _got, idles) = setup(&reactor, Duration::from_millis(100));
        drop(monitor);
        reactor.advance(Duration::from_millis(500));
        assert_eq!(idles.get(), 0);
    }
}
