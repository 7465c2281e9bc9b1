//! The relay router.
//!
//! Frames submitted for a (source, sink) pair are queued in a per-pair
//! *flow* and delivered to the sink's attached output in sink-wide arrival
//! order. Flows come and go on their own: submitting to a new pair creates
//! the flow, a bounded queue drops the oldest frame on overflow, and a
//! periodic sweep frees flows that have been empty and silent for the
//! inactivity window.
//!
//! Sinks attach and detach their outputs at runtime. Queued frames survive
//! detachment; a frame already handed to the output when it detaches is
//! lost. A per-sink generation counter makes completions from a previous
//! attachment inert.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, trace, warn};
use weir_flow::chan::packet_pass::PacketSender;
use weir_proto::PeerId;
use weir_reactor::{Reactor, TimerKey};

use crate::config::RouterConfig;
use crate::error::RelayError;

/// A flow is keyed by (source, sink).
type FlowKey = (PeerId, PeerId);

/// Delivery and drop counters, readable at any time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    /// Frames offered via submit, including those dropped.
    pub submitted: u64,
    /// Frames handed to a sink output.
    pub delivered: u64,
    /// Frames dropped because source or sink was unregistered.
    pub dropped_unknown_peer: u64,
    /// Oldest frames dropped by full flow queues.
    pub dropped_overflow: u64,
    /// Frames dropped for exceeding the frame MTU.
    pub dropped_oversize: u64,
    /// Flows freed by the inactivity sweep.
    pub evicted_flows: u64,
    /// Frames lost because their sink detached mid-delivery.
    pub lost_in_flight: u64,
}

struct Source {
    /// Flow keys, least recently active first.
    flows: Vec<FlowKey>,
}

struct Sink {
    flows: Vec<FlowKey>,
    /// One entry per queued frame, in arrival order across all flows.
    delivery: VecDeque<FlowKey>,
    output: Option<PacketSender>,
    busy: bool,
    /// Bumped on detach; completions carrying an older value are ignored.
    generation: u64,
}

struct Flow {
    queue: VecDeque<Vec<u8>>,
    last_activity: Duration,
}

struct Inner {
    cfg: RouterConfig,
    reactor: Rc<dyn Reactor>,
    sources: HashMap<PeerId, Source>,
    sinks: HashMap<PeerId, Sink>,
    flows: HashMap<FlowKey, Flow>,
    stats: RouterStats,
    sweep_timer: Option<TimerKey>,
}

/// Routes frames between registered peers through bounded per-pair queues.
pub struct RelayRouter {
    inner: Rc<RefCell<Inner>>,
}

impl RelayRouter {
    /// Build a router and start its sweep timer.
    pub fn new(reactor: Rc<dyn Reactor>, cfg: RouterConfig) -> Result<Self, RelayError> {
        cfg.validate()?;
        let inner = Rc::new(RefCell::new(Inner {
            cfg,
            reactor,
            sources: HashMap::new(),
            sinks: HashMap::new(),
            flows: HashMap::new(),
            stats: RouterStats::default(),
            sweep_timer: None,
        }));
        arm_sweep(&inner);
        Ok(Self { inner })
    }

    /// Register a peer as a frame source.
    pub fn add_source(&self, id: PeerId) -> Result<(), RelayError> {
        let inner = &mut *self.inner.borrow_mut();
        if inner.sources.contains_key(&id) {
            return Err(RelayError::DuplicatePeer(id));
        }
        inner.sources.insert(id, Source { flows: Vec::new() });
        debug!(source = %id, "source registered");
        Ok(())
    }

    /// Register a peer as a frame sink.
    pub fn add_sink(&self, id: PeerId) -> Result<(), RelayError> {
        let inner = &mut *self.inner.borrow_mut();
        if inner.sinks.contains_key(&id) {
            return Err(RelayError::DuplicatePeer(id));
        }
        inner.sinks.insert(
            id,
            Sink {
                flows: Vec::new(),
                delivery: VecDeque::new(),
                output: None,
                busy: false,
                generation: 0,
            },
        );
        debug!(sink = %id, "sink registered");
        Ok(())
    }

    /// Unregister a source, freeing all of its flows.
    pub fn remove_source(&self, id: PeerId) -> Result<(), RelayError> {
        let inner = &mut *self.inner.borrow_mut();
        let source = inner.sources.remove(&id).ok_or(RelayError::UnknownPeer(id))?;
        for key in source.flows {
            inner.flows.remove(&key);
            if let Some(sink) = inner.sinks.get_mut(&key.1) {
                sink.flows.retain(|k| *k != key);
                sink.delivery.retain(|k| *k != key);
            }
        }
        debug!(source = %id, "source removed");
        Ok(())
    }

    /// Unregister a sink, freeing all flows toward it. A frame in flight at
    /// its output is lost.
    pub fn remove_sink(&self, id: PeerId) -> Result<(), RelayError> {
        let inner = &mut *self.inner.borrow_mut();
        let sink = inner.sinks.remove(&id).ok_or(RelayError::UnknownPeer(id))?;
        if sink.busy {
            inner.stats.lost_in_flight += 1;
        }
        for key in sink.flows {
            inner.flows.remove(&key);
            if let Some(source) = inner.sources.get_mut(&key.0) {
                source.flows.retain(|k| *k != key);
            }
        }
        debug!(sink = %id, "sink removed");
        Ok(())
    }

    /// Attach `output` (idle, done callback not yet installed) to a sink
    /// and start delivering its queued frames.
    pub fn attach_sink(&self, id: PeerId, output: PacketSender) -> Result<(), RelayError> {
        let weak = Rc::downgrade(&self.inner);
        let inner = &mut *self.inner.borrow_mut();
        debug_assert!(output.mtu() >= inner.cfg.frame_mtu, "output MTU below frame MTU");
        let sink = inner.sinks.get_mut(&id).ok_or(RelayError::UnknownPeer(id))?;
        if sink.output.is_some() {
            return Err(RelayError::AlreadyAttached(id));
        }
        let generation = sink.generation;
        output.set_done(move |_buf| {
            let Some(rc) = weak.upgrade() else { return };
            let inner = &mut *rc.borrow_mut();
            let Some(sink) = inner.sinks.get_mut(&id) else { return };
            if sink.generation != generation {
                // A completion from before a detach; the frame it carried
                // was already counted lost.
                return;
            }
            sink.busy = false;
            pump_sink(inner, id);
        });
        sink.output = Some(output);
        debug!(sink = %id, queued = sink.delivery.len(), "sink output attached");
        pump_sink(inner, id);
        Ok(())
    }

    /// Detach a sink's output. Queued frames stay; a frame in flight is
    /// counted lost.
    pub fn detach_sink(&self, id: PeerId) -> Result<(), RelayError> {
        let inner = &mut *self.inner.borrow_mut();
        let sink = inner.sinks.get_mut(&id).ok_or(RelayError::UnknownPeer(id))?;
        let Some(output) = sink.output.take() else {
            return Err(RelayError::NotAttached(id));
        };
        sink.generation += 1;
        let lost = sink.busy;
        sink.busy = false;
        if lost {
            inner.stats.lost_in_flight += 1;
            if output.supports_cancel() {
                output.request_cancel();
            }
        }
        debug!(sink = %id, lost, "sink output detached");
        Ok(())
    }

    /// Queue `frame` on the (source, sink) flow and, unless `more`
    /// promises further fragments of the same burst, pump delivery.
    ///
    /// Never fails: frames that cannot be routed are dropped and counted.
    pub fn submit(&self, source: PeerId, sink: PeerId, frame: &[u8], more: bool) {
        let inner = &mut *self.inner.borrow_mut();
        inner.stats.submitted += 1;
        if frame.len() > inner.cfg.frame_mtu {
            inner.stats.dropped_oversize += 1;
            warn!(%source, %sink, len = frame.len(), "oversize frame dropped");
            return;
        }
        if !inner.sources.contains_key(&source) || !inner.sinks.contains_key(&sink) {
            inner.stats.dropped_unknown_peer += 1;
            warn!(%source, %sink, "frame for unregistered peer dropped");
            return;
        }

        let key = (source, sink);
        let now = inner.reactor.now();
        if !inner.flows.contains_key(&key) {
            inner.flows.insert(key, Flow { queue: VecDeque::new(), last_activity: now });
            if let Some(src) = inner.sources.get_mut(&source) {
                src.flows.push(key);
            }
            if let Some(snk) = inner.sinks.get_mut(&sink) {
                snk.flows.push(key);
            }
            debug!(%source, %sink, "flow created");
        }

        let Some(flow) = inner.flows.get_mut(&key) else { return };
        if flow.queue.len() == inner.cfg.flow_queue_capacity {
            // Oldest-drop policy: the new frame always gets in.
            flow.queue.pop_front();
            inner.stats.dropped_overflow += 1;
            if let Some(snk) = inner.sinks.get_mut(&sink) {
                if let Some(pos) = snk.delivery.iter().position(|k| *k == key) {
                    snk.delivery.remove(pos);
                }
            }
            warn!(%source, %sink, "flow queue full, oldest frame dropped");
        }
        flow.queue.push_back(frame.to_vec());
        flow.last_activity = now;
        trace!(%source, %sink, len = frame.len(), queued = flow.queue.len(), "frame queued");

        // Most-recently-active flows move to the tail of the source's list.
        if let Some(src) = inner.sources.get_mut(&source) {
            if let Some(pos) = src.flows.iter().position(|k| *k == key) {
                src.flows.remove(pos);
            }
            src.flows.push(key);
        }
        if let Some(snk) = inner.sinks.get_mut(&sink) {
            snk.delivery.push_back(key);
        }

        if !more {
            pump_sink(inner, sink);
        }
    }

    /// Current counters.
    pub fn stats(&self) -> RouterStats {
        self.inner.borrow().stats
    }

    /// Number of live flows.
    pub fn flow_count(&self) -> usize {
        self.inner.borrow().flows.len()
    }

    /// Whether a flow exists for the pair.
    pub fn has_flow(&self, source: PeerId, sink: PeerId) -> bool {
        self.inner.borrow().flows.contains_key(&(source, sink))
    }

    /// Frames queued on the pair's flow.
    pub fn queued_frames(&self, source: PeerId, sink: PeerId) -> usize {
        self.inner
            .borrow()
            .flows
            .get(&(source, sink))
            .map_or(0, |flow| flow.queue.len())
    }

    /// Whether the sink currently has an output attached.
    pub fn is_attached(&self, sink: PeerId) -> bool {
        self.inner
            .borrow()
            .sinks
            .get(&sink)
            .is_some_and(|s| s.output.is_some())
    }
}

impl Drop for RelayRouter {
    fn drop(&mut self) {
        let inner = self.inner.borrow();
        if let Some(key) = inner.sweep_timer {
            inner.reactor.cancel_timer(key);
        }
    }
}

/// Hand the next frame in arrival order to the sink's output, if it is
/// attached and idle.
fn pump_sink(inner: &mut Inner, id: PeerId) {
    let Some(sink) = inner.sinks.get_mut(&id) else { return };
    if sink.busy || sink.output.is_none() {
        return;
    }
    let Some(key) = sink.delivery.pop_front() else { return };
    let frame = inner
        .flows
        .get_mut(&key)
        .and_then(|flow| flow.queue.pop_front());
    let Some(frame) = frame else {
        debug_assert!(false, "delivery entry without a queued frame");
        return;
    };
    sink.busy = true;
    inner.stats.delivered += 1;
    trace!(source = %key.0, sink = %key.1, len = frame.len(), "frame delivered");
    if let Some(out) = sink.output.as_ref() {
        out.send(frame);
    }
}

fn arm_sweep(rc: &Rc<RefCell<Inner>>) {
    let weak = Rc::downgrade(rc);
    let inner = &mut *rc.borrow_mut();
    let period = inner.cfg.inactivity_window;
    let reactor = Rc::clone(&inner.reactor);
    inner.sweep_timer = Some(reactor.set_timer(
        period,
        Box::new(move || {
            let Some(rc) = weak.upgrade() else { return };
            sweep(&mut rc.borrow_mut());
            arm_sweep(&rc);
        }),
    ));
}

/// Free every flow that is empty and has been silent for the window.
fn sweep(inner: &mut Inner) {
    let now = inner.reactor.now();
    let window = inner.cfg.inactivity_window;
    let mut evicted = Vec::new();
    inner.flows.retain(|key, flow| {
        let stale =
            flow.queue.is_empty() && now.saturating_sub(flow.last_activity) >= window;
        if stale {
            evicted.push(*key);
        }
        !stale
    });
    for key in evicted {
        if let Some(src) = inner.sources.get_mut(&key.0) {
            src.flows.retain(|k| *k != key);
        }
        if let Some(snk) = inner.sinks.get_mut(&key.1) {
            snk.flows.retain(|k| *k != key);
        }
        inner.stats.evicted_flows += 1;
        debug!(source = %key.0, sink = %key.1, "inactive flow evicted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_flow::chan::packet_pass::{PacketSendHandler, SendGrant};
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

    fn small_config() -> RouterConfig {
        RouterConfig {
            frame_mtu: 64,
            inactivity_window: Duration::from_secs(10),
            flow_queue_capacity: 2,
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

    const A: PeerId = PeerId(1);
    const B: PeerId = PeerId(2);
    const C: PeerId = PeerId(3);

    fn router_with_peers(reactor: &Rc<StepReactor>) -> RelayRouter {
        let router = RelayRouter::new(reactor.clone(), small_config()).unwrap();
        router.add_source(A).unwrap();
        router.add_source(B).unwrap();
        router.add_sink(B).unwrap();
        router.add_sink(C).unwrap();
        router
    }

    #[test]
    fn test_unroutable_frames_dropped_without_flows() {
        let reactor = Rc::new(StepReactor::new());
        let router = router_with_peers(&reactor);

        router.submit(PeerId(99), B, &[1], false);
        router.submit(A, PeerId(99), &[1], false);
        router.submit(A, B, &[0u8; 65], false);
        assert_eq!(router.flow_count(), 0);

        let stats = router.stats();
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.dropped_unknown_peer, 2);
        assert_eq!(stats.dropped_oversize, 1);
    }

    #[test]
    fn test_attached_sink_receives_in_order() {
        let reactor = Rc::new(StepReactor::new());
        let router = router_with_peers(&reactor);
        let (output, got) = collector(&reactor);
        router.attach_sink(B, output).unwrap();

        router.submit(A, B, &[1], false);
        router.submit(A, B, &[2], false);
        reactor.run_pending();
        assert_eq!(*got.borrow(), vec![vec![1], vec![2]]);
        assert_eq!(router.stats().delivered, 2);
        // Delivered flows stay until swept.
        assert!(router.has_flow(A, B));
        assert_eq!(router.queued_frames(A, B), 0);
    }

    #[test]
    fn test_detached_queue_drops_oldest_then_flushes() {
        let reactor = Rc::new(StepReactor::new());
        let router = router_with_peers(&reactor);

        // Capacity 2: the third submission evicts the first.
        router.submit(A, B, &[1], false);
        router.submit(A, B, &[2], false);
        router.submit(A, B, &[3], false);
        assert_eq!(router.queued_frames(A, B), 2);
        assert_eq!(router.stats().dropped_overflow, 1);

        let (output, got) = collector(&reactor);
        router.attach_sink(B, output).unwrap();
        reactor.run_pending();
        assert_eq!(*got.borrow(), vec![vec![2], vec![3]]);
    }

    #[test]
    fn test_delivery_is_fifo_across_flows() {
        let reactor = Rc::new(StepReactor::new());
        let router = router_with_peers(&reactor);

        router.submit(A, C, &[10], false);
        router.submit(B, C, &[20], false);
        router.submit(A, C, &[11], false);
        router.submit(B, C, &[21], false);

        let (output, got) = collector(&reactor);
        router.attach_sink(C, output).unwrap();
        reactor.run_pending();
        assert_eq!(*got.borrow(), vec![vec![10], vec![20], vec![11], vec![21]]);
    }

    #[test]
    fn test_flows_are_isolated() {
        let reactor = Rc::new(StepReactor::new());
        let router = router_with_peers(&reactor);

        // Overflow A->C without touching B->C.
        for i in 0..5u8 {
            router.submit(A, C, &[i], false);
        }
        router.submit(B, C, &[100], false);
        assert_eq!(router.queued_frames(A, C), 2);
        assert_eq!(router.queued_frames(B, C), 1);

        let (output, got) = collector(&reactor);
        router.attach_sink(C, output).unwrap();
        reactor.run_pending();
        assert_eq!(*got.borrow(), vec![vec![3], vec![4], vec![100]]);
    }

    #[test]
    fn test_more_flag_defers_the_pump() {
        let reactor = Rc::new(StepReactor::new());
        let router = router_with_peers(&reactor);
        let (output, got) = collector(&reactor);
        router.attach_sink(B, output).unwrap();

        router.submit(A, B, &[1], true);
        reactor.run_pending();
        assert!(got.borrow().is_empty(), "delivery deferred while more fragments follow");

        router.submit(A, B, &[2], false);
        reactor.run_pending();
        assert_eq!(*got.borrow(), vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_detach_loses_frame_in_flight() {
        let reactor = Rc::new(StepReactor::new());
        let router = router_with_peers(&reactor);
        let held = Rc::new(RefCell::new(None));
        let slow = PacketSender::new(
            reactor.clone(),
            64,
            Rc::new(RefCell::new(Hold { held: held.clone() })),
        );
        router.attach_sink(B, slow).unwrap();

        router.submit(A, B, &[1], false);
        router.submit(A, B, &[2], false);
        reactor.run_pending();
        assert!(held.borrow().is_some(), "first frame in flight");

        router.detach_sink(B).unwrap();
        reactor.run_pending();
        assert_eq!(router.stats().lost_in_flight, 1);
        // The old attachment's completion must not pump the new one early
        // or double-count anything.
        assert!(held.borrow().is_none(), "cancel released the old output");

        let (output, got) = collector(&reactor);
        router.attach_sink(B, output).unwrap();
        reactor.run_pending();
        assert_eq!(*got.borrow(), vec![vec![2]]);
        assert_eq!(router.stats().delivered, 2);
    }

    #[test]
    fn test_inactive_empty_flows_are_swept() {
        let reactor = Rc::new(StepReactor::new());
        let router = router_with_peers(&reactor);
        let (output, _got) = collector(&reactor);
        router.attach_sink(B, output).unwrap();

        router.submit(A, B, &[1], false);
        // Queued but undeliverable frames keep their flow alive.
        router.submit(A, C, &[2], false);
        reactor.run_pending();
        assert_eq!(router.flow_count(), 2);

        reactor.advance(Duration::from_secs(10));
        assert_eq!(router.flow_count(), 1, "emptied flow swept, queued flow kept");
        assert!(router.has_flow(A, C));
        assert_eq!(router.stats().evicted_flows, 1);

        // The surviving flow is refreshed by new traffic.
        reactor.advance(Duration::from_secs(5));
        router.submit(A, C, &[3], false);
        reactor.advance(Duration::from_secs(10));
        assert!(router.has_flow(A, C));
    }

    #[test]
    fn test_peer_removal_frees_flows() {
        let reactor = Rc::new(StepReactor::new());
        let router = router_with_peers(&reactor);

        router.submit(A, B, &[1], false);
        router.submit(A, C, &[2], false);
        router.submit(B, C, &[3], false);
        assert_eq!(router.flow_count(), 3);

        router.remove_source(A).unwrap();
        assert_eq!(router.flow_count(), 1);
        assert!(router.has_flow(B, C));

        router.remove_sink(C).unwrap();
        assert_eq!(router.flow_count(), 0);

        assert_eq!(router.remove_source(A), Err(RelayError::UnknownPeer(A)));
    }

    #[test]
    fn test_duplicate_and_attach_errors() {
        let reactor = Rc::new(StepReactor::new());
        let router = router_with_peers(&reactor);
        assert_eq!(router.add_source(A), Err(RelayError::DuplicatePeer(A)));
        assert_eq!(router.add_sink(B), Err(RelayError::DuplicatePeer(B)));
        assert_eq!(router.detach_sink(B), Err(RelayError::NotAttached(B)));

        let (output, _got) = collector(&reactor);
        router.attach_sink(B, output).unwrap();
        let (second, _got) = collector(&reactor);
        assert_eq!(router.attach_sink(B, second), Err(RelayError::AlreadyAttached(B)));
        assert!(router.is_attached(B));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// A flow queue of capacity C receiving N frames keeps exactly
            /// the newest min(C, N), in order.
            #[test]
            fn bounded_queue_keeps_newest(capacity in 1usize..5, count in 0u8..12) {
                let reactor = Rc::new(StepReactor::new());
                let cfg = RouterConfig {
                    frame_mtu: 16,
                    inactivity_window: Duration::from_secs(60),
                    flow_queue_capacity: capacity,
                };
                let router = RelayRouter::new(reactor.clone(), cfg).unwrap();
                router.add_source(A).unwrap();
                router.add_sink(B).unwrap();

                for i in 0..count {
                    router.submit(A, B, &[i], false);
                }
                let (output, got) = collector(&reactor);
                router.attach_sink(B, output).unwrap();
                reactor.run_pending();

                let kept = (count as usize).min(capacity);
                let expected: Vec<Vec<u8>> =
                    (count - kept as u8..count).map(|i| vec![i]).collect();
                prop_assert_eq!(&*got.borrow(), &expected);
                prop_assert_eq!(
                    router.stats().dropped_overflow,
                    (count as usize - kept) as u64
                );
            }
        }
    }
}
