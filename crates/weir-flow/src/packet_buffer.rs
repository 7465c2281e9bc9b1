//! Multi-packet buffering bridge.
//!
//! [`PacketBuffer`] pulls packets from a [`PacketReceiver`] and pushes them
//! into a [`PacketSender`], decoupling the two sides through a
//! [`ChunkRing`]. The input side keeps a receive outstanding whenever the
//! ring can reserve a full MTU-sized slot, so a slow consumer exerts
//! backpressure on the producer by starving it of requests rather than by
//! dropping data.
//!
//! Frames are stored in the ring as a 2-byte little-endian length header
//! followed by the payload. Headers are internal; they never appear on
//! either channel.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::chan::packet_pass::PacketSender;
use crate::chan::packet_recv::PacketReceiver;
use crate::error::FlowError;
use crate::ring::ChunkRing;

/// Internal per-frame header: payload length as u16 LE.
const LEN_HDR: usize = 2;

struct State {
    ring: ChunkRing,
    input: PacketReceiver,
    output: PacketSender,
    mtu: usize,
    in_pending: bool,
    out_busy: bool,
    /// Recycled buffers, bounced between the two channels.
    spare: Vec<Vec<u8>>,
}

/// Ring-backed bridge from a pull-style input to a push-style output.
pub struct PacketBuffer {
    state: Rc<RefCell<State>>,
}

impl PacketBuffer {
    /// Bridge `input` to `output` with room for `num_packets` worst-case
    /// frames. Starts pulling immediately.
    pub fn new(
        input: PacketReceiver,
        output: PacketSender,
        num_packets: usize,
    ) -> Result<Self, FlowError> {
        if num_packets == 0 {
            return Err(FlowError::InvalidCapacity(0));
        }
        let mtu = input.mtu();
        debug_assert!(output.mtu() >= mtu, "output MTU below input MTU");
        debug_assert!(mtu <= u16::MAX as usize, "MTU exceeds length header range");
        // One extra byte so the ring can hold num_packets full frames even
        // in the wrapped state.
        let bytes = num_packets
            .checked_mul(LEN_HDR + mtu)
            .and_then(|b| b.checked_add(1))
            .ok_or(FlowError::CapacityOverflow { packets: num_packets, mtu })?;
        let state = Rc::new(RefCell::new(State {
            ring: ChunkRing::with_capacity(bytes)?,
            input,
            output,
            mtu,
            in_pending: false,
            out_busy: false,
            spare: Vec::new(),
        }));

        let weak: Weak<RefCell<State>> = Rc::downgrade(&state);
        state.borrow().input.set_done(move |buf| {
            let Some(state) = weak.upgrade() else { return };
            let s = &mut *state.borrow_mut();
            s.in_pending = false;
            store_frame(s, &buf);
            recycle(s, buf);
            pump(s);
        });

        let weak = Rc::downgrade(&state);
        state.borrow().output.set_done(move |buf| {
            let Some(state) = weak.upgrade() else { return };
            let s = &mut *state.borrow_mut();
            s.out_busy = false;
            recycle(s, buf);
            pump(s);
        });

        pump(&mut state.borrow_mut());
        Ok(Self { state })
    }

    /// Bytes currently queued in the ring, headers included.
    pub fn buffered_bytes(&self) -> usize {
        self.state.borrow().ring.len()
    }
}

fn recycle(s: &mut State, mut buf: Vec<u8>) {
    buf.clear();
    s.spare.push(buf);
}

fn store_frame(s: &mut State, frame: &[u8]) {
    // The slot was reserved before the receive was issued, so this cannot
    // fail between then and now.
    let Some(slot) = s.ring.writable(LEN_HDR + s.mtu) else {
        debug_assert!(false, "frame arrived without a reserved slot");
        return;
    };
    slot[..LEN_HDR].copy_from_slice(&(frame.len() as u16).to_le_bytes());
    slot[LEN_HDR..LEN_HDR + frame.len()].copy_from_slice(frame);
    s.ring.commit(LEN_HDR + frame.len());
}

fn pump(s: &mut State) {
    // Drain side: forward the oldest queued frame when the output is free.
    if !s.out_busy && !s.ring.is_empty() {
        let readable = s.ring.readable();
        let mut hdr = [0u8; LEN_HDR];
        hdr.copy_from_slice(&readable[..LEN_HDR]);
        let len = u16::from_le_bytes(hdr) as usize;
        let mut buf = s.spare.pop().unwrap_or_default();
        buf.extend_from_slice(&readable[LEN_HDR..LEN_HDR + len]);
        s.ring.consume(LEN_HDR + len);
        s.out_busy = true;
        s.output.send(buf);
    }
    // Fill side: keep a receive outstanding while a full slot is
    // reservable. Not reserving is the backpressure mechanism.
    if !s.in_pending && s.ring.writable(LEN_HDR + s.mtu).is_some() {
        s.in_pending = true;
        let buf = s.spare.pop().unwrap_or_else(|| Vec::with_capacity(s.mtu));
        s.input.recv(buf);
    }
}
