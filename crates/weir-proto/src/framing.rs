//! Length-prefix framing codec.
//!
//! Each frame on the wire is a 2-byte little-endian payload length followed
//! by the payload. The pure helpers operate on buffers; [`FrameEncoder`]
//! and [`FrameDecoder`] adapt the format onto the channel contracts so a
//! packet path can ride a reliable byte-stream transport.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::warn;
use weir_flow::chan::packet_pass::PacketSender;
use weir_flow::chan::packet_recv::PacketReceiver;
use weir_flow::chan::stream_pass::{StreamSendGrant, StreamSendHandler};
use weir_flow::chan::stream_recv::{StreamFillGrant, StreamRecvHandler};

use crate::error::{DecodeError, ProtoError};
use crate::{LEN_PREFIX_SIZE, MAX_PAYLOAD};

/// On-wire size of a frame carrying `payload_len` bytes.
pub fn encoded_len(payload_len: usize) -> usize {
    LEN_PREFIX_SIZE + payload_len
}

/// Append the encoded frame for `payload` to `out`.
pub fn encode_frame_into(out: &mut Vec<u8>, payload: &[u8]) {
    debug_assert!(payload.len() <= MAX_PAYLOAD, "payload exceeds frame format");
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Read the payload length from the front of `bytes`, if a complete prefix
/// is present.
pub fn decode_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < LEN_PREFIX_SIZE {
        return None;
    }
    Some(u16::from_le_bytes([bytes[0], bytes[1]]) as usize)
}

// ---------------------------------------------------------------------------
// Encoder: pull-packet input -> pull-stream output
// ---------------------------------------------------------------------------

struct EncState {
    input: PacketReceiver,
    /// Encoded frame currently being served, and how much of it has gone out.
    pending: Vec<u8>,
    off: usize,
    /// Downstream fill request parked while waiting for an input packet.
    waiting: Option<StreamFillGrant>,
    recv_pending: bool,
    spare: Vec<Vec<u8>>,
}

/// Serves the downstream stream-pull channel from the encoder state.
struct EncServe {
    state: Weak<RefCell<EncState>>,
    /// Keeps an unservable grant alive if the encoder is gone.
    // Written once at teardown, never read back.
    #[allow(dead_code)]
    orphaned: Option<StreamFillGrant>,
}

impl StreamRecvHandler for EncServe {
    fn on_fill(&mut self, grant: StreamFillGrant) {
        let Some(state) = self.state.upgrade() else {
            self.orphaned = Some(grant);
            return;
        };
        serve(&mut state.borrow_mut(), grant);
    }
}

fn serve(s: &mut EncState, mut grant: StreamFillGrant) {
    if s.off < s.pending.len() {
        let n = grant.max().min(s.pending.len() - s.off);
        grant.buffer_mut().extend_from_slice(&s.pending[s.off..s.off + n]);
        s.off += n;
        if s.off == s.pending.len() {
            s.pending.clear();
            s.off = 0;
        }
        grant.complete();
    } else {
        // Nothing encoded: fetch the next packet and serve when it lands.
        s.waiting = Some(grant);
        if !s.recv_pending {
            s.recv_pending = true;
            let buf = s.spare.pop().unwrap_or_default();
            s.input.recv(buf);
        }
    }
}

/// Adapter from a pull-packet input to a pull-stream output.
///
/// Each input packet is served as one encoded frame, across as many partial
/// fills as the downstream consumer asks for. Input packets are fetched
/// lazily, only once the consumer wants bytes.
pub struct FrameEncoder {
    state: Rc<RefCell<EncState>>,
}

impl FrameEncoder {
    /// Wrap `input` (MTU at most [`MAX_PAYLOAD`]). Returns the encoder and
    /// the handler to build the downstream `StreamReceiver` over.
    pub fn new(
        input: PacketReceiver,
    ) -> Result<(Self, Rc<RefCell<dyn StreamRecvHandler>>), ProtoError> {
        let mtu = input.mtu();
        if mtu > MAX_PAYLOAD {
            return Err(ProtoError::MtuTooLarge(mtu));
        }
        let state = Rc::new(RefCell::new(EncState {
            input,
            pending: Vec::new(),
            off: 0,
            waiting: None,
            recv_pending: false,
            spare: Vec::new(),
        }));

        let weak = Rc::downgrade(&state);
        state.borrow().input.set_done(move |mut packet| {
            let Some(state) = weak.upgrade() else { return };
            let s = &mut *state.borrow_mut();
            s.recv_pending = false;
            debug_assert!(s.pending.is_empty(), "packet fetched with a frame pending");
            encode_frame_into(&mut s.pending, &packet);
            packet.clear();
            s.spare.push(packet);
            if let Some(grant) = s.waiting.take() {
                serve(s, grant);
            }
        });

        let handler = Rc::new(RefCell::new(EncServe {
            state: Rc::downgrade(&state),
            orphaned: None,
        }));
        Ok((Self { state }, handler))
    }

    /// Bytes of the current frame not yet served downstream.
    pub fn unserved_bytes(&self) -> usize {
        let s = self.state.borrow();
        s.pending.len() - s.off
    }
}

// ---------------------------------------------------------------------------
// Decoder: push-stream input -> push-packet output
// ---------------------------------------------------------------------------

type ErrorFn = Box<dyn FnMut(DecodeError)>;

struct DecState {
    output: PacketSender,
    max_payload: usize,
    /// Accumulated stream bytes, at most `LEN_PREFIX_SIZE + max_payload`.
    acc: Vec<u8>,
    /// Input grant withheld while the accumulation buffer is full.
    held: Option<StreamSendGrant>,
    out_busy: bool,
    on_error: Option<ErrorFn>,
    spare: Vec<Vec<u8>>,
}

/// Consumes the upstream stream-push channel into the decoder state.
struct DecIngest {
    state: Weak<RefCell<DecState>>,
    // Written once at teardown, never read back.
    #[allow(dead_code)]
    orphaned: Option<StreamSendGrant>,
}

impl StreamSendHandler for DecIngest {
    fn on_chunk(&mut self, grant: StreamSendGrant) {
        let Some(state) = self.state.upgrade() else {
            self.orphaned = Some(grant);
            return;
        };
        {
            let s = &mut *state.borrow_mut();
            debug_assert!(s.held.is_none(), "chunk offered while one is withheld");
            ingest(s, grant);
        }
        pump(&state);
    }
}

/// Accept as much of the chunk as fits; withhold the grant when full.
/// Withholding is the decoder's backpressure: the upstream sender stays
/// busy until space opens.
fn ingest(s: &mut DecState, grant: StreamSendGrant) {
    let cap = LEN_PREFIX_SIZE + s.max_payload;
    let room = cap - s.acc.len();
    if room == 0 {
        s.held = Some(grant);
        return;
    }
    let n = grant.data().len().min(room);
    s.acc.extend_from_slice(&grant.data()[..n]);
    grant.complete(n);
}

fn pump(state: &Rc<RefCell<DecState>>) {
    loop {
        let mut error = None;
        let progress = {
            let s = &mut *state.borrow_mut();
            step(s, &mut error)
        };
        if let Some(err) = error {
            warn!(%err, "frame stream desynchronized, discarding buffer");
            report(state, err);
        }
        if !progress {
            return;
        }
    }
}

/// One pump step: extract a frame, reject an oversize header, or feed the
/// withheld grant. Returns whether anything changed.
fn step(s: &mut DecState, error: &mut Option<DecodeError>) -> bool {
    if let Some(len) = decode_len(&s.acc) {
        if len > s.max_payload {
            // No resynchronization: everything accumulated is discarded,
            // including withheld input.
            *error = Some(DecodeError::FrameTooLarge { len, max: s.max_payload });
            s.acc.clear();
            if let Some(grant) = s.held.take() {
                let n = grant.data().len();
                grant.complete(n);
            }
            return true;
        }
        if !s.out_busy && s.acc.len() >= LEN_PREFIX_SIZE + len {
            let mut buf = s.spare.pop().unwrap_or_default();
            buf.extend_from_slice(&s.acc[LEN_PREFIX_SIZE..LEN_PREFIX_SIZE + len]);
            s.acc.drain(..LEN_PREFIX_SIZE + len);
            s.out_busy = true;
            s.output.send(buf);
            return true;
        }
    }
    if s.held.is_some() && s.acc.len() < LEN_PREFIX_SIZE + s.max_payload {
        if let Some(grant) = s.held.take() {
            ingest(s, grant);
            return true;
        }
    }
    false
}

fn report(state: &Rc<RefCell<DecState>>, err: DecodeError) {
    // The callback runs with no borrow held; it may tear the decoder down.
    let cb = state.borrow_mut().on_error.take();
    if let Some(mut cb) = cb {
        cb(err);
        state.borrow_mut().on_error = Some(cb);
    }
}

/// Adapter from a push-stream input to a push-packet output.
///
/// Accumulates stream bytes into a bounded buffer, emits each complete
/// frame's payload as one output packet, and withholds the input grant when
/// the buffer is full. A declared length above the output MTU is a protocol
/// error: the accumulation state is reset and the error callback fires.
pub struct FrameDecoder {
    state: Rc<RefCell<DecState>>,
}

impl FrameDecoder {
    /// Wrap `output`. Returns the decoder and the handler to build the
    /// upstream `StreamSender` over. `on_error` observes protocol errors.
    pub fn new(
        output: PacketSender,
        on_error: impl FnMut(DecodeError) + 'static,
    ) -> (Self, Rc<RefCell<dyn StreamSendHandler>>) {
        let max_payload = output.mtu().min(MAX_PAYLOAD);
        let state = Rc::new(RefCell::new(DecState {
            output,
            max_payload,
            acc: Vec::new(),
            held: None,
            out_busy: false,
            on_error: Some(Box::new(on_error)),
            spare: Vec::new(),
        }));

        let weak = Rc::downgrade(&state);
        state.borrow().output.set_done(move |mut buf| {
            let Some(state) = weak.upgrade() else { return };
            {
                let s = &mut *state.borrow_mut();
                s.out_busy = false;
                buf.clear();
                s.spare.push(buf);
            }
            pump(&state);
        });

        let handler = Rc::new(RefCell::new(DecIngest {
            state: Rc::downgrade(&state),
            orphaned: None,
        }));
        (Self { state }, handler)
    }

    /// Bytes currently accumulated and not yet emitted.
    pub fn buffered_bytes(&self) -> usize {
        self.state.borrow().acc.len()
    }
}
