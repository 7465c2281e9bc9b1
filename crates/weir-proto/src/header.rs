//! Relay and control headers.
//!
//! Every framed payload exchanged with a relay starts with a 3-byte header:
//! a one-byte kind tag and a 2-byte little-endian peer identifier. For
//! control traffic the identifier is the origin peer; for relayed traffic
//! it is the destination (outbound) or origin (inbound).

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use weir_flow::chan::packet_recv::{PacketReceiver, PacketRecvHandler, RecvGrant};

use crate::PeerId;
use crate::error::HeaderError;

/// On-wire size of a relay header.
pub const RELAY_HEADER_SIZE: usize = 3;

/// Header kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderKind {
    /// Peer-to-relay control traffic.
    Control = 0x01,
    /// Relayed data traffic.
    Relay = 0x02,
}

impl TryFrom<u8> for HeaderKind {
    type Error = HeaderError;

    fn try_from(value: u8) -> Result<Self, HeaderError> {
        match value {
            0x01 => Ok(HeaderKind::Control),
            0x02 => Ok(HeaderKind::Relay),
            other => Err(HeaderError::InvalidKind(other)),
        }
    }
}

/// A parsed relay header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayHeader {
    /// What the payload is.
    pub kind: HeaderKind,
    /// The peer the payload concerns.
    pub peer: PeerId,
}

impl RelayHeader {
    /// Encode to wire bytes.
    pub fn encode(&self) -> [u8; RELAY_HEADER_SIZE] {
        let peer = self.peer.0.to_le_bytes();
        [self.kind as u8, peer[0], peer[1]]
    }

    /// Parse the header at the front of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < RELAY_HEADER_SIZE {
            return Err(HeaderError::Truncated(bytes.len()));
        }
        Ok(Self {
            kind: HeaderKind::try_from(bytes[0])?,
            peer: PeerId(u16::from_le_bytes([bytes[1], bytes[2]])),
        })
    }
}

struct StampState {
    input: PacketReceiver,
    origin: PeerId,
    /// Downstream request parked while the input packet is fetched.
    waiting: Option<RecvGrant>,
    spare: Vec<Vec<u8>>,
}

/// Serves the downstream packet-pull channel from the stamper state.
struct StampServe {
    state: Weak<RefCell<StampState>>,
    // Written once at teardown, never read back.
    #[allow(dead_code)]
    orphaned: Option<RecvGrant>,
}

impl PacketRecvHandler for StampServe {
    fn on_recv(&mut self, grant: RecvGrant) {
        let Some(state) = self.state.upgrade() else {
            self.orphaned = Some(grant);
            return;
        };
        let s = &mut *state.borrow_mut();
        debug_assert!(s.waiting.is_none(), "one request at a time downstream");
        s.waiting = Some(grant);
        let buf = s.spare.pop().unwrap_or_default();
        s.input.recv(buf);
    }
}

/// Pull-packet adapter that prepends a Control header carrying the local
/// origin identifier to every packet.
///
/// The downstream channel must be built with an MTU at least
/// [`RELAY_HEADER_SIZE`] larger than the input's.
pub struct OriginStamper {
    state: Rc<RefCell<StampState>>,
}

impl OriginStamper {
    /// Wrap `input`, stamping `origin`. Returns the stamper and the handler
    /// to build the downstream `PacketReceiver` over.
    pub fn new(
        input: PacketReceiver,
        origin: PeerId,
    ) -> (Self, Rc<RefCell<dyn PacketRecvHandler>>) {
        let state = Rc::new(RefCell::new(StampState {
            input,
            origin,
            waiting: None,
            spare: Vec::new(),
        }));

        let weak = Rc::downgrade(&state);
        state.borrow().input.set_done(move |mut packet| {
            let Some(state) = weak.upgrade() else { return };
            let s = &mut *state.borrow_mut();
            let Some(mut grant) = s.waiting.take() else {
                debug_assert!(false, "input packet without a downstream request");
                return;
            };
            let header = RelayHeader { kind: HeaderKind::Control, peer: s.origin };
            grant.buffer_mut().extend_from_slice(&header.encode());
            grant.buffer_mut().extend_from_slice(&packet);
            packet.clear();
            s.spare.push(packet);
            grant.complete();
        });

        let handler = Rc::new(RefCell::new(StampServe {
            state: Rc::downgrade(&state),
            orphaned: None,
        }));
        (Self { state }, handler)
    }

    /// The identifier stamped into every header.
    pub fn origin(&self) -> PeerId {
        self.state.borrow().origin
    }
}
