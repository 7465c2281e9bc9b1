//! Contiguous-chunk byte ring.
//!
//! [`ChunkRing`] backs the packet ring buffer. It only ever hands out
//! contiguous regions: [`ChunkRing::writable`] either returns one chunk of
//! at least the requested size or refuses, and never reports fragmented
//! space. When the tail cannot fit a request but the head can, the write
//! cursor wraps and a mark remembers where the valid data ends, so reads
//! stay contiguous too. One byte is kept free in the wrapped state to
//! distinguish full from empty.

use crate::error::FlowError;

/// Power-of-two byte ring with contiguous-chunk accounting.
pub struct ChunkRing {
    buf: Box<[u8]>,
    /// Read cursor: start of valid data.
    read: usize,
    /// Write cursor: end of valid data (or of the head segment when wrapped).
    write: usize,
    /// End of valid data in the tail segment, set while wrapped.
    wrap: Option<usize>,
}

impl ChunkRing {
    /// Create a ring of at least `min_capacity` bytes, rounded up to the
    /// next power of two.
    pub fn with_capacity(min_capacity: usize) -> Result<Self, FlowError> {
        if min_capacity == 0 {
            return Err(FlowError::InvalidCapacity(0));
        }
        let capacity = min_capacity.next_power_of_two();
        Ok(Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
            wrap: None,
        })
    }

    /// Total ring capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes of valid data currently stored.
    pub fn len(&self) -> usize {
        match self.wrap {
            None => self.write - self.read,
            Some(wrap) => (wrap - self.read) + self.write,
        }
    }

    /// True when no data is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A contiguous writable region of exactly `need` bytes, or `None` if
    /// no single chunk that large can be serviced. May move the write
    /// cursor to the head of the ring (setting the wrap mark) even if the
    /// caller later commits fewer bytes.
    pub fn writable(&mut self, need: usize) -> Option<&mut [u8]> {
        debug_assert!(need > 0, "zero-size write request");
        match self.wrap {
            None => {
                let tail = self.buf.len() - self.write;
                if tail >= need {
                    Some(&mut self.buf[self.write..self.write + need])
                } else if self.read > need {
                    // Tail too small; wrap to the head, leaving a gap byte.
                    self.wrap = Some(self.write);
                    self.write = 0;
                    Some(&mut self.buf[..need])
                } else {
                    None
                }
            }
            Some(_) => {
                if self.read - self.write > need {
                    Some(&mut self.buf[self.write..self.write + need])
                } else {
                    None
                }
            }
        }
    }

    /// Mark `n` bytes written into the last region returned by
    /// [`ChunkRing::writable`] as valid data.
    pub fn commit(&mut self, n: usize) {
        match self.wrap {
            None => debug_assert!(self.write + n <= self.buf.len(), "commit past ring end"),
            Some(_) => debug_assert!(self.write + n < self.read, "commit into unread data"),
        }
        self.write += n;
    }

    /// The contiguous readable region (empty slice when the ring is empty).
    pub fn readable(&self) -> &[u8] {
        match self.wrap {
            None => &self.buf[self.read..self.write],
            Some(wrap) => &self.buf[self.read..wrap],
        }
    }

    /// Discard `n` bytes from the front of the readable region.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.readable().len(), "consume past readable data");
        self.read += n;
        match self.wrap {
            Some(wrap) if self.read == wrap => {
                // Tail segment fully drained; continue at the head.
                self.read = 0;
                self.wrap = None;
            }
            None if self.read == self.write => {
                // Empty: reset for maximum contiguity.
                self.read = 0;
                self.write = 0;
            }
            _ => {}
        }
    }
}
