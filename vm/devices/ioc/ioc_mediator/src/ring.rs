// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Receive ring for bytes arriving from the virtual UART, and the framing
//! interface that carves link frames out of it.

use crate::request::RequestType;
use crate::request::CBC_MAX_FRAME_SIZE;

/// Size of the receive ring. Must be a power of two.
pub const CBC_RING_BUFFER_SIZE: usize = 256;

const _: () = assert!(CBC_RING_BUFFER_SIZE.is_power_of_two());
const _: () = assert!(CBC_RING_BUFFER_SIZE > CBC_MAX_FRAME_SIZE);

const MASK: usize = CBC_RING_BUFFER_SIZE - 1;

/// A byte ring with free-running head and tail counters.
pub struct CbcRing {
    buf: [u8; CBC_RING_BUFFER_SIZE],
    head: usize,
    tail: usize,
}

impl Default for CbcRing {
    fn default() -> Self {
        Self {
            buf: [0; CBC_RING_BUFFER_SIZE],
            head: 0,
            tail: 0,
        }
    }
}

impl CbcRing {
    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.tail.wrapping_sub(self.head)
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes that can be pushed before the ring is full.
    pub fn free(&self) -> usize {
        CBC_RING_BUFFER_SIZE - self.len()
    }

    /// Appends as much of `data` as fits. Returns the number of bytes taken.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        for &b in &data[..n] {
            self.buf[self.tail & MASK] = b;
            self.tail = self.tail.wrapping_add(1);
        }
        n
    }

    /// The byte `offset` bytes past the head.
    pub fn peek(&self, offset: usize) -> Option<u8> {
        (offset < self.len()).then(|| self.buf[self.head.wrapping_add(offset) & MASK])
    }

    /// Copies bytes from the head into `out` without consuming them. Returns
    /// the number of bytes copied.
    pub fn copy_out(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len());
        for (i, b) in out[..n].iter_mut().enumerate() {
            *b = self.buf[self.head.wrapping_add(i) & MASK];
        }
        n
    }

    /// Drops `n` bytes from the head.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len());
        self.head = self.head.wrapping_add(n);
    }
}

/// What a [`LinkUnpacker`] found at the head of the ring.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Unpacked {
    /// A complete link frame of `link_len` bytes, whose service frame is
    /// `srv_len` bytes long.
    ///
    /// `link_len` must not exceed [`CBC_MAX_FRAME_SIZE`] or the number of
    /// bytes buffered. A frame that does is discarded instead.
    Frame {
        /// Link frame length.
        link_len: usize,
        /// Service frame length.
        srv_len: usize,
        /// The kind of payload.
        rtype: RequestType,
    },
    /// Garbage at the head that should be dropped.
    Discard(usize),
    /// The head holds a partial frame.
    NeedMore,
}

/// Recognizes link frames in the bytes received from the guest.
pub trait LinkUnpacker: Send {
    /// Inspects the head of `ring`.
    fn unpack(&mut self, ring: &CbcRing) -> Unpacked;
}

impl<F> LinkUnpacker for F
where
    F: FnMut(&CbcRing) -> Unpacked + Send,
{
    fn unpack(&mut self, ring: &CbcRing) -> Unpacked {
        (self)(ring)
    }
}

/// Treats whatever is buffered, up to one maximum-size frame, as a single raw
/// frame.
#[derive(Debug, Default)]
pub struct RawUnpacker;

impl LinkUnpacker for RawUnpacker {
    fn unpack(&mut self, ring: &CbcRing) -> Unpacked {
        if ring.is_empty() {
            return Unpacked::NeedMore;
        }
        let link_len = ring.len().min(CBC_MAX_FRAME_SIZE);
        Unpacked::Frame {
            link_len,
            srv_len: 0,
            rtype: RequestType::Raw,
        }
    }
}
