// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pooled CBC requests.
//!
//! Every request the mediator will ever use is allocated up front by
//! [`RequestPool::new`]. Requests then move by value between the free, rx and
//! tx queues and the thread currently processing them, so a request can only
//! ever be in one place at a time.

use crate::channel::ChannelId;

/// Size of the CBC link header (start of frame, extension/length, sequence).
pub const CBC_LINK_HDR_SIZE: usize = 3;
/// Size of the CBC address header (mux and priority).
pub const CBC_ADDRESS_HDR_SIZE: usize = 1;
/// Offset of the service payload within a request buffer.
pub const CBC_SRV_POS: usize = CBC_LINK_HDR_SIZE + CBC_ADDRESS_HDR_SIZE;
/// Largest CBC service frame.
pub const CBC_MAX_SERVICE_SIZE: usize = 64;
/// Largest CBC link frame, and the size of every request buffer.
pub const CBC_MAX_FRAME_SIZE: usize = 96;

/// Default number of requests in the pool.
pub const IOC_MAX_REQUESTS: usize = 200;

const _: () = assert!(CBC_SRV_POS + CBC_MAX_SERVICE_SIZE <= CBC_MAX_FRAME_SIZE);

/// The kind of payload a request carries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestType {
    /// A CBC protocol frame.
    Protocol,
    /// Raw bytes with no CBC framing.
    Raw,
}

/// One in-flight message.
///
/// Requests are neither `Clone` nor constructible outside this module, so the
/// only way to get one is from the pool.
#[derive(Debug)]
pub struct Request {
    slot: usize,
    buf: Box<[u8; CBC_MAX_FRAME_SIZE]>,
    /// Length of the link frame stored at the start of `buf`.
    pub link_len: usize,
    /// Length of the service frame stored at [`CBC_SRV_POS`].
    pub srv_len: usize,
    /// The payload kind.
    pub rtype: RequestType,
    /// The channel the payload came from or is destined for.
    pub channel: ChannelId,
}

impl Request {
    fn new(slot: usize) -> Self {
        Self {
            slot,
            buf: Box::new([0; CBC_MAX_FRAME_SIZE]),
            link_len: 0,
            srv_len: 0,
            rtype: RequestType::Protocol,
            channel: ChannelId::VirtualUart,
        }
    }

    /// The index of this request within its pool. Stable for the life of the
    /// pool and unique among its requests.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The full request buffer.
    pub fn buf(&self) -> &[u8; CBC_MAX_FRAME_SIZE] {
        &self.buf
    }

    /// The full request buffer, mutably.
    pub fn buf_mut(&mut self) -> &mut [u8; CBC_MAX_FRAME_SIZE] {
        &mut self.buf
    }

    /// The link frame, `buf[..link_len]`.
    pub fn link_frame(&self) -> &[u8] {
        &self.buf[..self.link_len.min(CBC_MAX_FRAME_SIZE)]
    }

    /// The service frame, `buf[CBC_SRV_POS..CBC_SRV_POS + srv_len]`.
    pub fn service_frame(&self) -> &[u8] {
        let end = (CBC_SRV_POS + self.srv_len).min(CBC_MAX_FRAME_SIZE);
        &self.buf[CBC_SRV_POS..end]
    }

    /// The bytes a handler should consider the payload: the link frame when
    /// one was captured, otherwise the service frame.
    pub fn payload(&self) -> &[u8] {
        if self.link_len != 0 {
            self.link_frame()
        } else {
            self.service_frame()
        }
    }

    /// Clears the metadata before the request goes back on the free queue.
    pub(crate) fn reset(&mut self) {
        self.link_len = 0;
        self.srv_len = 0;
        self.rtype = RequestType::Protocol;
        self.channel = ChannelId::VirtualUart;
    }
}

/// The backing storage for all requests.
#[derive(Debug)]
pub struct RequestPool {
    requests: Vec<Request>,
}

impl RequestPool {
    /// Allocates `capacity` requests.
    pub fn new(capacity: usize) -> Self {
        Self {
            requests: (0..capacity).map(Request::new).collect(),
        }
    }

    /// The number of requests in the pool.
    pub fn capacity(&self) -> usize {
        self.requests.len()
    }

    /// Hands out every request, in slot order.
    pub fn into_requests(self) -> impl Iterator<Item = Request> {
        self.requests.into_iter()
    }
}
