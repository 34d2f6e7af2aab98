// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The core dispatch thread.
//!
//! Waits for readability on every open channel and turns what it reads into
//! requests: native device data becomes tx work, virtual UART data is framed
//! and becomes rx work.

use crate::channel::Channel;
use crate::channel::ChannelError;
use crate::channel::ChannelId;
use crate::channel::ChannelKind;
use crate::epoll::Epoll;
use crate::epoll::WakeEvent;
use crate::queue::QueueKind;
use crate::request::RequestType;
use crate::request::CBC_MAX_FRAME_SIZE;
use crate::request::CBC_MAX_SERVICE_SIZE;
use crate::request::CBC_SRV_POS;
use crate::ring::CbcRing;
use crate::ring::LinkUnpacker;
use crate::ring::Unpacked;
use crate::ring::CBC_RING_BUFFER_SIZE;
use crate::Shared;
use std::os::fd::AsFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// Maximum events handled per wait.
const IOC_MAX_EVENTS: usize = 32;

const WAKE_TOKEN: u64 = u64::MAX;

const BACKOFF_BASE: Duration = Duration::from_millis(10);
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// How long a channel sits out after `failures` consecutive failed reads.
fn backoff_delay(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    BACKOFF_BASE.saturating_mul(1 << shift).min(BACKOFF_MAX)
}

#[derive(Default)]
struct ChannelState {
    registered: bool,
    failures: u32,
    rearm_at: Option<Instant>,
}

pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    epoll: Epoll,
    wake: Arc<WakeEvent>,
    unpacker: Box<dyn LinkUnpacker>,
    ring: CbcRing,
    // Indexed like the channel table.
    states: Vec<ChannelState>,
    dropped: u64,
}

impl Dispatcher {
    /// Registers the wake event and every open channel with `epoll`.
    ///
    /// A channel that cannot be registered is logged and left out; it will
    /// produce no traffic.
    pub fn new(
        shared: Arc<Shared>,
        epoll: Epoll,
        wake: Arc<WakeEvent>,
        unpacker: Box<dyn LinkUnpacker>,
    ) -> std::io::Result<Self> {
        epoll.add(wake.as_fd(), WAKE_TOKEN)?;

        let mut states = Vec::new();
        for (index, channel) in shared.channels.iter().enumerate() {
            let mut state = ChannelState::default();
            if let Some(fd) = channel.fd() {
                match epoll.add(fd, index as u64) {
                    Ok(()) => state.registered = true,
                    Err(err) => tracing::warn!(
                        channel = %channel.id(),
                        error = &err as &dyn std::error::Error,
                        "failed to register channel for events"
                    ),
                }
            }
            states.push(state);
        }

        Ok(Self {
            shared,
            epoll,
            wake,
            unpacker,
            ring: CbcRing::default(),
            states,
            dropped: 0,
        })
    }

    /// The channels that were registered for events at startup.
    pub fn registered(&self) -> Vec<ChannelId> {
        self.shared
            .channels
            .iter()
            .zip(&self.states)
            .filter(|(_, state)| state.registered)
            .map(|(channel, _)| channel.id())
            .collect()
    }

    /// Runs until shutdown is signaled or the epoll instance fails. The epoll
    /// fd is closed on return.
    pub fn run(mut self) {
        tracing::debug!("ioc core thread started");
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; IOC_MAX_EVENTS];
        loop {
            let timeout = self.next_timeout();
            let n = match self.epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "epoll wait failed, exiting ioc core thread"
                    );
                    break;
                }
            };

            for event in &events[..n] {
                let token = event.u64;
                if token == WAKE_TOKEN {
                    self.wake.try_wait();
                } else {
                    self.dispatch(token as usize);
                }
            }

            if self.shared.closing.load(Ordering::Acquire) {
                break;
            }
            self.rearm_due();
        }
        tracing::debug!("ioc core thread stopped");
    }

    fn dispatch(&mut self, index: usize) {
        let shared = self.shared.clone();
        let Some(channel) = shared.channels.by_index(index) else {
            tracing::debug!(index, "ioc dispatch got unknown channel");
            return;
        };
        match channel.kind() {
            ChannelKind::Native => self.process_native(index, channel),
            ChannelKind::VirtualUart => self.process_virtual_uart(index, channel),
        }
    }

    /// Reads one service frame from a native channel and queues it for tx.
    fn process_native(&mut self, index: usize, channel: &Channel) {
        let shared = self.shared.clone();
        let queues = &shared.queues;
        let Some(mut req) = queues.dequeue_free() else {
            // Drain the device anyway so the level-triggered event clears.
            let mut scratch = [0; CBC_MAX_SERVICE_SIZE];
            match channel.read(&mut scratch) {
                Ok(Some(n)) if n > 0 => {
                    self.read_succeeded(index);
                    self.drop_data(channel.id(), n);
                }
                Ok(None) => {}
                Ok(Some(_)) => self.read_failed(index, channel, None),
                Err(err) => self.read_failed(index, channel, Some(&err)),
            }
            return;
        };

        let buf = &mut req.buf_mut()[CBC_SRV_POS..CBC_SRV_POS + CBC_MAX_SERVICE_SIZE];
        match channel.read(buf) {
            Ok(Some(n)) if n > 0 => {
                self.read_succeeded(index);
                req.srv_len = n;
                req.link_len = 0;
                req.rtype = RequestType::Protocol;
                req.channel = channel.id();
                tracing::trace!(channel = %channel.id(), len = n, "native data queued for tx");
                queues.enqueue(QueueKind::Tx, req, false);
            }
            Ok(None) => queues.enqueue(QueueKind::Free, req, false),
            Ok(Some(_)) => {
                queues.enqueue(QueueKind::Free, req, false);
                self.read_failed(index, channel, None);
            }
            Err(err) => {
                queues.enqueue(QueueKind::Free, req, false);
                self.read_failed(index, channel, Some(&err));
            }
        }
    }

    /// Reads guest bytes into the receive ring and queues every complete
    /// link frame for rx.
    fn process_virtual_uart(&mut self, index: usize, channel: &Channel) {
        if self.ring.free() == 0 {
            tracing::warn!(
                len = self.ring.len(),
                "receive ring full without a complete frame, discarding"
            );
            self.ring.consume(self.ring.len());
        }

        let mut buf = [0; CBC_RING_BUFFER_SIZE];
        let free = self.ring.free();
        match channel.read(&mut buf[..free]) {
            Ok(Some(n)) if n > 0 => {
                self.read_succeeded(index);
                self.ring.push(&buf[..n]);
            }
            Ok(None) => return,
            Ok(Some(_)) => return self.read_failed(index, channel, None),
            Err(err) => return self.read_failed(index, channel, Some(&err)),
        }

        while !self.ring.is_empty() {
            match self.unpacker.unpack(&self.ring) {
                Unpacked::Frame {
                    link_len,
                    srv_len,
                    rtype,
                } if link_len > 0 => {
                    let buffered = self.ring.len();
                    if link_len > CBC_MAX_FRAME_SIZE || link_len > buffered {
                        tracing::warn!(
                            link_len,
                            buffered,
                            "invalid guest frame length, discarding"
                        );
                        self.ring.consume(link_len.min(buffered));
                        continue;
                    }
                    self.build_request(link_len, srv_len.min(CBC_MAX_SERVICE_SIZE), rtype);
                    self.ring.consume(link_len);
                }
                Unpacked::Discard(n) if n > 0 => {
                    tracing::debug!(len = n, "discarding unframed guest bytes");
                    self.ring.consume(n);
                }
                _ => break,
            }
        }
    }

    /// Copies a link frame from the head of the ring into a request and
    /// queues it for rx.
    fn build_request(&mut self, link_len: usize, srv_len: usize, rtype: RequestType) {
        let shared = self.shared.clone();
        let queues = &shared.queues;
        let Some(mut req) = queues.dequeue_free() else {
            self.drop_data(ChannelId::VirtualUart, link_len);
            return;
        };
        let n = self.ring.copy_out(&mut req.buf_mut()[..link_len]);
        req.link_len = n;
        req.srv_len = srv_len;
        req.rtype = rtype;
        req.channel = ChannelId::VirtualUart;
        tracing::trace!(len = n, "guest frame queued for rx");
        queues.enqueue(QueueKind::Rx, req, false);
    }

    fn drop_data(&mut self, channel: ChannelId, len: usize) {
        self.dropped += 1;
        tracing::warn!(
            %channel,
            len,
            dropped = self.dropped,
            "ioc request pool exhausted, dropping data"
        );
    }

    fn read_succeeded(&mut self, index: usize) {
        self.states[index].failures = 0;
    }

    /// Takes a failing channel out of the event set for a while, so that a
    /// persistently failing device cannot spin this thread.
    fn read_failed(&mut self, index: usize, channel: &Channel, err: Option<&ChannelError>) {
        let state = &mut self.states[index];
        state.failures = state.failures.saturating_add(1);
        let delay = backoff_delay(state.failures);
        state.rearm_at = Some(Instant::now() + delay);

        if state.registered {
            if let Some(fd) = channel.fd() {
                match self.epoll.del(fd) {
                    Ok(()) => state.registered = false,
                    // Already out of the set.
                    Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
                        state.registered = false
                    }
                    Err(err) => tracing::debug!(
                        channel = %channel.id(),
                        error = &err as &dyn std::error::Error,
                        "failed to unregister channel"
                    ),
                }
            }
        }

        // Only log the first failure and then at exponentially spaced
        // intervals.
        if state.failures.is_power_of_two() {
            let reason = match err {
                Some(err) => err as &dyn std::error::Error,
                None => &EndOfFile as &dyn std::error::Error,
            };
            tracing::warn!(
                channel = %channel.id(),
                failures = state.failures,
                retry_ms = delay.as_millis() as u64,
                error = reason,
                "channel read failed, backing off"
            );
        }
    }

    /// Milliseconds until the next channel is due to be re-armed, or -1.
    fn next_timeout(&self) -> i32 {
        let Some(next) = self.states.iter().filter_map(|s| s.rearm_at).min() else {
            return -1;
        };
        let wait = next.saturating_duration_since(Instant::now());
        // Round up so the wait does not end just short of the deadline.
        let ms = wait.as_nanos().div_ceil(1_000_000);
        ms.min(i32::MAX as u128) as i32
    }

    fn rearm_due(&mut self) {
        let now = Instant::now();
        let shared = self.shared.clone();
        for (index, channel) in shared.channels.iter().enumerate() {
            let state = &mut self.states[index];
            if !state.rearm_at.is_some_and(|at| at <= now) {
                continue;
            }
            state.rearm_at = None;
            if state.registered {
                continue;
            }
            let Some(fd) = channel.fd() else {
                continue;
            };
            match self.epoll.add(fd, index as u64) {
                Ok(()) => state.registered = true,
                Err(err) if err.raw_os_error() == Some(libc::EEXIST) => state.registered = true,
                Err(err) => {
                    state.failures = state.failures.saturating_add(1);
                    state.rearm_at = Some(now + backoff_delay(state.failures));
                    if state.failures.is_power_of_two() {
                        tracing::warn!(
                            channel = %channel.id(),
                            failures = state.failures,
                            error = &err as &dyn std::error::Error,
                            "failed to re-register channel"
                        );
                    }
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("end of file")]
struct EndOfFile;
