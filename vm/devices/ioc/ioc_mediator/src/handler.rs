// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The interface between the mediator core and the CBC protocol logic that
//! runs on the rx and tx workers.

use crate::channel::ChannelId;
use crate::channel::ChannelTable;
use crate::request::Request;

/// Whether a signal or group is forwarded.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SignalFlag {
    /// Forwarded.
    Active,
    /// Dropped.
    Inactive,
}

/// A CBC signal definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CbcSignal {
    /// Signal id.
    pub id: u16,
    /// Signal width in bits.
    pub len: u16,
    /// Whether the signal is forwarded.
    pub flag: SignalFlag,
}

/// A CBC signal group definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CbcGroup {
    /// Group id.
    pub id: u16,
    /// Whether the group is forwarded.
    pub flag: SignalFlag,
}

/// The signal and group tables for one direction.
///
/// The mediator core never looks inside; these are handed to the handler
/// for that direction on every request.
#[derive(Debug, Clone, Default)]
pub struct CbcConfig {
    /// Known signals.
    pub signals: Vec<CbcSignal>,
    /// Known groups.
    pub groups: Vec<CbcGroup>,
    /// Ids of signals that are always forwarded.
    pub signal_whitelist: Vec<u16>,
    /// Ids of groups that are always forwarded.
    pub group_whitelist: Vec<u16>,
}

impl CbcConfig {
    /// Looks up a signal by id.
    pub fn signal(&self, id: u16) -> Option<&CbcSignal> {
        self.signals.iter().find(|s| s.id == id)
    }

    /// Looks up a group by id.
    pub fn group(&self, id: u16) -> Option<&CbcGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// Whether signal `id` should be forwarded: it is whitelisted, or it is
    /// known and active.
    pub fn forwards_signal(&self, id: u16) -> bool {
        self.signal_whitelist.contains(&id)
            || self
                .signal(id)
                .is_some_and(|s| s.flag == SignalFlag::Active)
    }

    /// Whether group `id` should be forwarded.
    pub fn forwards_group(&self, id: u16) -> bool {
        self.group_whitelist.contains(&id)
            || self.group(id).is_some_and(|g| g.flag == SignalFlag::Active)
    }
}

/// Which worker a handler runs on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Virtual UART to native devices.
    Rx,
    /// Native devices to virtual UART.
    Tx,
}

/// Where a request goes after its handler returns.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Route {
    /// Back to the free queue.
    Release,
    /// To the head of the opposite direction's queue.
    Forward,
}

/// Everything a handler gets besides the request itself.
pub struct HandlerContext<'a> {
    /// The worker this handler runs on.
    pub direction: Direction,
    /// This direction's signal and group tables.
    pub config: &'a CbcConfig,
    /// The boot reason passed at startup, for the lifecycle service.
    pub boot_reason: u32,
    /// The channels, for transmitting. Read-only.
    pub channels: &'a ChannelTable,
}

/// Protocol processing for one direction.
///
/// Handlers run on a worker thread with no queue lock held, and must not block
/// indefinitely: a handler stuck in a call cannot be cancelled by shutdown.
pub trait CbcHandler: Send {
    /// Processes `req` and decides where it goes next.
    fn handle(&mut self, req: &mut Request, cx: &HandlerContext<'_>) -> Route;
}

impl<F> CbcHandler for F
where
    F: FnMut(&mut Request, &HandlerContext<'_>) -> Route + Send,
{
    fn handle(&mut self, req: &mut Request, cx: &HandlerContext<'_>) -> Route {
        (self)(req, cx)
    }
}

/// Writes each request's payload verbatim to one channel.
#[derive(Debug)]
pub struct PassthroughHandler {
    target: ChannelId,
}

impl PassthroughHandler {
    /// A handler that writes to `target`.
    pub fn new(target: ChannelId) -> Self {
        Self { target }
    }
}

impl CbcHandler for PassthroughHandler {
    fn handle(&mut self, req: &mut Request, cx: &HandlerContext<'_>) -> Route {
        let payload = req.payload();
        if payload.is_empty() {
            return Route::Release;
        }
        tracing::trace!(
            direction = ?cx.direction,
            source = %req.channel,
            target = %self.target,
            len = payload.len(),
            "passing through"
        );
        if let Err(err) = cx.channels.write(self.target, payload) {
            tracing::warn!(
                direction = ?cx.direction,
                target = %self.target,
                error = &err as &dyn std::error::Error,
                "passthrough write failed, dropping request"
            );
        }
        Route::Release
    }
}

/// Drops every request.
#[derive(Debug, Default)]
pub struct DiscardHandler;

impl CbcHandler for DiscardHandler {
    fn handle(&mut self, req: &mut Request, cx: &HandlerContext<'_>) -> Route {
        tracing::trace!(
            direction = ?cx.direction,
            channel = %req.channel,
            len = req.payload().len(),
            "discarding request"
        );
        Route::Release
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_overrides_flags() {
        let config = CbcConfig {
            signals: vec![
                CbcSignal {
                    id: 1,
                    len: 8,
                    flag: SignalFlag::Active,
                },
                CbcSignal {
                    id: 2,
                    len: 16,
                    flag: SignalFlag::Inactive,
                },
            ],
            groups: vec![CbcGroup {
                id: 10,
                flag: SignalFlag::Inactive,
            }],
            signal_whitelist: vec![2],
            group_whitelist: vec![],
        };

        assert!(config.forwards_signal(1));
        assert!(config.forwards_signal(2));
        assert!(!config.forwards_signal(3));
        assert!(!config.forwards_group(10));
        assert_eq!(config.signal(2).unwrap().len, 16);
        assert!(config.group(11).is_none());
    }
}
