// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The rx and tx worker threads.

use crate::handler::CbcConfig;
use crate::handler::CbcHandler;
use crate::handler::Direction;
use crate::handler::HandlerContext;
use crate::handler::Route;
use crate::queue::QueueKind;
use crate::Shared;
use std::sync::Arc;

/// Consumes one direction's queue, running its handler on each request.
pub(crate) struct Worker {
    pub shared: Arc<Shared>,
    pub direction: Direction,
    pub handler: Box<dyn CbcHandler>,
    pub config: CbcConfig,
    pub boot_reason: u32,
}

impl Worker {
    /// Runs until the mediator starts closing. Requests still queued at that
    /// point are left where they are.
    pub fn run(mut self) {
        let (source, opposite) = match self.direction {
            Direction::Rx => (QueueKind::Rx, QueueKind::Tx),
            Direction::Tx => (QueueKind::Tx, QueueKind::Rx),
        };
        tracing::debug!(direction = ?self.direction, "ioc worker started");

        let queues = &self.shared.queues;
        while let Some(mut req) = queues.wait_dequeue(source, &self.shared.closing) {
            let cx = HandlerContext {
                direction: self.direction,
                config: &self.config,
                boot_reason: self.boot_reason,
                channels: &self.shared.channels,
            };
            match self.handler.handle(&mut req, &cx) {
                // Forwarded work is already in flight, so it goes ahead of new
                // work.
                Route::Forward => queues.enqueue(opposite, req, true),
                Route::Release => queues.enqueue(QueueKind::Free, req, false),
            }
        }

        tracing::debug!(direction = ?self.direction, "ioc worker stopped");
    }
}
