// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The free, rx and tx request queues.

use crate::request::Request;
use crate::request::RequestPool;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// Selects one of the three request queues.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueueKind {
    /// Requests available for new work.
    Free,
    /// Requests bound for the native devices.
    Rx,
    /// Requests bound for the virtual UART.
    Tx,
}

struct Queue {
    requests: Mutex<VecDeque<Request>>,
    // Only rx and tx have a blocking consumer.
    cond: Option<Condvar>,
}

impl Queue {
    fn new(capacity: usize, blocking: bool) -> Self {
        Self {
            requests: Mutex::new(VecDeque::with_capacity(capacity)),
            cond: blocking.then(Condvar::new),
        }
    }
}

/// Queue depths at one instant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct QueueDepths {
    /// Requests on the free queue.
    pub free: usize,
    /// Requests on the rx queue.
    pub rx: usize,
    /// Requests on the tx queue.
    pub tx: usize,
}

impl QueueDepths {
    /// The number of queued requests across all queues.
    pub fn total(&self) -> usize {
        self.free + self.rx + self.tx
    }
}

/// The three request queues, each behind its own lock.
pub struct RequestQueues {
    capacity: usize,
    free: Queue,
    rx: Queue,
    tx: Queue,
}

impl RequestQueues {
    /// Builds the queues and puts every request from `pool` on the free queue.
    pub fn new(pool: RequestPool) -> Self {
        let capacity = pool.capacity();
        let this = Self {
            capacity,
            free: Queue::new(capacity, false),
            rx: Queue::new(capacity, true),
            tx: Queue::new(capacity, true),
        };
        this.free.requests.lock().extend(pool.into_requests());
        this
    }

    /// The number of requests the queues were built with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn queue(&self, kind: QueueKind) -> &Queue {
        match kind {
            QueueKind::Free => &self.free,
            QueueKind::Rx => &self.rx,
            QueueKind::Tx => &self.tx,
        }
    }

    /// Puts `req` on the `kind` queue, at the head if `to_head` is set.
    ///
    /// Wakes one consumer if `kind` is rx or tx. Requests headed for the free
    /// queue have their metadata cleared first.
    pub fn enqueue(&self, kind: QueueKind, mut req: Request, to_head: bool) {
        if kind == QueueKind::Free {
            req.reset();
        }
        let queue = self.queue(kind);
        let mut requests = queue.requests.lock();
        if to_head {
            requests.push_front(req);
        } else {
            requests.push_back(req);
        }
        if let Some(cond) = &queue.cond {
            cond.notify_one();
        }
    }

    /// Takes a request from the head of the free queue, if there is one.
    ///
    /// Never blocks. `None` means the pool is exhausted; the caller should
    /// drop whatever it wanted the request for.
    pub fn dequeue_free(&self) -> Option<Request> {
        self.free.requests.lock().pop_front()
    }

    /// Blocks until the `kind` queue is non-empty, then pops its head.
    ///
    /// Returns `None` as soon as `closing` is observed set, whether or not the
    /// queue has anything in it.
    pub(crate) fn wait_dequeue(&self, kind: QueueKind, closing: &AtomicBool) -> Option<Request> {
        let queue = self.queue(kind);
        let cond = queue
            .cond
            .as_ref()
            .expect("only rx and tx queues support blocking dequeue");
        let mut requests = queue.requests.lock();
        loop {
            if closing.load(Ordering::Acquire) {
                return None;
            }
            if let Some(req) = requests.pop_front() {
                return Some(req);
            }
            cond.wait(&mut requests);
        }
    }

    /// Wakes every consumer blocked on the `kind` queue so that it can observe
    /// the closing flag.
    pub(crate) fn wake_all(&self, kind: QueueKind) {
        let queue = self.queue(kind);
        // Take the lock so a consumer between its closing check and its wait
        // cannot miss the notification.
        let _requests = queue.requests.lock();
        if let Some(cond) = &queue.cond {
            cond.notify_all();
        }
    }

    /// The number of requests on the `kind` queue.
    pub fn len(&self, kind: QueueKind) -> usize {
        self.queue(kind).requests.lock().len()
    }

    /// The depth of each queue.
    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            free: self.len(QueueKind::Free),
            rx: self.len(QueueKind::Rx),
            tx: self.len(QueueKind::Tx),
        }
    }

    /// Removes every request from the `kind` queue, head first.
    pub fn drain(&self, kind: QueueKind) -> Vec<Request> {
        self.queue(kind).requests.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelId;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn queues(capacity: usize) -> RequestQueues {
        RequestQueues::new(RequestPool::new(capacity))
    }

    #[test]
    fn head_insert_takes_priority() {
        let q = queues(4);
        let mut reqs: Vec<_> = std::iter::from_fn(|| q.dequeue_free()).collect();
        let d = reqs.pop().unwrap();
        let c = reqs.pop().unwrap();
        let b = reqs.pop().unwrap();
        let a = reqs.pop().unwrap();
        let order = [d.slot(), a.slot(), b.slot(), c.slot()];

        q.enqueue(QueueKind::Tx, a, false);
        q.enqueue(QueueKind::Tx, b, false);
        q.enqueue(QueueKind::Tx, c, false);
        q.enqueue(QueueKind::Tx, d, true);

        let drained: Vec<_> = q.drain(QueueKind::Tx).iter().map(|r| r.slot()).collect();
        assert_eq!(drained, order);
    }

    #[test]
    fn exhausted_pool_does_not_block() {
        let q = queues(3);
        let held: Vec<_> = (0..3).map(|_| q.dequeue_free().unwrap()).collect();
        assert!(q.dequeue_free().is_none());
        assert_eq!(q.len(QueueKind::Free), 0);
        for req in held {
            q.enqueue(QueueKind::Free, req, false);
        }
        assert_eq!(q.len(QueueKind::Free), 3);
    }

    #[test]
    fn requests_are_conserved() {
        let q = queues(16);
        let mut held = Vec::new();
        for i in 0..16 {
            let req = q.dequeue_free().unwrap();
            match i % 4 {
                0 => q.enqueue(QueueKind::Rx, req, false),
                1 => q.enqueue(QueueKind::Tx, req, true),
                2 => held.push(req),
                _ => q.enqueue(QueueKind::Free, req, false),
            }
            assert_eq!(q.depths().total() + held.len(), q.capacity());
        }

        // Move everything around once more and check nothing was duplicated.
        for req in q.drain(QueueKind::Rx) {
            q.enqueue(QueueKind::Tx, req, true);
        }
        let mut slots = HashSet::new();
        for kind in [QueueKind::Free, QueueKind::Rx, QueueKind::Tx] {
            for req in q.drain(kind) {
                assert!(slots.insert(req.slot()));
            }
        }
        for req in held {
            assert!(slots.insert(req.slot()));
        }
        assert_eq!(slots.len(), 16);
    }

    #[test]
    fn free_enqueue_resets_metadata() {
        let q = queues(1);
        let mut req = q.dequeue_free().unwrap();
        req.srv_len = 5;
        req.link_len = 7;
        req.channel = ChannelId::Raw3;
        q.enqueue(QueueKind::Free, req, false);
        let req = q.dequeue_free().unwrap();
        assert_eq!((req.srv_len, req.link_len), (0, 0));
        assert_eq!(req.channel, ChannelId::VirtualUart);
    }

    #[test]
    fn blocked_consumer_wakes_on_enqueue_and_close() {
        let q = Arc::new(queues(2));
        let closing = Arc::new(AtomicBool::new(false));

        let consumer = std::thread::spawn({
            let q = q.clone();
            let closing = closing.clone();
            move || {
                let mut seen = Vec::new();
                while let Some(req) = q.wait_dequeue(QueueKind::Rx, &closing) {
                    seen.push(req.slot());
                    q.enqueue(QueueKind::Free, req, false);
                }
                seen
            }
        });

        let req = q.dequeue_free().unwrap();
        let slot = req.slot();
        q.enqueue(QueueKind::Rx, req, false);
        while q.len(QueueKind::Free) != 2 {
            std::thread::sleep(Duration::from_millis(1));
        }

        closing.store(true, Ordering::Release);
        q.wake_all(QueueKind::Rx);
        assert_eq!(consumer.join().unwrap(), vec![slot]);
    }
}
