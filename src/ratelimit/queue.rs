//! Bounded waiter queue shared by the queuing limiters.

use std::collections::VecDeque;
use tokio::sync::oneshot;

use super::lease::{keys, reasons, Lease, Metadata};
use super::options::QueueOrder;

/// A suspended acquisition.
pub(crate) struct Waiter {
    pub(crate) id: u64,
    pub(crate) permits: u32,
    pub(crate) tx: oneshot::Sender<Lease>,
}

/// Result of trying to enqueue a waiter.
pub(crate) enum Enqueued {
    /// The waiter was queued; `evicted` waiters must be answered with a
    /// rejection built under the limiter lock and sent after it is dropped.
    Queued {
        id: u64,
        rx: oneshot::Receiver<Lease>,
        evicted: Vec<Waiter>,
    },
    /// No room for the waiter.
    Full,
}

/// Waiters are always pushed at the back; `order` decides which end is served.
pub(crate) struct WaitQueue {
    entries: VecDeque<Waiter>,
    queued_permits: u32,
    limit: u32,
    order: QueueOrder,
    next_id: u64,
}

impl WaitQueue {
    pub(crate) fn new(limit: u32, order: QueueOrder) -> Self {
        Self {
            entries: VecDeque::new(),
            queued_permits: 0,
            limit,
            order,
            next_id: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn queued_permits(&self) -> u32 {
        self.queued_permits
    }

    pub(crate) fn order(&self) -> QueueOrder {
        self.order
    }

    pub(crate) fn enqueue(&mut self, permits: u32) -> Enqueued {
        if self.limit == 0 || permits > self.limit {
            return Enqueued::Full;
        }

        let limit = u64::from(self.limit);
        let overflows = |queued: u32| u64::from(queued) + u64::from(permits) > limit;

        let mut evicted = Vec::new();
        if overflows(self.queued_permits) {
            match self.order {
                QueueOrder::OldestFirst => return Enqueued::Full,
                QueueOrder::NewestFirst => {
                    while overflows(self.queued_permits) {
                        let Some(oldest) = self.entries.pop_front() else {
                            break;
                        };
                        self.queued_permits -= oldest.permits;
                        evicted.push(oldest);
                    }
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        let id = self.next_id;
        self.next_id += 1;
        self.queued_permits += permits;
        self.entries.push_back(Waiter { id, permits, tx });

        Enqueued::Queued { id, rx, evicted }
    }

    /// Next waiter to serve, skipping waiters whose receiver is gone.
    pub(crate) fn peek_next(&mut self) -> Option<&Waiter> {
        loop {
            let closed = match self.next_slot() {
                Some(waiter) => waiter.tx.is_closed(),
                None => return None,
            };
            if !closed {
                break;
            }
            self.pop_next();
        }
        self.next_slot()
    }

    pub(crate) fn pop_next(&mut self) -> Option<Waiter> {
        let waiter = match self.order {
            QueueOrder::OldestFirst => self.entries.pop_front(),
            QueueOrder::NewestFirst => self.entries.pop_back(),
        }?;
        self.queued_permits -= waiter.permits;
        Some(waiter)
    }

    /// Remove a waiter by id. Returns `false` if it was already served.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        match self.entries.iter().position(|waiter| waiter.id == id) {
            Some(index) => {
                if let Some(waiter) = self.entries.remove(index) {
                    self.queued_permits -= waiter.permits;
                }
                true
            }
            None => false,
        }
    }

    fn next_slot(&self) -> Option<&Waiter> {
        match self.order {
            QueueOrder::OldestFirst => self.entries.front(),
            QueueOrder::NewestFirst => self.entries.back(),
        }
    }
}

/// Hand leases to waiters. Must be called without holding the limiter lock,
/// since a failed hand-off refunds through the limiter.
pub(crate) fn deliver(grants: Vec<(oneshot::Sender<Lease>, Lease)>) {
    for (tx, lease) in grants {
        if let Err(lease) = tx.send(lease) {
            lease.refund();
        }
    }
}

/// Implemented by limiters that own a [`WaitQueue`].
pub(crate) trait QueueHost: Send + Sync {
    /// Remove a waiter that gave up. Returns `false` if it was already served.
    fn withdraw(&self, id: u64) -> bool;
}

/// A queued acquisition in flight.
///
/// Dropping it before it resolves withdraws the waiter. If a lease was handed
/// over in the meantime it is refunded, so a cancelled waiter never consumes
/// capacity.
pub(crate) struct Pending<'a> {
    host: &'a dyn QueueHost,
    id: u64,
    rx: oneshot::Receiver<Lease>,
    settled: bool,
}

impl<'a> Pending<'a> {
    pub(crate) fn new(host: &'a dyn QueueHost, id: u64, rx: oneshot::Receiver<Lease>) -> Self {
        Self {
            host,
            id,
            rx,
            settled: false,
        }
    }

    pub(crate) async fn recv(&mut self) -> Lease {
        let outcome = (&mut self.rx).await;
        self.settled = true;
        outcome.unwrap_or_else(|_| {
            let mut metadata = Metadata::new();
            metadata.insert(keys::REASON.to_string(), reasons::LIMITER_DISPOSED.into());
            Lease::rejected(metadata)
        })
    }

    pub(crate) async fn wait(mut self) -> Lease {
        self.recv().await
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if self.settled || self.host.withdraw(self.id) {
            return;
        }
        self.rx.close();
        if let Ok(lease) = self.rx.try_recv() {
            lease.refund();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_id(enqueued: Enqueued) -> (u64, oneshot::Receiver<Lease>, Vec<Waiter>) {
        match enqueued {
            Enqueued::Queued { id, rx, evicted } => (id, rx, evicted),
            Enqueued::Full => panic!("expected the waiter to be queued"),
        }
    }

    #[test]
    fn test_zero_limit_never_queues() {
        let mut queue = WaitQueue::new(0, QueueOrder::OldestFirst);
        assert!(matches!(queue.enqueue(1), Enqueued::Full));
    }

    #[test]
    fn test_oldest_first_serves_in_arrival_order() {
        let mut queue = WaitQueue::new(3, QueueOrder::OldestFirst);
        let (first, _rx1, _) = queued_id(queue.enqueue(1));
        let (_second, _rx2, _) = queued_id(queue.enqueue(1));

        assert_eq!(queue.pop_next().map(|w| w.id), Some(first));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_oldest_first_rejects_when_full() {
        let mut queue = WaitQueue::new(2, QueueOrder::OldestFirst);
        let (_a, _rx1, _) = queued_id(queue.enqueue(1));
        let (_b, _rx2, _) = queued_id(queue.enqueue(1));
        assert!(matches!(queue.enqueue(1), Enqueued::Full));
        assert_eq!(queue.queued_permits(), 2);
    }

    #[test]
    fn test_newest_first_evicts_oldest_when_full() {
        let mut queue = WaitQueue::new(2, QueueOrder::NewestFirst);
        let (oldest, _rx1, _) = queued_id(queue.enqueue(1));
        let (_middle, _rx2, _) = queued_id(queue.enqueue(1));
        let (newest, _rx3, evicted) = queued_id(queue.enqueue(1));

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, oldest);
        assert_eq!(queue.queued_permits(), 2);
        assert_eq!(queue.pop_next().map(|w| w.id), Some(newest));
    }

    #[test]
    fn test_oversized_request_is_never_queued() {
        let mut queue = WaitQueue::new(2, QueueOrder::NewestFirst);
        assert!(matches!(queue.enqueue(3), Enqueued::Full));
    }

    #[test]
    fn test_large_queue_limit_does_not_overflow() {
        let mut queue = WaitQueue::new(u32::MAX, QueueOrder::OldestFirst);
        let (_big, _rx1, _) = queued_id(queue.enqueue(u32::MAX - 1));
        assert!(matches!(queue.enqueue(10), Enqueued::Full));
        assert_eq!(queue.queued_permits(), u32::MAX - 1);

        let mut queue = WaitQueue::new(u32::MAX, QueueOrder::NewestFirst);
        let (big, _rx1, _) = queued_id(queue.enqueue(u32::MAX - 1));
        let (_small, _rx2, evicted) = queued_id(queue.enqueue(10));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, big);
        assert_eq!(queue.queued_permits(), 10);
    }

    #[test]
    fn test_remove_and_skip_closed() {
        let mut queue = WaitQueue::new(3, QueueOrder::OldestFirst);
        let (first, rx1, _) = queued_id(queue.enqueue(1));
        let (second, _rx2, _) = queued_id(queue.enqueue(1));
        let (third, _rx3, _) = queued_id(queue.enqueue(1));

        assert!(queue.remove(second));
        assert!(!queue.remove(second));

        drop(rx1);
        assert_eq!(queue.peek_next().map(|w| w.id), Some(third));
        assert!(!queue.remove(first));
        assert_eq!(queue.queued_permits(), 1);
    }
}
