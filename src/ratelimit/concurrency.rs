//! Concurrency limiter: bounds the number of leases held at once.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;

use super::clock::Clock;
use super::lease::{keys, reasons, retired_lease, Lease, LeaseIssuer, Metadata};
use super::limiter::LimiterStatistics;
use super::options::{ConcurrencyOptions, QueueOrder};
use super::queue::{self, Enqueued, Pending, QueueHost, WaitQueue};
use crate::error::{Result, TurnstileError};

struct ConcurrencyState {
    available: u32,
    queue: WaitQueue,
    idle_since: Option<Duration>,
    retired: bool,
}

/// A limiter that admits at most `permit_limit` concurrent permits.
///
/// Permits come back when leases are released; queued waiters are then served
/// according to the configured [`QueueOrder`].
pub struct ConcurrencyLimiter {
    options: ConcurrencyOptions,
    state: Mutex<ConcurrencyState>,
    clock: Arc<dyn Clock>,
    me: Weak<ConcurrencyLimiter>,
    total_successful: AtomicU64,
    total_failed: AtomicU64,
}

impl ConcurrencyLimiter {
    /// Create a new concurrency limiter.
    pub fn new(options: ConcurrencyOptions, clock: Arc<dyn Clock>) -> Arc<Self> {
        let state = ConcurrencyState {
            available: options.permit_limit.get(),
            queue: WaitQueue::new(options.queue_limit, options.queue_order),
            idle_since: Some(clock.now()),
            retired: false,
        };

        Arc::new_cyclic(|me| Self {
            options,
            state: Mutex::new(state),
            clock,
            me: me.clone(),
            total_successful: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
        })
    }

    pub fn options(&self) -> &ConcurrencyOptions {
        &self.options
    }

    /// Attempt to acquire permits without waiting.
    pub fn try_acquire(&self, permits: u32) -> Result<Lease> {
        self.check_permits(permits)?;

        let mut state = self.state.lock();
        if state.retired {
            return Ok(retired_lease());
        }
        Ok(match self.try_lease(&mut state, permits) {
            Some(lease) => lease,
            None => self.reject(&state, reasons::PERMITS_EXHAUSTED),
        })
    }

    /// Acquire permits, waiting in the queue if one is configured.
    ///
    /// Dropping the returned future while queued withdraws the waiter without
    /// consuming any permits.
    pub async fn acquire(&self, permits: u32) -> Result<Lease> {
        self.check_permits(permits)?;

        let (id, rx, evicted) = {
            let mut state = self.state.lock();
            if state.retired {
                return Ok(retired_lease());
            }
            if let Some(lease) = self.try_lease(&mut state, permits) {
                return Ok(lease);
            }
            if permits == 0 {
                return Ok(self.reject(&state, reasons::PERMITS_EXHAUSTED));
            }
            match state.queue.enqueue(permits) {
                Enqueued::Queued { id, rx, evicted } => {
                    let evicted: Vec<_> = evicted
                        .into_iter()
                        .map(|waiter| (waiter.tx, self.reject(&state, reasons::EVICTED_FROM_QUEUE)))
                        .collect();
                    (id, rx, evicted)
                }
                Enqueued::Full => {
                    let reason = if self.options.queue_limit == 0 {
                        reasons::PERMITS_EXHAUSTED
                    } else {
                        reasons::QUEUE_FULL
                    };
                    return Ok(self.reject(&state, reason));
                }
            }
        };

        queue::deliver(evicted);

        trace!(waiter = id, permits = permits, "Queued for concurrency permits");
        Ok(Pending::new(self, id, rx).wait().await)
    }

    /// Permits currently available.
    pub fn available_permits(&self) -> u32 {
        self.state.lock().available
    }

    pub fn statistics(&self) -> LimiterStatistics {
        let state = self.state.lock();
        LimiterStatistics {
            available: state.available,
            queued_permits: state.queue.queued_permits(),
            queue_len: state.queue.len(),
            total_successful: self.total_successful.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
        }
    }

    /// How long the limiter has had every permit available and nobody queued.
    pub fn idle_duration(&self) -> Option<Duration> {
        let state = self.state.lock();
        state
            .idle_since
            .map(|since| self.clock.now().saturating_sub(since))
    }

    /// Retire the limiter if it has been idle for at least `max_idle`.
    ///
    /// A retired limiter refuses every acquisition with
    /// [`reasons::LIMITER_RETIRED`].
    pub fn retire_if_idle(&self, max_idle: Duration) -> bool {
        let mut state = self.state.lock();
        if state.retired {
            return true;
        }
        let idle = state
            .idle_since
            .map(|since| self.clock.now().saturating_sub(since));
        if idle.is_some_and(|idle| idle >= max_idle) {
            state.retired = true;
        }
        state.retired
    }

    pub fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    fn check_permits(&self, permits: u32) -> Result<()> {
        let limit = self.options.permit_limit.get();
        if permits > limit {
            return Err(TurnstileError::PermitsExceedLimit {
                requested: permits,
                limit,
            });
        }
        Ok(())
    }

    fn try_lease(&self, state: &mut ConcurrencyState, permits: u32) -> Option<Lease> {
        // A non-empty queue blocks newcomers unless the newest waiter wins anyway.
        let may_bypass_queue =
            state.queue.is_empty() || state.queue.order() == QueueOrder::NewestFirst;

        if permits == 0 {
            return (state.available > 0 && may_bypass_queue).then(|| self.grant(state, 0));
        }

        if state.available >= permits && may_bypass_queue {
            state.available -= permits;
            state.idle_since = None;
            self.total_successful.fetch_add(1, Ordering::Relaxed);
            return Some(self.grant(state, permits));
        }

        None
    }

    fn grant(&self, state: &ConcurrencyState, permits: u32) -> Lease {
        let mut metadata = Metadata::new();
        metadata.insert(keys::AVAILABLE_PERMITS.to_string(), state.available.into());
        let issuer: Weak<dyn LeaseIssuer> = self.me.clone();
        Lease::granted(permits, issuer, metadata)
    }

    fn reject(&self, state: &ConcurrencyState, reason: &str) -> Lease {
        self.total_failed.fetch_add(1, Ordering::Relaxed);

        let mut metadata = Metadata::new();
        metadata.insert(keys::REASON.to_string(), reason.into());
        metadata.insert(keys::AVAILABLE_PERMITS.to_string(), state.available.into());
        metadata.insert(
            keys::QUEUED_PERMITS.to_string(),
            state.queue.queued_permits().into(),
        );
        Lease::rejected(metadata)
    }

    fn serve_queue(&self, state: &mut ConcurrencyState) -> Vec<(oneshot::Sender<Lease>, Lease)> {
        let mut grants = Vec::new();
        while let Some(next) = state.queue.peek_next() {
            let needed = next.permits;
            if state.available < needed {
                break;
            }
            let Some(waiter) = state.queue.pop_next() else {
                break;
            };
            state.available -= waiter.permits;
            self.total_successful.fetch_add(1, Ordering::Relaxed);
            let lease = self.grant(state, waiter.permits);
            trace!(waiter = waiter.id, permits = waiter.permits, "Granted queued waiter");
            grants.push((waiter.tx, lease));
        }
        grants
    }

    fn mark_idle(&self, state: &mut ConcurrencyState) {
        if state.available == self.options.permit_limit.get() && state.queue.is_empty() {
            state.idle_since.get_or_insert_with(|| self.clock.now());
        } else {
            state.idle_since = None;
        }
    }

    fn return_permits(&self, permits: u32) {
        let grants = {
            let mut state = self.state.lock();
            state.available = (state.available + permits).min(self.options.permit_limit.get());
            let grants = self.serve_queue(&mut state);
            self.mark_idle(&mut state);
            grants
        };
        queue::deliver(grants);
    }
}

impl LeaseIssuer for ConcurrencyLimiter {
    fn release(&self, permits: u32) {
        self.return_permits(permits);
    }

    fn refund(&self, permits: u32) {
        self.total_successful.fetch_sub(1, Ordering::Relaxed);
        self.return_permits(permits);
    }
}

impl QueueHost for ConcurrencyLimiter {
    fn withdraw(&self, id: u64) -> bool {
        let (removed, grants) = {
            let mut state = self.state.lock();
            if !state.queue.remove(id) {
                return false;
            }
            let grants = self.serve_queue(&mut state);
            self.mark_idle(&mut state);
            (true, grants)
        };
        trace!(waiter = id, "Queued waiter withdrew");
        queue::deliver(grants);
        removed
    }
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("options", &self.options)
            .field("statistics", &self.statistics())
            .finish()
    }
}
