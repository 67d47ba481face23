//! Token bucket limiter with timer-driven or lazy replenishment.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use super::clock::Clock;
use super::lease::{keys, reasons, retired_lease, Lease, LeaseIssuer, Metadata};
use super::limiter::LimiterStatistics;
use super::options::{QueueOrder, TokenBucketOptions};
use super::queue::{self, Enqueued, Pending, QueueHost, WaitQueue};
use crate::error::{Result, TurnstileError};

/// Shortest sleep a lazily replenished waiter takes before re-checking.
const MIN_WAKE_INTERVAL: Duration = Duration::from_millis(1);

struct BucketState {
    tokens: u32,
    last_replenish: Duration,
    queue: WaitQueue,
    idle_since: Option<Duration>,
    retired: bool,
}

type Grants = Vec<(oneshot::Sender<Lease>, Lease)>;

enum Attempt {
    Done(Lease),
    Queued {
        id: u64,
        rx: oneshot::Receiver<Lease>,
        evicted: Grants,
    },
}

/// A token bucket limiter.
///
/// Holds up to `token_limit` tokens and adds `tokens_per_period` every
/// `replenish_period`. With auto-replenishment a background task adds the
/// tokens; otherwise elapsed whole periods are credited whenever the bucket is
/// consulted. Tokens are consumed by admission and not returned on release.
pub struct TokenBucketLimiter {
    options: TokenBucketOptions,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
    me: Weak<TokenBucketLimiter>,
    auto: bool,
    total_successful: AtomicU64,
    total_failed: AtomicU64,
}

impl TokenBucketLimiter {
    /// Create a new token bucket, full.
    ///
    /// Auto-replenishment needs a tokio runtime; without one the bucket logs
    /// a warning and replenishes lazily instead.
    pub fn new(options: TokenBucketOptions, clock: Arc<dyn Clock>) -> Arc<Self> {
        let now = clock.now();
        let state = BucketState {
            tokens: options.token_limit(),
            last_replenish: now,
            queue: WaitQueue::new(options.queue_limit(), options.queue_order()),
            idle_since: Some(now),
            retired: false,
        };

        Arc::new_cyclic(|me| {
            let auto = options.auto_replenish()
                && spawn_replenisher(me.clone(), options.replenish_period());
            Self {
                options,
                state: Mutex::new(state),
                clock,
                me: me.clone(),
                auto,
                total_successful: AtomicU64::new(0),
                total_failed: AtomicU64::new(0),
            }
        })
    }

    pub fn options(&self) -> &TokenBucketOptions {
        &self.options
    }

    /// Whether a background task is replenishing this bucket.
    pub fn is_auto_replenishing(&self) -> bool {
        self.auto
    }

    /// Attempt to take tokens without waiting.
    pub fn try_acquire(&self, permits: u32) -> Result<Lease> {
        self.check_permits(permits)?;

        let (lease, grants) = {
            let mut state = self.state.lock();
            if state.retired {
                return Ok(retired_lease());
            }
            let grants = self.refresh(&mut state);
            let lease = match self.try_lease(&mut state, permits) {
                Some(lease) => lease,
                None => self.reject(&state, reasons::TOKENS_EXHAUSTED, permits),
            };
            (lease, grants)
        };
        queue::deliver(grants);
        Ok(lease)
    }

    /// Take tokens, waiting in the queue if one is configured.
    ///
    /// Dropping the returned future while queued withdraws the waiter; a grant
    /// that raced the cancellation is refunded.
    pub async fn acquire(&self, permits: u32) -> Result<Lease> {
        self.check_permits(permits)?;

        let (attempt, grants) = {
            let mut state = self.state.lock();
            if state.retired {
                return Ok(retired_lease());
            }
            let grants = self.refresh(&mut state);
            let attempt = match self.try_lease(&mut state, permits) {
                Some(lease) => Attempt::Done(lease),
                None if permits == 0 => {
                    Attempt::Done(self.reject(&state, reasons::TOKENS_EXHAUSTED, permits))
                }
                None => match state.queue.enqueue(permits) {
                    Enqueued::Queued { id, rx, evicted } => {
                        let evicted = evicted
                            .into_iter()
                            .map(|waiter| {
                                let lease =
                                    self.reject(&state, reasons::EVICTED_FROM_QUEUE, waiter.permits);
                                (waiter.tx, lease)
                            })
                            .collect();
                        Attempt::Queued { id, rx, evicted }
                    }
                    Enqueued::Full => {
                        let reason = if self.options.queue_limit() == 0 {
                            reasons::TOKENS_EXHAUSTED
                        } else {
                            reasons::QUEUE_FULL
                        };
                        Attempt::Done(self.reject(&state, reason, permits))
                    }
                },
            };
            (attempt, grants)
        };
        queue::deliver(grants);

        let (id, rx, evicted) = match attempt {
            Attempt::Done(lease) => return Ok(lease),
            Attempt::Queued { id, rx, evicted } => (id, rx, evicted),
        };

        queue::deliver(evicted);
        trace!(waiter = id, permits = permits, "Queued for tokens");

        let mut pending = Pending::new(self, id, rx);
        if self.auto {
            return Ok(pending.wait().await);
        }

        // Nobody else replenishes a lazy bucket, so the waiter wakes itself at
        // each period boundary.
        loop {
            let wake_in = self.until_next_period();
            tokio::select! {
                lease = pending.recv() => return Ok(lease),
                _ = tokio::time::sleep(wake_in) => self.replenish_and_serve(),
            }
        }
    }

    /// Manually credit elapsed periods. Returns `false` for auto-replenished
    /// buckets, which are driven by their timer.
    pub fn try_replenish(&self) -> bool {
        if self.auto {
            return false;
        }
        self.replenish_and_serve();
        true
    }

    /// Tokens currently available.
    pub fn available_tokens(&self) -> u32 {
        self.statistics().available
    }

    pub fn statistics(&self) -> LimiterStatistics {
        let (stats, grants) = {
            let mut state = self.state.lock();
            let grants = self.refresh(&mut state);
            let stats = LimiterStatistics {
                available: state.tokens,
                queued_permits: state.queue.queued_permits(),
                queue_len: state.queue.len(),
                total_successful: self.total_successful.load(Ordering::Relaxed),
                total_failed: self.total_failed.load(Ordering::Relaxed),
            };
            (stats, grants)
        };
        queue::deliver(grants);
        stats
    }

    /// How long the bucket has been full with nobody queued.
    pub fn idle_duration(&self) -> Option<Duration> {
        let (idle_since, grants) = {
            let mut state = self.state.lock();
            let grants = self.refresh(&mut state);
            (state.idle_since, grants)
        };
        queue::deliver(grants);
        idle_since.map(|since| self.clock.now().saturating_sub(since))
    }

    /// Retire the bucket if it has been full and unused for at least
    /// `max_idle`. Later acquisitions are refused with
    /// [`reasons::LIMITER_RETIRED`].
    pub fn retire_if_idle(&self, max_idle: Duration) -> bool {
        let (retired, grants) = {
            let mut state = self.state.lock();
            let grants = self.refresh(&mut state);
            if !state.retired {
                let idle = state
                    .idle_since
                    .map(|since| self.clock.now().saturating_sub(since));
                state.retired = grants.is_empty() && idle.is_some_and(|idle| idle >= max_idle);
            }
            (state.retired, grants)
        };
        queue::deliver(grants);
        retired
    }

    pub fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    fn check_permits(&self, permits: u32) -> Result<()> {
        let limit = self.options.token_limit();
        if permits > limit {
            return Err(TurnstileError::PermitsExceedLimit {
                requested: permits,
                limit,
            });
        }
        Ok(())
    }

    /// Apply lazy replenishment and serve whoever it unblocks.
    fn refresh(&self, state: &mut BucketState) -> Grants {
        if self.auto {
            return Vec::new();
        }
        self.replenish_lazily(state);
        let grants = self.serve_queue(state);
        self.mark_idle(state);
        grants
    }

    fn replenish_lazily(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let period = self.options.replenish_period().as_nanos();
        let elapsed = now.saturating_sub(state.last_replenish).as_nanos();
        let periods = elapsed / period;
        if periods == 0 {
            return;
        }

        let added = periods.saturating_mul(u128::from(self.options.tokens_per_period()));
        let limit = u128::from(self.options.token_limit());
        state.tokens = (u128::from(state.tokens) + added).min(limit) as u32;

        // Advance by whole periods only so partial progress carries over.
        let advance = u64::try_from(periods * period).unwrap_or(u64::MAX);
        state.last_replenish = state
            .last_replenish
            .saturating_add(Duration::from_nanos(advance));

        trace!(periods = periods as u64, tokens = state.tokens, "Replenished token bucket");
    }

    fn replenish_tick(&self) {
        let grants = {
            let mut state = self.state.lock();
            state.tokens = state
                .tokens
                .saturating_add(self.options.tokens_per_period())
                .min(self.options.token_limit());
            state.last_replenish = self.clock.now();
            let grants = self.serve_queue(&mut state);
            self.mark_idle(&mut state);
            grants
        };
        queue::deliver(grants);
    }

    fn replenish_and_serve(&self) {
        let grants = {
            let mut state = self.state.lock();
            self.refresh(&mut state)
        };
        queue::deliver(grants);
    }

    fn until_next_period(&self) -> Duration {
        let state = self.state.lock();
        let into_period = self.clock.now().saturating_sub(state.last_replenish);
        self.options
            .replenish_period()
            .saturating_sub(into_period)
            .max(MIN_WAKE_INTERVAL)
    }

    fn try_lease(&self, state: &mut BucketState, permits: u32) -> Option<Lease> {
        let may_bypass_queue =
            state.queue.is_empty() || state.queue.order() == QueueOrder::NewestFirst;

        if permits == 0 {
            return (state.tokens > 0 && may_bypass_queue).then(|| self.grant(state, 0));
        }

        if state.tokens >= permits && may_bypass_queue {
            state.tokens -= permits;
            state.idle_since = None;
            self.total_successful.fetch_add(1, Ordering::Relaxed);
            return Some(self.grant(state, permits));
        }

        None
    }

    fn grant(&self, state: &BucketState, permits: u32) -> Lease {
        let mut metadata = Metadata::new();
        metadata.insert(keys::AVAILABLE_TOKENS.to_string(), state.tokens.into());
        let issuer: Weak<dyn LeaseIssuer> = self.me.clone();
        Lease::granted(permits, issuer, metadata)
    }

    fn reject(&self, state: &BucketState, reason: &str, permits: u32) -> Lease {
        self.total_failed.fetch_add(1, Ordering::Relaxed);

        let mut metadata = Metadata::new();
        metadata.insert(keys::REASON.to_string(), reason.into());
        metadata.insert(keys::AVAILABLE_TOKENS.to_string(), state.tokens.into());
        metadata.insert(
            keys::QUEUED_PERMITS.to_string(),
            state.queue.queued_permits().into(),
        );
        let retry_after = u64::try_from(self.retry_after(state, permits).as_millis())
            .unwrap_or(u64::MAX);
        metadata.insert(keys::RETRY_AFTER_MS.to_string(), retry_after.into());
        Lease::rejected(metadata)
    }

    /// Time until the bucket can cover this request plus everyone queued ahead.
    fn retry_after(&self, state: &BucketState, permits: u32) -> Duration {
        let demand = u64::from(permits) + u64::from(state.queue.queued_permits());
        let deficit = demand.saturating_sub(u64::from(state.tokens));
        let periods = deficit.div_ceil(u64::from(self.options.tokens_per_period()));
        let periods = u32::try_from(periods).unwrap_or(u32::MAX);
        let wait = self.options.replenish_period().saturating_mul(periods);

        if self.auto || periods == 0 {
            return wait;
        }
        let into_period = self.clock.now().saturating_sub(state.last_replenish);
        wait.saturating_sub(into_period)
    }

    fn serve_queue(&self, state: &mut BucketState) -> Grants {
        let mut grants = Vec::new();
        while let Some(next) = state.queue.peek_next() {
            let needed = next.permits;
            if state.tokens < needed {
                break;
            }
            let Some(waiter) = state.queue.pop_next() else {
                break;
            };
            state.tokens -= waiter.permits;
            self.total_successful.fetch_add(1, Ordering::Relaxed);
            let lease = self.grant(state, waiter.permits);
            trace!(waiter = waiter.id, tokens = waiter.permits, "Granted queued waiter");
            grants.push((waiter.tx, lease));
        }
        grants
    }

    fn mark_idle(&self, state: &mut BucketState) {
        if state.tokens == self.options.token_limit() && state.queue.is_empty() {
            state.idle_since.get_or_insert_with(|| self.clock.now());
        } else {
            state.idle_since = None;
        }
    }
}

fn spawn_replenisher(limiter: Weak<TokenBucketLimiter>, period: Duration) -> bool {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!("No tokio runtime available; token bucket falls back to lazy replenishment");
        return false;
    };

    let start = tokio::time::Instant::now() + period;
    handle.spawn(async move {
        let mut ticker = tokio::time::interval_at(start, period);
        loop {
            ticker.tick().await;
            let Some(limiter) = limiter.upgrade() else {
                break;
            };
            limiter.replenish_tick();
        }
        trace!("Token bucket dropped, stopping replenishment");
    });
    true
}

impl LeaseIssuer for TokenBucketLimiter {
    fn release(&self, _permits: u32) {}

    fn refund(&self, permits: u32) {
        self.total_successful.fetch_sub(1, Ordering::Relaxed);
        let grants = {
            let mut state = self.state.lock();
            state.tokens = state
                .tokens
                .saturating_add(permits)
                .min(self.options.token_limit());
            let grants = self.serve_queue(&mut state);
            self.mark_idle(&mut state);
            grants
        };
        queue::deliver(grants);
    }
}

impl QueueHost for TokenBucketLimiter {
    fn withdraw(&self, id: u64) -> bool {
        let grants = {
            let mut state = self.state.lock();
            if !state.queue.remove(id) {
                return false;
            }
            let grants = self.serve_queue(&mut state);
            self.mark_idle(&mut state);
            grants
        };
        trace!(waiter = id, "Queued waiter withdrew");
        queue::deliver(grants);
        true
    }
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("options", &self.options)
            .field("auto", &self.auto)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::{ManualClock, MonotonicClock};
    use tokio_test::{assert_pending, assert_ready};

    fn lazy_options() -> TokenBucketOptions {
        TokenBucketOptions::new(5, 1, Duration::from_secs(5))
            .unwrap()
            .with_auto_replenish(false)
    }

    fn lazy_bucket(clock: &ManualClock) -> Arc<TokenBucketLimiter> {
        TokenBucketLimiter::new(lazy_options(), Arc::new(clock.clone()))
    }

    fn drain(bucket: &TokenBucketLimiter, count: u32) {
        for _ in 0..count {
            assert!(bucket.try_acquire(1).unwrap().is_acquired());
        }
    }

    #[test]
    fn test_six_rapid_requests_sixth_rejected() {
        let clock = ManualClock::new();
        let bucket = lazy_bucket(&clock);

        for i in 1..=5 {
            let lease = bucket.try_acquire(1).unwrap();
            assert!(lease.is_acquired(), "Request {} should be admitted", i);
        }

        let sixth = bucket.try_acquire(1).unwrap();
        assert!(!sixth.is_acquired());
        assert_eq!(sixth.reason(), Some(reasons::TOKENS_EXHAUSTED));
        assert_eq!(sixth.retry_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_lazy_replenish_is_deterministic() {
        let clock = ManualClock::new();
        let bucket = lazy_bucket(&clock);
        drain(&bucket, 5);

        clock.set(Duration::from_millis(4900));
        assert!(!bucket.try_acquire(1).unwrap().is_acquired());

        clock.set(Duration::from_millis(5000));
        assert!(bucket.try_acquire(1).unwrap().is_acquired());

        // Exactly one token was credited.
        assert!(!bucket.try_acquire(1).unwrap().is_acquired());
    }

    #[test]
    fn test_lazy_replenish_keeps_partial_progress() {
        let clock = ManualClock::new();
        let bucket = lazy_bucket(&clock);
        drain(&bucket, 5);

        clock.set(Duration::from_secs(7));
        assert_eq!(bucket.available_tokens(), 1);
        drain(&bucket, 1);

        // The 2s past the first boundary still count toward the next one.
        clock.set(Duration::from_secs(10));
        assert_eq!(bucket.available_tokens(), 1);
    }

    #[test]
    fn test_lazy_replenish_caps_at_limit() {
        let clock = ManualClock::new();
        let bucket = lazy_bucket(&clock);
        drain(&bucket, 2);

        clock.advance(Duration::from_secs(100));
        let stats = bucket.statistics();
        assert_eq!(stats.available, 5);
        assert!(stats.available <= bucket.options().token_limit());
    }

    #[test]
    fn test_retry_after_accounts_for_elapsed_time() {
        let clock = ManualClock::new();
        let bucket = lazy_bucket(&clock);
        drain(&bucket, 5);

        clock.set(Duration::from_secs(2));
        let lease = bucket.try_acquire(1).unwrap();
        assert_eq!(lease.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_tokens_are_not_returned_on_release() {
        let clock = ManualClock::new();
        let bucket = lazy_bucket(&clock);

        let mut lease = bucket.try_acquire(2).unwrap();
        lease.release().unwrap();
        assert_eq!(bucket.available_tokens(), 3);
    }

    #[test]
    fn test_permits_over_token_limit_is_an_error() {
        let clock = ManualClock::new();
        let bucket = lazy_bucket(&clock);
        assert!(matches!(
            bucket.try_acquire(6),
            Err(TurnstileError::PermitsExceedLimit { requested: 6, limit: 5 })
        ));
    }

    #[test]
    fn test_try_replenish_only_for_lazy_buckets() {
        let clock = ManualClock::new();
        let bucket = lazy_bucket(&clock);
        assert!(bucket.try_replenish());
    }

    #[test]
    fn test_auto_without_runtime_falls_back_to_lazy() {
        let clock = ManualClock::new();
        let options = TokenBucketOptions::new(1, 1, Duration::from_secs(1)).unwrap();
        let bucket = TokenBucketLimiter::new(options, Arc::new(clock.clone()));
        assert!(!bucket.is_auto_replenishing());

        drain(&bucket, 1);
        clock.advance(Duration::from_secs(1));
        assert!(bucket.try_acquire(1).unwrap().is_acquired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_replenish_adds_tokens_on_timer() {
        let options = TokenBucketOptions::new(5, 1, Duration::from_secs(5)).unwrap();
        let bucket = TokenBucketLimiter::new(options, Arc::new(MonotonicClock::default()));
        assert!(bucket.is_auto_replenishing());
        assert!(!bucket.try_replenish());
        drain(&bucket, 5);

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(!bucket.try_acquire(1).unwrap().is_acquired());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(bucket.try_acquire(1).unwrap().is_acquired());
        assert!(!bucket.try_acquire(1).unwrap().is_acquired());
    }

    async fn admitted_over_timeline(bucket: &TokenBucketLimiter) -> u32 {
        // Two requests per second for 30 seconds, off the period boundaries.
        let mut admitted = 0;
        tokio::time::sleep(Duration::from_millis(250)).await;
        for _ in 0..60 {
            if bucket.try_acquire(1).unwrap().is_acquired() {
                admitted += 1;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        admitted
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_and_lazy_have_same_steady_state_rate() {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let auto = TokenBucketLimiter::new(
            TokenBucketOptions::new(5, 1, Duration::from_secs(5)).unwrap(),
            clock.clone(),
        );
        let lazy = TokenBucketLimiter::new(lazy_options(), clock);

        let (auto_admitted, lazy_admitted) =
            tokio::join!(admitted_over_timeline(&auto), admitted_over_timeline(&lazy));

        assert_eq!(auto_admitted, lazy_admitted);
        assert_eq!(lazy_admitted, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_waiter_served_by_timer() {
        let options = TokenBucketOptions::new(1, 1, Duration::from_secs(5))
            .unwrap()
            .with_queue(1, QueueOrder::OldestFirst);
        let bucket = TokenBucketLimiter::new(options, Arc::new(MonotonicClock::default()));
        drain(&bucket, 1);

        let start = tokio::time::Instant::now();
        let lease = bucket.acquire(1).await.unwrap();
        assert!(lease.is_acquired());
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_waiter_wakes_at_period_boundary() {
        let options = lazy_options().with_queue(2, QueueOrder::OldestFirst);
        let bucket = TokenBucketLimiter::new(options, Arc::new(MonotonicClock::default()));
        drain(&bucket, 5);

        let start = tokio::time::Instant::now();
        let lease = bucket.acquire(1).await.unwrap();
        assert!(lease.is_acquired());
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(bucket.statistics().queue_len, 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_refunds_raced_grant() {
        let clock = ManualClock::new();
        let options = lazy_options().with_queue(1, QueueOrder::OldestFirst);
        let bucket = TokenBucketLimiter::new(options, Arc::new(clock.clone()));
        drain(&bucket, 5);

        let mut waiter = tokio_test::task::spawn(bucket.acquire(1));
        assert_pending!(waiter.poll());

        clock.advance(Duration::from_secs(5));
        assert!(bucket.try_replenish());
        drop(waiter);

        assert_eq!(bucket.available_tokens(), 1);
        assert_eq!(bucket.statistics().queue_len, 0);
    }

    #[tokio::test]
    async fn test_evicted_waiter_gets_retry_hint() {
        let clock = ManualClock::new();
        let options = lazy_options().with_queue(1, QueueOrder::NewestFirst);
        let bucket = TokenBucketLimiter::new(options, Arc::new(clock.clone()));
        drain(&bucket, 5);

        let mut first = tokio_test::task::spawn(bucket.acquire(1));
        assert_pending!(first.poll());
        let mut second = tokio_test::task::spawn(bucket.acquire(1));
        assert_pending!(second.poll());

        let evicted = assert_ready!(first.poll()).unwrap();
        assert_eq!(evicted.reason(), Some(reasons::EVICTED_FROM_QUEUE));
        assert_eq!(evicted.get_metadata(keys::AVAILABLE_TOKENS).unwrap(), 0);
        assert_eq!(evicted.get_metadata(keys::QUEUED_PERMITS).unwrap(), 1);
        assert!(evicted.retry_after().is_some());
    }

    #[tokio::test]
    async fn test_queued_waiter_granted_by_manual_replenish() {
        let clock = ManualClock::new();
        let options = lazy_options().with_queue(1, QueueOrder::NewestFirst);
        let bucket = TokenBucketLimiter::new(options, Arc::new(clock.clone()));
        drain(&bucket, 5);

        let mut waiter = tokio_test::task::spawn(bucket.acquire(1));
        assert_pending!(waiter.poll());

        clock.advance(Duration::from_secs(5));
        bucket.try_replenish();
        let lease = assert_ready!(waiter.poll()).unwrap();
        assert!(lease.is_acquired());
        assert_eq!(bucket.available_tokens(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tokens_never_overdrawn_under_contention() {
        let clock = ManualClock::new();
        let bucket = lazy_bucket(&clock);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move {
                bucket.try_acquire(1).unwrap().is_acquired()
            }));
        }

        let admitted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|result| *result.as_ref().unwrap())
            .count();

        assert_eq!(admitted, 5);
        assert_eq!(bucket.available_tokens(), 0);
    }
}
