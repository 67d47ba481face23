//! The limiter facade.
//!
//! A [`Limiter`] is one of the supported admission algorithms behind a single
//! acquire/release contract. The variant is chosen from [`LimiterOptions`]
//! when a partition is first seen; callers never inspect it.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::clock::Clock;
use super::concurrency::ConcurrencyLimiter;
use super::lease::Lease;
use super::options::LimiterOptions;
use super::token_bucket::TokenBucketLimiter;
use crate::error::Result;

/// Point-in-time counters for a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimiterStatistics {
    /// Permits or tokens available right now
    pub available: u32,
    /// Permits requested by queued waiters
    pub queued_permits: u32,
    /// Number of queued waiters
    pub queue_len: usize,
    /// Leases granted so far
    pub total_successful: u64,
    /// Admissions refused so far
    pub total_failed: u64,
}

/// A cheaply cloneable handle to one admission algorithm instance.
#[derive(Clone, Debug)]
pub enum Limiter {
    /// Admits everything and holds no state
    NoLimit,
    /// Bounds concurrent leases
    Concurrency(Arc<ConcurrencyLimiter>),
    /// Bounds the admission rate
    TokenBucket(Arc<TokenBucketLimiter>),
}

impl Limiter {
    /// Build the limiter described by `options`.
    pub fn from_options(options: &LimiterOptions, clock: Arc<dyn Clock>) -> Self {
        debug!(kind = options.kind(), "Creating limiter");
        match options {
            LimiterOptions::NoLimit => Limiter::NoLimit,
            LimiterOptions::Concurrency(options) => {
                Limiter::Concurrency(ConcurrencyLimiter::new(options.clone(), clock))
            }
            LimiterOptions::TokenBucket(options) => {
                Limiter::TokenBucket(TokenBucketLimiter::new(options.clone(), clock))
            }
        }
    }

    /// Attempt admission without waiting.
    pub fn try_acquire(&self, permits: u32) -> Result<Lease> {
        match self {
            Limiter::NoLimit => Ok(Lease::unlimited()),
            Limiter::Concurrency(limiter) => limiter.try_acquire(permits),
            Limiter::TokenBucket(limiter) => limiter.try_acquire(permits),
        }
    }

    /// Attempt admission, waiting in the limiter's queue if it has one.
    pub async fn acquire(&self, permits: u32) -> Result<Lease> {
        match self {
            Limiter::NoLimit => Ok(Lease::unlimited()),
            Limiter::Concurrency(limiter) => limiter.acquire(permits).await,
            Limiter::TokenBucket(limiter) => limiter.acquire(permits).await,
        }
    }

    /// Current counters; `None` for [`Limiter::NoLimit`].
    pub fn statistics(&self) -> Option<LimiterStatistics> {
        match self {
            Limiter::NoLimit => None,
            Limiter::Concurrency(limiter) => Some(limiter.statistics()),
            Limiter::TokenBucket(limiter) => Some(limiter.statistics()),
        }
    }

    /// How long the limiter has been at full capacity with an empty queue.
    pub fn idle_duration(&self) -> Option<Duration> {
        match self {
            Limiter::NoLimit => Some(Duration::MAX),
            Limiter::Concurrency(limiter) => limiter.idle_duration(),
            Limiter::TokenBucket(limiter) => limiter.idle_duration(),
        }
    }

    /// Retire the limiter if it has been idle for at least `max_idle`.
    ///
    /// The check and the retirement happen under the limiter's own lock, so
    /// no lease can be granted by a limiter once it has been judged idle.
    pub fn retire_if_idle(&self, max_idle: Duration) -> bool {
        match self {
            Limiter::NoLimit => true,
            Limiter::Concurrency(limiter) => limiter.retire_if_idle(max_idle),
            Limiter::TokenBucket(limiter) => limiter.retire_if_idle(max_idle),
        }
    }

    pub fn is_retired(&self) -> bool {
        match self {
            Limiter::NoLimit => false,
            Limiter::Concurrency(limiter) => limiter.is_retired(),
            Limiter::TokenBucket(limiter) => limiter.is_retired(),
        }
    }

    /// Whether two handles point at the same instance.
    pub fn same_instance(&self, other: &Limiter) -> bool {
        match (self, other) {
            (Limiter::NoLimit, Limiter::NoLimit) => true,
            (Limiter::Concurrency(a), Limiter::Concurrency(b)) => Arc::ptr_eq(a, b),
            (Limiter::TokenBucket(a), Limiter::TokenBucket(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Limiter::NoLimit => "no_limit",
            Limiter::Concurrency(_) => "concurrency",
            Limiter::TokenBucket(_) => "token_bucket",
        }
    }
}
