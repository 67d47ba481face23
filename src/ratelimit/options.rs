//! Limiter options.
//!
//! Options are validated when they are constructed or deserialized, so every
//! value of these types describes a limiter that can actually be built. That
//! keeps configuration failures at startup instead of at request time.

use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// Order in which queued waiters are served when capacity frees up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrder {
    /// Serve waiters in arrival order
    #[default]
    OldestFirst,
    /// Serve the most recent waiter first; evict the oldest when the queue is full
    NewestFirst,
}

/// Options for a concurrency limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyOptions {
    /// Maximum number of permits held at once
    pub permit_limit: NonZeroU32,
    /// Maximum number of permits that may wait in the queue (0 disables queuing)
    #[serde(default)]
    pub queue_limit: u32,
    /// Queue processing order
    #[serde(default)]
    pub queue_order: QueueOrder,
}

impl ConcurrencyOptions {
    /// Create options with no queue.
    pub fn new(permit_limit: u32) -> Result<Self> {
        let permit_limit = NonZeroU32::new(permit_limit).ok_or_else(|| {
            TurnstileError::InvalidOptions("permit_limit must be greater than zero".into())
        })?;
        Ok(Self {
            permit_limit,
            queue_limit: 0,
            queue_order: QueueOrder::default(),
        })
    }

    /// Enable queuing with the given limit and order.
    pub fn with_queue(mut self, queue_limit: u32, queue_order: QueueOrder) -> Self {
        self.queue_limit = queue_limit;
        self.queue_order = queue_order;
        self
    }
}

/// Options for a token bucket limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TokenBucketSettings", into = "TokenBucketSettings")]
pub struct TokenBucketOptions {
    token_limit: NonZeroU32,
    tokens_per_period: NonZeroU32,
    replenish_period: Duration,
    auto_replenish: bool,
    queue_limit: u32,
    queue_order: QueueOrder,
}

impl TokenBucketOptions {
    /// Create options with auto-replenishment and no queue.
    pub fn new(token_limit: u32, tokens_per_period: u32, replenish_period: Duration) -> Result<Self> {
        let token_limit = NonZeroU32::new(token_limit).ok_or_else(|| {
            TurnstileError::InvalidOptions("token_limit must be greater than zero".into())
        })?;
        let tokens_per_period = NonZeroU32::new(tokens_per_period).ok_or_else(|| {
            TurnstileError::InvalidOptions("tokens_per_period must be greater than zero".into())
        })?;
        if replenish_period.is_zero() {
            return Err(TurnstileError::InvalidOptions(
                "replenish_period must be greater than zero".into(),
            ));
        }

        Ok(Self {
            token_limit,
            tokens_per_period,
            replenish_period,
            auto_replenish: true,
            queue_limit: 0,
            queue_order: QueueOrder::default(),
        })
    }

    /// Choose between a background replenishment timer and lazy replenishment.
    pub fn with_auto_replenish(mut self, auto_replenish: bool) -> Self {
        self.auto_replenish = auto_replenish;
        self
    }

    /// Enable queuing with the given limit and order.
    pub fn with_queue(mut self, queue_limit: u32, queue_order: QueueOrder) -> Self {
        self.queue_limit = queue_limit;
        self.queue_order = queue_order;
        self
    }

    pub fn token_limit(&self) -> u32 {
        self.token_limit.get()
    }

    pub fn tokens_per_period(&self) -> u32 {
        self.tokens_per_period.get()
    }

    pub fn replenish_period(&self) -> Duration {
        self.replenish_period
    }

    pub fn auto_replenish(&self) -> bool {
        self.auto_replenish
    }

    pub fn queue_limit(&self) -> u32 {
        self.queue_limit
    }

    pub fn queue_order(&self) -> QueueOrder {
        self.queue_order
    }
}

/// Wire form of [`TokenBucketOptions`] as it appears in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketSettings {
    pub token_limit: u32,
    pub tokens_per_period: u32,
    pub replenish_period_ms: u64,
    #[serde(default = "default_auto_replenish")]
    pub auto_replenish: bool,
    #[serde(default)]
    pub queue_limit: u32,
    #[serde(default)]
    pub queue_order: QueueOrder,
}

fn default_auto_replenish() -> bool {
    true
}

impl TryFrom<TokenBucketSettings> for TokenBucketOptions {
    type Error = TurnstileError;

    fn try_from(settings: TokenBucketSettings) -> Result<Self> {
        Ok(TokenBucketOptions::new(
            settings.token_limit,
            settings.tokens_per_period,
            Duration::from_millis(settings.replenish_period_ms),
        )?
        .with_auto_replenish(settings.auto_replenish)
        .with_queue(settings.queue_limit, settings.queue_order))
    }
}

impl From<TokenBucketOptions> for TokenBucketSettings {
    fn from(options: TokenBucketOptions) -> Self {
        Self {
            token_limit: options.token_limit(),
            tokens_per_period: options.tokens_per_period(),
            replenish_period_ms: u64::try_from(options.replenish_period.as_millis())
                .unwrap_or(u64::MAX),
            auto_replenish: options.auto_replenish,
            queue_limit: options.queue_limit,
            queue_order: options.queue_order,
        }
    }
}

/// The admission algorithm a partition uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LimiterOptions {
    /// Always admit
    NoLimit,
    /// Bound the number of in-flight requests
    Concurrency(ConcurrencyOptions),
    /// Bound the request rate with a replenishing token reservoir
    TokenBucket(TokenBucketOptions),
}

impl LimiterOptions {
    /// Short algorithm name used in logs and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            LimiterOptions::NoLimit => "no_limit",
            LimiterOptions::Concurrency(_) => "concurrency",
            LimiterOptions::TokenBucket(_) => "token_bucket",
        }
    }
}

impl From<ConcurrencyOptions> for LimiterOptions {
    fn from(options: ConcurrencyOptions) -> Self {
        LimiterOptions::Concurrency(options)
    }
}

impl From<TokenBucketOptions> for LimiterOptions {
    fn from(options: TokenBucketOptions) -> Self {
        LimiterOptions::TokenBucket(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_rejects_zero_permits() {
        let err = ConcurrencyOptions::new(0).unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidOptions(_)));
    }

    #[test]
    fn test_token_bucket_rejects_invalid_values() {
        assert!(TokenBucketOptions::new(0, 1, Duration::from_secs(1)).is_err());
        assert!(TokenBucketOptions::new(5, 0, Duration::from_secs(1)).is_err());
        assert!(TokenBucketOptions::new(5, 1, Duration::ZERO).is_err());
    }

    #[test]
    fn test_parse_token_bucket_options() {
        let yaml = r#"
type: token_bucket
token_limit: 5
tokens_per_period: 1
replenish_period_ms: 5000
auto_replenish: false
queue_order: newest_first
"#;
        let options: LimiterOptions = serde_yaml::from_str(yaml).unwrap();
        let LimiterOptions::TokenBucket(bucket) = options else {
            panic!("expected token bucket options");
        };
        assert_eq!(bucket.token_limit(), 5);
        assert_eq!(bucket.replenish_period(), Duration::from_secs(5));
        assert!(!bucket.auto_replenish());
        assert_eq!(bucket.queue_limit(), 0);
        assert_eq!(bucket.queue_order(), QueueOrder::NewestFirst);
    }

    #[test]
    fn test_parse_rejects_zero_period() {
        let yaml = r#"
type: token_bucket
token_limit: 5
tokens_per_period: 1
replenish_period_ms: 0
"#;
        assert!(serde_yaml::from_str::<LimiterOptions>(yaml).is_err());
    }

    #[test]
    fn test_parse_concurrency_defaults() {
        let yaml = "type: concurrency\npermit_limit: 1\n";
        let options: LimiterOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(options, LimiterOptions::Concurrency(ConcurrencyOptions::new(1).unwrap()));
    }

    #[test]
    fn test_parse_rejects_zero_permit_limit() {
        let yaml = "type: concurrency\npermit_limit: 0\n";
        assert!(serde_yaml::from_str::<LimiterOptions>(yaml).is_err());
    }
}
