//! Leases returned by admission attempts.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Weak;
use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// Informational metadata attached to a lease.
pub type Metadata = BTreeMap<String, Value>;

/// Well-known metadata keys.
pub mod keys {
    /// Milliseconds until a retry is likely to succeed
    pub const RETRY_AFTER_MS: &str = "retry_after_ms";
    /// Why the lease was not acquired
    pub const REASON: &str = "reason";
    /// Permits left after the decision (concurrency limiters)
    pub const AVAILABLE_PERMITS: &str = "available_permits";
    /// Tokens left after the decision (token bucket limiters)
    pub const AVAILABLE_TOKENS: &str = "available_tokens";
    /// Permits waiting in the queue at decision time
    pub const QUEUED_PERMITS: &str = "queued_permits";
    /// Partition key that governed the request
    pub const PARTITION_KEY: &str = "partition_key";
    /// Policy that governed the request
    pub const POLICY: &str = "policy";
}

/// Reasons recorded under [`keys::REASON`].
pub mod reasons {
    pub const PERMITS_EXHAUSTED: &str = "permits_exhausted";
    pub const TOKENS_EXHAUSTED: &str = "tokens_exhausted";
    pub const QUEUE_FULL: &str = "queue_full";
    pub const EVICTED_FROM_QUEUE: &str = "evicted_from_queue";
    pub const LIMITER_DISPOSED: &str = "limiter_disposed";
    /// The limiter was evicted as idle; resolve the partition again
    pub const LIMITER_RETIRED: &str = "limiter_retired";
}

/// Refusal handed out by a limiter that was retired as idle.
pub(crate) fn retired_lease() -> Lease {
    let mut metadata = Metadata::new();
    metadata.insert(keys::REASON.to_string(), reasons::LIMITER_RETIRED.into());
    Lease::rejected(metadata)
}

/// Implemented by limiters that hand out leases.
pub(crate) trait LeaseIssuer: Send + Sync {
    /// Return permits held by a lease that finished normally.
    fn release(&self, permits: u32);

    /// Return permits of a lease that was granted but never used.
    fn refund(&self, permits: u32);
}

/// The outcome of one admission attempt.
///
/// An acquired lease holds capacity until it is released, either explicitly
/// through [`Lease::release`] or implicitly when dropped. Releasing twice is an
/// error. Leases keep only a weak handle to their limiter; if the limiter has
/// been evicted, releasing is a no-op.
pub struct Lease {
    acquired: bool,
    permits: u32,
    metadata: Metadata,
    issuer: Option<Weak<dyn LeaseIssuer>>,
    released: bool,
}

impl Lease {
    pub(crate) fn granted(permits: u32, issuer: Weak<dyn LeaseIssuer>, metadata: Metadata) -> Self {
        Self {
            acquired: true,
            permits,
            metadata,
            issuer: Some(issuer),
            released: false,
        }
    }

    /// An acquired lease that holds no capacity.
    pub(crate) fn unlimited() -> Self {
        Self {
            acquired: true,
            permits: 0,
            metadata: Metadata::new(),
            issuer: None,
            released: false,
        }
    }

    pub(crate) fn rejected(metadata: Metadata) -> Self {
        Self {
            acquired: false,
            permits: 0,
            metadata,
            issuer: None,
            released: false,
        }
    }

    /// Whether the limiter that produced this lease was retired. The caller
    /// should resolve the partition again.
    pub fn is_retired(&self) -> bool {
        self.reason() == Some(reasons::LIMITER_RETIRED)
    }

    /// Whether the admission succeeded.
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Permits or tokens held by this lease.
    pub fn permits(&self) -> u32 {
        self.permits
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// The retry hint, if the limiter supplied one.
    pub fn retry_after(&self) -> Option<Duration> {
        self.metadata
            .get(keys::RETRY_AFTER_MS)
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
    }

    /// Rejection reason, if any.
    pub fn reason(&self) -> Option<&str> {
        self.metadata.get(keys::REASON).and_then(Value::as_str)
    }

    pub(crate) fn insert_metadata(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Return the held capacity to the issuing limiter.
    ///
    /// Fails with [`TurnstileError::LeaseAlreadyReleased`] on the second call.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Err(TurnstileError::LeaseAlreadyReleased);
        }
        self.released = true;

        if self.acquired && self.permits > 0 {
            if let Some(issuer) = self.issuer.as_ref().and_then(Weak::upgrade) {
                issuer.release(self.permits);
            }
        }
        Ok(())
    }

    /// Give the capacity back as if the lease had never been granted.
    pub(crate) fn refund(mut self) {
        self.released = true;
        if self.acquired && self.permits > 0 {
            if let Some(issuer) = self.issuer.as_ref().and_then(Weak::upgrade) {
                issuer.refund(self.permits);
            }
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.release();
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("acquired", &self.acquired)
            .field("permits", &self.permits)
            .field("metadata", &self.metadata)
            .field("released", &self.released)
            .finish()
    }
}
