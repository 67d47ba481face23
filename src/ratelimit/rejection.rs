//! Rejection handling.
//!
//! Turns a refused lease into the response a dispatch layer sends back, and
//! reports every rejection to a diagnostic sink. Sinks are best effort: a
//! full, closed or panicking sink never changes the rejection.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::lease::{keys, Lease, Metadata};
use crate::config::EngineConfig;

/// Status reported for rejected requests unless configured otherwise.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// The response for a request that was not admitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    /// HTTP status code to answer with
    pub status: u16,
    /// Suggested wait before retrying
    #[serde(skip)]
    pub retry_after: Option<Duration>,
    /// Policy that refused the request
    pub policy: String,
    /// Partition whose limiter refused the request
    pub partition_key: String,
    /// Limiter diagnostics plus policy and partition
    pub metadata: Metadata,
}

impl Rejection {
    /// Reason reported by the limiter, if any.
    pub fn reason(&self) -> Option<&str> {
        self.metadata.get(keys::REASON).and_then(|value| value.as_str())
    }

    /// Value for a `Retry-After` header, rounded up to whole seconds.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|after| {
            let secs = after.as_secs();
            if after.subsec_nanos() > 0 {
                secs + 1
            } else {
                secs
            }
        })
    }
}

/// One diagnostic record per rejection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectionRecord {
    pub at: DateTime<Utc>,
    pub policy: String,
    pub partition_key: String,
    pub status: u16,
    pub metadata: Metadata,
}

/// Why a sink could not take a record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink is full")]
    Full,

    #[error("sink is closed")]
    Closed,
}

/// Destination for rejection records.
///
/// `record` is called on the request path; it may take a short lock but
/// must not wait on I/O or a consumer.
pub trait DiagnosticSink: Send + Sync + std::fmt::Debug {
    fn record(&self, record: &RejectionRecord) -> Result<(), SinkError>;
}

/// Logs each metadata entry of a rejection as a warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn record(&self, record: &RejectionRecord) -> Result<(), SinkError> {
        if record.metadata.is_empty() {
            warn!(
                policy = %record.policy,
                partition = %record.partition_key,
                "Rate limit exceeded"
            );
        }
        for (key, value) in &record.metadata {
            warn!(
                policy = %record.policy,
                partition = %record.partition_key,
                "Rate limit exceeded: {} {}",
                key,
                value
            );
        }
        Ok(())
    }
}

/// Keeps the most recent records in memory.
///
/// The lock is held only to push one record, so concurrent rejections queue
/// briefly instead of losing records. Only the capacity bound drops them.
#[derive(Debug, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<VecDeque<RejectionRecord>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn records(&self) -> Vec<RejectionRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticSink for MemorySink {
    fn record(&self, record: &RejectionRecord) -> Result<(), SinkError> {
        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            records.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        records.push_back(record.clone());
        Ok(())
    }
}

/// Forwards records to a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<RejectionRecord>,
    dropped: Arc<AtomicU64>,
}

impl ChannelSink {
    /// Create a sink and the receiver that drains it.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RejectionRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, rx)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl DiagnosticSink for ChannelSink {
    fn record(&self, record: &RejectionRecord) -> Result<(), SinkError> {
        self.tx.try_send(record.clone()).map_err(|err| {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            match err {
                mpsc::error::TrySendError::Full(_) => SinkError::Full,
                mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
            }
        })
    }
}

/// Builds the response for a refused lease.
pub trait RejectionHandler: Send + Sync {
    fn on_rejected(&self, lease: &Lease, policy: &str, partition_key: &str) -> Rejection;
}

/// Answers rejections with a fixed status and an optional retry hint.
#[derive(Debug, Clone)]
pub struct TooManyRequests {
    status: u16,
    include_retry_after: bool,
    sink: Arc<dyn DiagnosticSink>,
}

impl TooManyRequests {
    pub fn new() -> Self {
        Self {
            status: TOO_MANY_REQUESTS,
            include_retry_after: true,
            sink: Arc::new(LogSink),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new()
            .with_status(config.rejection_status_code)
            .with_retry_after(config.include_retry_after)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_retry_after(mut self, include: bool) -> Self {
        self.include_retry_after = include;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    fn emit(&self, record: &RejectionRecord) {
        match catch_unwind(AssertUnwindSafe(|| self.sink.record(record))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %err, "Rejection record not delivered"),
            Err(_) => debug!("Diagnostic sink panicked"),
        }
    }
}

impl Default for TooManyRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl RejectionHandler for TooManyRequests {
    fn on_rejected(&self, lease: &Lease, policy: &str, partition_key: &str) -> Rejection {
        let mut metadata = lease.metadata().clone();
        let retry_after = if self.include_retry_after {
            lease.retry_after()
        } else {
            metadata.remove(keys::RETRY_AFTER_MS);
            None
        };
        metadata.insert(keys::POLICY.to_string(), policy.into());
        metadata.insert(keys::PARTITION_KEY.to_string(), partition_key.into());

        let record = RejectionRecord {
            at: Utc::now(),
            policy: policy.to_string(),
            partition_key: partition_key.to_string(),
            status: self.status,
            metadata: metadata.clone(),
        };
        self.emit(&record);

        Rejection {
            status: self.status,
            retry_after,
            policy: policy.to_string(),
            partition_key: partition_key.to_string(),
            metadata,
        }
    }
}
