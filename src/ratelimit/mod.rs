//! Admission control logic and limiter state management.

mod backend;
mod clock;
mod concurrency;
mod engine;
mod lease;
mod limiter;
mod options;
mod partition;
mod partition_map;
mod queue;
mod registry;
mod rejection;
mod request;
mod token_bucket;

pub use backend::AdmissionControl;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use concurrency::ConcurrencyLimiter;
pub use engine::{Admission, AdmissionEngine};
pub use lease::{keys, reasons, Lease, Metadata};
pub use limiter::{Limiter, LimiterStatistics};
pub use options::{ConcurrencyOptions, LimiterOptions, QueueOrder, TokenBucketOptions, TokenBucketSettings};
pub use partition::{Partition, PartitionRule, Partitioner, RulePartitioner, ANONYMOUS_KEY, NO_LIMITER_KEY};
pub use partition_map::PartitionMap;
pub use registry::{Policy, PolicyRegistry, PolicyRegistryBuilder};
pub use rejection::{
    ChannelSink, DiagnosticSink, LogSink, MemorySink, Rejection, RejectionHandler, RejectionRecord,
    SinkError, TooManyRequests, TOO_MANY_REQUESTS,
};
pub use request::{cancellation, CancelHandle, CancelSignal, RequestDescriptor};
pub use token_bucket::TokenBucketLimiter;
