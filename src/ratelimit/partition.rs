//! Partition classification.
//!
//! A partitioner looks at a request and decides which partition governs it.
//! Each partition has its own limiter, so traffic in one partition never
//! consumes capacity in another.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::options::LimiterOptions;
use super::request::RequestDescriptor;

/// Partition key that always maps to an unlimited limiter.
pub const NO_LIMITER_KEY: &str = "no-limiter";

/// Key used when the attribute a rule partitions on is missing.
pub const ANONYMOUS_KEY: &str = "anonymous";

/// The partition a request belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Partition {
    /// Exempt from limiting; no limiter state is allocated
    NoLimit,
    /// Governed by the limiter stored under `key`
    Limited {
        key: String,
        options: LimiterOptions,
    },
}

impl Partition {
    /// Build a partition. The key [`NO_LIMITER_KEY`] and
    /// [`LimiterOptions::NoLimit`] both normalise to [`Partition::NoLimit`].
    pub fn new(key: impl Into<String>, options: LimiterOptions) -> Self {
        let key = key.into();
        if key == NO_LIMITER_KEY || options == LimiterOptions::NoLimit {
            return Partition::NoLimit;
        }
        Partition::Limited { key, options }
    }

    pub fn no_limit() -> Self {
        Partition::NoLimit
    }

    pub fn key(&self) -> &str {
        match self {
            Partition::NoLimit => NO_LIMITER_KEY,
            Partition::Limited { key, .. } => key,
        }
    }

    pub fn is_no_limit(&self) -> bool {
        matches!(self, Partition::NoLimit)
    }
}

/// Maps a request to its partition.
///
/// Implementations must be pure functions of the request.
pub trait Partitioner: Send + Sync {
    fn classify(&self, request: &RequestDescriptor) -> Partition;
}

impl<F> Partitioner for F
where
    F: Fn(&RequestDescriptor) -> Partition + Send + Sync,
{
    fn classify(&self, request: &RequestDescriptor) -> Partition {
        self(request)
    }
}

/// Declarative partitioning rules available from configuration.
///
/// `header`, `client` and `route` take their keys from the request, so every
/// distinct value creates a limiter that stays in memory until idle eviction
/// (`engine.idle_eviction`) removes it. Without eviction, a caller that
/// varies the attribute grows the partition map without bound.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum PartitionRule {
    /// Every request shares one partition keyed by the policy name
    #[default]
    Global,
    /// Requests with a query string are not limited; the rest share one partition
    QueryExempt {
        /// Partition key for limited requests (defaults to the policy name)
        #[serde(default)]
        key: Option<String>,
    },
    /// One partition per value of a request header
    Header { name: String },
    /// One partition per client identity
    Client,
    /// One partition per route
    Route,
}

impl PartitionRule {
    /// Whether partition keys come from request attributes rather than
    /// configuration.
    pub fn has_unbounded_keys(&self) -> bool {
        matches!(
            self,
            PartitionRule::Header { .. } | PartitionRule::Client | PartitionRule::Route
        )
    }
}

impl fmt::Display for PartitionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionRule::Global => write!(f, "global"),
            PartitionRule::QueryExempt { .. } => write!(f, "query_exempt"),
            PartitionRule::Header { name } => write!(f, "header({})", name),
            PartitionRule::Client => write!(f, "client"),
            PartitionRule::Route => write!(f, "route"),
        }
    }
}

/// A [`Partitioner`] built from a [`PartitionRule`] and one set of options.
#[derive(Debug, Clone)]
pub struct RulePartitioner {
    policy: String,
    rule: PartitionRule,
    options: LimiterOptions,
}

impl RulePartitioner {
    pub fn new(policy: impl Into<String>, rule: PartitionRule, options: LimiterOptions) -> Self {
        Self {
            policy: policy.into(),
            rule,
            options,
        }
    }

    pub fn rule(&self) -> &PartitionRule {
        &self.rule
    }

    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }
}

impl Partitioner for RulePartitioner {
    fn classify(&self, request: &RequestDescriptor) -> Partition {
        let key = match &self.rule {
            PartitionRule::Global => self.policy.as_str(),
            PartitionRule::QueryExempt { key } => {
                if request.has_query() {
                    return Partition::NoLimit;
                }
                key.as_deref().unwrap_or(&self.policy)
            }
            PartitionRule::Header { name } => request.header(name).unwrap_or(ANONYMOUS_KEY),
            PartitionRule::Client => request.client().unwrap_or(ANONYMOUS_KEY),
            PartitionRule::Route => request.route(),
        };
        Partition::new(key, self.options.clone())
    }
}
