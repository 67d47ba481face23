//! Named policies and route bindings.
//!
//! A policy pairs a partitioner with the map of limiters it creates. The
//! registry is built once at startup; after that it is read-only and shared
//! between request tasks without locking.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::{Clock, MonotonicClock};
use super::limiter::Limiter;
use super::options::{ConcurrencyOptions, LimiterOptions, TokenBucketOptions};
use super::partition::{PartitionRule, Partitioner, RulePartitioner};
use super::partition_map::PartitionMap;
use super::request::RequestDescriptor;
use crate::config::TurnstileConfig;
use crate::error::{Result, TurnstileError};

/// A registered policy.
pub struct Policy {
    name: String,
    partitioner: Arc<dyn Partitioner>,
    partitions: PartitionMap,
}

impl Policy {
    fn new(name: String, partitioner: Arc<dyn Partitioner>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            partitioner,
            partitions: PartitionMap::new(clock),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Classify a request and return its partition key and limiter.
    pub fn resolve(&self, request: &RequestDescriptor) -> (String, Limiter) {
        let partition = self.partitioner.classify(request);
        let limiter = self.partitions.get_or_create(&partition);
        (partition.key().to_string(), limiter)
    }

    pub fn partitions(&self) -> &PartitionMap {
        &self.partitions
    }
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("name", &self.name)
            .field("partitions", &self.partitions)
            .finish()
    }
}

/// Immutable set of policies and route bindings.
#[derive(Debug)]
pub struct PolicyRegistry {
    policies: HashMap<String, Policy>,
    routes: BTreeMap<String, String>,
    default_policy: Option<String>,
}

impl PolicyRegistry {
    pub fn builder() -> PolicyRegistryBuilder {
        PolicyRegistryBuilder::default()
    }

    /// Build a registry from configuration.
    pub fn from_config(config: &TurnstileConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(MonotonicClock::default()))
    }

    /// Build a registry from configuration with an explicit time source.
    pub fn from_config_with_clock(config: &TurnstileConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut builder = PolicyRegistry::builder().clock(clock);
        for policy in &config.policies {
            if policy.partition.has_unbounded_keys() && config.engine.idle_eviction.is_none() {
                warn!(
                    policy = %policy.name,
                    rule = %policy.partition,
                    "Policy keys partitions by request attribute but idle eviction is disabled; partitions will accumulate"
                );
            }
            builder = builder.rule_policy(
                policy.name.clone(),
                policy.partition.clone(),
                policy.limiter.clone(),
            );
        }
        for (route, policy) in &config.routes {
            builder = builder.route(route.clone(), policy.clone());
        }
        if let Some(policy) = &config.default_policy {
            builder = builder.default_policy(policy.clone());
        }
        builder.build()
    }

    pub fn policy(&self, name: &str) -> Option<&Policy> {
        self.policies.get(name)
    }

    /// Policy names, sorted.
    pub fn policy_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn routes(&self) -> &BTreeMap<String, String> {
        &self.routes
    }

    pub fn default_policy(&self) -> Option<&str> {
        self.default_policy.as_deref()
    }

    /// Policy name for a route: the explicit binding, else the default policy.
    pub fn resolve_route(&self, route: &str) -> Option<&str> {
        self.routes
            .get(route)
            .map(String::as_str)
            .or(self.default_policy.as_deref())
    }

    /// Evict idle partitions across all policies.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let evicted: usize = self
            .policies
            .values()
            .map(|policy| policy.partitions.evict_idle(max_idle))
            .sum();
        if evicted > 0 {
            debug!(evicted, "Evicted idle partitions");
        }
        evicted
    }

    /// Run `evict_idle` every `interval` until the registry is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        info!(
            interval_ms = interval.as_millis() as u64,
            idle_after_ms = max_idle.as_millis() as u64,
            "Starting partition maintenance"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    debug!("Registry dropped, stopping partition maintenance");
                    return;
                };
                registry.evict_idle(max_idle);
            }
        })
    }
}

/// Collects registrations and validates them in [`PolicyRegistryBuilder::build`].
#[derive(Default)]
pub struct PolicyRegistryBuilder {
    policies: Vec<(String, Arc<dyn Partitioner>)>,
    routes: Vec<(String, String)>,
    default_policy: Option<String>,
    clock: Option<Arc<dyn Clock>>,
}

impl PolicyRegistryBuilder {
    /// Register a policy with one shared concurrency limiter.
    pub fn concurrency_limiter(self, name: impl Into<String>, options: ConcurrencyOptions) -> Self {
        self.rule_policy(name, PartitionRule::Global, options.into())
    }

    /// Register a policy with one shared token bucket.
    pub fn token_bucket_limiter(self, name: impl Into<String>, options: TokenBucketOptions) -> Self {
        self.rule_policy(name, PartitionRule::Global, options.into())
    }

    /// Register a policy that admits everything.
    pub fn no_limiter(self, name: impl Into<String>) -> Self {
        self.rule_policy(name, PartitionRule::Global, LimiterOptions::NoLimit)
    }

    /// Register a policy driven by a partitioning rule.
    pub fn rule_policy(
        self,
        name: impl Into<String>,
        rule: PartitionRule,
        options: LimiterOptions,
    ) -> Self {
        let name = name.into();
        let partitioner = RulePartitioner::new(name.clone(), rule, options);
        self.policy(name, partitioner)
    }

    /// Register a policy with a custom partitioner.
    pub fn policy(mut self, name: impl Into<String>, partitioner: impl Partitioner + 'static) -> Self {
        self.policies.push((name.into(), Arc::new(partitioner)));
        self
    }

    /// Bind a route to a policy.
    pub fn route(mut self, route: impl Into<String>, policy: impl Into<String>) -> Self {
        self.routes.push((route.into(), policy.into()));
        self
    }

    pub fn default_policy(mut self, policy: impl Into<String>) -> Self {
        self.default_policy = Some(policy.into());
        self
    }

    /// Time source for every limiter the registry creates.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<PolicyRegistry> {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::default()));

        let mut policies = HashMap::with_capacity(self.policies.len());
        for (name, partitioner) in self.policies {
            if policies.contains_key(&name) {
                return Err(TurnstileError::DuplicatePolicy(name));
            }
            let policy = Policy::new(name.clone(), partitioner, clock.clone());
            policies.insert(name, policy);
        }

        let mut routes = BTreeMap::new();
        for (route, policy) in self.routes {
            if !policies.contains_key(&policy) {
                return Err(TurnstileError::UnknownPolicy(policy));
            }
            routes.insert(route, policy);
        }

        if let Some(policy) = &self.default_policy {
            if !policies.contains_key(policy) {
                return Err(TurnstileError::UnknownPolicy(policy.clone()));
            }
        }

        info!(
            policies = policies.len(),
            routes = routes.len(),
            "Policy registry built"
        );

        Ok(PolicyRegistry {
            policies,
            routes,
            default_policy: self.default_policy,
        })
    }
}
