//! The admission engine.
//!
//! Entry point for dispatch layers: resolve the policy and partition for a
//! request, acquire a lease from the partition's limiter, and turn refusals
//! into rejections.

use std::sync::Arc;
use tracing::{debug, instrument, trace};

use super::lease::{keys, Lease};
use super::registry::{Policy, PolicyRegistry};
use super::rejection::{Rejection, RejectionHandler, TooManyRequests};
use super::request::RequestDescriptor;
use crate::config::TurnstileConfig;
use crate::error::{Result, TurnstileError};

/// Times a request resolves its partition again after finding the limiter
/// retired by idle eviction.
const RESOLVE_ATTEMPTS: usize = 3;

/// Outcome of an admission attempt.
#[derive(Debug)]
pub enum Admission {
    /// The request may proceed while it holds the lease
    Admitted(Lease),
    /// The request was refused
    Rejected(Rejection),
    /// The request was aborted before a decision was made
    Cancelled,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Admission::Rejected(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Admission::Cancelled)
    }

    pub fn lease(&self) -> Option<&Lease> {
        match self {
            Admission::Admitted(lease) => Some(lease),
            _ => None,
        }
    }

    pub fn into_lease(self) -> Option<Lease> {
        match self {
            Admission::Admitted(lease) => Some(lease),
            _ => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Admission::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }
}

/// Applies registered policies to inbound requests.
#[derive(Clone)]
pub struct AdmissionEngine {
    registry: Arc<PolicyRegistry>,
    rejection: Arc<dyn RejectionHandler>,
}

impl AdmissionEngine {
    /// Create an engine that answers rejections with 429.
    pub fn new(registry: PolicyRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            rejection: Arc::new(TooManyRequests::new()),
        }
    }

    /// Build the registry and rejection handler from configuration.
    pub fn from_config(config: &TurnstileConfig) -> Result<Self> {
        let registry = PolicyRegistry::from_config(config)?;
        Ok(Self::new(registry).with_rejection_handler(TooManyRequests::from_config(&config.engine)))
    }

    pub fn with_rejection_handler(mut self, handler: impl RejectionHandler + 'static) -> Self {
        self.rejection = Arc::new(handler);
        self
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    fn policy(&self, name: &str) -> Result<&Policy> {
        self.registry
            .policy(name)
            .ok_or_else(|| TurnstileError::UnknownPolicy(name.to_string()))
    }

    /// Admit a request under `policy`, waiting in the partition's queue if it
    /// has one.
    ///
    /// Returns `Err` only for an unknown policy. Cancelling the request while
    /// it waits yields [`Admission::Cancelled`] and consumes no capacity.
    #[instrument(skip(self, request), fields(route = %request.route()))]
    pub async fn admit(&self, policy: &str, request: &RequestDescriptor) -> Result<Admission> {
        let policy = self.policy(policy)?;
        let cancel = request.cancel_signal();
        if cancel.is_cancelled() {
            return Ok(Admission::Cancelled);
        }

        let mut attempt = 1;
        loop {
            let (partition_key, limiter) = policy.resolve(request);
            let lease = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(policy = %policy.name(), partition = %partition_key, "Request cancelled while waiting");
                    return Ok(Admission::Cancelled);
                }
                lease = limiter.acquire(1) => lease?,
            };

            if !lease.is_retired() || attempt == RESOLVE_ATTEMPTS {
                return Ok(self.settle(policy.name(), &partition_key, lease));
            }
            debug!(policy = %policy.name(), partition = %partition_key, "Partition limiter retired, resolving again");
            attempt += 1;
        }
    }

    /// Admit a request under `policy` without waiting.
    pub fn try_admit(&self, policy: &str, request: &RequestDescriptor) -> Result<Admission> {
        let policy = self.policy(policy)?;
        if request.cancel_signal().is_cancelled() {
            return Ok(Admission::Cancelled);
        }

        let mut attempt = 1;
        loop {
            let (partition_key, limiter) = policy.resolve(request);
            let lease = limiter.try_acquire(1)?;
            if !lease.is_retired() || attempt == RESOLVE_ATTEMPTS {
                return Ok(self.settle(policy.name(), &partition_key, lease));
            }
            debug!(policy = %policy.name(), partition = %partition_key, "Partition limiter retired, resolving again");
            attempt += 1;
        }
    }

    /// Admit a request under the policy bound to its route.
    ///
    /// Routes with neither a binding nor a default policy are not limited.
    pub async fn admit_route(&self, request: &RequestDescriptor) -> Result<Admission> {
        match self.registry.resolve_route(request.route()) {
            Some(policy) => self.admit(policy, request).await,
            None => {
                trace!(route = %request.route(), "No policy bound to route");
                Ok(Admission::Admitted(Lease::unlimited()))
            }
        }
    }

    /// Release a lease. Releasing the same lease twice is an error.
    pub fn release_lease(&self, lease: &mut Lease) -> Result<()> {
        lease.release()
    }

    fn settle(&self, policy: &str, partition_key: &str, mut lease: Lease) -> Admission {
        if lease.is_acquired() {
            trace!(policy = %policy, partition = %partition_key, "Request admitted");
            lease.insert_metadata(keys::POLICY, policy);
            lease.insert_metadata(keys::PARTITION_KEY, partition_key);
            return Admission::Admitted(lease);
        }
        Admission::Rejected(self.rejection.on_rejected(&lease, policy, partition_key))
    }
}

impl std::fmt::Debug for AdmissionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionEngine")
            .field("registry", &self.registry)
            .finish()
    }
}
