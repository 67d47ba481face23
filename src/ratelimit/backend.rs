//! Admission control trait for abstracting the engine from dispatch layers.

use async_trait::async_trait;

use super::engine::{Admission, AdmissionEngine};
use super::lease::Lease;
use super::request::RequestDescriptor;
use crate::error::Result;

/// Trait for admission control implementations.
///
/// Dispatch layers hold an `Arc<dyn AdmissionControl>` so they can be tested
/// against stubs and run against the [`AdmissionEngine`].
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Admit a request under a named policy.
    async fn admit(&self, policy: &str, request: &RequestDescriptor) -> Result<Admission>;

    /// Admit a request under the policy bound to its route.
    async fn admit_route(&self, request: &RequestDescriptor) -> Result<Admission>;

    /// Return a lease's capacity to its limiter.
    fn release_lease(&self, lease: &mut Lease) -> Result<()>;
}

#[async_trait]
impl AdmissionControl for AdmissionEngine {
    async fn admit(&self, policy: &str, request: &RequestDescriptor) -> Result<Admission> {
        AdmissionEngine::admit(self, policy, request).await
    }

    async fn admit_route(&self, request: &RequestDescriptor) -> Result<Admission> {
        AdmissionEngine::admit_route(self, request).await
    }

    fn release_lease(&self, lease: &mut Lease) -> Result<()> {
        AdmissionEngine::release_lease(self, lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::options::ConcurrencyOptions;
    use crate::ratelimit::registry::PolicyRegistry;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_engine_behind_trait_object() {
        let registry = PolicyRegistry::builder()
            .concurrency_limiter("controllers", ConcurrencyOptions::new(1).unwrap())
            .default_policy("controllers")
            .build()
            .unwrap();
        let control: Arc<dyn AdmissionControl> = Arc::new(AdmissionEngine::new(registry));
        let request = RequestDescriptor::new("/");

        let mut lease = control
            .admit_route(&request)
            .await
            .unwrap()
            .into_lease()
            .unwrap();
        assert!(control.admit("controllers", &request).await.unwrap().is_rejected());

        control.release_lease(&mut lease).unwrap();
        assert!(control.admit("controllers", &request).await.unwrap().is_admitted());
    }
}
