use std::sync::Arc;
use std::time::Duration;

use turnstile::config::TurnstileConfig;
use turnstile::error::TurnstileError;
use turnstile::ratelimit::{
    cancellation, keys, reasons, Admission, AdmissionControl, AdmissionEngine, ManualClock,
    MemorySink, PolicyRegistry, RequestDescriptor, TooManyRequests,
};

fn builtin_engine(clock: &ManualClock, sink: &MemorySink) -> AdmissionEngine {
    let config = TurnstileConfig::builtin().unwrap();
    let registry = PolicyRegistry::from_config_with_clock(&config, Arc::new(clock.clone())).unwrap();
    AdmissionEngine::new(registry).with_rejection_handler(
        TooManyRequests::from_config(&config.engine).with_sink(Arc::new(sink.clone())),
    )
}

async fn admit(engine: &AdmissionEngine, target: &str) -> Admission {
    engine
        .admit_route(&RequestDescriptor::from_target(target))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_controllers_admit_one_request_at_a_time() {
    let clock = ManualClock::new();
    let sink = MemorySink::new();
    let engine = builtin_engine(&clock, &sink);

    let first = admit(&engine, "/controllers/home").await;
    assert!(first.is_admitted());

    let second = admit(&engine, "/controllers/home?page=2").await;
    let rejection = second.rejection().expect("second request should be rejected");
    assert_eq!(rejection.status, 429);
    assert_eq!(rejection.policy, "controllers");
    assert_eq!(sink.len(), 1);

    drop(first);
    assert!(admit(&engine, "/controllers/home").await.is_admitted());
}

#[tokio::test]
async fn test_six_rapid_requests_sixth_rejected() {
    let clock = ManualClock::new();
    let sink = MemorySink::new();
    let engine = builtin_engine(&clock, &sink);

    for attempt in 1..=5 {
        let admission = admit(&engine, "/hello").await;
        assert!(admission.is_admitted(), "request {} should be admitted", attempt);
    }

    let sixth = admit(&engine, "/hello").await;
    let rejection = sixth.rejection().unwrap();
    assert_eq!(rejection.status, 429);
    assert_eq!(rejection.reason(), Some(reasons::TOKENS_EXHAUSTED));
    assert_eq!(rejection.retry_after, Some(Duration::from_secs(5)));
    assert_eq!(rejection.retry_after_secs(), Some(5));
}

#[tokio::test]
async fn test_token_policy_exempts_query_requests() {
    let clock = ManualClock::new();
    let sink = MemorySink::new();
    let engine = builtin_engine(&clock, &sink);

    for _ in 0..20 {
        let admission = admit(&engine, "/token?page=1").await;
        let lease = admission.lease().unwrap();
        assert_eq!(lease.get_metadata(keys::PARTITION_KEY).unwrap(), "no-limiter");
    }

    for _ in 0..5 {
        let admission = admit(&engine, "/token").await;
        let lease = admission.lease().unwrap();
        assert_eq!(lease.get_metadata(keys::PARTITION_KEY).unwrap(), "token");
    }
    assert!(admit(&engine, "/token").await.is_rejected());

    // Still exempt once the bucket is empty.
    assert!(admit(&engine, "/token?page=2").await.is_admitted());

    let policy = engine.registry().policy("token-policy").unwrap();
    assert_eq!(policy.partitions().keys(), vec!["token".to_string()]);
}

#[tokio::test]
async fn test_lazy_bucket_replenishes_on_period_boundary() {
    let clock = ManualClock::new();
    let sink = MemorySink::new();
    let engine = builtin_engine(&clock, &sink);

    for _ in 0..5 {
        assert!(admit(&engine, "/hello").await.is_admitted());
    }

    clock.set(Duration::from_millis(4900));
    assert!(admit(&engine, "/hello").await.is_rejected());

    clock.set(Duration::from_millis(5000));
    assert!(admit(&engine, "/hello").await.is_admitted());
    assert!(admit(&engine, "/hello").await.is_rejected());
}

#[tokio::test]
async fn test_policies_do_not_share_capacity() {
    let clock = ManualClock::new();
    let sink = MemorySink::new();
    let engine = builtin_engine(&clock, &sink);

    for _ in 0..5 {
        assert!(admit(&engine, "/hello").await.is_admitted());
    }
    assert!(admit(&engine, "/hello").await.is_rejected());

    // `/token` uses its own bucket even though its partition is also named "token".
    assert!(admit(&engine, "/token").await.is_admitted());
    assert!(admit(&engine, "/free").await.is_admitted());
}

#[tokio::test]
async fn test_cancelled_waiter_is_distinct_from_rejection() {
    let yaml = r#"
policies:
  - name: queued
    limiter:
      type: concurrency
      permit_limit: 1
      queue_limit: 1
default_policy: queued
"#;
    let config = TurnstileConfig::from_yaml(yaml).unwrap();
    let engine = Arc::new(AdmissionEngine::from_config(&config).unwrap());

    let held = admit(&engine, "/work").await;
    assert!(held.is_admitted());

    let (handle, signal) = cancellation();
    let waiter = tokio::spawn({
        let engine = engine.clone();
        async move {
            let request = RequestDescriptor::new("/work").with_cancel(signal);
            engine.admit_route(&request).await
        }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();
    let outcome = waiter.await.unwrap().unwrap();
    assert!(outcome.is_cancelled());

    // The cancelled waiter took nothing: releasing the held lease frees the permit.
    drop(held);
    assert!(admit(&engine, "/work").await.is_admitted());
}

#[tokio::test]
async fn test_double_release_is_reported() {
    let engine: Arc<dyn AdmissionControl> =
        Arc::new(AdmissionEngine::from_config(&TurnstileConfig::builtin().unwrap()).unwrap());
    let request = RequestDescriptor::new("/anything");

    let mut lease = engine
        .admit_route(&request)
        .await
        .unwrap()
        .into_lease()
        .unwrap();
    engine.release_lease(&mut lease).unwrap();
    assert!(matches!(
        engine.release_lease(&mut lease),
        Err(TurnstileError::LeaseAlreadyReleased)
    ));

    // Only one permit was returned.
    let first = engine.admit_route(&request).await.unwrap();
    assert!(first.is_admitted());
    assert!(engine.admit_route(&request).await.unwrap().is_rejected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_touch_shares_one_bucket() {
    let clock = ManualClock::new();
    let sink = MemorySink::new();
    let engine = Arc::new(builtin_engine(&clock, &sink));
    let barrier = Arc::new(tokio::sync::Barrier::new(32));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let engine = engine.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            engine
                .try_admit("token", &RequestDescriptor::new("/hello"))
                .unwrap()
                .into_lease()
                .is_some()
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 5);
    let policy = engine.registry().policy("token").unwrap();
    assert_eq!(policy.partitions().created_count(), 1);
    let stats = policy.partitions().get("token").unwrap().statistics().unwrap();
    assert_eq!(stats.total_successful, 5);
    assert_eq!(stats.total_failed, 27);
}
