//! End-to-end tests for the request pipeline.

use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;

use hypersim_security::audit::{SecurityEventType, Severity};
use hypersim_security::pipeline::{AUTHORIZATION, KEY_ROTATION};
use hypersim_security::SecurityError;

mod common;
use common::{caller, fast_config, manager, payload, MemoryTransport, Reply};

#[tokio::test(start_paused = true)]
async fn test_window_limit_rejects_then_recovers() {
    let mut config = fast_config();
    config.rate_limit.requests_per_window = 5;
    config.rate_limit.window_ms = 1_000;
    config.rate_limit.max_queue_size = 0;
    let (manager, sink) = manager(config);
    manager.initialize(None).await.unwrap();

    let client = caller("203.0.113.7");
    for n in 0..5 {
        manager.secure_request(payload(n), &client).await.unwrap();
    }
    let err = manager.secure_request(payload(5), &client).await.unwrap_err();
    match &err {
        SecurityError::RateLimitExceeded { identifier, retry_after_ms } => {
            assert_eq!(identifier, "203.0.113.7");
            assert!(*retry_after_ms <= 1_000);
        }
        other => panic!("expected rate limit, got {:?}", other),
    }

    // Another caller is unaffected.
    manager.secure_request(payload(0), &caller("198.51.100.2")).await.unwrap();

    tokio::time::advance(Duration::from_millis(1_000)).await;
    manager.secure_request(payload(6), &client).await.unwrap();

    let metrics = manager.metrics();
    assert_eq!(metrics.total_requests, 8);
    assert_eq!(metrics.blocked_requests, 1);
    assert_eq!(metrics.rate_limit_violations, 1);

    manager.shutdown().await.unwrap();
    let rejected: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| e.event_type == SecurityEventType::RateLimitExceeded)
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].severity, Severity::Medium);
    assert_eq!(rejected[0].metadata["identifier"], "203.0.113.7");
    assert_eq!(rejected[0].metadata["error"], "rate_limit");
}

#[tokio::test(start_paused = true)]
async fn test_over_limit_request_waits_in_queue() {
    let mut config = fast_config();
    config.rate_limit.requests_per_window = 5;
    config.rate_limit.window_ms = 1_000;
    config.rate_limit.max_queue_size = 4;
    let (manager, _sink) = manager(config);
    manager.initialize(None).await.unwrap();

    let client = caller("203.0.113.7");
    for n in 0..5 {
        manager.secure_request(payload(n), &client).await.unwrap();
    }
    let started = Instant::now();
    manager.secure_request(payload(5), &client).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(1_000));
    assert_eq!(manager.metrics().blocked_requests, 0);
}

#[tokio::test]
async fn test_execute_round_trip() {
    let (manager, sink) = manager(fast_config());
    manager.initialize(None).await.unwrap();
    let transport = MemoryTransport::new(Reply::Signed).await;

    let data = manager
        .execute(json!({"action": "quote", "pair": "ETH/USDC"}), &caller("203.0.113.7"), &transport)
        .await
        .unwrap();
    assert_eq!(data["echo"]["pair"], "ETH/USDC");

    let sent = transport.sent.lock().unwrap()[0].clone();
    assert!(sent.header(AUTHORIZATION).unwrap().starts_with("Bearer hsk_"));
    assert_eq!(sent.header(KEY_ROTATION), Some("0"));
    let body = sent.body().unwrap();
    assert!(body["signature"].is_string());
    assert_eq!(body["data"]["action"], "quote");

    manager.auditor().flush().await.unwrap();
    let usage = sink
        .events()
        .into_iter()
        .find(|e| e.event_type == SecurityEventType::ApiUsage)
        .unwrap();
    assert_eq!(usage.metadata["status_code"], 200);
    assert_eq!(usage.metadata["endpoint"], "memory://hypersim/v1/simulate");
}

#[tokio::test]
async fn test_payload_is_sanitized_before_signing() {
    let (manager, _sink) = manager(fast_config());
    manager.initialize(None).await.unwrap();

    let request = manager
        .secure_request(
            json!({
                "note": "  <script>steal()</script>gm ",
                "__proto__": {"admin": true},
                "tags": ["<img src=x onerror=alert(1)>ok"],
            }),
            &caller("203.0.113.7"),
        )
        .await
        .unwrap();

    let envelope = request.envelope().unwrap();
    assert_eq!(envelope.data["note"], "gm");
    assert!(envelope.data.get("__proto__").is_none());
    assert!(!envelope.data["tags"][0].as_str().unwrap().contains("onerror"));
    manager.signer().verify_request(envelope).await.unwrap();
}

#[tokio::test]
async fn test_rotation_updates_credential_headers() {
    let (manager, sink) = manager(fast_config());
    manager.initialize(None).await.unwrap();
    let client = caller("203.0.113.7");

    let before = manager.secure_request(payload(1), &client).await.unwrap();
    let old_primary = manager.api_keys().get_current_key().await.unwrap().primary.clone();

    manager.rotate_api_keys().await.unwrap();
    let after = manager.secure_request(payload(2), &client).await.unwrap();

    assert_eq!(after.header(KEY_ROTATION), Some("1"));
    assert_ne!(before.header(AUTHORIZATION), after.header(AUTHORIZATION));
    assert!(manager.api_keys().validate_key(&old_primary).await.unwrap());

    for _ in 0..100 {
        if manager.metrics().keys_rotated == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(manager.metrics().keys_rotated, 1);

    manager.shutdown().await.unwrap();
    let rotation = sink
        .events()
        .into_iter()
        .find(|e| e.event_type == SecurityEventType::ApiKeyRotation)
        .unwrap();
    assert_eq!(rotation.metadata["rotation_count"], 1);
}

#[tokio::test]
async fn test_initial_keys_are_used() {
    let (manager, _sink) = manager(fast_config());
    manager
        .initialize(Some(hypersim_security::credentials::InitialKeys {
            primary: "hsk_supplied".into(),
            fallbacks: vec!["hsk_previous".into()],
        }))
        .await
        .unwrap();

    let request = manager.secure_request(payload(1), &caller("203.0.113.7")).await.unwrap();
    assert_eq!(request.header(AUTHORIZATION), Some("Bearer hsk_supplied"));
    assert!(manager.api_keys().validate_key("hsk_previous").await.unwrap());
}

#[tokio::test]
async fn test_unsigned_pipeline() {
    let mut config = fast_config();
    config.signing.enabled = false;
    let (manager, _sink) = manager(config);
    manager.initialize(None).await.unwrap();
    let transport = MemoryTransport::new(Reply::Unsigned).await;

    let data = manager
        .execute(payload(7), &caller("203.0.113.7"), &transport)
        .await
        .unwrap();
    assert_eq!(data["echo"]["block"], 7);
    let sent = transport.sent.lock().unwrap()[0].clone();
    assert!(sent.envelope().is_none());
    assert_eq!(sent.body().unwrap(), payload(7));
}

#[tokio::test]
async fn test_policy_findings_are_audited() {
    let mut config = fast_config();
    config.validation.block_on_policy_findings = true;
    let (manager, sink) = manager(config);
    manager.initialize(None).await.unwrap();

    let err = manager
        .secure_request(json!({"file_url": "https://cdn.hypersim.test/sim.wasm"}), &caller("203.0.113.7"))
        .await
        .unwrap_err();
    assert!(matches!(err, SecurityError::PolicyViolation(_)));

    manager.auditor().flush().await.unwrap();
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, SecurityEventType::OwaspViolation);
    assert_eq!(events[0].metadata["violations"][0]["category"], "A08:2021");
}
