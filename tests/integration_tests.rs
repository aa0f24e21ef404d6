//! Integration tests for the orchestrator
//!
//! These tests drive the full stack (manager, scheduler, retry controller,
//! credential pool, model chain) with a scripted backend and paused tokio
//! time, verifying the end-to-end failover, ordering, and rate behavior.

use cadence::chain::ModelConfig;
use cadence::config::ManagerConfig;
use cadence::events::Event;
use cadence::test_utils::{ManualClock, MockBackend};
use cadence::{AiManager, GenerateOptions, GenerationError};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

fn config_json(minute_limit: u32, min_interval_ms: u64, cooldown_ms: u64) -> String {
    format!(
        r#"{{
            "credentials": [
                {{ "secret": "sk-a", "name": "key-a", "daily_limit": 100 }},
                {{ "secret": "sk-b", "name": "key-b", "daily_limit": 100 }}
            ],
            "models": [
                {{ "name": "model-new", "version": "2.0" }},
                {{ "name": "model-old", "version": "1.0" }}
            ],
            "scheduler": {{
                "minute_request_limit": {minute_limit},
                "min_request_interval_ms": {min_interval_ms},
                "cooldown_ms": {cooldown_ms}
            }}
        }}"#
    )
}

fn manager(backend: &MockBackend, clock: &Arc<ManualClock>) -> AiManager {
    let config = ManagerConfig::from_json(&config_json(1000, 0, 0)).unwrap();
    AiManager::with_clock(config, Arc::new(backend.clone()), clock.clone()).unwrap()
}

#[tokio::test]
async fn quota_failure_fails_over_within_two_attempts() {
    let backend = MockBackend::new();
    backend.enqueue_failure(Some(429), "Quota exceeded for requests per day");
    backend.enqueue_text("from the backup key");
    let clock = Arc::new(ManualClock::default());
    let manager = manager(&backend, &clock);

    let text = manager
        .generate("hello", GenerateOptions::default())
        .await
        .unwrap();
    assert_eq!(text, "from the backup key");

    let calls = backend.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].credential, "key-a");
    assert_eq!(calls[1].credential, "key-b");

    let stats = manager.api_key_stats().await;
    assert_eq!(stats.current, "key-b");
    assert_eq!(stats.quota_exceeded, 1);
    // Only the successful attempt counted against a budget.
    assert_eq!(stats.credentials[0].used, 0);
    assert_eq!(stats.credentials[1].used, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_complete_in_submission_order() {
    let backend = MockBackend::new();
    for i in 0..4 {
        backend.enqueue_text(format!("answer-{i}"));
    }
    let clock = Arc::new(ManualClock::default());
    let manager = Arc::new(manager(&backend, &clock));

    let mut handles = Vec::new();
    for i in 0..4 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .generate(format!("prompt-{i}"), GenerateOptions::default())
                .await
        }));
        tokio::task::yield_now().await;
    }

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap(), format!("answer-{i}"));
    }

    let prompts: Vec<_> = backend.calls().into_iter().map(|c| c.prompt).collect();
    assert_eq!(prompts, vec!["prompt-0", "prompt-1", "prompt-2", "prompt-3"]);
}

#[tokio::test(start_paused = true)]
async fn minute_limit_throttles_the_third_request() {
    let backend = MockBackend::new();
    let clock = Arc::new(ManualClock::default());
    let config = ManagerConfig::from_json(&config_json(2, 0, 0)).unwrap();
    let manager = AiManager::with_clock(config, Arc::new(backend.clone()), clock).unwrap();

    let started = tokio::time::Instant::now();
    for _ in 0..2 {
        manager
            .generate("p", GenerateOptions::default())
            .await
            .unwrap();
    }
    let after_two = started.elapsed();
    assert!(after_two < Duration::from_secs(65));

    manager
        .generate("p", GenerateOptions::default())
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(65));
}

#[tokio::test(start_paused = true)]
async fn exhausted_chain_and_retries_surface_exhausted_error() {
    let backend = MockBackend::new();
    // Every attempt rejects the model; chain walks to its end and parks.
    for _ in 0..3 {
        backend.enqueue_failure(Some(404), "model is not found");
    }
    let clock = Arc::new(ManualClock::default());
    let manager = manager(&backend, &clock);
    let mut events = manager.subscribe();

    let err = manager
        .generate("p", GenerateOptions::default())
        .await
        .unwrap_err();
    match err {
        GenerationError::Exhausted {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("not found"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(manager.current_model().await.name, "model-old");

    let mut saw_fallback = false;
    let mut saw_failed = false;
    while let Ok(Some(Ok(event))) =
        tokio::time::timeout(Duration::from_millis(10), events.next()).await
    {
        match event {
            Event::ModelFallback { from, to } => {
                assert_eq!(from, "model-new");
                assert_eq!(to, "model-old");
                saw_fallback = true;
            }
            Event::GenerationFailed { retries, .. } => {
                assert_eq!(retries, 3);
                saw_failed = true;
            }
            _ => {}
        }
    }
    assert!(saw_fallback);
    assert!(saw_failed);
}

#[tokio::test(start_paused = true)]
async fn empty_responses_consume_the_whole_retry_budget() {
    let backend = MockBackend::new();
    for _ in 0..3 {
        backend.enqueue_text("   \n");
    }
    let clock = Arc::new(ManualClock::default());
    let manager = manager(&backend, &clock);

    let err = manager
        .generate("p", GenerateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GenerationError::Exhausted { attempts: 3, .. }
    ));
    assert_eq!(backend.calls().len(), 3);
}

#[tokio::test]
async fn daily_rollover_restores_a_quota_exceeded_credential() {
    let backend = MockBackend::new();
    backend.enqueue_failure(Some(429), "quota exhausted");
    backend.enqueue_text("ok");
    let clock = Arc::new(ManualClock::default());
    let manager = manager(&backend, &clock);

    manager
        .generate("p", GenerateOptions::default())
        .await
        .unwrap();
    assert_eq!(manager.api_key_stats().await.quota_exceeded, 1);

    clock.advance(chrono::Duration::days(1));
    let stats = manager.api_key_stats().await;
    assert_eq!(stats.quota_exceeded, 0);
    assert_eq!(stats.active, 2);
    // Priority order reasserts itself: key-a is usable again.
    backend.enqueue_text("back on the primary");
    let text = manager
        .generate("p", GenerateOptions::default())
        .await
        .unwrap();
    assert_eq!(text, "back on the primary");
    assert_eq!(backend.calls().last().unwrap().credential, "key-a");
}

#[tokio::test(start_paused = true)]
async fn exhausted_credentials_reject_the_next_call_instead_of_hanging() {
    let backend = MockBackend::new();
    // First call: quota wall on key-a, success on key-b.
    backend.enqueue_failure(Some(429), "Quota exceeded for requests per day");
    backend.enqueue_text("from the backup");
    // Second call: every remaining attempt hits the same wall.
    for _ in 0..3 {
        backend.enqueue_failure(Some(429), "Quota exceeded for requests per day");
    }
    let clock = Arc::new(ManualClock::default());
    let config = ManagerConfig::from_json(
        r#"{
            "credentials": [
                { "secret": "sk-a", "name": "key-a", "daily_limit": 1 },
                { "secret": "sk-b", "name": "key-b", "daily_limit": 1 }
            ],
            "models": [{ "name": "model-new", "version": "2.0" }],
            "scheduler": {
                "minute_request_limit": 1000,
                "min_request_interval_ms": 0,
                "cooldown_ms": 0
            }
        }"#,
    )
    .unwrap();
    let manager = AiManager::with_clock(config, Arc::new(backend.clone()), clock).unwrap();

    let text = manager
        .generate("one", GenerateOptions::default())
        .await
        .unwrap();
    assert_eq!(text, "from the backup");
    let stats = manager.api_key_stats().await;
    assert_eq!(stats.quota_exceeded, 1);
    assert_eq!(stats.credentials[1].used, 1);

    // Both keys are spent now. The second call must settle with Exhausted
    // after its full budget rather than wait for the daily rollover.
    let started = tokio::time::Instant::now();
    let err = manager
        .generate("two", GenerateOptions::default())
        .await
        .unwrap_err();
    match err {
        GenerationError::Exhausted {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("Quota exceeded"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // With no alternate left, attempts 1 and 2 each served a quota backoff
    // (30s then 60s) before failing over to nothing.
    assert!(started.elapsed() >= Duration::from_secs(90));
    assert_eq!(backend.calls().len(), 5);
}

#[tokio::test]
async fn per_credential_budgets_steer_traffic_without_failures() {
    let backend = MockBackend::new();
    let clock = Arc::new(ManualClock::default());
    let config = ManagerConfig::from_json(
        r#"{
            "credentials": [
                { "secret": "sk-a", "name": "key-a", "daily_limit": 1 },
                { "secret": "sk-b", "name": "key-b", "daily_limit": 1 }
            ],
            "models": [{ "name": "model-new", "version": "2.0" }],
            "scheduler": {
                "minute_request_limit": 1000,
                "min_request_interval_ms": 0,
                "cooldown_ms": 0
            }
        }"#,
    )
    .unwrap();
    let manager = AiManager::with_clock(config, Arc::new(backend.clone()), clock).unwrap();

    // No provider errors at all: the pool rotates purely on local budgets.
    manager
        .generate("one", GenerateOptions::default())
        .await
        .unwrap();
    manager
        .generate("two", GenerateOptions::default())
        .await
        .unwrap();

    let calls = backend.calls();
    assert_eq!(calls[0].credential, "key-a");
    assert_eq!(calls[1].credential, "key-b");

    let stats = manager.api_key_stats().await;
    assert_eq!(stats.credentials[0].used, 1);
    assert_eq!(stats.credentials[1].used, 1);
    assert_eq!(stats.active, 2);
}

#[tokio::test(start_paused = true)]
async fn batch_runs_in_chunks_of_two_with_one_pause() {
    let backend = MockBackend::new();
    for i in 0..3 {
        backend.enqueue_text(format!("r{i}"));
    }
    let clock = Arc::new(ManualClock::default());
    let manager = manager(&backend, &clock);

    let started = tokio::time::Instant::now();
    let results = manager
        .generate_batch(
            vec!["a".into(), "b".into(), "c".into()],
            GenerateOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(results, vec!["r0", "r1", "r2"]);
    // Two chunks (2 + 1) means exactly one 120s pause.
    assert_eq!(started.elapsed(), Duration::from_secs(120));
}

#[tokio::test]
async fn operator_surface_manages_keys_and_models() {
    let backend = MockBackend::new();
    let clock = Arc::new(ManualClock::default());
    let manager = manager(&backend, &clock);

    manager.add_api_key("sk-c", "key-c", 50).await.unwrap();
    assert_eq!(manager.api_key_stats().await.total, 3);

    manager.switch_to_api_key("key-c").await.unwrap();
    assert_eq!(manager.api_key_stats().await.current, "key-c");

    manager.remove_api_key("key-b").await.unwrap();
    assert_eq!(manager.api_key_stats().await.total, 2);

    // Migrating to an unknown model is refused; to a probed one it works.
    assert!(!manager.migrate_to_model("model-unknown").await);
    backend.enqueue_text("pong");
    assert!(manager.migrate_to_model("model-old").await);
    let stats = manager.model_stats().await;
    assert_eq!(stats.chain.current.name, "model-old");
    assert!(!stats.chain.is_latest);

    // And back up via the probe path.
    backend.enqueue_text("pong");
    assert!(manager.check_for_newer_versions().await);
    assert!(manager.model_stats().await.chain.is_latest);
}

#[tokio::test(start_paused = true)]
async fn invalid_request_shrinks_parameters_and_recovers() {
    let backend = MockBackend::new();
    backend.enqueue_failure(Some(400), "Invalid JSON payload received");
    backend.enqueue_text("recovered");
    let clock = Arc::new(ManualClock::default());
    let config = ManagerConfig::from_json(
        r#"{
            "credentials": [{ "secret": "sk-a", "name": "key-a" }],
            "models": [{ "name": "model-new", "version": "2.0", "temperature": 0.4 }],
            "scheduler": {
                "minute_request_limit": 1000,
                "min_request_interval_ms": 0,
                "cooldown_ms": 0
            }
        }"#,
    )
    .unwrap();
    let manager = AiManager::with_clock(config, Arc::new(backend.clone()), clock).unwrap();

    manager
        .generate("p", GenerateOptions::default())
        .await
        .unwrap();

    let model: ModelConfig = manager.current_model().await;
    assert!((model.temperature - 0.3).abs() < 1e-9);
    assert_eq!(model.max_output_tokens, 3072);
}
