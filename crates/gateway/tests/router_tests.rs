mod common;

use common::{policy, router, transient, ScriptedAdapter, Step};
use futures::StreamExt;
use gateway::{
    CancellationToken, GatewayError, GenerateRequest, ProviderAdapter, ProviderError, ProviderKind,
    RetryPolicy,
};
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test]
async fn test_primary_success_never_touches_fallback() {
    let openai = ScriptedAdapter::new(ProviderKind::OpenAi, vec![Step::Reply("from openai")]);
    let claude = ScriptedAdapter::new(ProviderKind::Claude, vec![]);
    let router = router(
        &[openai.clone(), claude.clone()],
        policy(ProviderKind::OpenAi, vec![ProviderKind::Claude]),
    );

    let response = router.dispatch(&GenerateRequest::new("hello")).await.unwrap();

    assert_eq!(response.provider, ProviderKind::OpenAi);
    assert_eq!(response.content, "from openai");
    assert_eq!(openai.calls(), 1);
    assert_eq!(claude.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_back_off_exponentially_then_succeed() {
    let openai = ScriptedAdapter::new(
        ProviderKind::OpenAi,
        vec![
            Step::Fail(transient(ProviderKind::OpenAi, "HTTP 503: busy")),
            Step::Fail(transient(ProviderKind::OpenAi, "HTTP 503: busy")),
            Step::Reply("third time lucky"),
        ],
    );
    let claude = ScriptedAdapter::new(ProviderKind::Claude, vec![]);
    let router = router(
        &[openai.clone(), claude.clone()],
        policy(ProviderKind::OpenAi, vec![ProviderKind::Claude]),
    );

    let started = Instant::now();
    let response = router.dispatch(&GenerateRequest::new("hello")).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.content, "third time lucky");
    assert_eq!(openai.calls(), 3);
    assert_eq!(claude.calls(), 0);
    // 1s after the first failure, 2s after the second
    assert!(elapsed >= Duration::from_secs(3), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3100), "elapsed {:?}", elapsed);

    let stats = router.provider_stats();
    let openai_stats = &stats[&ProviderKind::OpenAi];
    assert_eq!(openai_stats.total_requests, 3);
    assert_eq!(openai_stats.failed_requests, 2);
    assert_eq!(openai_stats.successful_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_primary_falls_back_to_next_candidate() {
    let openai = ScriptedAdapter::always_failing(ProviderKind::OpenAi);
    let claude = ScriptedAdapter::new(ProviderKind::Claude, vec![Step::Reply("from claude")]);
    let router = router(
        &[openai.clone(), claude.clone()],
        policy(ProviderKind::OpenAi, vec![ProviderKind::Claude]),
    );

    let response = router.dispatch(&GenerateRequest::new("hello")).await.unwrap();

    assert_eq!(response.provider, ProviderKind::Claude);
    assert_eq!(response.model, ProviderKind::Claude.default_model_config().model);
    assert_eq!(openai.calls(), 3);
    assert_eq!(claude.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_all_failed_carries_last_error() {
    let openai = ScriptedAdapter::always_failing(ProviderKind::OpenAi);
    let claude = ScriptedAdapter::with_fallback(
        ProviderKind::Claude,
        vec![],
        Step::Fail(transient(ProviderKind::Claude, "HTTP 502: claude gateway down")),
    );
    let router = router(
        &[openai.clone(), claude.clone()],
        policy(ProviderKind::OpenAi, vec![ProviderKind::Claude]),
    );

    let err = router.dispatch(&GenerateRequest::new("hello")).await.unwrap_err();

    match &err {
        GatewayError::AllProvidersFailed { last_error, .. } => {
            assert!(matches!(
                **last_error,
                ProviderError::Transient {
                    provider: ProviderKind::Claude,
                    ..
                }
            ));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(err.to_string().contains("claude gateway down"));
    assert_eq!(openai.calls(), 3);
    assert_eq!(claude.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_fallback_entries_are_not_revisited() {
    let openai = ScriptedAdapter::always_failing(ProviderKind::OpenAi);
    let claude = ScriptedAdapter::new(ProviderKind::Claude, vec![]);
    let router = router(
        &[openai.clone(), claude.clone()],
        policy(
            ProviderKind::OpenAi,
            vec![ProviderKind::OpenAi, ProviderKind::Claude, ProviderKind::OpenAi],
        ),
    );

    router.dispatch(&GenerateRequest::new("hello")).await.unwrap();

    assert_eq!(openai.calls(), 3);
    assert_eq!(claude.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_cancels_the_upstream_call() {
    let openai = ScriptedAdapter::with_fallback(ProviderKind::OpenAi, vec![], Step::Hang);
    let claude = ScriptedAdapter::new(ProviderKind::Claude, vec![]);
    let routing = policy(ProviderKind::OpenAi, vec![ProviderKind::Claude])
        .with_timeout(Duration::from_secs(5))
        .with_retry(RetryPolicy::new(1, Duration::from_secs(1)));
    let router = router(&[openai.clone(), claude.clone()], routing);

    let started = Instant::now();
    let response = router.dispatch(&GenerateRequest::new("hello")).await.unwrap();

    assert_eq!(response.provider, ProviderKind::Claude);
    assert!(started.elapsed() >= Duration::from_secs(5));

    let hung = openai.tokens();
    assert_eq!(hung.len(), 1);
    assert!(hung[0].is_cancelled());
    assert!(!claude.tokens()[0].is_cancelled());

    let stats = router.provider_stats();
    assert!(stats[&ProviderKind::OpenAi]
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_are_retried_like_transient_failures() {
    let openai = ScriptedAdapter::new(ProviderKind::OpenAi, vec![Step::Hang, Step::Reply("recovered")]);
    let routing = policy(ProviderKind::OpenAi, vec![]).with_timeout(Duration::from_secs(2));
    let router = router(&[openai.clone()], routing);

    let response = router.dispatch(&GenerateRequest::new("hello")).await.unwrap();

    assert_eq!(response.content, "recovered");
    assert_eq!(openai.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_caller_cancellation_aborts_without_fallback() {
    let openai = ScriptedAdapter::with_fallback(ProviderKind::OpenAi, vec![], Step::Hang);
    let claude = ScriptedAdapter::new(ProviderKind::Claude, vec![]);
    let router = router(
        &[openai.clone(), claude.clone()],
        policy(ProviderKind::OpenAi, vec![ProviderKind::Claude]),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = router
        .dispatch(&GenerateRequest::new("hello").with_cancel(cancel))
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Cancelled));
    assert!(started.elapsed() < RetryPolicy::default().max_backoff);
    assert!(openai.tokens()[0].is_cancelled());
    assert_eq!(claude.calls(), 0);
}

#[tokio::test]
async fn test_pre_cancelled_request_never_reaches_a_provider() {
    let openai = ScriptedAdapter::new(ProviderKind::OpenAi, vec![]);
    let router = router(&[openai.clone()], policy(ProviderKind::OpenAi, vec![]));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = router
        .dispatch(&GenerateRequest::new("hello").with_cancel(cancel))
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Cancelled));
    assert_eq!(openai.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_backoff_stops_retrying() {
    let openai = ScriptedAdapter::always_failing(ProviderKind::OpenAi);
    let routing = policy(ProviderKind::OpenAi, vec![])
        .with_retry(RetryPolicy::new(3, Duration::from_secs(10)));
    let router = router(&[openai.clone()], routing);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let err = router
        .dispatch(&GenerateRequest::new("hello").with_cancel(cancel))
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Cancelled));
    assert_eq!(openai.calls(), 1);
}

#[tokio::test]
async fn test_auth_failure_is_not_retried_but_falls_back() {
    let openai = ScriptedAdapter::new(
        ProviderKind::OpenAi,
        vec![Step::Fail(ProviderError::Auth {
            provider: ProviderKind::OpenAi,
            message: "HTTP 401: bad key".to_string(),
        })],
    );
    let claude = ScriptedAdapter::new(ProviderKind::Claude, vec![Step::Reply("from claude")]);
    let router = router(
        &[openai.clone(), claude.clone()],
        policy(ProviderKind::OpenAi, vec![ProviderKind::Claude]),
    );

    let response = router.dispatch(&GenerateRequest::new("hello")).await.unwrap();

    assert_eq!(response.provider, ProviderKind::Claude);
    assert_eq!(openai.calls(), 1);
    assert!(!openai.health().healthy);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_hint_stretches_the_backoff() {
    let openai = ScriptedAdapter::new(
        ProviderKind::OpenAi,
        vec![
            Step::Fail(ProviderError::RateLimited {
                provider: ProviderKind::OpenAi,
                message: "HTTP 429: slow down".to_string(),
                retry_after: Some(Duration::from_secs(7)),
            }),
            Step::Reply("after the wait"),
        ],
    );
    let router = router(&[openai.clone()], policy(ProviderKind::OpenAi, vec![]));

    let started = Instant::now();
    router.dispatch(&GenerateRequest::new("hello")).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(7));
    assert_eq!(openai.calls(), 2);
}

#[tokio::test]
async fn test_blank_prompt_fails_validation_on_every_candidate() {
    let openai = ScriptedAdapter::new(ProviderKind::OpenAi, vec![]);
    let claude = ScriptedAdapter::new(ProviderKind::Claude, vec![]);
    let router = router(
        &[openai.clone(), claude.clone()],
        policy(ProviderKind::OpenAi, vec![ProviderKind::Claude]),
    );

    let err = router.dispatch(&GenerateRequest::new("   ")).await.unwrap_err();

    assert!(matches!(err, GatewayError::Validation(_)), "unexpected error: {:?}", err);
    assert!(!err.counts_toward_circuit());
    // Validation is never retried
    assert_eq!(openai.calls(), 1);
    assert_eq!(claude.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejection_followed_by_outage_reports_the_outage() {
    let openai = ScriptedAdapter::new(
        ProviderKind::OpenAi,
        vec![Step::Fail(ProviderError::Validation("openai rejected request: HTTP 400".to_string()))],
    );
    let claude = ScriptedAdapter::always_failing(ProviderKind::Claude);
    let router = router(
        &[openai.clone(), claude.clone()],
        policy(ProviderKind::OpenAi, vec![ProviderKind::Claude]),
    );

    let err = router.dispatch(&GenerateRequest::new("hello")).await.unwrap_err();

    match &err {
        GatewayError::AllProvidersFailed { last_error, .. } => {
            assert!(matches!(**last_error, ProviderError::Transient { .. }));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(err.counts_toward_circuit());
}

#[tokio::test(start_paused = true)]
async fn test_status_report_summarises_attempts() {
    let openai = ScriptedAdapter::new(
        ProviderKind::OpenAi,
        vec![
            Step::Fail(transient(ProviderKind::OpenAi, "HTTP 503: busy")),
            Step::Reply("ok"),
        ],
    );
    let claude = ScriptedAdapter::new(ProviderKind::Claude, vec![]);
    let router = router(
        &[openai.clone(), claude.clone()],
        policy(ProviderKind::OpenAi, vec![ProviderKind::Claude]),
    );

    router.dispatch(&GenerateRequest::new("hello")).await.unwrap();
    let report = router.status_report();

    assert!(report.starts_with("📊 Provider status:"));
    assert!(report.contains("openai ["), "{}", report);
    assert!(report.contains("2 requests, 50.0% success"), "{}", report);
    assert!(report.contains("claude [healthy]: 0 requests"), "{}", report);
}

#[tokio::test(start_paused = true)]
async fn test_stream_dispatch_falls_back_and_emits_cumulative_chunks() {
    let openai = ScriptedAdapter::always_failing(ProviderKind::OpenAi);
    let claude = ScriptedAdapter::new(ProviderKind::Claude, vec![Step::Reply("streamed from claude")]);
    let router = router(
        &[openai.clone(), claude.clone()],
        policy(ProviderKind::OpenAi, vec![ProviderKind::Claude]),
    );

    let (provider, stream) = router
        .dispatch_stream(&GenerateRequest::new("hello").streaming())
        .await
        .unwrap();
    let chunks: Vec<_> = stream.collect().await;

    assert_eq!(provider, ProviderKind::Claude);
    assert_eq!(openai.calls(), 3);

    let chunks: Vec<_> = chunks.into_iter().map(|c| c.unwrap()).collect();
    let last = chunks.last().unwrap();
    assert!(last.done);
    assert_eq!(last.content, "streamed from claude");
    assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
    assert_eq!(chunks[0].delta, "streamed ");
}
