//! Cross-component scenarios for the execution substrate: rate limiter
//! boundaries, breaker recovery, pool capacity, and the retry
//! composition rules.

use lexideck::breaker::{BreakDurationGenerator, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use lexideck::database::{ConnectionPool, DatabaseConfig, DatabaseError};
use lexideck::error::{ErrorKind, PipelineError};
use lexideck::ratelimit::{RateLimiterConfig, ShardedRateLimiter};
use lexideck::retry::{RetryCoordinator, RetryPolicy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn scenario_burst_bounded_then_refill() {
    // 60 tokens/minute over 2 shards with a burst of 5
    let limiter = ShardedRateLimiter::new(RateLimiterConfig {
        rate: 60,
        period: Duration::from_secs(60),
        shards: Some(2),
        burst: Some(5),
        ..Default::default()
    });

    let mut allowed = 0;
    for _ in 0..10 {
        if limiter.try_acquire("k", 1).allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 5);

    // Refill runs at half a token per second per shard; wait for a full
    // token to accumulate on each shard
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert!(limiter.try_acquire("k", 1).allowed);
    assert!(limiter.try_acquire("k", 1).allowed);
    assert!(!limiter.try_acquire("k", 1).allowed);
}

#[tokio::test]
async fn scenario_single_token_per_minute_reservation() {
    let limiter = ShardedRateLimiter::new(RateLimiterConfig {
        rate: 1,
        period: Duration::from_secs(60),
        shards: Some(1),
        burst: Some(1),
        ..Default::default()
    });

    assert!(limiter.try_acquire("k", 1).allowed);
    assert!(!limiter.try_acquire("k", 1).allowed);

    // A reservation lands roughly one period out
    let reservation = limiter.reserve("k", 1, Duration::from_secs(120)).unwrap();
    let wait = reservation.ready_in(Instant::now());
    assert!(wait > Duration::from_secs(55) && wait <= Duration::from_secs(61));
}

#[tokio::test]
async fn scenario_breaker_open_probe_reopen() {
    let breaker = CircuitBreaker::new(
        "downstream",
        CircuitBreakerConfig {
            failure_threshold: 0.5,
            min_throughput: 2,
            sampling_duration: Duration::from_secs(60),
            break_duration: Duration::from_millis(300),
            break_duration_generator: BreakDurationGenerator::Exponential,
            min_break: Duration::from_millis(10),
            max_break: Duration::from_secs(30),
        },
    );

    let fail = || async {
        Err::<u32, _>(PipelineError::transient(
            ErrorKind::ApiServerError,
            "downstream failure",
            "test",
        ))
    };

    breaker.call(fail).await.unwrap_err();
    breaker.call(fail).await.unwrap_err();
    assert_eq!(breaker.state(), CircuitState::Open);

    // Inside the break: fail fast with the recovery hint
    let refused = breaker.call(|| async { Ok(1u32) }).await.unwrap_err();
    assert_eq!(refused.kind, ErrorKind::CircuitOpen);
    assert!(refused.retry_after.unwrap() <= Duration::from_millis(300));

    // Past the break: the probe fails and the break grows by 1.5x
    tokio::time::sleep(Duration::from_millis(350)).await;
    breaker.call(fail).await.unwrap_err();
    assert_eq!(breaker.state(), CircuitState::Open);
    let second_break = breaker.stats().recovery_in.unwrap();
    assert!(second_break > Duration::from_millis(320), "break {:?}", second_break);

    // Wait out the longer break; a successful probe closes the breaker
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(breaker.call(|| async { Ok(7u32) }).await.unwrap(), 7);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn scenario_pool_capacity_and_handoff() {
    let pool = ConnectionPool::new(DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        min_connections: 2,
        max_connections: 5,
        acquire_timeout: Duration::from_millis(200),
        enable_wal: false,
        ..Default::default()
    })
    .await
    .unwrap();

    let mut held = Vec::new();
    for _ in 0..5 {
        held.push(pool.acquire().await.unwrap());
    }
    assert_eq!(pool.size(), 5);

    let started = Instant::now();
    let err = pool.acquire().await.unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(matches!(err, DatabaseError::PoolTimeout { .. }));

    // A released connection reaches the next waiter promptly
    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move {
        let started = Instant::now();
        let guard = waiter_pool.acquire().await;
        (started.elapsed(), guard.is_ok())
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    drop(held.pop());

    let (waited, acquired) = waiter.await.unwrap();
    assert!(acquired);
    assert!(waited < Duration::from_millis(150), "waited {:?}", waited);
}

#[tokio::test]
async fn scenario_retry_respects_breaker_refusals() {
    // An open breaker refuses immediately; the default retry predicate
    // must not spin on it
    let breaker = Arc::new(CircuitBreaker::new(
        "downstream",
        CircuitBreakerConfig {
            failure_threshold: 0.5,
            min_throughput: 1,
            break_duration: Duration::from_secs(30),
            break_duration_generator: BreakDurationGenerator::Fixed,
            ..Default::default()
        },
    ));

    breaker
        .call(|| async {
            Err::<u32, _>(PipelineError::transient(
                ErrorKind::ApiServerError,
                "boom",
                "test",
            ))
        })
        .await
        .unwrap_err();
    assert_eq!(breaker.state(), CircuitState::Open);

    let coordinator = RetryCoordinator::new(RetryPolicy {
        max_attempts: 5,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        exponential_base: 2.0,
        jitter_fraction: 0.0,
    });

    let calls = AtomicU32::new(0);
    let breaker_for_retry = breaker.clone();
    let started = Instant::now();
    let err = coordinator
        .retry(|| {
            let breaker = breaker_for_retry.clone();
            calls.fetch_add(1, Ordering::SeqCst);
            async move { breaker.call(|| async { Ok(1u32) }).await }
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::CircuitOpen);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn scenario_rate_hint_floors_retry_backoff() {
    let coordinator = RetryCoordinator::new(RetryPolicy {
        max_attempts: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_secs(5),
        exponential_base: 2.0,
        jitter_fraction: 0.0,
    });

    let calls = AtomicU32::new(0);
    let started = Instant::now();
    coordinator
        .retry(|| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(PipelineError::transient(
                        ErrorKind::RateLimited,
                        "throttled upstream",
                        "test",
                    )
                    .with_retry_after(Duration::from_millis(120)))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

    // The 1 ms backoff was floored by the 120 ms hint
    assert!(started.elapsed() >= Duration::from_millis(120));
}
