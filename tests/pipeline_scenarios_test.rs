//! End-to-end pipeline scenarios against a scripted LLM service.

use async_trait::async_trait;
use lexideck::breaker::CircuitBreakerConfig;
use lexideck::cache::CacheConfig;
use lexideck::database::DatabaseConfig;
use lexideck::error::{ErrorKind, PipelineError, Result as PipelineResult};
use lexideck::llm::{LlmResponse, LlmService, Stage};
use lexideck::models::{ProcessingOutcome, TokenUsage, VocabularyItem};
use lexideck::pipeline::{CancellationToken, Orchestrator, PipelineContext, PipelineSettings};
use lexideck::ratelimit::RateLimiterConfig;
use lexideck::retry::RetryPolicy;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Scripted LLM: fixed per-stage delay, optional leading failures
struct MockLlm {
    delay: Duration,
    stage1_calls: AtomicUsize,
    stage2_calls: AtomicUsize,
    fail_first: AtomicUsize,
}

impl MockLlm {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            stage1_calls: AtomicUsize::new(0),
            stage2_calls: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(0),
        }
    }

    fn failing_first(delay: Duration, failures: usize) -> Self {
        let mock = Self::new(delay);
        mock.fail_first.store(failures, Ordering::SeqCst);
        mock
    }

    fn stage1_count(&self) -> usize {
        self.stage1_calls.load(Ordering::SeqCst)
    }

    fn stage2_count(&self) -> usize {
        self.stage2_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmService for MockLlm {
    async fn call(&self, stage: Stage, payload: &str) -> PipelineResult<LlmResponse> {
        match stage {
            Stage::One => self.stage1_calls.fetch_add(1, Ordering::SeqCst),
            Stage::Two => self.stage2_calls.fetch_add(1, Ordering::SeqCst),
        };

        tokio::time::sleep(self.delay).await;

        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::transient(
                ErrorKind::ApiServerError,
                "scripted transient failure",
                "mock",
            ));
        }

        let content = match stage {
            Stage::One => format!("analysis of: {}", payload.lines().nth(1).unwrap_or("")),
            Stage::Two => {
                "position\tterm\tterm_number\ttab_name\tprimer\tfront\tback\ttags\thonorific\n\
                 1\tterm\t1\tScene\tprimer\tfront\tback\ttags\tcasual"
                    .to_string()
            }
        };

        Ok(LlmResponse {
            content,
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            request_id: uuid::Uuid::new_v4().to_string(),
        })
    }
}

async fn build_context(
    dir: &TempDir,
    llm: Arc<dyn LlmService>,
    concurrency: usize,
    retry: RetryPolicy,
) -> Arc<PipelineContext> {
    let db_path = dir.path().join("pipeline.db");
    PipelineContext::build(
        llm,
        RateLimiterConfig {
            rate: 10_000,
            period: Duration::from_secs(1),
            shards: Some(1),
            burst: Some(10_000),
            ..Default::default()
        },
        CircuitBreakerConfig {
            min_throughput: 1_000,
            ..Default::default()
        },
        retry,
        CacheConfig {
            enable_l2: false,
            ..Default::default()
        },
        DatabaseConfig {
            url: format!("sqlite://{}", db_path.display()),
            min_connections: 1,
            max_connections: 4,
            enable_wal: false,
            ..Default::default()
        },
        PipelineSettings {
            concurrency,
            ..Default::default()
        },
    )
    .await
    .unwrap()
}

fn items(terms: &[&str]) -> Vec<VocabularyItem> {
    terms
        .iter()
        .enumerate()
        .map(|(index, term)| VocabularyItem::new(index + 1, *term, "noun"))
        .collect()
}

fn no_jitter_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_secs(1),
        exponential_base: 2.0,
        jitter_fraction: 0.0,
    }
}

#[tokio::test]
async fn scenario_ordered_results_under_bounded_concurrency() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(MockLlm::new(Duration::from_millis(100)));
    let ctx = build_context(&dir, llm.clone(), 2, no_jitter_retry()).await;
    let orchestrator = Orchestrator::new(ctx);

    let start = Instant::now();
    let report = orchestrator
        .process_batch(
            items(&["하나", "둘", "셋", "넷", "다섯"]),
            CancellationToken::new(),
            Vec::new(),
        )
        .await
        .unwrap();
    let elapsed = start.elapsed();

    // Five items, two 100 ms stages each, two workers
    assert!(elapsed >= Duration::from_millis(500), "elapsed {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(900), "elapsed {:?}", elapsed);

    let positions: Vec<usize> = report.results.iter().map(|r| r.position).collect();
    assert_eq!(positions, vec![1, 2, 3, 4, 5]);
    assert_eq!(report.succeeded, 5);
    assert_eq!(report.failed, 0);
    assert_eq!(llm.stage1_count(), 5);
    assert_eq!(llm.stage2_count(), 5);
    assert!(report.tokens.total() > 0);
}

#[tokio::test]
async fn scenario_identical_items_share_one_computation() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(MockLlm::new(Duration::from_millis(50)));
    let ctx = build_context(&dir, llm.clone(), 20, no_jitter_retry()).await;
    let cache = ctx.cache.clone();
    let orchestrator = Orchestrator::new(ctx);

    let batch: Vec<VocabularyItem> = (1..=10)
        .map(|position| VocabularyItem::new(position, "사과", "noun"))
        .collect();

    let report = orchestrator
        .process_batch(batch, CancellationToken::new(), Vec::new())
        .await
        .unwrap();

    // One stage-1 call serves all ten identical items
    assert_eq!(llm.stage1_count(), 1);
    assert_eq!(llm.stage2_count(), 1);
    assert_eq!(report.succeeded, 10);
    // At most one worker per stage computed; the rest observed it
    assert!(report.cached >= 8, "cached {}", report.cached);

    // All ten results carry the same flashcards
    let first = report.results[0].outcome.flashcards().unwrap().to_vec();
    for result in &report.results {
        assert_eq!(result.outcome.flashcards().unwrap(), first.as_slice());
    }
    assert!(cache.stats().hits >= 9);
}

#[tokio::test]
async fn scenario_transient_failures_recovered_by_retry() {
    let dir = TempDir::new().unwrap();
    // Two scripted failures, then success; three attempts allowed
    let llm = Arc::new(MockLlm::failing_first(Duration::from_millis(5), 2));
    let ctx = build_context(&dir, llm.clone(), 1, no_jitter_retry()).await;
    let orchestrator = Orchestrator::new(ctx);

    let start = Instant::now();
    let report = orchestrator
        .process_batch(items(&["하나"]), CancellationToken::new(), Vec::new())
        .await
        .unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);
    // Backoff slept at least 10 + 20 ms between the three attempts
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert_eq!(llm.stage1_count(), 3);
}

#[tokio::test]
async fn scenario_exhausted_retries_fail_the_item_only() {
    let dir = TempDir::new().unwrap();
    // More failures than the retry budget: stage 1 never succeeds for
    // the first item processed, then recovers for the rest
    let llm = Arc::new(MockLlm::failing_first(Duration::from_millis(5), 3));
    let ctx = build_context(&dir, llm.clone(), 1, no_jitter_retry()).await;
    let orchestrator = Orchestrator::new(ctx);

    let report = orchestrator
        .process_batch(items(&["하나", "둘"]), CancellationToken::new(), Vec::new())
        .await
        .unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 1);

    let failed_kinds: Vec<ErrorKind> = report
        .results
        .iter()
        .filter_map(|result| match &result.outcome {
            ProcessingOutcome::Failed(record) => Some(record.kind),
            _ => None,
        })
        .collect();
    assert_eq!(failed_kinds, vec![ErrorKind::RetryExhausted]);
    assert_eq!(report.exit_code(), 2);
}

#[tokio::test]
async fn scenario_cancellation_emits_partial_results() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(MockLlm::new(Duration::from_millis(150)));
    let ctx = build_context(&dir, llm.clone(), 1, no_jitter_retry()).await;
    let orchestrator = Orchestrator::new(ctx);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let report = orchestrator
        .process_batch(items(&["하나", "둘", "셋", "넷"]), cancel, Vec::new())
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.exit_code(), 130);
    // Every position still emits, later ones as cancelled failures
    assert_eq!(report.results.len(), 4);
    let cancelled = report
        .results
        .iter()
        .filter(|r| match &r.outcome {
            ProcessingOutcome::Failed(record) => record.kind == ErrorKind::Cancelled,
            _ => false,
        })
        .count();
    assert!(cancelled >= 1);
}

#[tokio::test]
async fn scenario_artifacts_persisted_to_store() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(MockLlm::new(Duration::from_millis(5)));
    let ctx = build_context(&dir, llm.clone(), 4, no_jitter_retry()).await;
    let executor = ctx.executor.clone();
    let orchestrator = Orchestrator::new(ctx);

    orchestrator
        .process_batch(items(&["하나", "둘", "셋"]), CancellationToken::new(), Vec::new())
        .await
        .unwrap();

    let vocabulary = executor
        .execute("SELECT COUNT(*) AS n FROM vocabulary", &[])
        .await
        .unwrap();
    assert_eq!(vocabulary.rows[0]["n"].as_integer(), Some(3));

    // Two stage rows and two usage rows per fresh item
    let stages = executor
        .execute("SELECT COUNT(*) AS n FROM stage_output", &[])
        .await
        .unwrap();
    assert_eq!(stages.rows[0]["n"].as_integer(), Some(6));

    let usage = executor
        .execute(
            "SELECT COALESCE(SUM(input_tokens + output_tokens), 0) AS n FROM api_usage",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(usage.rows[0]["n"].as_integer(), Some(6 * 150));

    let cards = executor
        .execute("SELECT COUNT(*) AS n FROM flashcards", &[])
        .await
        .unwrap();
    assert_eq!(cards.rows[0]["n"].as_integer(), Some(3));
}
