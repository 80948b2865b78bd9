//! # Batch Orchestrator
//!
//! Runs the two-stage composition per item under bounded concurrency:
//! cache lookup, token acquisition, breaker-and-retry-wrapped external
//! call, cache store. Stage outputs and API usage stream to the
//! relational store as they land; flashcards are persisted by the
//! ordered consumer so writes follow emission order.

use crate::cache::CacheService;
use crate::database::TransactionScope;
use crate::error::{ErrorCategory, ErrorKind, PipelineError};
use crate::llm::{self, LlmResponse, Stage};
use crate::models::{
    Flashcard, ProcessingOutcome, ProcessingResult, StageTimings, TokenUsage, VocabularyItem,
};
use crate::pipeline::collector::OrderedCollector;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::progress::{ProgressCallback, ProgressReporter};
use crate::pipeline::{BatchReport, CancellationToken};
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Bounded-concurrency pipeline orchestrator
pub struct Orchestrator {
    ctx: Arc<PipelineContext>,
}

impl Orchestrator {
    /// Create an orchestrator over a built context
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    /// The shared context
    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Process a batch, emitting results in input order
    pub async fn process_batch(
        &self,
        items: Vec<VocabularyItem>,
        cancel: CancellationToken,
        progress_callbacks: Vec<ProgressCallback>,
    ) -> crate::error::Result<BatchReport> {
        let started = Instant::now();
        let total = items.len();

        if total == 0 {
            return Ok(Self::empty_report());
        }
        Self::validate_positions(&items)?;
        self.enforce_quota().await?;
        self.upsert_vocabulary(&items).await;

        let progress = Arc::new(ProgressReporter::new(
            total,
            self.ctx.settings.progress_interval,
        ));
        for callback in progress_callbacks {
            progress.subscribe(callback);
        }

        let (collector, mut ordered_rx) = OrderedCollector::new(total);
        let collector = Arc::new(collector);
        let semaphore = Arc::new(Semaphore::new(self.ctx.settings.concurrency.max(1)));
        let drain = Arc::new(AtomicBool::new(false));
        let batch_tag = format!("batch:{}", Utc::now().format("%Y%m%dT%H%M%S"));

        // Ordered consumer: persists flashcards as results emit
        let consumer = {
            let executor = self.ctx.executor.clone();
            tokio::spawn(async move {
                let mut ordered = Vec::with_capacity(total);
                while let Some(result) = ordered_rx.recv().await {
                    if let Some(cards) = result.outcome.flashcards() {
                        persist_flashcards(&executor, cards).await;
                    }
                    ordered.push(result);
                }
                ordered
            })
        };

        let mut workers = Vec::with_capacity(total);
        for item in items {
            let ctx = self.ctx.clone();
            let cancel = cancel.clone();
            let drain = drain.clone();
            let collector = collector.clone();
            let progress = progress.clone();
            let semaphore = semaphore.clone();
            let batch_tag = batch_tag.clone();

            workers.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("batch semaphore never closes");
                progress.record_started();

                let result = if cancel.is_cancelled() {
                    refusal_result(&item, ErrorKind::Cancelled, "batch cancelled", &ctx)
                } else if drain.load(Ordering::Acquire) {
                    refusal_result(
                        &item,
                        ErrorKind::ResourceExhausted,
                        "drain mode: batch is shedding remaining items",
                        &ctx,
                    )
                } else {
                    match process_item(&ctx, &item, &cancel, &batch_tag).await {
                        Ok(result) => result,
                        Err(error) => {
                            if error.category == ErrorCategory::System {
                                drain.store(true, Ordering::Release);
                                log::error!(
                                    "system failure at position {}; entering drain mode",
                                    item.position
                                );
                            }
                            let record = ctx.errors.collect(
                                &error.with_context("position", item.position.to_string()),
                            );
                            ProcessingResult::failed(item.position, item.term.clone(), record)
                        }
                    }
                };

                let failed = !result.outcome.is_success();
                progress.record_completed(failed, result.from_cache);
                collector.deposit(result);
            }));
        }

        for worker in workers {
            if let Err(join_error) = worker.await {
                log::error!("worker panicked: {}", join_error);
            }
        }
        if cancel.is_cancelled() {
            collector.finish_cancelled();
        }
        drop(collector);

        let results = consumer.await.unwrap_or_default();
        progress.final_tick();

        self.flush_error_records().await;
        if self.ctx.settings.mirror_cache_metadata {
            self.mirror_cache_metadata().await;
        }
        self.audit_rate_limiter().await;

        Ok(self.build_report(
            results,
            started.elapsed(),
            cancel.is_cancelled(),
            drain.load(Ordering::Acquire),
        ))
    }

    fn empty_report() -> BatchReport {
        BatchReport {
            results: Vec::new(),
            succeeded: 0,
            cached: 0,
            failed: 0,
            failures_by_category: HashMap::new(),
            failure_fingerprints: Vec::new(),
            tokens: TokenUsage::default(),
            estimated_cost: 0.0,
            elapsed: Duration::ZERO,
            cancelled: false,
            drained: false,
        }
    }

    /// Positions must be exactly `1..=N`, each once
    fn validate_positions(items: &[VocabularyItem]) -> crate::error::Result<()> {
        let mut seen = vec![false; items.len()];
        for item in items {
            item.validate().map_err(|message| {
                PipelineError::permanent(ErrorKind::Validation, message, "pipeline")
                    .with_context("position", item.position.to_string())
            })?;
            let index = item.position - 1;
            if index >= seen.len() || seen[index] {
                return Err(PipelineError::permanent(
                    ErrorKind::Validation,
                    format!("positions must cover 1..={} exactly once", items.len()),
                    "pipeline",
                ));
            }
            seen[index] = true;
        }
        Ok(())
    }

    /// Refuse the batch when the daily token budget is spent
    async fn enforce_quota(&self) -> crate::error::Result<()> {
        let budget = self.ctx.settings.daily_token_budget;
        if budget == 0 {
            return Ok(());
        }

        let midnight = format!("{}T00:00:00", Utc::now().format("%Y-%m-%d"));
        let result = self
            .ctx
            .executor
            .execute(
                "SELECT COALESCE(SUM(input_tokens + output_tokens), 0) AS used
                 FROM api_usage WHERE created_at >= ?",
                &[midnight.into()],
            )
            .await?;

        let used = result
            .rows
            .first()
            .and_then(|row| row.get("used"))
            .and_then(crate::database::SqlValue::as_integer)
            .unwrap_or(0) as u64;

        if used >= budget {
            return Err(PipelineError::business(
                ErrorKind::QuotaExceeded,
                format!("daily token budget exhausted ({} of {})", used, budget),
                "pipeline",
            ));
        }
        Ok(())
    }

    async fn upsert_vocabulary(&self, items: &[VocabularyItem]) {
        let created = Utc::now().to_rfc3339();
        let params: Vec<Vec<crate::database::SqlValue>> = items
            .iter()
            .map(|item| {
                vec![
                    item.position.into(),
                    item.term.clone().into(),
                    item.item_type.clone().into(),
                    created.clone().into(),
                ]
            })
            .collect();

        if let Err(error) = self
            .ctx
            .executor
            .execute_many(
                "INSERT OR REPLACE INTO vocabulary (position, term, type, created_at)
                 VALUES (?, ?, ?, ?)",
                &params,
            )
            .await
        {
            log::warn!("vocabulary upsert failed: {}", error);
        }
    }

    async fn flush_error_records(&self) {
        let records = self.ctx.errors.drain(1000);
        if records.is_empty() {
            return;
        }

        let params: Vec<Vec<crate::database::SqlValue>> = records
            .iter()
            .map(|record| {
                vec![
                    record.id.clone().into(),
                    record.fingerprint.clone().into(),
                    record.category.as_str().into(),
                    record.severity.as_str().into(),
                    record.timestamp.to_rfc3339().into(),
                    serde_json::to_string(&record.context)
                        .unwrap_or_else(|_| "{}".to_string())
                        .into(),
                ]
            })
            .collect();

        if let Err(error) = self
            .ctx
            .executor
            .execute_many(
                "INSERT OR REPLACE INTO error_records
                 (id, fingerprint, category, severity, timestamp, context_json)
                 VALUES (?, ?, ?, ?, ?, ?)",
                &params,
            )
            .await
        {
            log::warn!("error record flush failed: {}", error);
        }
    }

    async fn mirror_cache_metadata(&self) {
        let rows = self.ctx.cache.metadata();
        if rows.is_empty() {
            return;
        }

        let params: Vec<Vec<crate::database::SqlValue>> = rows
            .into_iter()
            .take(500)
            .map(|row| {
                vec![
                    row.key.into(),
                    row.tier.into(),
                    row.tags.join(",").into(),
                    row.created_at.to_rfc3339().into(),
                    row.expires_at
                        .map(|at| at.to_rfc3339().into())
                        .unwrap_or(crate::database::SqlValue::Null),
                    row.hit_count.into(),
                    row.size_bytes.into(),
                    i64::from(row.hot).into(),
                ]
            })
            .collect();

        if let Err(error) = self
            .ctx
            .executor
            .execute_many(
                "INSERT OR REPLACE INTO cache_metadata
                 (key, tier, tags, created_at, expires_at, hit_count, size_bytes, hot)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                &params,
            )
            .await
        {
            log::warn!("cache metadata mirror failed: {}", error);
        }
    }

    /// One audit row per batch; limiter state itself stays in-process
    async fn audit_rate_limiter(&self) {
        let status = self.ctx.limiter.status();
        if let Err(error) = self
            .ctx
            .executor
            .execute(
                "INSERT INTO rate_limiter_audit
                 (snapshot_at, shards, allowed, refused, pending_reservations, imbalance_ratio)
                 VALUES (?, ?, ?, ?, ?, ?)",
                &[
                    Utc::now().to_rfc3339().into(),
                    status.shards.into(),
                    status.allowed.into(),
                    status.refused.into(),
                    status.pending_reservations.into(),
                    crate::database::SqlValue::Real(status.imbalance_ratio),
                ],
            )
            .await
        {
            log::warn!("rate limiter audit write failed: {}", error);
        }
    }

    fn build_report(
        &self,
        results: Vec<ProcessingResult>,
        elapsed: Duration,
        cancelled: bool,
        drained: bool,
    ) -> BatchReport {
        let mut succeeded = 0;
        let mut cached = 0;
        let mut failed = 0;
        let mut tokens = TokenUsage::default();
        let mut failures_by_category: HashMap<ErrorCategory, u64> = HashMap::new();
        let mut fingerprints: Vec<String> = Vec::new();

        for result in &results {
            tokens = tokens.add(result.tokens);
            match &result.outcome {
                ProcessingOutcome::Success(_) => succeeded += 1,
                ProcessingOutcome::Cached(_) => {
                    succeeded += 1;
                    cached += 1;
                }
                ProcessingOutcome::Failed(record) => {
                    failed += 1;
                    *failures_by_category.entry(record.category).or_insert(0) += 1;
                    if !fingerprints.contains(&record.fingerprint) {
                        fingerprints.push(record.fingerprint.clone());
                    }
                }
            }
        }
        fingerprints.truncate(5);

        BatchReport {
            estimated_cost: tokens.total() as f64 * self.ctx.settings.cost_per_token,
            results,
            succeeded,
            cached,
            failed,
            failures_by_category,
            failure_fingerprints: fingerprints,
            tokens,
            elapsed,
            cancelled,
            drained,
        }
    }
}

// ============================================================================
// Per-item processing
// ============================================================================

fn refusal_result(
    item: &VocabularyItem,
    kind: ErrorKind,
    message: &str,
    ctx: &PipelineContext,
) -> ProcessingResult {
    let category = match kind {
        ErrorKind::ResourceExhausted => ErrorCategory::System,
        _ => ErrorCategory::Transient,
    };
    let error = PipelineError::new(kind, category, message, "pipeline")
        .with_context("position", item.position.to_string());
    let record = ctx.errors.collect(&error);
    ProcessingResult::failed(item.position, item.term.clone(), record)
}

/// Estimated request cost in rate-limiter tokens
fn token_cost(prompt: &str) -> u64 {
    1 + (prompt.len() / 4000) as u64
}

async fn process_item(
    ctx: &Arc<PipelineContext>,
    item: &VocabularyItem,
    cancel: &CancellationToken,
    batch_tag: &str,
) -> crate::error::Result<ProcessingResult> {
    let ttl = ctx.settings.stage_cache_ttl;

    // Stage 1: linguistic analysis
    let stage1_key = CacheService::fingerprint(&["stage1", &item.term, &item.item_type]);
    let stage1_tags: HashSet<String> =
        [batch_tag.to_string(), "stage1".to_string()].into();
    let usage1 = Arc::new(Mutex::new(TokenUsage::default()));
    let prompt1 = llm::stage1_prompt(item);

    let stage1_started = Instant::now();
    let lookup1 = ctx
        .cache
        .get_or_compute::<String, _, _>(&stage1_key, ttl, stage1_tags, {
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            let usage = usage1.clone();
            let position = item.position;
            move || {
                async move {
                    let response =
                        call_external(&ctx, Stage::One, &prompt1, &cancel).await?;
                    *usage.lock() = response.usage;
                    record_stage(&ctx, position, Stage::One, &response).await;
                    Ok(response.content)
                }
            }
        })
        .await
        .map_err(|error| {
            error
                .with_context("position", item.position.to_string())
                .with_context("stage", "1")
        })?;
    let stage1_ms = stage1_started.elapsed().as_millis() as u64;

    if cancel.is_cancelled() {
        return Err(PipelineError::transient(
            ErrorKind::Cancelled,
            "cancelled between stages",
            "pipeline",
        ));
    }

    // Stage 2: flashcard generation, keyed by item and stage-1 output
    let stage1_digest = CacheService::fingerprint(&[&lookup1.value]);
    let stage2_key = CacheService::fingerprint(&[
        "stage2",
        &item.term,
        &item.item_type,
        &stage1_digest,
    ]);
    let stage2_tags: HashSet<String> =
        [batch_tag.to_string(), "stage2".to_string()].into();
    let usage2 = Arc::new(Mutex::new(TokenUsage::default()));

    let stage2_started = Instant::now();
    let lookup2 = ctx
        .cache
        .get_or_compute::<Vec<Flashcard>, _, _>(&stage2_key, ttl, stage2_tags, {
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            let usage = usage2.clone();
            let item = item.clone();
            let analysis = lookup1.value.clone();
            move || {
                async move {
                    let prompt2 = llm::stage2_prompt(&analysis);
                    let response =
                        call_external(&ctx, Stage::Two, &prompt2, &cancel).await?;
                    let cards = llm::parse_flashcards(&response.content, &item);
                    if cards.is_empty() {
                        return Err(PipelineError::permanent(
                            ErrorKind::ParseFailed,
                            "stage-2 response carried no flashcard rows",
                            "pipeline",
                        ));
                    }
                    *usage.lock() = response.usage;
                    record_stage(&ctx, item.position, Stage::Two, &response).await;
                    Ok(cards)
                }
            }
        })
        .await
        .map_err(|error| {
            error
                .with_context("position", item.position.to_string())
                .with_context("stage", "2")
        })?;
    let stage2_ms = stage2_started.elapsed().as_millis() as u64;

    let tokens = usage1.lock().add(*usage2.lock());
    let from_cache = lookup1.from_cache && lookup2.from_cache;
    let outcome = if from_cache {
        ProcessingOutcome::Cached(lookup2.value)
    } else {
        ProcessingOutcome::Success(lookup2.value)
    };

    Ok(ProcessingResult {
        position: item.position,
        term: item.term.clone(),
        outcome,
        from_cache,
        timings: StageTimings { stage1_ms, stage2_ms },
        tokens,
    })
}

/// One stage call through rate limiter, breaker, and retry
///
/// A `CircuitOpen` refusal is not retried inside the coordinator;
/// instead the worker sleeps until the scheduled recovery time and tries
/// again, bounded by the configured stage patience.
async fn call_external(
    ctx: &Arc<PipelineContext>,
    stage: Stage,
    prompt: &str,
    cancel: &CancellationToken,
) -> crate::error::Result<LlmResponse> {
    let cost = token_cost(prompt);
    let limiter_key = match stage {
        Stage::One => "stage1",
        Stage::Two => "stage2",
    };
    let deadline = Instant::now() + ctx.settings.stage_patience;

    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::transient(
                ErrorKind::Cancelled,
                "cancelled before external call",
                "pipeline",
            ));
        }

        let attempt = ctx
            .retry
            .retry(|| {
                let ctx = ctx.clone();
                let prompt = prompt.to_string();
                async move {
                    let grant = ctx.limiter.acquire(limiter_key, cost).await;
                    if !grant.allowed {
                        let mut error = PipelineError::transient(
                            ErrorKind::RateLimiterRefused,
                            "rate limiter refused the request credit",
                            "pipeline",
                        );
                        if let Some(retry_after) = grant.retry_after {
                            error = error.with_retry_after(retry_after);
                        }
                        return Err(error);
                    }

                    let llm = ctx.llm.clone();
                    ctx.breaker
                        .call(|| async move { llm.call(stage, &prompt).await })
                        .await
                }
            })
            .await;

        match attempt {
            Ok(response) => return Ok(response),
            Err(error)
                if error.kind == ErrorKind::CircuitOpen && Instant::now() < deadline =>
            {
                // Back-pressure: wait out the scheduled recovery instead
                // of tight-looping against the open breaker
                let recovery = error.retry_after.unwrap_or(Duration::from_millis(250));
                let remaining = deadline.saturating_duration_since(Instant::now());
                ctx.errors.collect(&error);
                tokio::time::sleep(recovery.min(remaining)).await;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Persist one stage's artifacts; bookkeeping failures degrade, they do
/// not fail the stage
async fn record_stage(ctx: &Arc<PipelineContext>, position: usize, stage: Stage, response: &LlmResponse) {
    let created = Utc::now().to_rfc3339();

    let stage_row = ctx
        .executor
        .execute(
            "INSERT INTO stage_output
             (position, stage, raw, parsed_json, tokens, duration_ms, created_at)
             VALUES (?, ?, ?, NULL, ?, 0, ?)",
            &[
                position.into(),
                i64::from(stage.number()).into(),
                response.content.clone().into(),
                response.usage.total().into(),
                created.clone().into(),
            ],
        )
        .await;

    let usage_row = ctx
        .executor
        .execute(
            "INSERT INTO api_usage
             (request_id, stage, input_tokens, output_tokens, cost, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            &[
                response.request_id.clone().into(),
                i64::from(stage.number()).into(),
                response.usage.input_tokens.into(),
                response.usage.output_tokens.into(),
                crate::database::SqlValue::Real(
                    response.usage.total() as f64 * ctx.settings.cost_per_token,
                ),
                created.into(),
            ],
        )
        .await;

    for outcome in [stage_row, usage_row] {
        if let Err(error) = outcome {
            let degraded = PipelineError::degraded(
                ErrorKind::Database,
                format!("stage bookkeeping write failed: {}", error),
                "pipeline",
            )
            .with_context("position", position.to_string());
            ctx.errors.collect(&degraded);
            log::warn!("{}", degraded);
        }
    }
}

async fn persist_flashcards(executor: &Arc<crate::database::QueryExecutor>, cards: &[Flashcard]) {
    if cards.is_empty() {
        return;
    }
    let created = Utc::now().to_rfc3339();
    let cards = cards.to_vec();

    let outcome = executor
        .transaction(move |tx: &mut TransactionScope| {
            async move {
                for card in &cards {
                    tx.execute(
                        "INSERT INTO flashcards
                         (position, term_number, tab, front, back, tags, honorific, created_at)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                        &[
                            card.position.into(),
                            card.term_number.into(),
                            card.tab_name.clone().into(),
                            card.front.clone().into(),
                            card.back.clone().into(),
                            card.tags.clone().into(),
                            card.honorific_level.clone().into(),
                            created.clone().into(),
                        ],
                    )
                    .await?;
                }
                Ok(())
            }
            .boxed()
        })
        .await;

    if let Err(error) = outcome {
        log::warn!("flashcard persistence failed: {}", error);
    }
}
