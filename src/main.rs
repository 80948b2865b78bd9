//! LEXIDECK - AI Flashcard Generation Pipeline
//!
//! Command-line entry point. Subcommands:
//! - `process`: run a vocabulary file through the two-stage pipeline
//! - `check`: diagnose configuration, database, and cache health
//! - `stats`: print store-backed usage and error aggregates
//! - `example`: write a sample vocabulary file

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use lexideck::config::PipelineConfig;
use lexideck::database::SqlValue;
use lexideck::error::ErrorKind;
use lexideck::llm::OpenRouterClient;
use lexideck::pipeline::{CancellationToken, Orchestrator, PipelineContext, ProgressCallback};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "lexideck", version, about = "AI flashcard generation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process a vocabulary file into flashcards
    Process {
        /// Input CSV file with (position, term, type) rows
        #[arg(short, long)]
        input: PathBuf,

        /// Output TSV file for generated flashcards
        #[arg(short, long)]
        output: PathBuf,

        /// Process at most this many items
        #[arg(short, long)]
        limit: Option<usize>,

        /// Concurrent workers (overrides LEXIDECK_CONCURRENCY)
        #[arg(short, long)]
        concurrent: Option<usize>,
    },

    /// Diagnose configuration and component health
    Check,

    /// Print usage and error aggregates from the store
    Stats,

    /// Write a sample vocabulary CSV
    Example {
        /// Where to write the sample
        #[arg(default_value = "example_vocabulary.csv")]
        path: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let code = runtime.block_on(run(cli));
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    match cli.command {
        Command::Process {
            input,
            output,
            limit,
            concurrent,
        } => run_process(input, output, limit, concurrent).await,
        Command::Check => run_check().await,
        Command::Stats => run_stats().await,
        Command::Example { path } => match lexideck::io::write_example(&path) {
            Ok(()) => {
                println!("wrote sample vocabulary to {:?}", path);
                0
            }
            Err(e) => {
                log::error!("{}", e);
                1
            }
        },
    }
}

async fn build_context(config: &PipelineConfig) -> Result<Arc<PipelineContext>, i32> {
    let llm = OpenRouterClient::new(config.api.clone()).map_err(|e| {
        log::error!("{}", e);
        3
    })?;

    PipelineContext::build(
        Arc::new(llm),
        config.rate_limit.clone(),
        config.breaker.clone(),
        config.retry.clone(),
        config.cache.clone(),
        config.database.clone(),
        config.pipeline.clone(),
    )
    .await
    .map_err(|e| {
        log::error!("startup failed: {}", e);
        3
    })
}

async fn run_process(
    input: PathBuf,
    output: PathBuf,
    limit: Option<usize>,
    concurrent: Option<usize>,
) -> i32 {
    let mut config = PipelineConfig::from_env();
    if let Some(concurrent) = concurrent {
        config.pipeline.concurrency = concurrent.clamp(1, 64);
    }
    if let Err(e) = config.validate() {
        log::error!("{}", e);
        return 1;
    }

    let ingress = match lexideck::io::read_vocabulary(&input, limit) {
        Ok(report) => report,
        Err(e) => {
            log::error!("{}", e);
            return 1;
        }
    };
    for (row, reason) in &ingress.skipped {
        log::warn!("skipping input row {}: {}", row, reason);
    }
    log::info!("processing {} vocabulary items", ingress.items.len());

    let ctx = match build_context(&config).await {
        Ok(ctx) => ctx,
        Err(code) => return code,
    };
    ctx.cache.spawn_sweeper();

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received; cancelling batch");
            ctrl_c_cancel.cancel();
        }
    });

    let bar = ProgressBar::new(ingress.items.len() as u64);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let bar_for_callback = bar.clone();
    let callback: ProgressCallback = Box::new(move |snapshot| {
        bar_for_callback.set_position(snapshot.completed);
        bar_for_callback.set_message(format!(
            "{} failed, {} cached",
            snapshot.failed, snapshot.from_cache
        ));
    });

    let orchestrator = Orchestrator::new(ctx);
    let report = match orchestrator
        .process_batch(ingress.items, cancel, vec![callback])
        .await
    {
        Ok(report) => report,
        Err(e) => {
            bar.finish_and_clear();
            log::error!("batch failed to start: {}", e);
            return match e.kind {
                ErrorKind::Validation | ErrorKind::QuotaExceeded => 1,
                _ => 3,
            };
        }
    };
    bar.finish_and_clear();

    // Flashcards stream out in position order
    let cards: Vec<_> = report
        .results
        .iter()
        .filter_map(|result| result.outcome.flashcards())
        .flatten()
        .cloned()
        .collect();
    if let Err(e) = lexideck::io::write_flashcards(&output, &cards) {
        log::error!("{}", e);
        return 3;
    }

    println!("Processing complete");
    println!("  items:       {}", report.results.len());
    println!("  succeeded:   {} ({} from cache)", report.succeeded, report.cached);
    println!("  failed:      {}", report.failed);
    for (category, count) in &report.failures_by_category {
        println!("    {}: {}", category, count);
    }
    if !report.failure_fingerprints.is_empty() {
        println!("  failure fingerprints: {}", report.failure_fingerprints.join(", "));
    }
    println!("  flashcards:  {}", cards.len());
    println!(
        "  tokens:      {} (est. ${:.4})",
        report.tokens.total(),
        report.estimated_cost
    );
    println!("  elapsed:     {:.1?}", report.elapsed);
    println!("  output:      {:?}", output);

    report.exit_code()
}

async fn run_check() -> i32 {
    let config = PipelineConfig::from_env();
    let mut failures = 0;

    let key_ok = !config.api.api_key.is_empty();
    print_check("API credential", key_ok, "set LEXIDECK_API_KEY");
    failures += u32::from(!key_ok);

    let cache_ok = std::fs::create_dir_all(&config.cache.l2_directory).is_ok();
    print_check(
        "cache directory",
        cache_ok,
        &format!("{:?} not writable", config.cache.l2_directory),
    );
    failures += u32::from(!cache_ok);

    match lexideck::database::ConnectionPool::new(config.database.clone()).await {
        Ok(pool) => match pool.health_check().await {
            Ok(health) if health.healthy => {
                print_check("database", true, "");
                println!("    latency: {:?}, pool size {}", health.latency, health.pool_size);
            }
            Ok(health) => {
                print_check("database", false, health.error.as_deref().unwrap_or("probe failed"));
                failures += 1;
            }
            Err(e) => {
                print_check("database", false, &e.to_string());
                failures += 1;
            }
        },
        Err(e) => {
            print_check("database", false, &e.to_string());
            failures += 1;
        }
    }

    if failures == 0 {
        println!("all checks passed");
        0
    } else {
        println!("{} check(s) failed", failures);
        1
    }
}

fn print_check(name: &str, ok: bool, detail: &str) {
    if ok {
        println!("  [ok]   {}", name);
    } else {
        println!("  [fail] {} - {}", name, detail);
    }
}

async fn run_stats() -> i32 {
    let config = PipelineConfig::from_env();
    let ctx = match build_context(&config).await {
        Ok(ctx) => ctx,
        Err(code) => return code,
    };

    let queries = [
        ("vocabulary items", "SELECT COUNT(*) AS n FROM vocabulary"),
        ("flashcards", "SELECT COUNT(*) AS n FROM flashcards"),
        ("stage outputs", "SELECT COUNT(*) AS n FROM stage_output"),
        (
            "tokens used",
            "SELECT COALESCE(SUM(input_tokens + output_tokens), 0) AS n FROM api_usage",
        ),
        ("error records", "SELECT COUNT(*) AS n FROM error_records"),
    ];

    println!("store aggregates:");
    for (label, sql) in queries {
        match ctx.executor.execute(sql, &[]).await {
            Ok(result) => {
                let n = result
                    .rows
                    .first()
                    .and_then(|row| row.get("n"))
                    .and_then(SqlValue::as_integer)
                    .unwrap_or(0);
                println!("  {:<18} {}", label, n);
            }
            Err(e) => {
                log::error!("stats query failed: {}", e);
                return 3;
            }
        }
    }

    let limiter = ctx.limiter.status();
    println!("rate limiter: {} shards, imbalance {:.2}", limiter.shards, limiter.imbalance_ratio);
    let cache = ctx.cache.stats();
    println!(
        "cache: {} entries, hit rate {:.1}%",
        cache.l1_entries,
        cache.hit_rate * 100.0
    );
    0
}
