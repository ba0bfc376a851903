//! qgbench — drives a QueryGrid instance with synthetic read traffic.
//!
//! The backend is simulated in-process, so the numbers measure the layer
//! itself: cache hit ratio, coalescing, pool pressure and batching.
//!
//! # Usage
//!
//! ```text
//! qgbench run --requests 10000 --distinct 100 --concurrency 64 --latency-ms 5
//! qgbench config > querygrid.toml
//! ```

mod load;
mod sim;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use querygrid::{QueryGrid, QueryGridConfig, names};
use serde_json::json;
use tracing::info;

use crate::load::run_load;
use crate::sim::{SimulatedBackend, SimulatedFactory};

#[derive(Parser)]
#[command(name = "qgbench", about = "QueryGrid load generator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a load test and print a JSON report.
    Run {
        /// Total queries to issue.
        #[arg(long, default_value_t = 10_000)]
        requests: usize,

        /// Number of distinct query keys.
        #[arg(long, default_value_t = 100)]
        distinct: usize,

        /// Concurrent workers.
        #[arg(long, default_value_t = 32)]
        concurrency: usize,

        /// querygrid.toml to load instead of the defaults.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Simulated backend latency in milliseconds.
        #[arg(long, default_value_t = 5)]
        latency_ms: u64,

        /// Probability that a simulated backend call times out.
        #[arg(long, default_value_t = 0.0)]
        failure_rate: f64,

        /// Let the simulated backend accept batched calls.
        #[arg(long)]
        batching: bool,
    },
    /// Print the default configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,qgbench=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            requests,
            distinct,
            concurrency,
            config,
            latency_ms,
            failure_rate,
            batching,
        } => {
            anyhow::ensure!(distinct > 0, "--distinct must be at least 1");
            anyhow::ensure!(concurrency > 0, "--concurrency must be at least 1");
            anyhow::ensure!(
                (0.0..=1.0).contains(&failure_rate),
                "--failure-rate must be between 0 and 1"
            );

            let config = match config {
                Some(path) => QueryGridConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => QueryGridConfig::default(),
            };
            let backend =
                SimulatedBackend::new(Duration::from_millis(latency_ms), failure_rate, batching);
            run(config, backend, requests, distinct, concurrency).await
        }
        Command::Config => {
            print!("{}", QueryGridConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(
    config: QueryGridConfig,
    backend: Arc<SimulatedBackend>,
    requests: usize,
    distinct: usize,
    concurrency: usize,
) -> anyhow::Result<()> {
    let grid = QueryGrid::builder(config)
        .connection_factory(Arc::new(SimulatedFactory::new(Arc::clone(&backend))))
        .build()
        .await
        .context("starting query grid")?;
    let grid = Arc::new(grid);

    info!(requests, distinct, concurrency, "load test started");
    let summary = run_load(Arc::clone(&grid), requests, distinct, concurrency).await;
    info!(
        ok = summary.ok,
        errors = summary.errors,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "load test finished"
    );

    let window = summary.elapsed + Duration::from_secs(1);
    let metrics = grid.metrics();
    let pool = grid.pool_stats();
    let cache = grid.cache_stats();
    let report = json!({
        "requests": requests,
        "distinct": distinct,
        "concurrency": concurrency,
        "elapsed_ms": summary.elapsed.as_millis() as u64,
        "throughput_rps": summary.throughput(),
        "ok": summary.ok,
        "errors": summary.errors,
        "errors_by_kind": summary.errors_by_kind,
        "backend": {
            "calls": backend.calls(),
            "round_trips": backend.round_trips(),
        },
        "cache": {
            "hit_ratio": metrics.hit_ratio(names::CACHE_HIT, names::CACHE_MISS, window),
            "hits": cache.hits,
            "misses": cache.misses,
            "evictions": cache.evictions,
            "entries": cache.entries,
        },
        "pool": {
            "total": pool.total,
            "warm_target": pool.warm_target,
            "exhausted": pool.exhausted_count,
        },
        "metrics_dropped": metrics.dropped(),
        "metrics": metrics.summary(window),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    grid.shutdown().await;
    Ok(())
}
