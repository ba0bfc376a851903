//! Closed-loop load generation against a running grid.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use querygrid::{ExecuteOptions, QueryError, QueryGrid};
use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::debug;

pub const QUERY: &str = "query Item($id: ID!) { item(id: $id) { id name } }";

#[derive(Debug, Default)]
pub struct LoadSummary {
    pub ok: usize,
    pub errors: usize,
    pub errors_by_kind: BTreeMap<&'static str, usize>,
    pub elapsed: Duration,
}

impl LoadSummary {
    fn merge(&mut self, other: LoadSummary) {
        self.ok += other.ok;
        self.errors += other.errors;
        for (kind, n) in other.errors_by_kind {
            *self.errors_by_kind.entry(kind).or_default() += n;
        }
    }

    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.ok + self.errors) as f64 / secs
        } else {
            0.0
        }
    }
}

/// Issue `requests` queries over `distinct` keys from `concurrency`
/// workers, each sending its next request as soon as the previous returns.
pub async fn run_load(
    grid: Arc<QueryGrid>,
    requests: usize,
    distinct: usize,
    concurrency: usize,
) -> LoadSummary {
    let distinct = distinct.max(1);
    let next = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();
    let mut workers = JoinSet::new();

    for worker in 0..concurrency.max(1) {
        let grid = Arc::clone(&grid);
        let next = Arc::clone(&next);
        workers.spawn(async move {
            let mut summary = LoadSummary::default();
            loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                if i >= requests {
                    break;
                }
                let variables = json!({ "id": i % distinct });
                match grid.execute(QUERY, variables, ExecuteOptions::default()).await {
                    Ok(_) => summary.ok += 1,
                    Err(e) => {
                        summary.errors += 1;
                        *summary.errors_by_kind.entry(error_kind(&e)).or_default() += 1;
                    }
                }
            }
            debug!(worker, ok = summary.ok, errors = summary.errors, "worker finished");
            summary
        });
    }

    let mut total = LoadSummary::default();
    while let Some(joined) = workers.join_next().await {
        if let Ok(summary) = joined {
            total.merge(summary);
        }
    }
    total.elapsed = started.elapsed();
    total
}

fn error_kind(error: &QueryError) -> &'static str {
    match error {
        QueryError::PoolExhausted { .. } => "pool_exhausted",
        QueryError::PoolClosed => "pool_closed",
        QueryError::Transport(_) => "transport",
        QueryError::QueryTooExpensive { .. } => "too_expensive",
        QueryError::ChunkFailed { .. } => "chunk_failed",
        QueryError::Cancelled => "cancelled",
        QueryError::DeadlineExceeded(_) => "deadline",
        QueryError::Config(_) => "config",
        QueryError::Internal(_) => "internal",
    }
}
