//! Bulk processor — runs jobs chunk by chunk through the connection pool.
//!
//! Chunks start in index order. A processor-wide semaphore caps how many
//! chunks run at once across every job, so a large job cannot starve the
//! pool for interactive queries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use querygrid_cache::QueryCache;
use querygrid_core::{
    Backoff, BackendResponse, QueryError, QueryGridConfig, QueryRequest, QueryResult,
    RequestContext,
};
use querygrid_metrics::{MetricsCollector, names};
use querygrid_pool::ConnectionPool;
use serde_json::{Value, json};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::job::{BulkHandle, BulkProgress, BulkReport, ChunkFailure, ChunkOutcome};

/// Configuration for the bulk processor.
#[derive(Clone, Debug, PartialEq)]
pub struct BulkConfig {
    /// Items per chunk unless a job overrides it (default: 100).
    pub chunk_size: usize,
    /// Chunks running at once across all jobs (default: 4).
    pub max_concurrent_chunks: usize,
    /// Attempts per chunk, first try included (default: 3).
    pub attempts_per_chunk: u32,
    /// Failure reasons kept in a job's progress (default: 10).
    pub max_failure_reasons: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            max_concurrent_chunks: 4,
            attempts_per_chunk: 3,
            max_failure_reasons: 10,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
        }
    }
}

impl From<&QueryGridConfig> for BulkConfig {
    fn from(config: &QueryGridConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_concurrent_chunks: config.max_concurrent_chunks,
            attempts_per_chunk: config.retry_attempts,
            max_failure_reasons: config.max_failure_reasons,
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
        }
    }
}

/// Per-job options.
#[derive(Clone, Debug, Default)]
pub struct BulkOptions {
    /// Operation document each chunk runs. Chunk items are passed as the
    /// `items` variable.
    pub operation: String,
    pub context: RequestContext,
    /// Overrides [`BulkConfig::chunk_size`].
    pub chunk_size: Option<usize>,
    /// Query cache tags invalidated once any chunk has been written.
    pub invalidate_tags: Vec<String>,
}

impl BulkOptions {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidate_tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Runs bulk jobs with processor-wide bounded parallelism.
pub struct BulkProcessor {
    pool: Arc<ConnectionPool>,
    cache: Option<Arc<QueryCache>>,
    config: BulkConfig,
    permits: Arc<Semaphore>,
    metrics: MetricsCollector,
    next_job: AtomicU64,
}

/// State shared by the chunks of one job.
struct Job {
    id: u64,
    operation: String,
    context: RequestContext,
    pool: Arc<ConnectionPool>,
    metrics: MetricsCollector,
    progress: watch::Sender<BulkProgress>,
    cancel: CancellationToken,
    attempts: u32,
    keep_failures: usize,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl BulkProcessor {
    pub fn new(
        pool: Arc<ConnectionPool>,
        cache: Option<Arc<QueryCache>>,
        config: BulkConfig,
        metrics: MetricsCollector,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_chunks.max(1)));
        Self {
            pool,
            cache,
            config,
            permits,
            metrics,
            next_job: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    /// Split `items` into ordered chunks and start processing them.
    ///
    /// Returns immediately; the job runs in the background and reports
    /// through the returned handle.
    pub fn submit(&self, items: Vec<Value>, options: BulkOptions) -> BulkHandle {
        let id = self.next_job.fetch_add(1, Ordering::Relaxed);
        let chunk_size = options.chunk_size.unwrap_or(self.config.chunk_size).max(1);
        let chunks: Vec<Vec<Value>> = items.chunks(chunk_size).map(<[Value]>::to_vec).collect();

        let (progress_tx, progress) = watch::channel(BulkProgress::new(chunks.len()));
        let cancel = CancellationToken::new();
        let job = Arc::new(Job {
            id,
            operation: options.operation,
            context: options.context,
            pool: Arc::clone(&self.pool),
            metrics: self.metrics.clone(),
            progress: progress_tx,
            cancel: cancel.clone(),
            attempts: self.config.attempts_per_chunk.max(1),
            keep_failures: self.config.max_failure_reasons,
            backoff_base: self.config.backoff_base,
            backoff_max: self.config.backoff_max,
        });

        info!(
            job = id,
            items = items.len(),
            chunks = chunks.len(),
            chunk_size,
            "bulk job submitted"
        );

        let task = tokio::spawn(run_job(
            job,
            chunks,
            Arc::clone(&self.permits),
            self.cache.clone(),
            options.invalidate_tags,
        ));

        BulkHandle {
            id,
            progress,
            task,
            cancel,
        }
    }
}

impl std::fmt::Debug for BulkProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkProcessor")
            .field("config", &self.config)
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

async fn run_job(
    job: Arc<Job>,
    chunks: Vec<Vec<Value>>,
    permits: Arc<Semaphore>,
    cache: Option<Arc<QueryCache>>,
    invalidate_tags: Vec<String>,
) -> BulkReport {
    let started = Instant::now();
    let total = chunks.len();
    let mut outcomes = BTreeMap::new();
    let mut running = JoinSet::new();
    let mut chunks = chunks.into_iter().enumerate();

    // Start chunks in order as permits free up.
    while let Some((index, items)) = chunks.next() {
        let permit = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => None,
            permit = Arc::clone(&permits).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            for (index, _) in std::iter::once((index, items)).chain(chunks.by_ref()) {
                outcomes.insert(index, job.fail(index, 0, QueryError::Cancelled));
            }
            break;
        };
        running.spawn(run_chunk(Arc::clone(&job), index, items, permit));
    }

    while let Some(joined) = running.join_next().await {
        match joined {
            Ok((index, outcome)) => {
                outcomes.insert(index, outcome);
            }
            Err(e) => warn!(job = job.id, error = %e, "bulk chunk task failed"),
        }
    }

    let progress = job.progress.borrow().clone();
    if progress.completed > 0 {
        if let Some(cache) = &cache {
            for tag in &invalidate_tags {
                cache.invalidate_by_tag(tag);
            }
        }
    }

    info!(
        job = job.id,
        chunks = total,
        completed = progress.completed,
        failed = progress.failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "bulk job finished"
    );

    BulkReport { outcomes, progress }
}

async fn run_chunk(
    job: Arc<Job>,
    index: usize,
    items: Vec<Value>,
    _permit: OwnedSemaphorePermit,
) -> (usize, ChunkOutcome) {
    let request = QueryRequest::new(
        job.operation.clone(),
        json!({ "items": items }),
        job.context.clone(),
    );
    let mut backoff = Backoff::new(job.backoff_base, job.backoff_max);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => Err(QueryError::Cancelled),
            result = call_once(&job.pool, &request) => result,
        };
        job.metrics
            .record_duration(names::BULK_CHUNK_LATENCY_MS, started.elapsed());

        let error = match result {
            Ok(response) => {
                job.progress.send_modify(BulkProgress::record_success);
                job.metrics.increment(names::BULK_CHUNK_SUCCEEDED);
                debug!(job = job.id, chunk = index, attempt, "bulk chunk succeeded");
                return (
                    index,
                    ChunkOutcome::Succeeded {
                        attempts: attempt,
                        data: response.data,
                    },
                );
            }
            Err(e) => e,
        };

        if !error.is_retriable() || attempt >= job.attempts {
            return (index, job.fail(index, attempt, error));
        }

        let delay = backoff.next_delay();
        job.metrics.increment(names::BULK_CHUNK_RETRY);
        debug!(
            job = job.id,
            chunk = index,
            attempt,
            delay = ?delay,
            error = %error,
            "retrying bulk chunk"
        );
        tokio::select! {
            biased;
            _ = job.cancel.cancelled() => {
                return (index, job.fail(index, attempt, QueryError::Cancelled));
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn call_once(pool: &Arc<ConnectionPool>, request: &QueryRequest) -> QueryResult<BackendResponse> {
    let mut conn = pool.acquire(None).await?;
    let result = conn.call(request).await;
    if let Err(e) = &result {
        if e.is_connection_fatal() {
            conn.mark_broken();
        }
    }
    conn.release().await;
    result.map_err(QueryError::from)
}

impl Job {
    /// Record a failed chunk and build its outcome. Cancellation stays
    /// `Cancelled`; anything else becomes `ChunkFailed`.
    fn fail(&self, index: usize, attempts: u32, error: QueryError) -> ChunkOutcome {
        let reason = error.to_string();
        let error = match error {
            QueryError::Cancelled => QueryError::Cancelled,
            _ => QueryError::ChunkFailed {
                chunk: index,
                attempts,
                reason: reason.clone(),
            },
        };

        let failure = ChunkFailure {
            chunk: index,
            attempts,
            reason,
        };
        self.progress
            .send_modify(|progress| progress.record_failure(failure, self.keep_failures));
        self.metrics.increment(names::BULK_CHUNK_FAILED);
        warn!(job = self.id, chunk = index, attempts, error = %error, "bulk chunk failed");
        ChunkOutcome::Failed(error)
    }
}
