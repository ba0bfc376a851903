//! Query optimizer — cost gate, cache lookup, request coalescing and
//! dispatch.
//!
//! Concurrent reads with the same fingerprint share one backend call. The
//! first caller registers an [`InFlight`] entry and spawns the call; later
//! callers subscribe to its broadcast. The call task populates the cache,
//! then removes the entry and broadcasts the outcome under the in-flight
//! lock, so every episode removes its entry exactly once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use querygrid_cache::{QueryCache, SchemaCache};
use querygrid_core::{
    BackendResponse, OperationKind, QueryError, QueryFingerprint, QueryGridConfig, QueryRequest,
    QueryResult, RequestContext,
};
use querygrid_metrics::{MetricsCollector, names};
use querygrid_pool::ConnectionPool;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::batcher::Batcher;
use crate::cost::{CostEstimate, estimate_cost};

type Outcome = QueryResult<Arc<Value>>;

/// Configuration for the query optimizer.
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizerConfig {
    /// Queries scoring above this are rejected (default: 1000).
    pub max_cost_score: u32,
    /// How long the batcher holds a batch open (default: 2ms, zero disables).
    pub batch_window: Duration,
    /// Largest batch sent in one round trip (default: 16).
    pub max_batch_size: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_cost_score: 1_000,
            batch_window: Duration::from_millis(2),
            max_batch_size: 16,
        }
    }
}

impl From<&QueryGridConfig> for OptimizerConfig {
    fn from(config: &QueryGridConfig) -> Self {
        Self {
            max_cost_score: config.max_cost_score,
            batch_window: config.batch_window(),
            max_batch_size: config.max_batch_size,
        }
    }
}

/// Per-call options for [`QueryOptimizer::execute`].
#[derive(Clone, Debug, Default)]
pub struct ExecuteOptions {
    /// Caller identity folded into the fingerprint.
    pub context: RequestContext,
    /// Cache TTL when the response carries none.
    pub ttl: Option<Duration>,
    /// Tags attached to the cached result. For mutations, tags to
    /// invalidate after success.
    pub tags: Vec<String>,
    /// Longest this caller waits for a result.
    pub deadline: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// A backend call shared by every caller with the same fingerprint.
struct InFlight {
    id: u64,
    sender: broadcast::Sender<Outcome>,
    subscribers: usize,
    task: AbortHandle,
}

pub struct QueryOptimizer {
    config: OptimizerConfig,
    pool: Arc<ConnectionPool>,
    cache: Arc<QueryCache>,
    schema: Option<Arc<SchemaCache>>,
    metrics: MetricsCollector,
    in_flight: Mutex<HashMap<QueryFingerprint, InFlight>>,
    next_id: AtomicU64,
    batcher: Option<(Batcher, JoinHandle<()>)>,
}

impl QueryOptimizer {
    /// Build the optimizer. Starts the batching task when the pool's
    /// backend supports multi-operation calls, so this must run inside a
    /// tokio runtime.
    pub fn new(
        config: OptimizerConfig,
        pool: Arc<ConnectionPool>,
        cache: Arc<QueryCache>,
        schema: Option<Arc<SchemaCache>>,
        metrics: MetricsCollector,
    ) -> Arc<Self> {
        let batcher = (pool.supports_batching() && !config.batch_window.is_zero()).then(|| {
            Batcher::spawn(
                Arc::clone(&pool),
                metrics.clone(),
                config.batch_window,
                config.max_batch_size,
            )
        });

        Arc::new(Self {
            config,
            pool,
            cache,
            schema,
            metrics,
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            batcher,
        })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Static cost of a query document.
    pub fn estimate_cost(&self, query: &str) -> CostEstimate {
        estimate_cost(query)
    }

    /// Number of fingerprints with a backend call in progress.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Run a query or mutation.
    pub async fn execute(
        self: &Arc<Self>,
        query: &str,
        variables: Value,
        options: ExecuteOptions,
    ) -> QueryResult<Arc<Value>> {
        let started = Instant::now();

        let cost = estimate_cost(query);
        if cost.score > self.config.max_cost_score {
            self.metrics.increment(names::QUERY_REJECTED);
            warn!(
                score = cost.score,
                ceiling = self.config.max_cost_score,
                fields = cost.fields,
                depth = cost.depth,
                "query rejected by cost ceiling"
            );
            return Err(QueryError::QueryTooExpensive {
                cost: cost.score,
                ceiling: self.config.max_cost_score,
            });
        }

        let request = QueryRequest::new(query, variables, options.context.clone());
        let result = match request.kind {
            OperationKind::Query => self.execute_query(request, &options).await,
            OperationKind::Mutation => self.execute_mutation(request, &options).await,
            OperationKind::Subscription => Err(QueryError::Internal(
                "subscription operations must go through subscribe()".into(),
            )),
        };

        if result.is_ok() {
            self.metrics
                .record_duration(names::QUERY_LATENCY_MS, started.elapsed());
        }
        result
    }

    async fn execute_query(
        self: &Arc<Self>,
        request: QueryRequest,
        options: &ExecuteOptions,
    ) -> QueryResult<Arc<Value>> {
        let fingerprint = request.fingerprint();
        if let Some(value) = self.cache.get(&fingerprint) {
            return Ok(value);
        }

        let mut waiter = match self.join_or_lead(fingerprint, request, options) {
            Joined::Cached(value) => return Ok(value),
            Joined::Waiting(waiter) => waiter,
        };

        let receive = async {
            waiter
                .rx
                .recv()
                .await
                .map_err(|_| QueryError::Internal("in-flight call ended without a result".into()))?
        };
        guarded(receive, options).await
    }

    /// Attach to the in-flight call for `fingerprint`, or start one.
    fn join_or_lead(
        self: &Arc<Self>,
        fingerprint: QueryFingerprint,
        request: QueryRequest,
        options: &ExecuteOptions,
    ) -> Joined {
        let mut in_flight = self.in_flight.lock();

        if let Some(entry) = in_flight.get_mut(&fingerprint) {
            entry.subscribers += 1;
            self.metrics.increment(names::QUERY_COALESCED);
            debug!(
                fingerprint = %fingerprint.short(),
                subscribers = entry.subscribers,
                "coalesced onto in-flight query"
            );
            return Joined::Waiting(Waiter {
                optimizer: Arc::clone(self),
                fingerprint,
                id: entry.id,
                rx: entry.sender.subscribe(),
            });
        }

        // A call may have finished between our cache miss and taking the lock.
        if let Some(value) = self.cache.peek(&fingerprint) {
            return Joined::Cached(value);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, rx) = broadcast::channel(1);
        let optimizer = Arc::clone(self);
        let ttl = options.ttl;
        let tags = options.tags.clone();
        let task = tokio::spawn(async move {
            optimizer.run_call(fingerprint, id, request, ttl, tags).await;
        });
        in_flight.insert(
            fingerprint,
            InFlight {
                id,
                sender,
                subscribers: 1,
                task: task.abort_handle(),
            },
        );
        debug!(fingerprint = %fingerprint.short(), "dispatching query");

        Joined::Waiting(Waiter {
            optimizer: Arc::clone(self),
            fingerprint,
            id,
            rx,
        })
    }

    /// The shared backend call for one cache-miss episode.
    async fn run_call(
        &self,
        fingerprint: QueryFingerprint,
        id: u64,
        request: QueryRequest,
        ttl: Option<Duration>,
        tags: Vec<String>,
    ) {
        let outcome = match self.dispatch(request).await {
            Ok(response) => {
                self.observe_schema_version(&response);
                let ttl = response.cache_ttl.or(ttl);
                let value = Arc::new(response.data);
                self.cache.put(fingerprint, Arc::clone(&value), ttl, &tags);
                Ok(value)
            }
            Err(e) => {
                self.metrics.increment(names::QUERY_FAILED);
                warn!(fingerprint = %fingerprint.short(), error = %e, "query failed");
                Err(e)
            }
        };

        let mut in_flight = self.in_flight.lock();
        if in_flight.get(&fingerprint).is_some_and(|entry| entry.id == id) {
            if let Some(entry) = in_flight.remove(&fingerprint) {
                let _ = entry.sender.send(outcome);
            }
        }
    }

    async fn execute_mutation(
        &self,
        request: QueryRequest,
        options: &ExecuteOptions,
    ) -> QueryResult<Arc<Value>> {
        let response = guarded(self.call_direct(request), options).await;
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.metrics.increment(names::QUERY_FAILED);
                return Err(e);
            }
        };
        self.observe_schema_version(&response);

        let mut invalidated = 0;
        for tag in &options.tags {
            invalidated += self.cache.invalidate_by_tag(tag);
        }
        debug!(tags = options.tags.len(), invalidated, "mutation applied");
        Ok(Arc::new(response.data))
    }

    async fn dispatch(&self, request: QueryRequest) -> QueryResult<BackendResponse> {
        match &self.batcher {
            Some((batcher, _)) => batcher.submit(request).await,
            None => self.call_direct(request).await,
        }
    }

    async fn call_direct(&self, request: QueryRequest) -> QueryResult<BackendResponse> {
        let mut conn = self.pool.acquire(None).await?;
        self.metrics.increment(names::QUERY_BACKEND_CALL);
        let result = conn.call(&request).await;
        if let Err(e) = &result {
            if e.is_connection_fatal() {
                conn.mark_broken();
            }
        }
        conn.release().await;
        result.map_err(QueryError::from)
    }

    fn observe_schema_version(&self, response: &BackendResponse) {
        if let (Some(schema), Some(version)) = (&self.schema, &response.schema_version) {
            schema.observe_version(version);
        }
    }

    /// Drop a cancelled subscriber. The call is aborted once nobody waits.
    fn detach(&self, fingerprint: &QueryFingerprint, id: u64) {
        let mut in_flight = self.in_flight.lock();
        let Some(entry) = in_flight.get_mut(fingerprint) else {
            return;
        };
        if entry.id != id {
            return;
        }
        entry.subscribers -= 1;
        if entry.subscribers > 0 {
            return;
        }
        if let Some(entry) = in_flight.remove(fingerprint) {
            entry.task.abort();
            self.metrics.increment(names::QUERY_ABANDONED);
            debug!(fingerprint = %fingerprint.short(), "abandoned in-flight query");
        }
    }
}

impl Drop for QueryOptimizer {
    fn drop(&mut self) {
        if let Some((_, handle)) = &self.batcher {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for QueryOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptimizer")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight_count())
            .field("batching", &self.batcher.is_some())
            .finish_non_exhaustive()
    }
}

enum Joined {
    Cached(Arc<Value>),
    Waiting(Waiter),
}

/// One caller's subscription to an in-flight call. Dropping it before the
/// outcome arrives detaches the caller.
struct Waiter {
    optimizer: Arc<QueryOptimizer>,
    fingerprint: QueryFingerprint,
    id: u64,
    rx: broadcast::Receiver<Outcome>,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.optimizer.detach(&self.fingerprint, self.id);
    }
}

/// Race `fut` against the caller's deadline and cancellation token.
async fn guarded<T>(
    fut: impl Future<Output = QueryResult<T>>,
    options: &ExecuteOptions,
) -> QueryResult<T> {
    let cancelled = async {
        match &options.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    let expired = async {
        match options.deadline {
            Some(deadline) => {
                tokio::time::sleep(deadline).await;
                deadline
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancelled => Err(QueryError::Cancelled),
        deadline = expired => Err(QueryError::DeadlineExceeded(deadline)),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use querygrid_cache::{CacheConfig, SchemaSource};
    use querygrid_core::{
        BackendConnection, ConnectionFactory, SchemaDescriptor, TransportError,
    };
    use querygrid_pool::PoolConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    // ── Mock backend ────────────────────────────────────────────────

    #[derive(Default)]
    struct BackendState {
        calls: AtomicUsize,
        batch_calls: AtomicUsize,
        batched_requests: AtomicUsize,
        fail: AtomicBool,
        delay_ms: AtomicU64,
        response_ttl_ms: AtomicU64,
        schema_version: Mutex<Option<String>>,
    }

    impl BackendState {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn respond(&self, request: &QueryRequest) -> Result<BackendResponse, TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Backend("resolver exploded".into()));
            }
            let mut response = BackendResponse::new(json!({
                "query": request.query,
                "variables": request.variables,
            }));
            let ttl = self.response_ttl_ms.load(Ordering::SeqCst);
            if ttl > 0 {
                response = response.with_cache_ttl(Duration::from_millis(ttl));
            }
            if let Some(version) = self.schema_version.lock().clone() {
                response = response.with_schema_version(version);
            }
            Ok(response)
        }
    }

    #[derive(Debug)]
    struct MockConnection {
        state: Arc<BackendState>,
    }

    impl std::fmt::Debug for BackendState {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("BackendState").finish_non_exhaustive()
        }
    }

    #[async_trait]
    impl BackendConnection for MockConnection {
        async fn call(&mut self, request: &QueryRequest) -> Result<BackendResponse, TransportError> {
            self.state.calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.state.delay_ms.load(Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.state.respond(request)
        }

        async fn call_batch(
            &mut self,
            requests: &[QueryRequest],
        ) -> Result<Vec<Result<BackendResponse, TransportError>>, TransportError> {
            self.state.batch_calls.fetch_add(1, Ordering::SeqCst);
            self.state
                .batched_requests
                .fetch_add(requests.len(), Ordering::SeqCst);
            let delay = self.state.delay_ms.load(Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(requests.iter().map(|r| self.state.respond(r)).collect())
        }

        async fn ping(&mut self) -> bool {
            true
        }

        async fn close(&mut self) {}
    }

    struct MockFactory {
        state: Arc<BackendState>,
        batching: bool,
    }

    #[async_trait]
    impl ConnectionFactory for MockFactory {
        async fn connect(&self) -> Result<Box<dyn BackendConnection>, TransportError> {
            Ok(Box::new(MockConnection {
                state: Arc::clone(&self.state),
            }))
        }

        fn supports_batching(&self) -> bool {
            self.batching
        }
    }

    struct Harness {
        optimizer: Arc<QueryOptimizer>,
        backend: Arc<BackendState>,
        cache: Arc<QueryCache>,
        metrics: MetricsCollector,
    }

    async fn harness_with(batching: bool, config: OptimizerConfig, schema: Option<Arc<SchemaCache>>) -> Harness {
        let backend = Arc::new(BackendState::default());
        let metrics = MetricsCollector::new(4096, Duration::from_secs(600));
        let factory = Arc::new(MockFactory {
            state: Arc::clone(&backend),
            batching,
        });
        let pool_config = PoolConfig {
            min_size: 0,
            max_size: 8,
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::open(pool_config, factory, metrics.clone())
            .await
            .unwrap();
        let cache = Arc::new(QueryCache::new(CacheConfig::default(), metrics.clone()));
        let optimizer = QueryOptimizer::new(config, pool, Arc::clone(&cache), schema, metrics.clone());
        Harness {
            optimizer,
            backend,
            cache,
            metrics,
        }
    }

    async fn harness() -> Harness {
        harness_with(false, OptimizerConfig::default(), None).await
    }

    const USERS: &str = "{ users { id name } }";

    // ── Cache path ──────────────────────────────────────────────────

    #[tokio::test]
    async fn second_identical_query_is_served_from_cache() {
        let h = harness().await;
        let first = h.optimizer.execute(USERS, json!({}), ExecuteOptions::default()).await.unwrap();
        let second = h.optimizer.execute(USERS, json!({}), ExecuteOptions::default()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.backend.calls(), 1);
        assert_eq!(h.cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn whitespace_differences_share_cache_entry() {
        let h = harness().await;
        h.optimizer.execute(USERS, json!({}), ExecuteOptions::default()).await.unwrap();
        h.optimizer
            .execute("{\n  users {\n    id,\n    name\n  }\n}", json!({}), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(h.backend.calls(), 1);
    }

    #[tokio::test]
    async fn distinct_variables_and_roles_are_distinct() {
        let h = harness().await;
        let q = "query($id: ID) { user(id: $id) { name } }";
        h.optimizer.execute(q, json!({"id": 1}), ExecuteOptions::default()).await.unwrap();
        h.optimizer.execute(q, json!({"id": 2}), ExecuteOptions::default()).await.unwrap();
        let admin = ExecuteOptions::default().with_context(RequestContext::new("admin", "acme"));
        h.optimizer.execute(q, json!({"id": 1}), admin).await.unwrap();
        assert_eq!(h.backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn response_ttl_overrides_option_ttl() {
        let h = harness().await;
        h.backend.response_ttl_ms.store(100, Ordering::SeqCst);
        let options = ExecuteOptions::default().with_ttl(Duration::from_secs(60));

        h.optimizer.execute(USERS, json!({}), options.clone()).await.unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;
        h.optimizer.execute(USERS, json!({}), options).await.unwrap();
        assert_eq!(h.backend.calls(), 2);
    }

    // ── Coalescing ──────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_queries_coalesce() {
        let h = harness().await;
        h.backend.delay_ms.store(50, Ordering::SeqCst);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let optimizer = Arc::clone(&h.optimizer);
            handles.push(tokio::spawn(async move {
                optimizer.execute(USERS, json!({}), ExecuteOptions::default()).await
            }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(h.backend.calls(), 1);
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(h.metrics.count(names::QUERY_COALESCED, Duration::from_secs(60)), 9);
        assert_eq!(h.optimizer.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_reaches_every_subscriber_and_is_not_cached() {
        let h = harness().await;
        h.backend.delay_ms.store(50, Ordering::SeqCst);
        h.backend.fail.store(true, Ordering::SeqCst);

        let mut handles = Vec::new();
        for _ in 0..3 {
            let optimizer = Arc::clone(&h.optimizer);
            handles.push(tokio::spawn(async move {
                optimizer.execute(USERS, json!({}), ExecuteOptions::default()).await
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, QueryError::Transport(TransportError::Backend(_))));
        }
        assert_eq!(h.backend.calls(), 1);
        assert!(h.cache.is_empty());

        h.backend.fail.store(false, Ordering::SeqCst);
        h.optimizer.execute(USERS, json!({}), ExecuteOptions::default()).await.unwrap();
        assert_eq!(h.backend.calls(), 2);
    }

    // ── Cost ceiling ────────────────────────────────────────────────

    #[tokio::test]
    async fn expensive_query_is_rejected_before_dispatch() {
        let config = OptimizerConfig {
            max_cost_score: 4,
            ..OptimizerConfig::default()
        };
        let h = harness_with(false, config, None).await;

        let err = h.optimizer.execute(USERS, json!({}), ExecuteOptions::default()).await.unwrap_err();
        assert_eq!(err, QueryError::QueryTooExpensive { cost: 5, ceiling: 4 });
        assert!(!err.is_retriable());
        assert_eq!(h.backend.calls(), 0);
        assert_eq!(h.metrics.count(names::QUERY_REJECTED, Duration::from_secs(60)), 1);
    }

    // ── Mutations ───────────────────────────────────────────────────

    #[tokio::test]
    async fn mutation_bypasses_cache_and_invalidates_tags() {
        let h = harness().await;
        let tagged = ExecuteOptions::default().with_tags(["users"]);
        h.optimizer.execute(USERS, json!({}), tagged).await.unwrap();
        assert_eq!(h.cache.len(), 1);

        let mutation = "mutation { renameUser(id: 1, name: \"x\") { id } }";
        let options = ExecuteOptions::default().with_tags(["users"]);
        h.optimizer.execute(mutation, json!({}), options.clone()).await.unwrap();
        h.optimizer.execute(mutation, json!({}), options).await.unwrap();

        assert_eq!(h.backend.calls(), 3);
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn subscription_documents_are_refused() {
        let h = harness().await;
        let err = h
            .optimizer
            .execute("subscription { userChanged { id } }", json!({}), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Internal(_)));
    }

    // ── Cancellation ────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn cancelled_subscriber_detaches_without_aborting_others() {
        let h = harness().await;
        h.backend.delay_ms.store(100, Ordering::SeqCst);
        let token = CancellationToken::new();

        let patient = {
            let optimizer = Arc::clone(&h.optimizer);
            tokio::spawn(async move { optimizer.execute(USERS, json!({}), ExecuteOptions::default()).await })
        };
        let impatient = {
            let optimizer = Arc::clone(&h.optimizer);
            let options = ExecuteOptions::default().with_cancel(token.clone());
            tokio::spawn(async move { optimizer.execute(USERS, json!({}), options).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        assert_eq!(impatient.await.unwrap().unwrap_err(), QueryError::Cancelled);
        assert!(patient.await.unwrap().is_ok());
        assert_eq!(h.backend.calls(), 1);
        assert_eq!(h.metrics.count(names::QUERY_ABANDONED, Duration::from_secs(60)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn last_subscriber_leaving_aborts_call() {
        let h = harness().await;
        h.backend.delay_ms.store(100, Ordering::SeqCst);

        let options = ExecuteOptions::default().with_deadline(Duration::from_millis(10));
        let err = h.optimizer.execute(USERS, json!({}), options).await.unwrap_err();
        assert_eq!(err, QueryError::DeadlineExceeded(Duration::from_millis(10)));

        assert_eq!(h.optimizer.in_flight_count(), 0);
        assert_eq!(h.metrics.count(names::QUERY_ABANDONED, Duration::from_secs(60)), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn already_cancelled_token_fails_fast() {
        let h = harness().await;
        let token = CancellationToken::new();
        token.cancel();
        let options = ExecuteOptions::default().with_cancel(token);
        let err = h.optimizer.execute(USERS, json!({}), options).await.unwrap_err();
        assert_eq!(err, QueryError::Cancelled);
    }

    // ── Batching ────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn distinct_queries_share_a_batch() {
        let config = OptimizerConfig {
            batch_window: Duration::from_millis(20),
            ..OptimizerConfig::default()
        };
        let h = harness_with(true, config, None).await;

        let mut handles = Vec::new();
        for i in 0..3 {
            let optimizer = Arc::clone(&h.optimizer);
            handles.push(tokio::spawn(async move {
                optimizer
                    .execute("query($n: Int) { item(n: $n) { id } }", json!({ "n": i }), ExecuteOptions::default())
                    .await
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(value["variables"]["n"], i);
        }

        assert_eq!(h.backend.batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.backend.batched_requests.load(Ordering::SeqCst), 3);
        assert_eq!(h.backend.calls(), 0);
        assert_eq!(h.metrics.aggregate(names::QUERY_BATCH_SIZE, Duration::from_secs(60)).max, 3.0);
    }

    #[tokio::test]
    async fn non_batching_backend_gets_one_call_per_fingerprint() {
        let h = harness().await;
        for i in 0..3 {
            h.optimizer
                .execute("query($n: Int) { item(n: $n) { id } }", json!({ "n": i }), ExecuteOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(h.backend.calls(), 3);
        assert_eq!(h.backend.batch_calls.load(Ordering::SeqCst), 0);
    }

    // ── Schema version forwarding ───────────────────────────────────

    struct StaticSchema;

    #[async_trait]
    impl SchemaSource for StaticSchema {
        async fn fetch_schema(&self) -> Result<SchemaDescriptor, TransportError> {
            Ok(SchemaDescriptor::new("v1"))
        }
    }

    #[tokio::test]
    async fn response_schema_version_marks_schema_stale() {
        let metrics = MetricsCollector::default();
        let schema = Arc::new(SchemaCache::new(Arc::new(StaticSchema), metrics));
        schema.get_schema().await.unwrap();

        let h = harness_with(false, OptimizerConfig::default(), Some(Arc::clone(&schema))).await;
        *h.backend.schema_version.lock() = Some("v2".to_string());
        assert!(!schema.is_stale());
        h.optimizer.execute(USERS, json!({}), ExecuteOptions::default()).await.unwrap();

        assert!(schema.is_stale());
    }
}
