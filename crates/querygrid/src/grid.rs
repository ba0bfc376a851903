//! The `QueryGrid` facade and its builder.

use std::sync::Arc;
use std::time::Duration;

use querygrid_bulk::{BulkConfig, BulkHandle, BulkOptions, BulkProcessor};
use querygrid_cache::{CacheConfig, CacheStats, QueryCache, SchemaCache, SweeperHandle};
use querygrid_core::{
    ConfigError, ConnectionFactory, QueryError, QueryGridConfig, QueryResult, SchemaDescriptor,
    SubscriptionTransport,
};
use querygrid_metrics::MetricsCollector;
use querygrid_optimizer::{ExecuteOptions, OptimizerConfig, QueryOptimizer};
use querygrid_pool::{ConnectionPool, MaintenanceHandle, PoolConfig, PoolStats};
use querygrid_subscription::{
    Subscription, SubscriptionConfig, SubscriptionEvent, SubscriptionManager, SubscriptionState,
};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::schema_source::PoolSchemaSource;

/// Background tasks owned by a running grid.
struct Background {
    maintenance: MaintenanceHandle,
    sweeper: SweeperHandle,
    metrics: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

/// Builder for [`QueryGrid`].
pub struct QueryGridBuilder {
    config: QueryGridConfig,
    factory: Option<Arc<dyn ConnectionFactory>>,
    transport: Option<Arc<dyn SubscriptionTransport>>,
    metrics: Option<MetricsCollector>,
    metrics_log_interval: Option<Duration>,
}

impl QueryGridBuilder {
    pub fn connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn subscription_transport(mut self, transport: Arc<dyn SubscriptionTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Report into an existing collector instead of creating one.
    pub fn metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Log a metrics summary at this interval while the grid runs.
    pub fn log_metrics_every(mut self, interval: Duration) -> Self {
        self.metrics_log_interval = Some(interval);
        self
    }

    /// Validate the configuration, open the pool, and start background
    /// maintenance. Must run inside a Tokio runtime.
    pub async fn build(self) -> QueryResult<QueryGrid> {
        let config = self.config;
        config.validate()?;
        let factory = self
            .factory
            .ok_or_else(|| ConfigError::Invalid("a connection factory is required".into()))?;
        let metrics = self
            .metrics
            .unwrap_or_else(|| MetricsCollector::from_config(&config));

        let pool = ConnectionPool::open(PoolConfig::from(&config), factory, metrics.clone()).await?;
        let cache = Arc::new(QueryCache::new(CacheConfig::from(&config), metrics.clone()));
        let schema = Arc::new(SchemaCache::new(
            Arc::new(PoolSchemaSource::new(Arc::clone(&pool))),
            metrics.clone(),
        ));
        let optimizer = QueryOptimizer::new(
            OptimizerConfig::from(&config),
            Arc::clone(&pool),
            Arc::clone(&cache),
            Some(Arc::clone(&schema)),
            metrics.clone(),
        );
        let bulk = BulkProcessor::new(
            Arc::clone(&pool),
            Some(Arc::clone(&cache)),
            BulkConfig::from(&config),
            metrics.clone(),
        );
        let subscriptions = self.transport.map(|transport| {
            SubscriptionManager::new(
                transport,
                Some(Arc::clone(&cache)),
                SubscriptionConfig::from(&config),
                metrics.clone(),
            )
        });

        let metrics_task = self.metrics_log_interval.map(|interval| {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let collector = metrics.clone();
            let handle = tokio::spawn(async move { collector.run(interval, shutdown_rx).await });
            (shutdown_tx, handle)
        });
        let background = Background {
            maintenance: pool.spawn_maintenance(),
            sweeper: cache.spawn_sweeper(config.sweep_interval()),
            metrics: metrics_task,
        };

        info!(
            pool_min = config.pool_min,
            pool_max = config.pool_max,
            cache_capacity = config.cache_capacity,
            batching = pool.supports_batching(),
            subscriptions = subscriptions.is_some(),
            "query grid started"
        );

        Ok(QueryGrid {
            config,
            metrics,
            pool,
            cache,
            schema,
            optimizer,
            bulk,
            subscriptions,
            background: parking_lot::Mutex::new(Some(background)),
        })
    }
}

/// Query performance layer facade.
pub struct QueryGrid {
    config: QueryGridConfig,
    metrics: MetricsCollector,
    pool: Arc<ConnectionPool>,
    cache: Arc<QueryCache>,
    schema: Arc<SchemaCache>,
    optimizer: Arc<QueryOptimizer>,
    bulk: BulkProcessor,
    subscriptions: Option<SubscriptionManager>,
    background: parking_lot::Mutex<Option<Background>>,
}

impl QueryGrid {
    pub fn builder(config: QueryGridConfig) -> QueryGridBuilder {
        QueryGridBuilder {
            config,
            factory: None,
            transport: None,
            metrics: None,
            metrics_log_interval: None,
        }
    }

    /// Run a query or mutation through the cost gate, cache and coalescer.
    pub async fn execute(
        &self,
        query: &str,
        variables: Value,
        options: ExecuteOptions,
    ) -> QueryResult<Arc<Value>> {
        self.optimizer.execute(query, variables, options).await
    }

    /// Start a bulk job. Chunk items reach the backend as the `items`
    /// variable of `options.operation`.
    pub fn submit_bulk(&self, items: Vec<Value>, options: BulkOptions) -> BulkHandle {
        self.bulk.submit(items, options)
    }

    /// Subscribe to change events on `topic`. Dropping or calling
    /// [`Subscription::unsubscribe`] on the result ends the registration.
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> QueryResult<Subscription>
    where
        F: Fn(SubscriptionEvent) + Send + Sync + 'static,
    {
        let manager = self.subscriptions.as_ref().ok_or_else(|| {
            QueryError::from(ConfigError::Invalid(
                "no subscription transport configured".into(),
            ))
        })?;
        Ok(manager.subscribe(topic, callback))
    }

    pub fn subscription_state(&self, topic: &str) -> SubscriptionState {
        self.subscriptions
            .as_ref()
            .map_or(SubscriptionState::Closed, |manager| manager.state(topic))
    }

    /// Drop every cached result carrying `tag`. Returns how many.
    pub fn invalidate_tag(&self, tag: &str) -> usize {
        self.cache.invalidate_by_tag(tag)
    }

    /// Current backend schema, fetched on first use or after a version change.
    pub async fn schema(&self) -> QueryResult<Arc<SchemaDescriptor>> {
        self.schema.get_schema().await
    }

    pub fn config(&self) -> &QueryGridConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn in_flight_count(&self) -> usize {
        self.optimizer.in_flight_count()
    }

    /// Close subscriptions, stop background tasks, and drain the pool.
    /// Returns the number of leases still outstanding after the drain
    /// timeout. Later calls only drain again.
    pub async fn shutdown(&self) -> usize {
        info!("query grid shutting down");
        if let Some(manager) = &self.subscriptions {
            manager.close_all().await;
        }

        let background = self.background.lock().take();
        if let Some(background) = background {
            background.maintenance.shutdown().await;
            background.sweeper.shutdown().await;
            if let Some((shutdown_tx, handle)) = background.metrics {
                let _ = shutdown_tx.send(true);
                let _ = handle.await;
            }
        }

        let outstanding = self.pool.drain().await;
        if outstanding > 0 {
            warn!(outstanding, "query grid stopped with leases still out");
        } else {
            info!("query grid stopped");
        }
        outstanding
    }
}

impl std::fmt::Debug for QueryGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryGrid")
            .field("pool", &self.pool.stats())
            .field("cache", &self.cache.stats())
            .field("in_flight", &self.optimizer.in_flight_count())
            .finish_non_exhaustive()
    }
}
