//! Metric names emitted by QueryGrid components.

// Connection pool
pub const POOL_ACQUIRE_LATENCY_MS: &str = "pool.acquire_latency_ms";
pub const POOL_EXHAUSTED: &str = "pool.exhausted";
pub const POOL_UTILIZATION: &str = "pool.utilization";
pub const POOL_CONNECTION_CREATED: &str = "pool.connection_created";
pub const POOL_CONNECTION_CLOSED: &str = "pool.connection_closed";
pub const POOL_HEALTH_CHECK_FAILED: &str = "pool.health_check_failed";
pub const POOL_WARM_TARGET: &str = "pool.warm_target";

// Query cache
pub const CACHE_HIT: &str = "cache.hit";
pub const CACHE_MISS: &str = "cache.miss";
pub const CACHE_EVICTION: &str = "cache.eviction";
pub const CACHE_EXPIRED: &str = "cache.expired";
pub const CACHE_INVALIDATION: &str = "cache.invalidation";

// Schema cache
pub const SCHEMA_REFRESH: &str = "schema.refresh";
pub const SCHEMA_REFRESH_FAILED: &str = "schema.refresh_failed";

// Query optimizer
pub const QUERY_LATENCY_MS: &str = "query.latency_ms";
pub const QUERY_BACKEND_CALL: &str = "query.backend_call";
pub const QUERY_COALESCED: &str = "query.coalesced";
pub const QUERY_REJECTED: &str = "query.rejected";
pub const QUERY_FAILED: &str = "query.failed";
pub const QUERY_ABANDONED: &str = "query.abandoned";
pub const QUERY_BATCH_SIZE: &str = "query.batch_size";

// Subscriptions
pub const SUBSCRIPTION_EVENT: &str = "subscription.event";
pub const SUBSCRIPTION_RECONNECT_DELAY_MS: &str = "subscription.reconnect_delay_ms";
pub const SUBSCRIPTION_CLOSED: &str = "subscription.closed";

// Bulk processor
pub const BULK_CHUNK_SUCCEEDED: &str = "bulk.chunk_succeeded";
pub const BULK_CHUNK_FAILED: &str = "bulk.chunk_failed";
pub const BULK_CHUNK_RETRY: &str = "bulk.chunk_retry";
pub const BULK_CHUNK_LATENCY_MS: &str = "bulk.chunk_latency_ms";
