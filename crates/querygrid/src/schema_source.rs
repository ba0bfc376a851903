use std::sync::Arc;

use async_trait::async_trait;
use querygrid_cache::SchemaSource;
use querygrid_core::{QueryError, SchemaDescriptor, TransportError};
use querygrid_pool::ConnectionPool;
use tracing::debug;

/// Fetches schema descriptors by introspecting through a pooled connection.
pub struct PoolSchemaSource {
    pool: Arc<ConnectionPool>,
}

impl PoolSchemaSource {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchemaSource for PoolSchemaSource {
    async fn fetch_schema(&self) -> Result<SchemaDescriptor, TransportError> {
        let mut conn = self.pool.acquire(None).await.map_err(|e| match e {
            QueryError::Transport(e) => e,
            other => TransportError::Unreachable(other.to_string()),
        })?;

        debug!(slot = conn.id(), "introspecting backend schema");
        let result = conn.introspect().await;
        if let Err(e) = &result {
            if e.is_connection_fatal() {
                conn.mark_broken();
            }
        }
        conn.release().await;
        result
    }
}
