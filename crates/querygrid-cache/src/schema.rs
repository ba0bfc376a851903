//! Schema cache — the backend's schema descriptor, refreshed only when the
//! backend reports a new version token or on explicit invalidation.
//!
//! Refresh is single-flight: callers that arrive while a fetch is running
//! wait for it and share its outcome, error included.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use querygrid_core::{QueryError, QueryResult, SchemaDescriptor, TransportError};
use querygrid_metrics::{MetricsCollector, names};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Where schema descriptors come from.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn fetch_schema(&self) -> Result<SchemaDescriptor, TransportError>;
}

#[derive(Default)]
struct Snapshot {
    schema: Option<Arc<SchemaDescriptor>>,
    stale: bool,
    /// Bumped whenever the snapshot is marked stale.
    generation: u64,
    /// Newest differing token observed; `None` after an explicit invalidation.
    latest_token: Option<String>,
}

/// Outcome of the most recent fetch, tagged with its completion number.
type LastFetch = Option<(u64, QueryResult<Arc<SchemaDescriptor>>)>;

/// Holds at most one schema snapshot.
pub struct SchemaCache {
    source: Arc<dyn SchemaSource>,
    snapshot: RwLock<Snapshot>,
    refresh: Mutex<LastFetch>,
    completed: AtomicU64,
    metrics: MetricsCollector,
}

impl SchemaCache {
    pub fn new(source: Arc<dyn SchemaSource>, metrics: MetricsCollector) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Snapshot::default()),
            refresh: Mutex::new(None),
            completed: AtomicU64::new(0),
            metrics,
        }
    }

    /// Current schema, fetching it first if there is no fresh snapshot.
    pub async fn get_schema(&self) -> QueryResult<Arc<SchemaDescriptor>> {
        if let Some(schema) = self.fresh() {
            return Ok(schema);
        }

        let ticket = self.completed.load(Ordering::Acquire);
        let mut last = self.refresh.lock().await;

        // Another caller refreshed while we waited.
        if let Some(schema) = self.fresh() {
            return Ok(schema);
        }
        // A fetch finished after we arrived; share its outcome.
        if let Some((seq, outcome)) = last.as_ref() {
            if *seq > ticket {
                return outcome.clone();
            }
        }

        debug!("refreshing schema");
        let started = self.snapshot.read().generation;
        let outcome = match self.source.fetch_schema().await {
            Ok(schema) => {
                let schema = Arc::new(schema);
                let previous = {
                    let mut snapshot = self.snapshot.write();
                    // Staleness raised mid-fetch survives unless the fetch
                    // already returned the newest observed version.
                    let superseded = snapshot.generation != started
                        && snapshot.latest_token.as_deref() != Some(schema.version.as_str());
                    if superseded {
                        debug!(version = %schema.version, "schema changed again during refresh");
                    }
                    snapshot.stale = superseded;
                    snapshot.schema.replace(Arc::clone(&schema))
                };
                self.metrics.increment(names::SCHEMA_REFRESH);
                info!(
                    version = %schema.version,
                    previous = previous.as_ref().map_or("none", |p| p.version.as_str()),
                    types = schema.types.len(),
                    "schema refreshed"
                );
                Ok(schema)
            }
            Err(e) => {
                self.metrics.increment(names::SCHEMA_REFRESH_FAILED);
                warn!(error = %e, "schema refresh failed");
                Err(QueryError::from(e))
            }
        };
        let seq = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        *last = Some((seq, outcome.clone()));
        outcome
    }

    fn fresh(&self) -> Option<Arc<SchemaDescriptor>> {
        let snapshot = self.snapshot.read();
        match &snapshot.schema {
            Some(schema) if !snapshot.stale => Some(Arc::clone(schema)),
            _ => None,
        }
    }

    /// Record a version token seen in backend response metadata. Marks the
    /// snapshot stale when the token differs. Returns whether it did.
    pub fn observe_version(&self, token: &str) -> bool {
        let mut snapshot = self.snapshot.write();
        let changed = snapshot
            .schema
            .as_ref()
            .is_some_and(|schema| schema.version != token);
        if changed {
            if !snapshot.stale {
                debug!(token, "schema version changed, snapshot marked stale");
            }
            snapshot.stale = true;
            snapshot.generation += 1;
            snapshot.latest_token = Some(token.to_string());
        }
        changed
    }

    /// Force the next `get_schema` to refetch.
    pub fn invalidate(&self) {
        let mut snapshot = self.snapshot.write();
        snapshot.stale = true;
        snapshot.generation += 1;
        snapshot.latest_token = None;
    }

    /// Whether the next `get_schema` will refetch.
    pub fn is_stale(&self) -> bool {
        let snapshot = self.snapshot.read();
        snapshot.schema.is_none() || snapshot.stale
    }

    /// The cached snapshot, fresh or stale, without fetching.
    pub fn snapshot(&self) -> Option<Arc<SchemaDescriptor>> {
        self.snapshot.read().schema.clone()
    }

    pub fn version(&self) -> Option<String> {
        self.snapshot
            .read()
            .schema
            .as_ref()
            .map(|schema| schema.version.clone())
    }
}

impl std::fmt::Debug for SchemaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaCache")
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}
