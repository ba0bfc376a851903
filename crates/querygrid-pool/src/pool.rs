//! Bounded pool of backend connections.
//!
//! Capacity is enforced by a semaphore with `max_size` permits. A permit is
//! held by every lease, every connection being created, and every idle
//! connection under a health probe. A new connection is only dialed by a
//! permit holder that found the idle list empty, so the slot table never
//! grows past `max_size`.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use querygrid_core::{
    BackendConnection, BackendResponse, ConfigError, ConnectionFactory, QueryError,
    QueryGridConfig, QueryRequest, QueryResult, SchemaDescriptor, TransportError,
};
use querygrid_metrics::{MetricsCollector, names};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Configuration for the connection pool.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolConfig {
    /// Connections kept open at all times (default: 2).
    pub min_size: usize,
    /// Hard upper bound on open connections (default: 10).
    pub max_size: usize,
    /// Idle connections older than this are closed above the warm target (default: 300s).
    pub idle_timeout: Duration,
    /// Interval of the maintenance task (default: 30s).
    pub health_check_interval: Duration,
    /// Longest an `acquire` waits for a free connection (default: 5s).
    pub acquire_timeout: Duration,
    /// How long `drain()` waits for outstanding leases (default: 30s).
    pub drain_timeout: Duration,
    /// Mean utilization below which the warm target shrinks (default: 0.25).
    pub low_utilization: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(30),
            low_utilization: 0.25,
        }
    }
}

impl From<&QueryGridConfig> for PoolConfig {
    fn from(config: &QueryGridConfig) -> Self {
        Self {
            min_size: config.pool_min,
            max_size: config.pool_max,
            idle_timeout: config.idle_timeout(),
            health_check_interval: config.health_check_interval(),
            acquire_timeout: config.acquire_timeout(),
            drain_timeout: config.drain_timeout(),
            ..Self::default()
        }
    }
}

/// Lifecycle state of a pooled connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    InUse,
    Unhealthy,
    Closed,
}

/// Bookkeeping for one pooled connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSlot {
    pub id: u64,
    pub state: SlotState,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub use_count: u64,
}

/// Point-in-time pool statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently leased to callers.
    pub in_use: usize,
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Open connections plus connections being dialed.
    pub total: usize,
    /// Size the maintenance task keeps the pool warm at.
    pub warm_target: usize,
    /// Number of acquires that timed out.
    pub exhausted_count: u64,
}

pub(crate) struct IdleConnection {
    pub(crate) id: u64,
    pub(crate) conn: Box<dyn BackendConnection>,
}

pub(crate) struct PoolState {
    pub(crate) slots: HashMap<u64, ConnectionSlot>,
    /// Most recently used at the back.
    pub(crate) idle: VecDeque<IdleConnection>,
    pub(crate) pending: usize,
    pub(crate) warm_target: usize,
    pub(crate) exhausted_count: u64,
    /// Sizing signals accumulated since the last warm target adjustment.
    pub(crate) pressure: PressureSample,
}

#[derive(Debug, Default)]
pub(crate) struct PressureSample {
    pub(crate) exhausted_seen: u64,
    pub(crate) utilization_sum: f64,
    pub(crate) utilization_samples: u64,
}

impl PoolState {
    pub(crate) fn total(&self) -> usize {
        self.slots.len() + self.pending
    }

    fn in_use(&self) -> usize {
        self.slots
            .values()
            .filter(|s| s.state == SlotState::InUse)
            .count()
    }
}

/// Connection pool shared by every component that talks to the backend.
pub struct ConnectionPool {
    pub(crate) config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    pub(crate) metrics: MetricsCollector,
    pub(crate) state: Mutex<PoolState>,
    pub(crate) permits: Arc<Semaphore>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Create the pool and eagerly dial `min_size` connections.
    pub async fn open(
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        metrics: MetricsCollector,
    ) -> QueryResult<Arc<Self>> {
        if config.max_size == 0 {
            return Err(ConfigError::Invalid("pool max_size must be at least 1".into()).into());
        }
        if config.min_size > config.max_size {
            return Err(ConfigError::Invalid(format!(
                "pool min_size ({}) exceeds max_size ({})",
                config.min_size, config.max_size
            ))
            .into());
        }

        let pool = Arc::new(Self {
            permits: Arc::new(Semaphore::new(config.max_size)),
            state: Mutex::new(PoolState {
                slots: HashMap::new(),
                idle: VecDeque::new(),
                pending: 0,
                warm_target: config.min_size,
                exhausted_count: 0,
                pressure: PressureSample::default(),
            }),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            config,
            factory,
            metrics,
        });

        for _ in 0..pool.config.min_size {
            if let Err(e) = pool.create_idle().await {
                tracing::error!(error = %e, "failed to open minimum pool connections");
                pool.close_idle().await;
                return Err(e.into());
            }
        }

        tracing::info!(
            min_size = pool.config.min_size,
            max_size = pool.config.max_size,
            "connection pool opened"
        );
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether connections from this pool accept multi-operation calls.
    pub fn supports_batching(&self) -> bool {
        self.factory.supports_batching()
    }

    /// Lease a connection.
    ///
    /// Waits at most `timeout` (capped at the configured `acquire_timeout`)
    /// for an idle connection or free capacity, then fails with
    /// [`QueryError::PoolExhausted`].
    pub async fn acquire(self: &Arc<Self>, timeout: Option<Duration>) -> QueryResult<PooledConnection> {
        if self.is_closed() {
            return Err(QueryError::PoolClosed);
        }

        let wait = timeout.map_or(self.config.acquire_timeout, |t| {
            t.min(self.config.acquire_timeout)
        });
        let started = Instant::now();

        let permit = match tokio::time::timeout(wait, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(QueryError::PoolClosed),
            Err(_) => {
                self.state.lock().exhausted_count += 1;
                self.metrics.increment(names::POOL_EXHAUSTED);
                tracing::warn!(
                    waited = ?wait,
                    max_size = self.config.max_size,
                    "connection pool exhausted"
                );
                return Err(QueryError::PoolExhausted { timeout: wait });
            }
        };

        let reused = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let idle = state.idle.pop_back();
            if let Some(idle) = &idle {
                if let Some(slot) = state.slots.get_mut(&idle.id) {
                    slot.state = SlotState::InUse;
                    slot.last_used_at = Instant::now();
                    slot.use_count += 1;
                }
            }
            idle
        };

        let (id, conn) = match reused {
            Some(idle) => {
                tracing::debug!(slot = idle.id, "reusing idle connection");
                (idle.id, idle.conn)
            }
            None => {
                let pending = PendingCreate::begin(self);
                let result = self.factory.connect().await;
                let mut state = self.state.lock();
                pending.finish(&mut state);
                match result {
                    Ok(conn) => {
                        let id = self.insert_slot(&mut state, SlotState::InUse);
                        tracing::debug!(slot = id, total = state.total(), "created new connection");
                        (id, conn)
                    }
                    Err(e) => {
                        drop(state);
                        tracing::warn!(error = %e, "failed to create backend connection");
                        return Err(e.into());
                    }
                }
            }
        };

        self.metrics
            .record_duration(names::POOL_ACQUIRE_LATENCY_MS, started.elapsed());
        self.record_utilization();

        Ok(PooledConnection {
            id,
            conn,
            permit: Some(permit),
            pool: Arc::clone(self),
            broken: false,
            in_call: false,
            checked_in: false,
        })
    }

    /// Return a lease to the pool, closing it if it was marked broken.
    pub async fn release(&self, mut lease: PooledConnection) {
        if let Some(conn) = lease.check_in() {
            self.close_slot(lease.id, conn, "broken").await;
            self.replace_below_min().await;
        }
    }

    /// Close a lease's connection instead of returning it to the pool.
    pub async fn invalidate(&self, mut lease: PooledConnection) {
        lease.broken = true;
        if let Some(conn) = lease.check_in() {
            self.close_slot(lease.id, conn, "invalidated").await;
            self.replace_below_min().await;
        }
    }

    /// Snapshot of every slot, ordered by id.
    pub fn slots(&self) -> Vec<ConnectionSlot> {
        let state = self.state.lock();
        let mut slots: Vec<_> = state.slots.values().cloned().collect();
        slots.sort_by_key(|s| s.id);
        slots
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            in_use: state.in_use(),
            idle: state.idle.len(),
            total: state.total(),
            warm_target: state.warm_target,
            exhausted_count: state.exhausted_count,
        }
    }

    /// Log pool statistics at `tracing::info` level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        tracing::info!(
            in_use = stats.in_use,
            idle = stats.idle,
            total = stats.total,
            warm_target = stats.warm_target,
            exhausted = stats.exhausted_count,
            "pool statistics"
        );
    }

    /// Stop accepting acquires, wait for outstanding leases up to
    /// `drain_timeout`, then close every idle connection.
    ///
    /// Returns the number of leases still outstanding when the timeout
    /// expired. Those connections are closed as their holders return them.
    pub async fn drain(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
        tracing::info!(drain_timeout = ?self.config.drain_timeout, "connection pool draining started");

        let deadline = Instant::now() + self.config.drain_timeout;
        let poll_interval = Duration::from_millis(50);
        let outstanding = loop {
            let in_use = self.state.lock().in_use();
            if in_use == 0 {
                tracing::info!("all leased connections returned");
                break 0;
            }
            if Instant::now() >= deadline {
                tracing::warn!(remaining = in_use, "drain timeout expired with leases outstanding");
                break in_use;
            }
            tokio::time::sleep(poll_interval).await;
        };

        let closed = self.close_idle().await;
        tracing::info!(closed, outstanding, "connection pool drain complete");
        outstanding
    }

    // ── Internals shared with the maintenance task ──────────────────

    /// Dial one connection straight into the idle list.
    ///
    /// Returns `Ok(false)` when no capacity is free.
    pub(crate) async fn create_idle(&self) -> Result<bool, TransportError> {
        let Ok(_permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            return Ok(false);
        };
        let pending = PendingCreate::begin(self);
        let result = self.factory.connect().await;
        let mut state = self.state.lock();
        pending.finish(&mut state);
        let conn = result?;
        let id = self.insert_slot(&mut state, SlotState::Idle);
        state.idle.push_back(IdleConnection { id, conn });
        Ok(true)
    }

    /// Mark a slot closed, close the transport, then drop the slot.
    pub(crate) async fn close_slot(
        &self,
        id: u64,
        mut conn: Box<dyn BackendConnection>,
        reason: &'static str,
    ) {
        if let Some(slot) = self.state.lock().slots.get_mut(&id) {
            slot.state = SlotState::Closed;
        }
        conn.close().await;
        self.state.lock().slots.remove(&id);
        self.metrics.increment(names::POOL_CONNECTION_CLOSED);
        tracing::debug!(slot = id, reason, "closed pooled connection");
    }

    pub(crate) async fn close_idle(&self) -> usize {
        let idle: Vec<_> = self.state.lock().idle.drain(..).collect();
        let count = idle.len();
        for conn in idle {
            self.close_slot(conn.id, conn.conn, "drain").await;
        }
        count
    }

    fn insert_slot(&self, state: &mut PoolState, slot_state: SlotState) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        state.slots.insert(
            id,
            ConnectionSlot {
                id,
                state: slot_state,
                created_at: now,
                last_used_at: now,
                use_count: u64::from(slot_state == SlotState::InUse),
            },
        );
        self.metrics.increment(names::POOL_CONNECTION_CREATED);
        id
    }

    /// Best-effort replacement after a connection was closed.
    async fn replace_below_min(&self) {
        if self.is_closed() || self.state.lock().total() >= self.config.min_size {
            return;
        }
        if let Err(e) = self.create_idle().await {
            tracing::warn!(error = %e, "failed to replace closed connection");
        }
    }

    /// Put a leased connection back. Returns the connection when it must be
    /// closed instead.
    fn check_in(
        &self,
        id: u64,
        conn: Box<dyn BackendConnection>,
        broken: bool,
    ) -> Option<Box<dyn BackendConnection>> {
        let mut state = self.state.lock();
        let closing = broken || self.is_closed();
        match state.slots.get_mut(&id) {
            Some(slot) if !closing => {
                slot.state = SlotState::Idle;
                slot.last_used_at = Instant::now();
            }
            Some(slot) => {
                slot.state = SlotState::Closed;
                return Some(conn);
            }
            None => return Some(conn),
        }
        state.idle.push_back(IdleConnection { id, conn });
        None
    }

    fn record_utilization(&self) {
        let utilization = {
            let mut state = self.state.lock();
            let utilization = state.in_use() as f64 / self.config.max_size as f64;
            state.pressure.utilization_sum += utilization;
            state.pressure.utilization_samples += 1;
            utilization
        };
        self.metrics.record(names::POOL_UTILIZATION, utilization);
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Counts a connection being dialed toward the pool total. Dropping it
/// without `finish` (a cancelled acquire) undoes the count.
struct PendingCreate<'a> {
    pool: &'a ConnectionPool,
    armed: bool,
}

impl<'a> PendingCreate<'a> {
    fn begin(pool: &'a ConnectionPool) -> Self {
        pool.state.lock().pending += 1;
        Self { pool, armed: true }
    }

    fn finish(mut self, state: &mut PoolState) {
        state.pending = state.pending.saturating_sub(1);
        self.armed = false;
    }
}

impl Drop for PendingCreate<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.state.lock();
            state.pending = state.pending.saturating_sub(1);
        }
    }
}

// ── Lease ───────────────────────────────────────────────────────────

/// A connection leased from the pool.
///
/// Derefs to the underlying [`BackendConnection`]. Dropping the lease
/// returns the connection to the pool, or closes it if it was marked
/// broken with [`mark_broken`](Self::mark_broken).
///
/// Backend calls made through the lease's own `call`, `call_batch` and
/// `introspect` are tracked: a lease dropped while one of them is still
/// pending has a request left on the wire, so its connection is closed.
pub struct PooledConnection {
    id: u64,
    conn: Box<dyn BackendConnection>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<ConnectionPool>,
    broken: bool,
    in_call: bool,
    checked_in: bool,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Report the connection as unusable; it will be closed, never reused.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Whether the connection will be closed rather than reused.
    pub fn is_broken(&self) -> bool {
        self.broken || self.in_call
    }

    pub async fn call(&mut self, request: &QueryRequest) -> Result<BackendResponse, TransportError> {
        self.in_call = true;
        let result = self.conn.call(request).await;
        self.in_call = false;
        result
    }

    pub async fn call_batch(
        &mut self,
        requests: &[QueryRequest],
    ) -> Result<Vec<Result<BackendResponse, TransportError>>, TransportError> {
        self.in_call = true;
        let result = self.conn.call_batch(requests).await;
        self.in_call = false;
        result
    }

    pub async fn introspect(&mut self) -> Result<SchemaDescriptor, TransportError> {
        self.in_call = true;
        let result = self.conn.introspect().await;
        self.in_call = false;
        result
    }

    /// Return the connection to its pool.
    pub async fn release(self) {
        let pool = Arc::clone(&self.pool);
        pool.release(self).await;
    }

    /// Close the connection instead of returning it.
    pub async fn invalidate(self) {
        let pool = Arc::clone(&self.pool);
        pool.invalidate(self).await;
    }

    /// Hand the connection back to the pool exactly once. The capacity
    /// permit is released after the connection is back in the idle list.
    fn check_in(&mut self) -> Option<Box<dyn BackendConnection>> {
        if self.checked_in {
            return None;
        }
        self.checked_in = true;
        let conn = std::mem::replace(&mut self.conn, Box::new(Detached));
        let to_close = self.pool.check_in(self.id, conn, self.is_broken());
        drop(self.permit.take());
        self.pool.record_utilization();
        to_close
    }
}

impl Deref for PooledConnection {
    type Target = dyn BackendConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.check_in() else {
            return;
        };
        let id = self.id;
        let reason = if self.in_call { "interrupted" } else { "broken" };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(&self.pool);
                handle.spawn(async move {
                    pool.close_slot(id, conn, reason).await;
                    pool.replace_below_min().await;
                });
            }
            Err(_) => {
                self.pool.state.lock().slots.remove(&id);
                self.pool.metrics.increment(names::POOL_CONNECTION_CLOSED);
            }
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("broken", &self.broken)
            .field("in_call", &self.in_call)
            .finish_non_exhaustive()
    }
}

/// Placeholder left in a lease after its connection was checked in.
#[derive(Debug)]
struct Detached;

#[async_trait]
impl BackendConnection for Detached {
    async fn call(&mut self, _request: &QueryRequest) -> Result<BackendResponse, TransportError> {
        Err(TransportError::Closed)
    }

    async fn ping(&mut self) -> bool {
        false
    }

    async fn close(&mut self) {}
}
