//! Query result cache with TTL expiration, LRU eviction, and tag invalidation.
//!
//! Entries are spread over independently locked shards keyed by
//! fingerprint, so a `put` only blocks readers of the same shard. Lookups
//! take the shard's read lock; LRU recency and hit counts are atomics on the
//! entry and never need the write lock.
//!
//! Capacity and LRU order are cache-wide. The entry count is an atomic
//! shared by every shard, and inserts of new keys are admitted one at a
//! time so the count cannot overshoot. Eviction picks its victim across
//! all shards, locking one shard at a time.
//!
//! Lock order is tag index, then admission, then shard. Only tagged
//! writes, tag invalidation, sweeps and `clear` touch the tag index.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use querygrid_core::{QueryFingerprint, QueryGridConfig};
use querygrid_metrics::{MetricsCollector, names};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::tags::TagIndex;

/// Configuration for the query cache.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    /// Maximum number of entries across all shards (default: 10000).
    pub capacity: usize,
    /// Number of lock shards (default: 16, clamped to `1..=capacity`).
    /// Sharding only spreads lock contention; capacity is not split.
    pub shards: usize,
    /// TTL applied when a put carries none (default: 60s).
    pub default_ttl: Duration,
    /// Interval of the background sweeper (default: 10s).
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            shards: 16,
            default_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl From<&QueryGridConfig> for CacheConfig {
    fn from(config: &QueryGridConfig) -> Self {
        Self {
            capacity: config.cache_capacity,
            shards: config.cache_shards,
            default_ttl: config.default_ttl(),
            sweep_interval: config.sweep_interval(),
        }
    }
}

/// A cached query result.
#[derive(Debug)]
pub struct CacheEntry {
    pub fingerprint: QueryFingerprint,
    pub value: Arc<Value>,
    pub inserted_at: Instant,
    pub expires_at: Instant,
    /// Serialized size of `value`.
    pub size_bytes: usize,
    pub tags: Vec<String>,
    hit_count: AtomicU64,
    /// Logical access clock for LRU ordering.
    last_access: AtomicU64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    fn touch(&self, tick: u64) {
        self.last_access.store(tick, Ordering::Relaxed);
        self.hit_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }
}

/// Accumulated cache statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub entries: usize,
    pub bytes: usize,
}

struct Shard {
    entries: HashMap<QueryFingerprint, CacheEntry>,
    bytes: usize,
    /// Entry count across every shard.
    total: Arc<AtomicUsize>,
}

impl Shard {
    fn insert(&mut self, entry: CacheEntry) {
        self.bytes += entry.size_bytes;
        match self.entries.insert(entry.fingerprint, entry) {
            Some(old) => self.bytes -= old.size_bytes,
            None => {
                self.total.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    fn remove(&mut self, fingerprint: &QueryFingerprint) -> Option<CacheEntry> {
        let entry = self.entries.remove(fingerprint)?;
        self.bytes -= entry.size_bytes;
        self.total.fetch_sub(1, Ordering::AcqRel);
        Some(entry)
    }

    fn clear(&mut self) {
        self.total.fetch_sub(self.entries.len(), Ordering::AcqRel);
        self.entries.clear();
        self.bytes = 0;
    }
}

/// Entry chosen for eviction.
struct Victim {
    shard: usize,
    fingerprint: QueryFingerprint,
    expired: bool,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

/// Sharded query result cache.
pub struct QueryCache {
    config: CacheConfig,
    shards: Vec<RwLock<Shard>>,
    total: Arc<AtomicUsize>,
    /// Serializes inserts of new keys so `total` never passes `capacity`.
    admission: Mutex<()>,
    tags: RwLock<TagIndex>,
    clock: AtomicU64,
    counters: Counters,
    metrics: MetricsCollector,
}

impl QueryCache {
    pub fn new(config: CacheConfig, metrics: MetricsCollector) -> Self {
        let shard_count = config.shards.clamp(1, config.capacity.max(1));
        let total = Arc::new(AtomicUsize::new(0));
        let shards = (0..shard_count)
            .map(|_| {
                RwLock::new(Shard {
                    entries: HashMap::new(),
                    bytes: 0,
                    total: Arc::clone(&total),
                })
            })
            .collect();

        Self {
            config,
            shards,
            total,
            admission: Mutex::new(()),
            tags: RwLock::new(TagIndex::default()),
            clock: AtomicU64::new(0),
            counters: Counters::default(),
            metrics,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, fingerprint: &QueryFingerprint) -> &RwLock<Shard> {
        &self.shards[fingerprint.bucket(self.shards.len())]
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a fingerprint. Expired entries are removed and count as a miss.
    pub fn get(&self, fingerprint: &QueryFingerprint) -> Option<Arc<Value>> {
        let now = Instant::now();
        let shard = self.shard(fingerprint);

        {
            let guard = shard.read();
            match guard.entries.get(fingerprint) {
                Some(entry) if !entry.is_expired(now) => {
                    entry.touch(self.tick());
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    self.metrics.increment(names::CACHE_HIT);
                    debug!(fingerprint = %fingerprint.short(), "query cache hit");
                    return Some(Arc::clone(&entry.value));
                }
                Some(_) => {}
                None => {
                    self.record_miss(fingerprint);
                    return None;
                }
            }
        }

        let mut guard = shard.write();
        if guard
            .entries
            .get(fingerprint)
            .is_some_and(|entry| entry.is_expired(now))
        {
            guard.remove(fingerprint);
            drop(guard);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.metrics.increment(names::CACHE_EXPIRED);
        }
        self.record_miss(fingerprint);
        None
    }

    fn record_miss(&self, fingerprint: &QueryFingerprint) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment(names::CACHE_MISS);
        debug!(fingerprint = %fingerprint.short(), "query cache miss");
    }

    /// Store a result. `ttl` falls back to the configured default; a zero
    /// TTL stores nothing. A new key arriving at a full cache evicts an
    /// expired entry if there is one, otherwise the least recently used.
    pub fn put(
        &self,
        fingerprint: QueryFingerprint,
        value: impl Into<Arc<Value>>,
        ttl: Option<Duration>,
        tags: &[String],
    ) {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        if ttl.is_zero() || self.config.capacity == 0 {
            return;
        }

        let value = value.into();
        let now = Instant::now();
        let entry = CacheEntry {
            fingerprint,
            size_bytes: serde_json::to_vec(value.as_ref()).map_or(0, |bytes| bytes.len()),
            value,
            inserted_at: now,
            expires_at: now + ttl,
            tags: tags.to_vec(),
            hit_count: AtomicU64::new(0),
            last_access: AtomicU64::new(self.tick()),
        };

        let index = if tags.is_empty() {
            None
        } else {
            let mut index = self.tags.write();
            index.add(fingerprint, tags);
            Some(index)
        };

        let shard = self.shard(&fingerprint);
        let mut guard = shard.write();
        if guard.entries.contains_key(&fingerprint) {
            guard.insert(entry);
        } else {
            drop(guard);
            let admission = self.admission.lock();
            while self.total.load(Ordering::Acquire) >= self.config.capacity {
                if !self.evict_one(now) {
                    break;
                }
            }
            shard.write().insert(entry);
            drop(admission);
        }
        drop(index);

        debug!(fingerprint = %fingerprint.short(), ttl = ?ttl, tags = tags.len(), "query cache put");
    }

    /// Remove one expired entry if any exists, otherwise the least recently
    /// used entry in the whole cache. Returns `false` when the cache is empty.
    fn evict_one(&self, now: Instant) -> bool {
        let Some(victim) = self.find_victim(now) else {
            return false;
        };
        let removed = self.shards[victim.shard]
            .write()
            .remove(&victim.fingerprint)
            .is_some();
        if !removed {
            // Removed concurrently; the caller rechecks the count.
            return true;
        }

        if victim.expired {
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.metrics.increment(names::CACHE_EXPIRED);
        } else {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            self.metrics.increment(names::CACHE_EVICTION);
            debug!(fingerprint = %victim.fingerprint.short(), "evicted LRU cache entry");
        }
        true
    }

    fn find_victim(&self, now: Instant) -> Option<Victim> {
        let mut lru: Option<(u64, Victim)> = None;
        for (index, shard) in self.shards.iter().enumerate() {
            let shard = shard.read();
            for entry in shard.entries.values() {
                if entry.is_expired(now) {
                    return Some(Victim {
                        shard: index,
                        fingerprint: entry.fingerprint,
                        expired: true,
                    });
                }
                let access = entry.last_access.load(Ordering::Relaxed);
                if lru.as_ref().is_none_or(|(oldest, _)| access < *oldest) {
                    lru = Some((
                        access,
                        Victim {
                            shard: index,
                            fingerprint: entry.fingerprint,
                            expired: false,
                        },
                    ));
                }
            }
        }
        lru.map(|(_, victim)| victim)
    }

    /// Remove one entry. Returns whether it was present.
    pub fn invalidate(&self, fingerprint: &QueryFingerprint) -> bool {
        let removed = self.shard(fingerprint).write().remove(fingerprint).is_some();
        if removed {
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
            self.metrics.increment(names::CACHE_INVALIDATION);
        }
        removed
    }

    /// Remove every entry carrying `tag`, and no entry that does not.
    /// Returns the number removed.
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut index = self.tags.write();
        let mut removed = 0;
        for fingerprint in index.take(tag) {
            let mut shard = self.shard(&fingerprint).write();
            if shard
                .entries
                .get(&fingerprint)
                .is_some_and(|entry| entry.has_tag(tag))
            {
                shard.remove(&fingerprint);
                removed += 1;
                self.metrics.increment(names::CACHE_INVALIDATION);
            }
        }
        drop(index);

        self.counters
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        debug!(tag, removed, "invalidated cache entries by tag");
        removed
    }

    /// Remove all expired entries and prune stale tag index records.
    /// Returns the number of entries removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        for shard in &self.shards {
            let mut shard = shard.write();
            let expired: Vec<_> = shard
                .entries
                .values()
                .filter(|entry| entry.is_expired(now))
                .map(|entry| entry.fingerprint)
                .collect();
            for fingerprint in expired {
                shard.remove(&fingerprint);
                removed += 1;
                self.metrics.increment(names::CACHE_EXPIRED);
            }
        }

        self.tags.write().retain(|tag, fingerprint| {
            self.shard(fingerprint)
                .read()
                .entries
                .get(fingerprint)
                .is_some_and(|entry| entry.has_tag(tag))
        });

        self.counters
            .expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            debug!(removed, "swept expired cache entries");
        }
        removed
    }

    /// Run `sweep_expired` every `interval` until shut down.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let (shutdown_tx, mut shutdown) = watch::channel(false);
        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        cache.sweep_expired();
                    }
                    _ = shutdown.changed() => {
                        debug!("cache sweeper shutting down");
                        break;
                    }
                }
            }
        });
        info!(interval = ?interval, "cache sweeper started");
        SweeperHandle {
            handle,
            shutdown_tx,
        }
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let mut index = self.tags.write();
        index.clear();
        for shard in &self.shards {
            shard.write().clear();
        }
    }

    /// Look up a live value without counting a hit or miss.
    pub fn peek(&self, fingerprint: &QueryFingerprint) -> Option<Arc<Value>> {
        let now = Instant::now();
        self.shard(fingerprint)
            .read()
            .entries
            .get(fingerprint)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| Arc::clone(&entry.value))
    }

    /// Read an entry without counting a hit or refreshing its recency.
    pub fn inspect<R>(
        &self,
        fingerprint: &QueryFingerprint,
        f: impl FnOnce(&CacheEntry) -> R,
    ) -> Option<R> {
        self.shard(fingerprint).read().entries.get(fingerprint).map(f)
    }

    pub fn len(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, bytes) = self.shards.iter().fold((0, 0), |(n, b), shard| {
            let shard = shard.read();
            (n + shard.entries.len(), b + shard.bytes)
        });
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            entries,
            bytes,
        }
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("config", &self.config)
            .field("shards", &self.shards.len())
            .finish_non_exhaustive()
    }
}

/// Handle to a running sweeper task.
pub struct SweeperHandle {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}
