//! Metrics collector — append-only samples with windowed aggregation.
//!
//! Writers push into a bounded channel with `try_send`, so recording a sample
//! never waits on a lock held by a reader. Readers drain the channel into a
//! retained window before aggregating.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use querygrid_core::QueryGridConfig;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

/// A single recorded observation. Never mutated after ingestion.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub name: &'static str,
    pub timestamp: Instant,
    pub value: f64,
    pub tags: BTreeMap<&'static str, String>,
}

/// Aggregated view of one metric over a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Aggregate {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

struct Inner {
    tx: mpsc::Sender<MetricSample>,
    rx: Mutex<mpsc::Receiver<MetricSample>>,
    /// Drained samples, oldest first.
    retained: Mutex<VecDeque<MetricSample>>,
    retention: Duration,
    max_retained: usize,
    ingested: AtomicU64,
    dropped: AtomicU64,
}

/// Process-wide metrics sink shared by every QueryGrid component.
///
/// Cloning is cheap; all clones feed the same buffer.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Inner>,
}

impl MetricsCollector {
    /// Create a collector with an ingestion buffer of `buffer` samples that
    /// keeps drained samples for `retention`.
    pub fn new(buffer: usize, retention: Duration) -> Self {
        let buffer = buffer.max(1);
        let (tx, rx) = mpsc::channel(buffer);
        Self {
            inner: Arc::new(Inner {
                tx,
                rx: Mutex::new(rx),
                retained: Mutex::new(VecDeque::new()),
                retention,
                max_retained: buffer.saturating_mul(16),
                ingested: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &QueryGridConfig) -> Self {
        Self::new(config.metrics_buffer, config.metrics_retention())
    }

    /// Record a sample. Never blocks; drops the sample if the buffer is full.
    pub fn record(&self, name: &'static str, value: f64) {
        self.push(MetricSample {
            name,
            timestamp: Instant::now(),
            value,
            tags: BTreeMap::new(),
        });
    }

    /// Record a sample with tags.
    pub fn record_tagged(
        &self,
        name: &'static str,
        value: f64,
        tags: impl IntoIterator<Item = (&'static str, String)>,
    ) {
        self.push(MetricSample {
            name,
            timestamp: Instant::now(),
            value,
            tags: tags.into_iter().collect(),
        });
    }

    /// Record an occurrence (value `1.0`).
    pub fn increment(&self, name: &'static str) {
        self.record(name, 1.0);
    }

    /// Record a latency in milliseconds.
    pub fn record_duration(&self, name: &'static str, elapsed: Duration) {
        self.record(name, elapsed.as_secs_f64() * 1000.0);
    }

    fn push(&self, sample: MetricSample) {
        match self.inner.tx.try_send(sample) {
            Ok(()) => {
                self.inner.ingested.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Samples dropped because the ingestion buffer was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Samples accepted since creation.
    pub fn ingested(&self) -> u64 {
        self.inner.ingested.load(Ordering::Relaxed)
    }

    /// Aggregate every sample named `name` recorded within `window`.
    pub fn aggregate(&self, name: &str, window: Duration) -> Aggregate {
        self.aggregate_matching(window, |s| s.name == name)
    }

    /// Aggregate samples of `name` carrying tag `key = value`.
    pub fn aggregate_tagged(&self, name: &str, key: &str, value: &str, window: Duration) -> Aggregate {
        self.aggregate_matching(window, |s| {
            s.name == name && s.tags.get(key).is_some_and(|v| v == value)
        })
    }

    /// Number of samples named `name` within `window`.
    pub fn count(&self, name: &str, window: Duration) -> u64 {
        self.aggregate(name, window).count
    }

    /// `hits / (hits + misses)` over `window`, or 0.0 without traffic.
    pub fn hit_ratio(&self, hit: &str, miss: &str, window: Duration) -> f64 {
        let hits = self.aggregate(hit, window).sum;
        let misses = self.aggregate(miss, window).sum;
        let total = hits + misses;
        if total > 0.0 { hits / total } else { 0.0 }
    }

    /// Aggregates for every metric name seen within `window`.
    pub fn summary(&self, window: Duration) -> BTreeMap<&'static str, Aggregate> {
        self.drain();
        let names: BTreeSet<&'static str> = {
            let retained = self.inner.retained.lock();
            let cutoff = cutoff(window);
            retained
                .iter()
                .filter(|s| within(s, cutoff))
                .map(|s| s.name)
                .collect()
        };
        names
            .into_iter()
            .map(|name| (name, self.aggregate(name, window)))
            .collect()
    }

    fn aggregate_matching(&self, window: Duration, pred: impl Fn(&MetricSample) -> bool) -> Aggregate {
        self.drain();
        let cutoff = cutoff(window);
        let values: Vec<f64> = {
            let retained = self.inner.retained.lock();
            retained
                .iter()
                .filter(|s| within(s, cutoff) && pred(s))
                .map(|s| s.value)
                .collect()
        };
        compute_aggregate(values)
    }

    /// Move buffered samples into the retained window and prune old ones.
    fn drain(&self) {
        let mut rx = self.inner.rx.lock();
        let mut retained = self.inner.retained.lock();
        while let Ok(sample) = rx.try_recv() {
            retained.push_back(sample);
        }
        drop(rx);

        let cutoff = cutoff(self.inner.retention);
        while retained.front().is_some_and(|s| !within(s, cutoff)) {
            retained.pop_front();
        }
        while retained.len() > self.inner.max_retained {
            retained.pop_front();
        }
    }

    /// Periodically log a summary until the shutdown signal fires.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "metrics collector started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.log_summary(interval);
                }
                _ = shutdown.changed() => {
                    info!("metrics collector shutting down");
                    self.log_summary(interval);
                    break;
                }
            }
        }
    }

    fn log_summary(&self, window: Duration) {
        let summary = self.summary(window);
        for (name, agg) in &summary {
            info!(
                metric = %name,
                count = agg.count,
                sum = agg.sum,
                mean = agg.mean,
                p50 = agg.p50,
                p99 = agg.p99,
                "metrics summary"
            );
        }
        debug!(
            metrics = summary.len(),
            dropped = self.dropped(),
            "metrics summary logged"
        );
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("ingested", &self.ingested())
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::from_config(&QueryGridConfig::default())
    }
}

/// Earliest timestamp inside `window`; `None` when the window reaches back
/// past the clock's origin.
fn cutoff(window: Duration) -> Option<Instant> {
    Instant::now().checked_sub(window)
}

fn within(sample: &MetricSample, cutoff: Option<Instant>) -> bool {
    cutoff.is_none_or(|c| sample.timestamp >= c)
}

/// Nearest-rank percentiles over unsorted values.
fn compute_aggregate(mut values: Vec<f64>) -> Aggregate {
    if values.is_empty() {
        return Aggregate::default();
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let count = values.len();
    let sum: f64 = values.iter().sum();
    let pick = |q: f64| values[((count as f64 * q) as usize).min(count - 1)];

    Aggregate {
        count: count as u64,
        sum,
        min: values[0],
        max: values[count - 1],
        mean: sum / count as f64,
        p50: pick(0.50),
        p95: pick(0.95),
        p99: pick(0.99),
    }
}
