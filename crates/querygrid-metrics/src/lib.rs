//! querygrid-metrics — observability for the QueryGrid layer.
//!
//! Every component records latency, hit/miss, and utilization samples into
//! a shared [`MetricsCollector`]. Reads aggregate over a sliding window.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector
//!   ├── record() / increment()  ← called by pool, caches, optimizer, bulk, subscriptions
//!   │     └── bounded channel (full → sample dropped, drop counter bumped)
//!   ├── aggregate(name, window) → count / sum / min / max / mean / p50 / p95 / p99
//!   └── run() → periodic summary log loop
//! ```

pub mod collector;
pub mod names;

pub use collector::{Aggregate, MetricSample, MetricsCollector};
