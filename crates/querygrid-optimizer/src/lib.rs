//! querygrid-optimizer — the read path between callers and the backend.
//!
//! # Architecture
//!
//! ```text
//! execute(query, variables, options)
//!   → cost score > ceiling → QueryTooExpensive
//!   → mutation → pool → backend, then invalidate option tags
//!   → cache hit → return
//!   → same fingerprint in flight → subscribe to its broadcast
//!   → otherwise → spawn the call
//!       → batcher (window of a few ms, backends with multi-operation support)
//!       → or one call on a pooled connection
//!       → populate cache → broadcast outcome → remove in-flight entry
//! ```

mod batcher;
pub mod cost;
pub mod optimizer;

pub use cost::{CostEstimate, estimate_cost};
pub use optimizer::{ExecuteOptions, OptimizerConfig, QueryOptimizer};
pub use tokio_util::sync::CancellationToken;
