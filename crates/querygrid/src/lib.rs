//! querygrid — performance layer between a GraphQL API and its backend.
//!
//! [`QueryGrid`] wires every component together:
//!
//! ```text
//!             execute()                 submit_bulk()       subscribe()
//!                │                           │                   │
//!         QueryOptimizer              BulkProcessor     SubscriptionManager
//!        ┌──────┴───────┐                    │                   │
//!   QueryCache    SchemaCache                │          SubscriptionTransport
//!        └──────┬───────┘                    │
//!               └────────── ConnectionPool ──┘
//!                                │
//!                        ConnectionFactory
//! ```
//!
//! All components report into one [`MetricsCollector`].

pub mod grid;
mod schema_source;

pub use grid::{QueryGrid, QueryGridBuilder};
pub use schema_source::PoolSchemaSource;

pub use querygrid_bulk::{BulkConfig, BulkHandle, BulkOptions, BulkProgress, BulkReport, ChunkFailure, ChunkOutcome};
pub use querygrid_cache::{CacheConfig, CacheStats, QueryCache, SchemaCache, SchemaSource};
pub use querygrid_core::*;
pub use querygrid_metrics::{Aggregate, MetricsCollector, names};
pub use querygrid_optimizer::{CancellationToken, CostEstimate, ExecuteOptions, OptimizerConfig};
pub use querygrid_pool::{PoolConfig, PoolStats};
pub use querygrid_subscription::{
    CloseReason, Subscription, SubscriptionConfig, SubscriptionEvent, SubscriptionState,
};
