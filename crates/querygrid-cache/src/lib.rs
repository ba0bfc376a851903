//! querygrid-cache — result and schema caching.
//!
//! # Architecture
//!
//! ```text
//! QueryCache
//!   ├── shards[fingerprint.bucket(n)]  (RwLock each: reads concurrent, writes per shard)
//!   │     └── fingerprint → CacheEntry { value, expires_at, tags, hit_count, last access }
//!   ├── TagIndex  tag → fingerprints   (invalidate_by_tag)
//!   └── sweeper task → sweep_expired()
//!
//! SchemaCache
//!   └── one snapshot, refreshed single-flight when the version token moves
//! ```

pub mod query;
pub mod schema;
mod tags;

pub use query::{CacheConfig, CacheEntry, CacheStats, QueryCache, SweeperHandle};
pub use schema::{SchemaCache, SchemaSource};
