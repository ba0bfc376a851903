//! querygrid-pool — backend connection pool.
//!
//! A bounded set of reusable connections produced by an injected
//! [`ConnectionFactory`](querygrid_core::ConnectionFactory). Callers lease a
//! connection with [`ConnectionPool::acquire`]; the lease returns itself to
//! the pool when released or dropped.
//!
//! # Architecture
//!
//! ```text
//! acquire(timeout)
//!   → wait for a lease permit (semaphore sized max_size)
//!     → timed out → PoolExhausted (recorded in metrics)
//!   → idle connection available → reuse it
//!   → otherwise → factory.connect() → new slot
//!
//! maintenance task (every health_check_interval)
//!   ├── ping idle slots, close the unhealthy ones
//!   ├── close slots idle past idle_timeout above the warm target
//!   ├── grow / shrink the warm target from exhaustion + utilization metrics
//!   └── replenish up to the warm target (never below min_size)
//! ```

pub mod maintenance;
pub mod pool;

pub use maintenance::{MaintenanceHandle, MaintenanceReport};
pub use pool::{ConnectionPool, ConnectionSlot, PoolConfig, PoolStats, PooledConnection, SlotState};
