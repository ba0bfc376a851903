//! querygrid-core — shared vocabulary for the QueryGrid performance layer.
//!
//! Every other QueryGrid crate builds on the types defined here:
//!
//! - **`config`** — `QueryGridConfig`, the TOML-backed configuration surface
//! - **`error`** — `QueryError` / `TransportError` taxonomy
//! - **`fingerprint`** — deterministic request identity (`QueryFingerprint`)
//! - **`backoff`** — bounded, jittered exponential backoff
//! - **`transport`** — downstream traits the backend integration implements
//! - **`types`** — requests, responses, change events, schema snapshots

pub mod backoff;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod transport;
pub mod types;

pub use backoff::Backoff;
pub use config::QueryGridConfig;
pub use error::{ConfigError, QueryError, QueryResult, TransportError};
pub use fingerprint::{QueryFingerprint, RequestContext};
pub use transport::{BackendConnection, ConnectionFactory, EventStream, SubscriptionTransport};
pub use types::*;
