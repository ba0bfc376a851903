//! querygrid-bulk — splits large write batches into ordered chunks and runs
//! them against the connection pool with bounded parallelism.
//!
//! Each chunk is retried independently on transient failures. A chunk that
//! exhausts its attempts is recorded as failed without aborting its
//! siblings, so a job can finish partially successful.

pub mod job;
pub mod processor;

pub use job::{BulkHandle, BulkProgress, BulkReport, ChunkFailure, ChunkOutcome};
pub use processor::{BulkConfig, BulkOptions, BulkProcessor};
