//! Bulk job progress, outcomes, and the caller-facing handle.

use std::collections::BTreeMap;

use querygrid_core::{QueryError, QueryResult};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Why a chunk failed, as kept in [`BulkProgress::failures`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChunkFailure {
    pub chunk: usize,
    pub attempts: u32,
    pub reason: String,
}

/// Incrementally updated counts for one job.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BulkProgress {
    pub total_chunks: usize,
    pub completed: usize,
    pub failed: usize,
    /// Chunks not yet finished, running ones included.
    pub pending: usize,
    /// The first N failures in the order they happened.
    pub failures: Vec<ChunkFailure>,
}

impl BulkProgress {
    pub(crate) fn new(total_chunks: usize) -> Self {
        Self {
            total_chunks,
            pending: total_chunks,
            ..Self::default()
        }
    }

    pub fn is_finished(&self) -> bool {
        self.pending == 0
    }

    pub(crate) fn record_success(&mut self) {
        self.completed += 1;
        self.pending = self.pending.saturating_sub(1);
    }

    pub(crate) fn record_failure(&mut self, failure: ChunkFailure, keep: usize) {
        self.failed += 1;
        self.pending = self.pending.saturating_sub(1);
        if self.failures.len() < keep {
            self.failures.push(failure);
        }
    }
}

/// Final result of one chunk.
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkOutcome {
    Succeeded { attempts: u32, data: Value },
    Failed(QueryError),
}

impl ChunkOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ChunkOutcome::Succeeded { .. })
    }
}

/// Per-chunk outcomes of a finished job, keyed by chunk index.
#[derive(Clone, Debug, Default)]
pub struct BulkReport {
    pub outcomes: BTreeMap<usize, ChunkOutcome>,
    pub progress: BulkProgress,
}

impl BulkReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed() == 0
    }

    /// Errors of the failed chunks, in chunk order.
    pub fn errors(&self) -> impl Iterator<Item = (usize, &QueryError)> {
        self.outcomes.iter().filter_map(|(index, outcome)| match outcome {
            ChunkOutcome::Failed(e) => Some((*index, e)),
            ChunkOutcome::Succeeded { .. } => None,
        })
    }
}

/// Handle to a running bulk job.
///
/// Dropping the handle does not stop the job; call [`BulkHandle::cancel`].
pub struct BulkHandle {
    pub(crate) id: u64,
    pub(crate) progress: watch::Receiver<BulkProgress>,
    pub(crate) task: JoinHandle<BulkReport>,
    pub(crate) cancel: CancellationToken,
}

impl BulkHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Latest progress snapshot.
    pub fn progress(&self) -> BulkProgress {
        self.progress.borrow().clone()
    }

    /// Wait for the next progress update. Returns `None` once the job has
    /// finished and every update was observed.
    pub async fn changed(&mut self) -> Option<BulkProgress> {
        self.progress.changed().await.ok()?;
        Some(self.progress.borrow_and_update().clone())
    }

    /// Stop scheduling chunks. Running chunks are interrupted and every
    /// unfinished chunk fails with `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for every chunk to finish.
    pub async fn wait(self) -> QueryResult<BulkReport> {
        self.task
            .await
            .map_err(|e| QueryError::Internal(format!("bulk job {} panicked: {e}", self.id)))
    }
}

impl std::fmt::Debug for BulkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkHandle")
            .field("id", &self.id)
            .field("progress", &*self.progress.borrow())
            .finish_non_exhaustive()
    }
}
