//! Batching window — merges requests for different fingerprints that arrive
//! within a few milliseconds into one multi-operation backend call.
//!
//! Only used when the connection factory reports batching support; other
//! backends get one call per fingerprint.

use std::sync::Arc;
use std::time::Duration;

use querygrid_core::{BackendResponse, QueryError, QueryRequest, QueryResult, TransportError};
use querygrid_metrics::{MetricsCollector, names};
use querygrid_pool::ConnectionPool;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

struct BatchItem {
    request: QueryRequest,
    reply: oneshot::Sender<QueryResult<BackendResponse>>,
}

/// Sender side of the batching task. The task exits once every clone is
/// dropped.
#[derive(Clone)]
pub(crate) struct Batcher {
    tx: mpsc::Sender<BatchItem>,
}

impl Batcher {
    pub(crate) fn spawn(
        pool: Arc<ConnectionPool>,
        metrics: MetricsCollector,
        window: Duration,
        max_batch_size: usize,
    ) -> (Self, JoinHandle<()>) {
        let max_batch_size = max_batch_size.max(1);
        let (tx, rx) = mpsc::channel(max_batch_size * 64);
        let handle = tokio::spawn(run(pool, metrics, window, max_batch_size, rx));
        debug!(window = ?window, max_batch_size, "query batcher started");
        (Self { tx }, handle)
    }

    /// Queue a request for the next batch and wait for its own response.
    pub(crate) async fn submit(&self, request: QueryRequest) -> QueryResult<BackendResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BatchItem { request, reply })
            .await
            .map_err(|_| QueryError::Internal("query batcher stopped".into()))?;
        rx.await
            .map_err(|_| QueryError::Internal("batched call dropped".into()))?
    }
}

async fn run(
    pool: Arc<ConnectionPool>,
    metrics: MetricsCollector,
    window: Duration,
    max_batch_size: usize,
    mut rx: mpsc::Receiver<BatchItem>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let close_at = Instant::now() + window;
        while batch.len() < max_batch_size {
            match tokio::time::timeout_at(close_at, rx.recv()).await {
                Ok(Some(item)) => batch.push(item),
                Ok(None) | Err(_) => break,
            }
        }
        tokio::spawn(dispatch(Arc::clone(&pool), metrics.clone(), batch));
    }
    debug!("query batcher stopped");
}

async fn dispatch(pool: Arc<ConnectionPool>, metrics: MetricsCollector, batch: Vec<BatchItem>) {
    metrics.record(names::QUERY_BATCH_SIZE, batch.len() as f64);
    let (requests, replies): (Vec<_>, Vec<_>) =
        batch.into_iter().map(|item| (item.request, item.reply)).unzip();

    let mut conn = match pool.acquire(None).await {
        Ok(conn) => conn,
        Err(e) => {
            for reply in replies {
                let _ = reply.send(Err(e.clone()));
            }
            return;
        }
    };

    metrics.increment(names::QUERY_BACKEND_CALL);
    debug!(size = requests.len(), slot = conn.id(), "dispatching query batch");
    let outcome = conn.call_batch(&requests).await;

    match outcome {
        Ok(results) if results.len() == replies.len() => {
            for (reply, result) in replies.into_iter().zip(results) {
                let _ = reply.send(result.map_err(QueryError::from));
            }
        }
        Ok(results) => {
            warn!(
                expected = replies.len(),
                received = results.len(),
                "backend returned a batch of the wrong size"
            );
            let e = TransportError::Protocol(format!(
                "batch of {} requests answered with {} results",
                replies.len(),
                results.len()
            ));
            conn.mark_broken();
            for reply in replies {
                let _ = reply.send(Err(e.clone().into()));
            }
        }
        Err(e) => {
            if e.is_connection_fatal() {
                conn.mark_broken();
            }
            for reply in replies {
                let _ = reply.send(Err(e.clone().into()));
            }
        }
    }
    conn.release().await;
}
