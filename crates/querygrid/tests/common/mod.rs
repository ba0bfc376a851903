//! Shared in-process backend for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use querygrid::{
    BackendConnection, BackendResponse, ChangeEvent, ConnectionFactory, EventStream, QueryGrid,
    QueryGridConfig, QueryRequest, SchemaDescriptor, SubscriptionTransport, TransportError,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// Backend state shared by every connection.
///
/// Queries containing `boom` fail with a backend error. Bulk chunks whose
/// first item is listed in `bulk_failures` fail that many times with a
/// transient error.
#[derive(Debug, Default)]
pub struct Backend {
    pub latency: Duration,
    calls: AtomicUsize,
    connects: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    per_query: parking_lot::Mutex<HashMap<String, usize>>,
    bulk_failures: parking_lot::Mutex<HashMap<i64, usize>>,
    schema_version: parking_lot::Mutex<String>,
}

impl Backend {
    pub fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            schema_version: parking_lot::Mutex::new("v1".to_string()),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, query: &str) -> usize {
        self.per_query.lock().get(query).copied().unwrap_or(0)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn fail_bulk_chunk(&self, first_item: i64, times: usize) {
        self.bulk_failures.lock().insert(first_item, times);
    }

    pub fn set_schema_version(&self, version: &str) {
        *self.schema_version.lock() = version.to_string();
    }

    fn schema_version(&self) -> String {
        self.schema_version.lock().clone()
    }

    fn bulk_should_fail(&self, items: &Value) -> bool {
        let Some(first) = items.get(0).and_then(Value::as_i64) else {
            return false;
        };
        match self.bulk_failures.lock().get_mut(&first) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
struct Connection {
    backend: Arc<Backend>,
}

#[async_trait]
impl BackendConnection for Connection {
    async fn call(&mut self, request: &QueryRequest) -> Result<BackendResponse, TransportError> {
        let backend = &self.backend;
        backend.calls.fetch_add(1, Ordering::SeqCst);
        *backend.per_query.lock().entry(request.query.clone()).or_default() += 1;
        let active = backend.active.fetch_add(1, Ordering::SeqCst) + 1;
        backend.peak.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(backend.latency).await;
        backend.active.fetch_sub(1, Ordering::SeqCst);

        if request.query.contains("boom") {
            return Err(TransportError::Backend("resolver exploded".into()));
        }
        if let Some(items) = request.variables.get("items") {
            if backend.bulk_should_fail(items) {
                return Err(TransportError::Unreachable("connection reset".into()));
            }
            return Ok(BackendResponse::new(json!({ "written": items })));
        }
        Ok(BackendResponse::new(json!({
            "query": request.query,
            "variables": request.variables,
        }))
        .with_schema_version(backend.schema_version()))
    }

    async fn introspect(&mut self) -> Result<SchemaDescriptor, TransportError> {
        Ok(SchemaDescriptor::new(self.backend.schema_version())
            .with_type("User", ["id", "name", "email"]))
    }

    async fn ping(&mut self) -> bool {
        true
    }

    async fn close(&mut self) {}
}

pub struct Factory {
    backend: Arc<Backend>,
}

#[async_trait]
impl ConnectionFactory for Factory {
    async fn connect(&self) -> Result<Box<dyn BackendConnection>, TransportError> {
        self.backend.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Connection {
            backend: Arc::clone(&self.backend),
        }))
    }
}

type Feed = mpsc::UnboundedSender<Result<ChangeEvent, TransportError>>;

/// Subscription transport fed by the test.
#[derive(Default)]
pub struct Transport {
    opens: AtomicUsize,
    feeds: parking_lot::Mutex<HashMap<String, Feed>>,
}

impl Transport {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn publish(&self, event: ChangeEvent) {
        let feeds = self.feeds.lock();
        let feed = feeds.get(&event.topic).expect("topic not open");
        feed.send(Ok(event)).expect("stream closed");
    }

    pub fn is_open(&self, topic: &str) -> bool {
        self.feeds
            .lock()
            .get(topic)
            .is_some_and(|feed| !feed.is_closed())
    }
}

#[async_trait]
impl SubscriptionTransport for Transport {
    async fn open_subscription(&self, topic: &str) -> Result<EventStream, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().insert(topic.to_string(), tx);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

pub fn config() -> QueryGridConfig {
    QueryGridConfig {
        pool_min: 1,
        pool_max: 4,
        backoff_base_ms: 10,
        backoff_max_ms: 100,
        ..QueryGridConfig::default()
    }
}

pub async fn grid(config: QueryGridConfig, backend: &Arc<Backend>) -> Arc<QueryGrid> {
    let grid = QueryGrid::builder(config)
        .connection_factory(Arc::new(Factory {
            backend: Arc::clone(backend),
        }))
        .build()
        .await
        .expect("grid should build");
    Arc::new(grid)
}

pub async fn grid_with_transport(
    config: QueryGridConfig,
    backend: &Arc<Backend>,
    transport: &Arc<Transport>,
) -> Arc<QueryGrid> {
    let grid = QueryGrid::builder(config)
        .connection_factory(Arc::new(Factory {
            backend: Arc::clone(backend),
        }))
        .subscription_transport(Arc::clone(transport) as Arc<dyn SubscriptionTransport>)
        .build()
        .await
        .expect("grid should build");
    Arc::new(grid)
}

/// Poll `check` until it holds, sleeping between attempts.
pub async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
