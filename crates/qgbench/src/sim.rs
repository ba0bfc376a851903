//! Simulated backend: fixed latency, random transient failures.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use querygrid::{
    BackendConnection, BackendResponse, ConnectionFactory, QueryRequest, SchemaDescriptor,
    TransportError,
};
use rand::Rng;
use serde_json::json;

#[derive(Debug)]
pub struct SimulatedBackend {
    latency: Duration,
    failure_rate: f64,
    batching: bool,
    calls: AtomicU64,
    round_trips: AtomicU64,
}

impl SimulatedBackend {
    pub fn new(latency: Duration, failure_rate: f64, batching: bool) -> Arc<Self> {
        Arc::new(Self {
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            batching,
            calls: AtomicU64::new(0),
            round_trips: AtomicU64::new(0),
        })
    }

    /// Operations executed, batched ones counted individually.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Network round trips; a batch counts once.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }

    fn roll_failure(&self) -> bool {
        self.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.failure_rate)
    }

    fn answer(&self, request: &QueryRequest) -> Result<BackendResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.roll_failure() {
            return Err(TransportError::Timeout("simulated timeout".into()));
        }
        Ok(BackendResponse::new(json!({
            "item": { "id": request.variables.get("id"), "name": "simulated" }
        })))
    }
}

#[derive(Debug)]
struct SimConnection {
    backend: Arc<SimulatedBackend>,
}

#[async_trait]
impl BackendConnection for SimConnection {
    async fn call(&mut self, request: &QueryRequest) -> Result<BackendResponse, TransportError> {
        self.backend.round_trips.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.backend.latency).await;
        self.backend.answer(request)
    }

    async fn call_batch(
        &mut self,
        requests: &[QueryRequest],
    ) -> Result<Vec<Result<BackendResponse, TransportError>>, TransportError> {
        self.backend.round_trips.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.backend.latency).await;
        Ok(requests.iter().map(|r| self.backend.answer(r)).collect())
    }

    async fn introspect(&mut self) -> Result<SchemaDescriptor, TransportError> {
        Ok(SchemaDescriptor::new("sim-1").with_type("Item", ["id", "name"]))
    }

    async fn ping(&mut self) -> bool {
        true
    }

    async fn close(&mut self) {}
}

pub struct SimulatedFactory {
    backend: Arc<SimulatedBackend>,
}

impl SimulatedFactory {
    pub fn new(backend: Arc<SimulatedBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl ConnectionFactory for SimulatedFactory {
    async fn connect(&self) -> Result<Box<dyn BackendConnection>, TransportError> {
        Ok(Box::new(SimConnection {
            backend: Arc::clone(&self.backend),
        }))
    }

    fn supports_batching(&self) -> bool {
        self.backend.batching
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use querygrid::RequestContext;

    fn request(id: u64) -> QueryRequest {
        QueryRequest::new("{ item(id: $id) { id } }", json!({ "id": id }), RequestContext::default())
    }

    async fn connect(backend: &Arc<SimulatedBackend>) -> Box<dyn BackendConnection> {
        SimulatedFactory::new(Arc::clone(backend)).connect().await.unwrap()
    }

    #[tokio::test]
    async fn answers_echo_the_requested_id() {
        let backend = SimulatedBackend::new(Duration::ZERO, 0.0, false);
        let mut conn = connect(&backend).await;
        let response = conn.call(&request(7)).await.unwrap();
        assert_eq!(response.data["item"]["id"], json!(7));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn full_failure_rate_always_fails() {
        let backend = SimulatedBackend::new(Duration::ZERO, 1.0, false);
        let mut conn = connect(&backend).await;
        for id in 0..5 {
            assert!(matches!(conn.call(&request(id)).await, Err(TransportError::Timeout(_))));
        }
    }

    #[tokio::test]
    async fn batch_is_one_round_trip() {
        let backend = SimulatedBackend::new(Duration::ZERO, 0.0, true);
        let mut conn = connect(&backend).await;
        let results = conn.call_batch(&[request(1), request(2), request(3)]).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(backend.calls(), 3);
        assert_eq!(backend.round_trips(), 1);
    }
}
