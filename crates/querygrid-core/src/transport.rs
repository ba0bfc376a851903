//! Downstream traits implemented by the backend integration.
//!
//! QueryGrid never speaks a wire protocol itself. The embedding application
//! supplies a [`ConnectionFactory`] that dials the backend and returns
//! [`BackendConnection`]s, plus a [`SubscriptionTransport`] for push events.
//! Tests plug in mock implementations.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::TransportError;
use crate::types::{BackendResponse, ChangeEvent, QueryRequest, SchemaDescriptor};

/// Stream of change notifications for one topic.
///
/// A stream item error, or the stream ending, means the transport dropped
/// and the subscription must reconnect.
pub type EventStream = BoxStream<'static, Result<ChangeEvent, TransportError>>;

/// A live connection to the query backend.
#[async_trait]
pub trait BackendConnection: Send + std::fmt::Debug {
    /// Execute one operation.
    async fn call(&mut self, request: &QueryRequest) -> Result<BackendResponse, TransportError>;

    /// Execute several operations in one round trip.
    ///
    /// The outer error fails the whole batch; inner results are per
    /// operation and in request order. The default issues one call per
    /// request.
    async fn call_batch(
        &mut self,
        requests: &[QueryRequest],
    ) -> Result<Vec<Result<BackendResponse, TransportError>>, TransportError> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.call(request).await);
        }
        Ok(results)
    }

    /// Fetch the backend's schema metadata.
    async fn introspect(&mut self) -> Result<SchemaDescriptor, TransportError> {
        Err(TransportError::Backend(
            "introspection not supported by this backend".to_string(),
        ))
    }

    /// Health-check ping. Returns `true` if the connection is alive.
    async fn ping(&mut self) -> bool;

    /// Close the underlying transport.
    async fn close(&mut self);
}

/// Factory for creating new connections, injected into the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BackendConnection>, TransportError>;

    /// Whether connections accept multi-operation round trips through
    /// [`BackendConnection::call_batch`].
    fn supports_batching(&self) -> bool {
        false
    }
}

/// Push-subscription transport.
#[async_trait]
pub trait SubscriptionTransport: Send + Sync {
    async fn open_subscription(&self, topic: &str) -> Result<EventStream, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::RequestContext;
    use serde_json::json;

    #[derive(Debug, Default)]
    struct EchoConnection {
        calls: usize,
    }

    #[async_trait]
    impl BackendConnection for EchoConnection {
        async fn call(&mut self, request: &QueryRequest) -> Result<BackendResponse, TransportError> {
            self.calls += 1;
            if request.query.contains("fail") {
                return Err(TransportError::Backend("rejected".into()));
            }
            Ok(BackendResponse::new(request.variables.clone()))
        }

        async fn ping(&mut self) -> bool {
            true
        }

        async fn close(&mut self) {}
    }

    #[tokio::test]
    async fn default_call_batch_calls_each_request_in_order() {
        let mut conn = EchoConnection::default();
        let requests = vec![
            QueryRequest::new("{ a }", json!(1), RequestContext::default()),
            QueryRequest::new("{ fail }", json!(2), RequestContext::default()),
            QueryRequest::new("{ c }", json!(3), RequestContext::default()),
        ];
        let results = conn.call_batch(&requests).await.unwrap();
        assert_eq!(conn.calls, 3);
        assert_eq!(results[0].as_ref().unwrap().data, json!(1));
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().data, json!(3));
    }

    #[tokio::test]
    async fn default_introspect_is_unsupported() {
        let mut conn = EchoConnection::default();
        assert!(matches!(
            conn.introspect().await,
            Err(TransportError::Backend(_))
        ));
    }
}
