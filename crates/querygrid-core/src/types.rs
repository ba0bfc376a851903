//! Shared types used across QueryGrid crates.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fingerprint::{QueryFingerprint, RequestContext, normalize_query};

/// Kind of GraphQL operation, taken from the document's leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OperationKind {
    /// Read operation (also the kind of anonymous `{ ... }` documents).
    #[default]
    Query,
    /// Write operation; never cached or coalesced.
    Mutation,
    /// Push-based operation, served by the subscription optimizer.
    Subscription,
}

impl OperationKind {
    pub fn detect(query: &str) -> Self {
        let normalized = normalize_query(query);
        let keyword = normalized
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .next()
            .unwrap_or("");
        match keyword {
            "mutation" => OperationKind::Mutation,
            "subscription" => OperationKind::Subscription,
            _ => OperationKind::Query,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Query => write!(f, "query"),
            OperationKind::Mutation => write!(f, "mutation"),
            OperationKind::Subscription => write!(f, "subscription"),
        }
    }
}

/// One operation sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub variables: Value,
    pub context: RequestContext,
    pub kind: OperationKind,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>, variables: Value, context: RequestContext) -> Self {
        let query = query.into();
        let kind = OperationKind::detect(&query);
        Self {
            query,
            variables,
            context,
            kind,
        }
    }

    pub fn fingerprint(&self) -> QueryFingerprint {
        QueryFingerprint::compute(&self.query, &self.variables, &self.context)
    }
}

/// Backend reply to a single operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    pub data: Value,
    /// Schema version token advertised by the backend, if any.
    pub schema_version: Option<String>,
    /// Cache lifetime suggested by operation metadata.
    pub cache_ttl: Option<Duration>,
}

impl BackendResponse {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            schema_version: None,
            cache_ttl: None,
        }
    }

    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = Some(version.into());
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }
}

/// Change notification pushed by the backend on a subscription topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub topic: String,
    pub payload: Value,
    /// Cache tags made stale by this change.
    #[serde(default)]
    pub invalidates: Vec<String>,
}

impl ChangeEvent {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            invalidates: Vec::new(),
        }
    }

    pub fn invalidating<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidates.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// Introspected schema snapshot: type name → field names.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub version: String,
    pub types: BTreeMap<String, Vec<String>>,
}

impl SchemaDescriptor {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            types: BTreeMap::new(),
        }
    }

    pub fn with_type<I, S>(mut self, name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types
            .insert(name.into(), fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn fields(&self, type_name: &str) -> Option<&[String]> {
        self.types.get(type_name).map(Vec::as_slice)
    }
}
