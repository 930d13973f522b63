//! Document store abstraction
//!
//! Every entity in Classbook is a loosely-typed JSON document living in a
//! named collection. Handlers and services talk to the store through the
//! [`DocumentStore`] trait; production uses [`crate::PgDocumentStore`]
//! (a JSONB table), tests and local runs use [`crate::MemoryDocumentStore`].

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// A stored document with store-managed metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: Uuid,
    pub collection: String,
    /// Bumped on every write; used for compare-and-swap replaces
    pub version: i64,
    pub body: Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Document {
    /// Render the document for API responses.
    ///
    /// The body is returned as-is with `id` added. `createdAt`/`updatedAt`
    /// are filled from store metadata only when the body does not carry its own.
    pub fn to_json(&self) -> Value {
        let mut out = match &self.body {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        out.insert("id".to_string(), Value::String(self.id.to_string()));
        if !out.contains_key("createdAt") {
            out.insert("createdAt".to_string(), Value::String(rfc3339(self.created_at)));
        }
        if !out.contains_key("updatedAt") {
            out.insert("updatedAt".to_string(), Value::String(rfc3339(self.updated_at)));
        }
        Value::Object(out)
    }

    /// Deserialize the body into a typed view
    pub fn decode<T: DeserializeOwned>(&self) -> StoreResult<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Read a top-level string field from the body
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }
}

fn rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

/// Equality filter over top-level body fields.
///
/// Only scalar values are supported; an empty filter matches every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    fields: Map<String, Value>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality condition
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The filter as a JSON object (used for JSONB containment queries)
    pub fn as_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Check a body against every condition
    pub fn matches(&self, body: &Value) -> bool {
        self.fields
            .iter()
            .all(|(key, expected)| body.get(key) == Some(expected))
    }
}

/// A write that can be grouped with others in [`DocumentStore::apply_batch`]
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert a new document
    Insert { collection: String, body: Value },
    /// Merge `body` into the first document matching `filter`, or insert it
    Upsert {
        collection: String,
        filter: Filter,
        body: Value,
    },
}

impl WriteOp {
    /// Collection the op writes to
    pub fn collection(&self) -> &str {
        match self {
            WriteOp::Insert { collection, .. } | WriteOp::Upsert { collection, .. } => collection,
        }
    }

    pub fn insert(collection: &str, body: Value) -> Self {
        WriteOp::Insert {
            collection: collection.to_string(),
            body,
        }
    }

    pub fn upsert(collection: &str, filter: Filter, body: Value) -> Self {
        WriteOp::Upsert {
            collection: collection.to_string(),
            filter,
            body,
        }
    }
}

/// Storage backend for Classbook documents
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a document; the body must be a JSON object
    async fn insert(&self, collection: &str, body: Value) -> StoreResult<Document>;

    async fn get(&self, collection: &str, id: Uuid) -> StoreResult<Option<Document>>;

    /// First matching document in insertion order
    async fn find_one(&self, collection: &str, filter: &Filter) -> StoreResult<Option<Document>>;

    /// All matching documents in insertion order
    async fn find(&self, collection: &str, filter: &Filter) -> StoreResult<Vec<Document>>;

    /// Insert `body` unless a document matching `filter` already exists.
    ///
    /// The lookup and the insert are one atomic step. Returns the stored
    /// document and whether this call created it.
    async fn insert_if_absent(
        &self,
        collection: &str,
        filter: &Filter,
        body: Value,
    ) -> StoreResult<(Document, bool)>;

    /// Replace a document body if its version still equals `expected_version`
    async fn replace(
        &self,
        collection: &str,
        id: Uuid,
        expected_version: i64,
        body: Value,
    ) -> StoreResult<Document>;

    /// Merge top-level fields of `patch` into a document. Returns `None` if absent.
    async fn merge(&self, collection: &str, id: Uuid, patch: Value)
        -> StoreResult<Option<Document>>;

    /// Delete a document. Returns whether it existed.
    async fn delete(&self, collection: &str, id: Uuid) -> StoreResult<bool>;

    /// Apply several writes atomically: either every op lands or none does
    async fn apply_batch(&self, ops: Vec<WriteOp>) -> StoreResult<Vec<Document>>;

    /// Connectivity check for readiness probes
    async fn ping(&self) -> StoreResult<()>;

    async fn upsert(&self, collection: &str, filter: Filter, body: Value) -> StoreResult<Document> {
        self.apply_batch(vec![WriteOp::upsert(collection, filter, body)])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Database("upsert produced no document".to_string()))
    }
}

/// Serialize a typed value into a document body
pub fn to_body<T: Serialize>(value: &T) -> StoreResult<Value> {
    let body = serde_json::to_value(value)?;
    ensure_object(&body)?;
    Ok(body)
}

pub(crate) fn ensure_object(body: &Value) -> StoreResult<()> {
    if body.is_object() {
        Ok(())
    } else {
        Err(StoreError::InvalidDocument(
            "document body must be a JSON object".to_string(),
        ))
    }
}

/// Shallow merge: top-level keys of `patch` overwrite those of `target`
pub fn merge_top_level(target: &mut Value, patch: &Value) -> StoreResult<()> {
    ensure_object(patch)?;
    let (Value::Object(dst), Value::Object(src)) = (target, patch) else {
        return Err(StoreError::InvalidDocument(
            "document body must be a JSON object".to_string(),
        ));
    };
    for (key, value) in src {
        dst.insert(key.clone(), value.clone());
    }
    Ok(())
}
