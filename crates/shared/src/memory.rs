//! In-memory document store
//!
//! Used by tests and by local runs without `DATABASE_URL`. A batch is applied
//! under a single write lock so it is atomic with respect to other callers.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::store::{ensure_object, merge_top_level, Document, DocumentStore, Filter, WriteOp};

#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection
    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

fn new_document(collection: &str, body: Value) -> StoreResult<Document> {
    ensure_object(&body)?;
    let now = OffsetDateTime::now_utc();
    Ok(Document {
        id: Uuid::new_v4(),
        collection: collection.to_string(),
        version: 1,
        body,
        created_at: now,
        updated_at: now,
    })
}

fn touch(doc: &mut Document) {
    doc.version += 1;
    doc.updated_at = OffsetDateTime::now_utc();
}

fn apply_op(
    collections: &mut HashMap<String, Vec<Document>>,
    op: WriteOp,
) -> StoreResult<Document> {
    match op {
        WriteOp::Insert { collection, body } => {
            let doc = new_document(&collection, body)?;
            collections.entry(collection).or_default().push(doc.clone());
            Ok(doc)
        }
        WriteOp::Upsert {
            collection,
            filter,
            body,
        } => {
            let docs = collections.entry(collection.clone()).or_default();
            if let Some(existing) = docs.iter_mut().find(|d| filter.matches(&d.body)) {
                merge_top_level(&mut existing.body, &body)?;
                touch(existing);
                return Ok(existing.clone());
            }
            let doc = new_document(&collection, body)?;
            docs.push(doc.clone());
            Ok(doc)
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert(&self, collection: &str, body: Value) -> StoreResult<Document> {
        let mut collections = self.collections.write().await;
        apply_op(&mut collections, WriteOp::insert(collection, body))
    }

    async fn get(&self, collection: &str, id: Uuid) -> StoreResult<Option<Document>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| d.id == id))
            .cloned())
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> StoreResult<Option<Document>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| filter.matches(&d.body)))
            .cloned())
    }

    async fn find(&self, collection: &str, filter: &Filter) -> StoreResult<Vec<Document>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| filter.matches(&d.body))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_if_absent(
        &self,
        collection: &str,
        filter: &Filter,
        body: Value,
    ) -> StoreResult<(Document, bool)> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        if let Some(existing) = docs.iter().find(|d| filter.matches(&d.body)) {
            return Ok((existing.clone(), false));
        }
        let doc = new_document(collection, body)?;
        docs.push(doc.clone());
        Ok((doc, true))
    }

    async fn replace(
        &self,
        collection: &str,
        id: Uuid,
        expected_version: i64,
        body: Value,
    ) -> StoreResult<Document> {
        ensure_object(&body)?;
        let mut collections = self.collections.write().await;
        let doc = collections
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|d| d.id == id))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id,
            })?;
        if doc.version != expected_version {
            return Err(StoreError::VersionConflict {
                collection: collection.to_string(),
                id,
                expected: expected_version,
            });
        }
        doc.body = body;
        touch(doc);
        Ok(doc.clone())
    }

    async fn merge(
        &self,
        collection: &str,
        id: Uuid,
        patch: Value,
    ) -> StoreResult<Option<Document>> {
        let mut collections = self.collections.write().await;
        let Some(doc) = collections
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|d| d.id == id))
        else {
            return Ok(None);
        };
        merge_top_level(&mut doc.body, &patch)?;
        touch(doc);
        Ok(Some(doc.clone()))
    }

    async fn delete(&self, collection: &str, id: Uuid) -> StoreResult<bool> {
        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(false);
        };
        let before = docs.len();
        docs.retain(|d| d.id != id);
        Ok(docs.len() != before)
    }

    async fn apply_batch(&self, ops: Vec<WriteOp>) -> StoreResult<Vec<Document>> {
        let mut collections = self.collections.write().await;
        // Stage copies of the touched collections so a failing op leaves nothing behind
        let mut staged: HashMap<String, Vec<Document>> = HashMap::new();
        for op in &ops {
            let name = op.collection();
            if !staged.contains_key(name) {
                let docs = collections.get(name).cloned().unwrap_or_default();
                staged.insert(name.to_string(), docs);
            }
        }
        let mut written = Vec::with_capacity(ops.len());
        for op in ops {
            written.push(apply_op(&mut staged, op)?);
        }
        collections.extend(staged);
        Ok(written)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = MemoryDocumentStore::new();
        store.insert("students", json!({"name": "Ann"})).await.unwrap();
        store.insert("students", json!({"name": "Ben"})).await.unwrap();

        let all = store.find("students", &Filter::new()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].str_field("name"), Some("Ann"));

        let ben = store
            .find_one("students", &Filter::new().eq("name", "Ben"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ben.version, 1);
    }

    #[tokio::test]
    async fn test_insert_rejects_non_object() {
        let store = MemoryDocumentStore::new();
        let err = store.insert("students", json!("Ann")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument(_)));
    }

    #[tokio::test]
    async fn test_replace_detects_version_conflict() {
        let store = MemoryDocumentStore::new();
        let doc = store.insert("payments", json!({"orderId": "A"})).await.unwrap();

        let updated = store
            .replace("payments", doc.id, 1, json!({"orderId": "A", "status": "DONE"}))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);

        let err = store
            .replace("payments", doc.id, 1, json!({"orderId": "A", "status": "FAILED"}))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_upsert_merges_existing() {
        let store = MemoryDocumentStore::new();
        let key = Filter::new().eq("student_name", "Ann").eq("yyyymm", "202505");
        store
            .upsert("billing_check1", key.clone(), json!({"student_name": "Ann", "yyyymm": "202505", "final_save": false}))
            .await
            .unwrap();
        let second = store
            .upsert("billing_check1", key, json!({"student_name": "Ann", "yyyymm": "202505", "final_save": true}))
            .await
            .unwrap();

        assert_eq!(store.count("billing_check1").await, 1);
        assert_eq!(second.body["final_save"], true);
        assert_eq!(second.version, 2);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let store = MemoryDocumentStore::new();
        let result = store
            .apply_batch(vec![
                WriteOp::insert("billing_check1", json!({"student_name": "Ann"})),
                WriteOp::insert("billing_status", json!(["not", "an", "object"])),
            ])
            .await;

        assert!(result.is_err());
        assert_eq!(store.count("billing_check1").await, 0);
        assert_eq!(store.count("billing_status").await, 0);
    }

    #[tokio::test]
    async fn test_batch_leaves_other_collections_alone() {
        let store = MemoryDocumentStore::new();
        store.insert("students", json!({"name": "Ann"})).await.unwrap();
        store
            .apply_batch(vec![WriteOp::insert("billing_status", json!({"student_name": "Ann"}))])
            .await
            .unwrap();
        assert_eq!(store.count("students").await, 1);
        assert_eq!(store.count("billing_status").await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_insert_if_absent_under_contention() {
        let store = std::sync::Arc::new(MemoryDocumentStore::new());
        let mut handles = Vec::new();
        for amount in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert_if_absent(
                        "payments",
                        &Filter::new().eq("orderId", "ORD-race-1"),
                        json!({"orderId": "ORD-race-1", "amount": amount}),
                    )
                    .await
                    .unwrap()
            }));
        }
        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().1 {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.count("payments").await, 1);
    }

    #[tokio::test]
    async fn test_merge_and_delete() {
        let store = MemoryDocumentStore::new();
        let doc = store.insert("teachers", json!({"name": "Kim"})).await.unwrap();

        let merged = store
            .merge("teachers", doc.id, json!({"email": "kim@example.com"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged.body["name"], "Kim");
        assert_eq!(merged.body["email"], "kim@example.com");

        assert!(store.delete("teachers", doc.id).await.unwrap());
        assert!(!store.delete("teachers", doc.id).await.unwrap());
        assert!(store.merge("teachers", doc.id, json!({})).await.unwrap().is_none());
    }
}
