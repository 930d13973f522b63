//! Postgres-backed document store
//!
//! All collections share one `documents` table; bodies are JSONB and filters
//! are evaluated with JSONB containment (`body @> filter`).

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{FromRow, PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::store::{ensure_object, Document, DocumentStore, Filter, WriteOp};

#[derive(Debug, FromRow)]
struct DocumentRow {
    id: Uuid,
    collection: String,
    body: Value,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        Document {
            id: row.id,
            collection: row.collection,
            version: row.version,
            body: row.body,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const COLUMNS: &str = "id, collection, body, version, created_at, updated_at";

#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn locked_insert_if_absent(
        &self,
        collection: &str,
        filter: &Filter,
        body: Value,
    ) -> StoreResult<(Document, bool)> {
        let mut tx = self.pool.begin().await?;
        lock_key(&mut *tx, collection, filter).await?;
        if let Some(existing) = find_one_on(&mut *tx, collection, filter).await? {
            return Ok((existing, false));
        }
        let doc = insert_on(&mut *tx, collection, body).await?;
        tx.commit().await?;
        Ok((doc, true))
    }
}

/// Take a transaction-scoped advisory lock on a collection and filter key
async fn lock_key(conn: &mut PgConnection, collection: &str, filter: &Filter) -> StoreResult<()> {
    let key = format!("{}:{}", collection, filter.as_json());
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(&key)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn find_one_on(
    conn: &mut PgConnection,
    collection: &str,
    filter: &Filter,
) -> StoreResult<Option<Document>> {
    let row: Option<DocumentRow> = sqlx::query_as(&format!(
        r#"
        SELECT {COLUMNS} FROM documents
        WHERE collection = $1 AND body @> $2
        ORDER BY created_at ASC
        LIMIT 1
        "#
    ))
    .bind(collection)
    .bind(filter.as_json())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(Into::into))
}

async fn insert_on(conn: &mut PgConnection, collection: &str, body: Value) -> StoreResult<Document> {
    ensure_object(&body)?;
    let row: DocumentRow = sqlx::query_as(&format!(
        r#"
        INSERT INTO documents (id, collection, body, version, created_at, updated_at)
        VALUES ($1, $2, $3, 1, NOW(), NOW())
        RETURNING {COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(collection)
    .bind(&body)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.into())
}

async fn upsert_on(
    conn: &mut PgConnection,
    collection: &str,
    filter: &Filter,
    body: Value,
) -> StoreResult<Document> {
    ensure_object(&body)?;

    // Serialize concurrent upserts on the same key for the rest of the transaction
    lock_key(conn, collection, filter).await?;

    let existing: Option<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT id FROM documents
        WHERE collection = $1 AND body @> $2
        ORDER BY created_at ASC
        LIMIT 1
        FOR UPDATE
        "#,
    )
    .bind(collection)
    .bind(filter.as_json())
    .fetch_optional(&mut *conn)
    .await?;

    match existing {
        Some((id,)) => {
            let row: DocumentRow = sqlx::query_as(&format!(
                r#"
                UPDATE documents
                SET body = body || $2, version = version + 1, updated_at = NOW()
                WHERE id = $1
                RETURNING {COLUMNS}
                "#
            ))
            .bind(id)
            .bind(&body)
            .fetch_one(&mut *conn)
            .await?;
            Ok(row.into())
        }
        None => insert_on(conn, collection, body).await,
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn insert(&self, collection: &str, body: Value) -> StoreResult<Document> {
        let mut conn = self.pool.acquire().await?;
        insert_on(&mut *conn, collection, body).await
    }

    async fn get(&self, collection: &str, id: Uuid) -> StoreResult<Option<Document>> {
        let row: Option<DocumentRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM documents WHERE collection = $1 AND id = $2"
        ))
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> StoreResult<Option<Document>> {
        let mut conn = self.pool.acquire().await?;
        find_one_on(&mut *conn, collection, filter).await
    }

    async fn find(&self, collection: &str, filter: &Filter) -> StoreResult<Vec<Document>> {
        let rows: Vec<DocumentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {COLUMNS} FROM documents
            WHERE collection = $1 AND body @> $2
            ORDER BY created_at ASC
            "#
        ))
        .bind(collection)
        .bind(filter.as_json())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_if_absent(
        &self,
        collection: &str,
        filter: &Filter,
        body: Value,
    ) -> StoreResult<(Document, bool)> {
        match self.locked_insert_if_absent(collection, filter, body).await {
            // A writer outside the lock got there first; the unique index caught it
            Err(StoreError::Duplicate(detail)) => match self.find_one(collection, filter).await? {
                Some(existing) => Ok((existing, false)),
                None => Err(StoreError::Duplicate(detail)),
            },
            other => other,
        }
    }

    async fn replace(
        &self,
        collection: &str,
        id: Uuid,
        expected_version: i64,
        body: Value,
    ) -> StoreResult<Document> {
        ensure_object(&body)?;
        let row: Option<DocumentRow> = sqlx::query_as(&format!(
            r#"
            UPDATE documents
            SET body = $4, version = version + 1, updated_at = NOW()
            WHERE collection = $1 AND id = $2 AND version = $3
            RETURNING {COLUMNS}
            "#
        ))
        .bind(collection)
        .bind(id)
        .bind(expected_version)
        .bind(&body)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.into()),
            None => {
                // Distinguish a lost race from a missing document
                if self.get(collection, id).await?.is_some() {
                    Err(StoreError::VersionConflict {
                        collection: collection.to_string(),
                        id,
                        expected: expected_version,
                    })
                } else {
                    Err(StoreError::NotFound {
                        collection: collection.to_string(),
                        id,
                    })
                }
            }
        }
    }

    async fn merge(
        &self,
        collection: &str,
        id: Uuid,
        patch: Value,
    ) -> StoreResult<Option<Document>> {
        ensure_object(&patch)?;
        let row: Option<DocumentRow> = sqlx::query_as(&format!(
            r#"
            UPDATE documents
            SET body = body || $3, version = version + 1, updated_at = NOW()
            WHERE collection = $1 AND id = $2
            RETURNING {COLUMNS}
            "#
        ))
        .bind(collection)
        .bind(id)
        .bind(&patch)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn delete(&self, collection: &str, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn apply_batch(&self, ops: Vec<WriteOp>) -> StoreResult<Vec<Document>> {
        let mut tx = self.pool.begin().await?;
        let mut written = Vec::with_capacity(ops.len());
        for op in ops {
            let doc = match op {
                WriteOp::Insert { collection, body } => insert_on(&mut *tx, &collection, body).await?,
                WriteOp::Upsert {
                    collection,
                    filter,
                    body,
                } => upsert_on(&mut *tx, &collection, &filter, body).await?,
            };
            written.push(doc);
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup() -> PgDocumentStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = crate::db::create_pool(&url, 2).await.expect("Failed to create pool");
        crate::db::run_migrations(&pool).await.expect("Failed to run migrations");
        PgDocumentStore::new(pool)
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_batch_upsert_then_insert() {
        let store = setup().await;
        let student = format!("test-{}", Uuid::new_v4());
        let docs = store
            .apply_batch(vec![
                WriteOp::upsert(
                    "billing_check1",
                    Filter::new().eq("student_name", student.as_str()).eq("yyyymm", "202505"),
                    json!({"student_name": student, "yyyymm": "202505"}),
                ),
                WriteOp::insert("billing_status", json!({"student_name": student, "step": "TeacherConfirm"})),
            ])
            .await
            .expect("batch failed");
        assert_eq!(docs.len(), 2);

        let rows = store
            .find("billing_status", &Filter::new().eq("student_name", student.as_str()))
            .await
            .expect("find failed");
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_insert_if_absent_keeps_first() {
        let store = setup().await;
        let order_id = format!("ORD-{}", Uuid::new_v4().simple());
        let filter = Filter::new().eq("orderId", order_id.as_str());

        let (first, created) = store
            .insert_if_absent("payments", &filter, json!({"orderId": order_id, "amount": 1}))
            .await
            .expect("first insert failed");
        assert!(created);

        let (second, created) = store
            .insert_if_absent("payments", &filter, json!({"orderId": order_id, "amount": 2}))
            .await
            .expect("second insert failed");
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.body["amount"], 1);
    }
}
