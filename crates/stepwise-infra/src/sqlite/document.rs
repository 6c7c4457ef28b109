//! SQLite document store.
//!
//! Backs the store-query/upsert/delete actions with named collections in a
//! single `documents` table. Documents are keyed by their `key` (or `id`)
//! field; `parameters` act as top-level field equality filters. The
//! free-form query string is for backends with a native query language and
//! is ignored here.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use stepwise_core::repository::DocumentStore;
use stepwise_types::error::RepositoryError;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `DocumentStore`.
pub struct SqliteDocumentStore {
    pool: DatabasePool,
}

impl SqliteDocumentStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn document_key(document: &Value) -> Option<String> {
    document
        .get("key")
        .or_else(|| document.get("id"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn partition_key(document: &Value) -> String {
    document
        .get("partition")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn parse_body(body: &str) -> Result<Value, RepositoryError> {
    serde_json::from_str(body)
        .map_err(|e| RepositoryError::Query(format!("invalid document JSON: {e}")))
}

impl DocumentStore for SqliteDocumentStore {
    async fn query(
        &self,
        store: &str,
        _query: &str,
        parameters: &HashMap<String, Value>,
    ) -> Result<Vec<Value>, RepositoryError> {
        let rows = sqlx::query("SELECT body FROM documents WHERE store = ? ORDER BY doc_key ASC")
            .bind(store)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut documents = Vec::new();
        for row in &rows {
            let body: String = row
                .try_get("body")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let document = parse_body(&body)?;
            let matches = parameters
                .iter()
                .all(|(field, expected)| document.get(field) == Some(expected));
            if matches {
                documents.push(document);
            }
        }
        Ok(documents)
    }

    async fn upsert(&self, store: &str, document: &Value) -> Result<Value, RepositoryError> {
        // Documents without a key field get a generated one so they remain
        // individually addressable.
        let (key, stored) = match document_key(document) {
            Some(key) => (key, document.clone()),
            None => {
                let key = Uuid::now_v7().to_string();
                let mut stored = document.clone();
                if let Some(map) = stored.as_object_mut() {
                    map.insert("key".to_string(), Value::String(key.clone()));
                }
                (key, stored)
            }
        };
        let partition = partition_key(&stored);
        let body = serde_json::to_string(&stored)
            .map_err(|e| RepositoryError::Query(format!("serialize document: {e}")))?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"INSERT INTO documents (store, doc_key, partition_key, body, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(store, doc_key, partition_key) DO UPDATE SET
                 body = excluded.body,
                 updated_at = excluded.updated_at"#,
        )
        .bind(store)
        .bind(&key)
        .bind(&partition)
        .bind(&body)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(stored)
    }

    async fn delete(
        &self,
        store: &str,
        key: &str,
        partition: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        let result = match partition {
            Some(partition) => {
                sqlx::query(
                    "DELETE FROM documents WHERE store = ? AND doc_key = ? AND partition_key = ?",
                )
                .bind(store)
                .bind(key)
                .bind(partition)
                .execute(&self.pool.writer)
                .await
            }
            None => {
                sqlx::query("DELETE FROM documents WHERE store = ? AND doc_key = ?")
                    .bind(store)
                    .bind(key)
                    .execute(&self.pool.writer)
                    .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_query_with_filters() {
        let pool = test_pool().await;
        let store = SqliteDocumentStore::new(pool);

        store
            .upsert("orders", &json!({"key": "o-1", "region": "eu", "total": 10}))
            .await
            .unwrap();
        store
            .upsert("orders", &json!({"key": "o-2", "region": "us", "total": 20}))
            .await
            .unwrap();
        // Same key replaces the document.
        store
            .upsert("orders", &json!({"key": "o-1", "region": "eu", "total": 15}))
            .await
            .unwrap();

        let all = store.query("orders", "", &HashMap::new()).await.unwrap();
        assert_eq!(all.len(), 2);

        let eu = store
            .query(
                "orders",
                "",
                &HashMap::from([("region".to_string(), json!("eu"))]),
            )
            .await
            .unwrap();
        assert_eq!(eu.len(), 1);
        assert_eq!(eu[0]["total"], json!(15));
    }

    #[tokio::test]
    async fn test_upsert_generates_missing_key() {
        let pool = test_pool().await;
        let store = SqliteDocumentStore::new(pool);

        let stored = store
            .upsert("notes", &json!({"text": "call back"}))
            .await
            .unwrap();
        let key = stored["key"].as_str().unwrap().to_string();

        assert!(store.delete("notes", &key, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_stores_are_isolated() {
        let pool = test_pool().await;
        let store = SqliteDocumentStore::new(pool);

        store
            .upsert("orders", &json!({"key": "shared"}))
            .await
            .unwrap();
        store
            .upsert("invoices", &json!({"key": "shared"}))
            .await
            .unwrap();

        assert!(store.delete("orders", "shared", None).await.unwrap());
        let invoices = store.query("invoices", "", &HashMap::new()).await.unwrap();
        assert_eq!(invoices.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_respects_partition() {
        let pool = test_pool().await;
        let store = SqliteDocumentStore::new(pool);

        store
            .upsert("orders", &json!({"key": "o-1", "partition": "eu"}))
            .await
            .unwrap();
        store
            .upsert("orders", &json!({"key": "o-1", "partition": "us"}))
            .await
            .unwrap();

        assert!(store.delete("orders", "o-1", Some("eu")).await.unwrap());
        let remaining = store.query("orders", "", &HashMap::new()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0]["partition"], json!("us"));

        // No partition deletes across partitions.
        assert!(store.delete("orders", "o-1", None).await.unwrap());
        assert!(store.query("orders", "", &HashMap::new()).await.unwrap().is_empty());
    }
}
