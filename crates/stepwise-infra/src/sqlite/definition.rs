//! SQLite definition store.
//!
//! One row per (workflow_id, version), definition stored as a JSON blob.
//! The extracted name/status columns exist for filtering without
//! deserializing every row.

use chrono::Utc;
use sqlx::Row;
use stepwise_core::repository::{DefinitionFilter, DefinitionStore};
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{WorkflowDefinition, WorkflowStatus};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `DefinitionStore`.
pub struct SqliteDefinitionStore {
    pool: DatabasePool,
}

impl SqliteDefinitionStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct DefinitionRow {
    definition: String,
}

impl DefinitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))
    }
}

fn status_str(status: &WorkflowStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "draft".to_string())
}

fn rows_to_definitions(
    rows: &[sqlx::sqlite::SqliteRow],
) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
    let mut defs = Vec::with_capacity(rows.len());
    for row in rows {
        let r = DefinitionRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        defs.push(r.into_definition()?);
    }
    Ok(defs)
}

// ---------------------------------------------------------------------------
// DefinitionStore impl
// ---------------------------------------------------------------------------

impl DefinitionStore for SqliteDefinitionStore {
    async fn save(&self, definition: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(definition)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;
        let tags_json = serde_json::to_string(&definition.tags)
            .map_err(|e| RepositoryError::Query(format!("serialize tags: {e}")))?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"INSERT INTO workflow_definitions
               (workflow_id, version, name, status, category, tags, definition, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(workflow_id, version) DO UPDATE SET
                 name = excluded.name,
                 status = excluded.status,
                 category = excluded.category,
                 tags = excluded.tags,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(definition.workflow_id.to_string())
        .bind(definition.version as i64)
        .bind(&definition.name)
        .bind(status_str(&definition.status))
        .bind(&definition.category)
        .bind(&tags_json)
        .bind(&definition_json)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_latest(
        &self,
        workflow_id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT definition FROM workflow_definitions WHERE workflow_id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(workflow_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = DefinitionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn get_version(
        &self,
        workflow_id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT definition FROM workflow_definitions WHERE workflow_id = ? AND version = ?",
        )
        .bind(workflow_id.to_string())
        .bind(version as i64)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = DefinitionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn get_active(
        &self,
        workflow_id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT definition FROM workflow_definitions WHERE workflow_id = ? AND status = 'active' ORDER BY version DESC LIMIT 1",
        )
        .bind(workflow_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = DefinitionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn list_versions(
        &self,
        workflow_id: &Uuid,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT definition FROM workflow_definitions WHERE workflow_id = ? ORDER BY version ASC",
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows_to_definitions(&rows)
    }

    async fn list(
        &self,
        filter: &DefinitionFilter,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        // Latest version per workflow; status/category/tag narrowing happens
        // on the deserialized records.
        let rows = sqlx::query(
            r#"SELECT definition FROM workflow_definitions wd
               WHERE version = (SELECT MAX(version) FROM workflow_definitions
                                WHERE workflow_id = wd.workflow_id)
               ORDER BY name ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let defs = rows_to_definitions(&rows)?;
        Ok(defs
            .into_iter()
            .filter(|d| {
                filter.status.map(|s| d.status == s).unwrap_or(true)
                    && filter
                        .category
                        .as_deref()
                        .map(|c| d.category.as_deref() == Some(c))
                        .unwrap_or(true)
                    && filter
                        .tag
                        .as_ref()
                        .map(|t| d.tags.iter().any(|have| have == t))
                        .unwrap_or(true)
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use stepwise_types::workflow::WorkflowSettings;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn sample_definition(workflow_id: Uuid, version: u32) -> WorkflowDefinition {
        WorkflowDefinition {
            workflow_id,
            version,
            name: "order-fulfillment".to_string(),
            description: Some("Pick, pack, ship".to_string()),
            status: WorkflowStatus::Draft,
            steps: vec![],
            triggers: vec![],
            variables: HashMap::new(),
            settings: WorkflowSettings::default(),
            tags: vec!["ops".to_string()],
            category: Some("fulfillment".to_string()),
            created_by: Some("ops-team".to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_and_get_version() {
        let pool = test_pool().await;
        let store = SqliteDefinitionStore::new(pool);
        let id = Uuid::now_v7();

        store.save(&sample_definition(id, 1)).await.unwrap();

        let loaded = store.get_version(&id, 1).await.unwrap().unwrap();
        assert_eq!(loaded.name, "order-fulfillment");
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_save_is_upsert_per_version() {
        let pool = test_pool().await;
        let store = SqliteDefinitionStore::new(pool);
        let id = Uuid::now_v7();

        let mut def = sample_definition(id, 1);
        store.save(&def).await.unwrap();
        def.status = WorkflowStatus::Active;
        store.save(&def).await.unwrap();

        let versions = store.list_versions(&id).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].status, WorkflowStatus::Active);
    }

    #[tokio::test]
    async fn test_latest_and_active() {
        let pool = test_pool().await;
        let store = SqliteDefinitionStore::new(pool);
        let id = Uuid::now_v7();

        let mut v1 = sample_definition(id, 1);
        v1.status = WorkflowStatus::Active;
        store.save(&v1).await.unwrap();
        store.save(&sample_definition(id, 2)).await.unwrap();

        assert_eq!(store.get_latest(&id).await.unwrap().unwrap().version, 2);
        assert_eq!(store.get_active(&id).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_get_active_none() {
        let pool = test_pool().await;
        let store = SqliteDefinitionStore::new(pool);
        let id = Uuid::now_v7();

        store.save(&sample_definition(id, 1)).await.unwrap();
        assert!(store.get_active(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_latest_with_filters() {
        let pool = test_pool().await;
        let store = SqliteDefinitionStore::new(pool);

        let first = Uuid::now_v7();
        store.save(&sample_definition(first, 1)).await.unwrap();
        let mut active = sample_definition(first, 2);
        active.status = WorkflowStatus::Active;
        store.save(&active).await.unwrap();

        let second = Uuid::now_v7();
        let mut other = sample_definition(second, 1);
        other.name = "invoice-review".to_string();
        other.category = Some("finance".to_string());
        store.save(&other).await.unwrap();

        let all = store.list(&DefinitionFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let active_only = store
            .list(&DefinitionFilter {
                status: Some(WorkflowStatus::Active),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(active_only.len(), 1);
        assert_eq!(active_only[0].workflow_id, first);

        let finance = store
            .list(&DefinitionFilter {
                category: Some("finance".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(finance.len(), 1);
        assert_eq!(finance[0].name, "invoice-review");
    }
}
