//! SQLite instance store.
//!
//! The record blob is the source of truth for an instance; the revision
//! column implements the compare-and-swap that keeps concurrent writers
//! (orchestrator walks, pause/cancel callers) from clobbering each other.

use chrono::Utc;
use sqlx::Row;
use stepwise_core::repository::{InstanceFilter, InstanceStore};
use stepwise_types::error::RepositoryError;
use stepwise_types::instance::{InstanceStatus, WorkflowInstance};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `InstanceStore`.
pub struct SqliteInstanceStore {
    pool: DatabasePool,
}

impl SqliteInstanceStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct InstanceRow {
    record: String,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            record: row.try_get("record")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        serde_json::from_str(&self.record)
            .map_err(|e| RepositoryError::Query(format!("invalid instance JSON: {e}")))
    }
}

fn status_str(status: &InstanceStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "running".to_string())
}

// ---------------------------------------------------------------------------
// InstanceStore impl
// ---------------------------------------------------------------------------

impl InstanceStore for SqliteInstanceStore {
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let record = serde_json::to_string(instance)
            .map_err(|e| RepositoryError::Query(format!("serialize instance: {e}")))?;
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"INSERT OR IGNORE INTO workflow_instances
               (instance_id, workflow_id, status, revision, record, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance.instance_id.to_string())
        .bind(instance.workflow_id.to_string())
        .bind(status_str(&instance.status))
        .bind(instance.revision as i64)
        .bind(&record)
        .bind(instance.created_at.to_rfc3339())
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "instance {} already exists",
                instance.instance_id
            )));
        }
        Ok(())
    }

    async fn get(&self, instance_id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query("SELECT record FROM workflow_instances WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r =
                    InstanceRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn update(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        // The persisted record carries the advanced revision so the blob and
        // the column stay in lockstep.
        let mut next = instance.clone();
        next.revision = instance.revision + 1;
        let record = serde_json::to_string(&next)
            .map_err(|e| RepositoryError::Query(format!("serialize instance: {e}")))?;
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"UPDATE workflow_instances
               SET status = ?, revision = ?, record = ?, updated_at = ?
               WHERE instance_id = ? AND revision = ?"#,
        )
        .bind(status_str(&next.status))
        .bind(next.revision as i64)
        .bind(&record)
        .bind(&now)
        .bind(instance.instance_id.to_string())
        .bind(instance.revision as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            // Distinguish a stale revision from a missing row.
            let current: Option<(i64,)> =
                sqlx::query_as("SELECT revision FROM workflow_instances WHERE instance_id = ?")
                    .bind(instance.instance_id.to_string())
                    .fetch_optional(&self.pool.reader)
                    .await
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;

            return match current {
                Some((found,)) => Err(RepositoryError::Conflict(format!(
                    "expected revision {}, found {found}",
                    instance.revision
                ))),
                None => Err(RepositoryError::NotFound),
            };
        }
        Ok(())
    }

    async fn list(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let limit = filter.limit.map(|l| l as i64).unwrap_or(i64::MAX);
        let rows = match (&filter.workflow_id, &filter.status) {
            (Some(workflow_id), Some(status)) => {
                sqlx::query(
                    "SELECT record FROM workflow_instances WHERE workflow_id = ? AND status = ? ORDER BY created_at ASC LIMIT ?",
                )
                .bind(workflow_id.to_string())
                .bind(status_str(status))
                .bind(limit)
                .fetch_all(&self.pool.reader)
                .await
            }
            (Some(workflow_id), None) => {
                sqlx::query(
                    "SELECT record FROM workflow_instances WHERE workflow_id = ? ORDER BY created_at ASC LIMIT ?",
                )
                .bind(workflow_id.to_string())
                .bind(limit)
                .fetch_all(&self.pool.reader)
                .await
            }
            (None, Some(status)) => {
                sqlx::query(
                    "SELECT record FROM workflow_instances WHERE status = ? ORDER BY created_at ASC LIMIT ?",
                )
                .bind(status_str(status))
                .bind(limit)
                .fetch_all(&self.pool.reader)
                .await
            }
            (None, None) => {
                sqlx::query("SELECT record FROM workflow_instances ORDER BY created_at ASC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = InstanceRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            instances.push(r.into_instance()?);
        }
        Ok(instances)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
