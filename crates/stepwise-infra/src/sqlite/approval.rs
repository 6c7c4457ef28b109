//! SQLite approval request store.
//!
//! Requests are stored as JSON blobs; the status column keeps the pending
//! queue queryable. Approver eligibility is evaluated on the deserialized
//! records because role lists live inside the blob.

use sqlx::Row;
use stepwise_core::repository::ApprovalStore;
use stepwise_types::approval::{ApprovalRequest, ApprovalStatus};
use stepwise_types::error::RepositoryError;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ApprovalStore`.
pub struct SqliteApprovalStore {
    pool: DatabasePool,
}

impl SqliteApprovalStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ApprovalRow {
    record: String,
}

impl ApprovalRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            record: row.try_get("record")?,
        })
    }

    fn into_request(self) -> Result<ApprovalRequest, RepositoryError> {
        serde_json::from_str(&self.record)
            .map_err(|e| RepositoryError::Query(format!("invalid approval request JSON: {e}")))
    }
}

fn status_str(status: &ApprovalStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "pending".to_string())
}

fn may_decide(request: &ApprovalRequest, user: &str, roles: &[String]) -> bool {
    if request.approver_users.is_empty() && request.approver_roles.is_empty() {
        return true;
    }
    request.approver_users.iter().any(|u| u == user)
        || request
            .approver_roles
            .iter()
            .any(|required| roles.iter().any(|held| held == required))
}

// ---------------------------------------------------------------------------
// ApprovalStore impl
// ---------------------------------------------------------------------------

impl ApprovalStore for SqliteApprovalStore {
    async fn create(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
        let record = serde_json::to_string(request)
            .map_err(|e| RepositoryError::Query(format!("serialize approval request: {e}")))?;

        sqlx::query(
            r#"INSERT INTO approval_requests (id, instance_id, step_id, status, created_at, record)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(request.id.to_string())
        .bind(request.instance_id.to_string())
        .bind(&request.step_id)
        .bind(status_str(&request.status))
        .bind(request.created_at.to_rfc3339())
        .bind(&record)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let row = sqlx::query("SELECT record FROM approval_requests WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r =
                    ApprovalRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_request()?))
            }
            None => Ok(None),
        }
    }

    async fn update(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
        let record = serde_json::to_string(request)
            .map_err(|e| RepositoryError::Query(format!("serialize approval request: {e}")))?;

        let result = sqlx::query("UPDATE approval_requests SET status = ?, record = ? WHERE id = ?")
            .bind(status_str(&request.status))
            .bind(&record)
            .bind(request.id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_pending_for_user(
        &self,
        user: &str,
        roles: &[String],
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT record FROM approval_requests WHERE status = 'pending' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut requests = Vec::new();
        for row in &rows {
            let r = ApprovalRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            let request = r.into_request()?;
            if may_decide(&request, user, roles) {
                requests.push(request);
            }
        }
        Ok(requests)
    }

    async fn find_for_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let row = sqlx::query(
            "SELECT record FROM approval_requests WHERE instance_id = ? AND step_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(instance_id.to_string())
        .bind(step_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r =
                    ApprovalRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_request()?))
            }
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
