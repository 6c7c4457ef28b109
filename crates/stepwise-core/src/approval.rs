//! Approval decision handling.
//!
//! Requests are created by the orchestrator when an approval gate suspends
//! an instance; this service records decisions against them. A single
//! rejection resolves the request immediately; approvals accumulate until
//! the threshold is met. Resuming the suspended instance is the caller's
//! move once the request resolves.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use stepwise_types::approval::{
    ApprovalDecision, ApprovalRequest, ApprovalStatus, Decision,
};
use stepwise_types::error::ApprovalError;
use tracing::info;
use uuid::Uuid;

use crate::repository::{ApprovalStore, EventSink};

pub struct ApprovalService<AS, E> {
    store: Arc<AS>,
    events: Arc<E>,
}

impl<AS, E> ApprovalService<AS, E>
where
    AS: ApprovalStore,
    E: EventSink,
{
    pub fn new(store: Arc<AS>, events: Arc<E>) -> Self {
        Self { store, events }
    }

    /// Record one approver's decision.
    ///
    /// Eligibility: with no approver lists configured anyone may decide;
    /// otherwise the user must be listed directly or hold a listed role.
    /// Each user decides at most once. A rejection resolves the request
    /// immediately; approvals resolve it once the threshold is met.
    pub async fn record_decision(
        &self,
        request_id: &Uuid,
        user: &str,
        roles: &[String],
        decision: Decision,
        comment: Option<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let mut request = self
            .store
            .get(request_id)
            .await
            .map_err(|e| ApprovalError::Storage(e.to_string()))?
            .ok_or(ApprovalError::NotFound)?;

        if request.is_pending() && is_expired(&request) {
            request.status = ApprovalStatus::Expired;
            self.store
                .update(&request)
                .await
                .map_err(|e| ApprovalError::Storage(e.to_string()))?;
        }
        if !request.is_pending() {
            return Err(ApprovalError::NotPending);
        }
        if !is_eligible(&request, user, roles) {
            return Err(ApprovalError::NotEligible(user.to_string()));
        }
        if request.has_decided(user) {
            return Err(ApprovalError::AlreadyDecided(user.to_string()));
        }

        request.decisions.push(ApprovalDecision {
            decided_by: user.to_string(),
            decision,
            comment,
            decided_at: Utc::now(),
        });
        if decision == Decision::Rejected {
            request.status = ApprovalStatus::Rejected;
        } else if request.approvals_count() >= request.required_approvals {
            request.status = ApprovalStatus::Approved;
        }

        self.store
            .update(&request)
            .await
            .map_err(|e| ApprovalError::Storage(e.to_string()))?;
        info!(
            approval_id = %request.id,
            instance_id = %request.instance_id,
            user,
            decision = ?decision,
            status = ?request.status,
            "approval decision recorded"
        );
        self.events
            .publish(
                "approval.decided",
                Some(&request.id.to_string()),
                &json!({
                    "instanceId": request.instance_id,
                    "stepId": request.step_id,
                    "decidedBy": user,
                    "status": request.status,
                }),
            )
            .await;
        Ok(request)
    }

    /// Hand a pending request to a different set of approvers. The original
    /// request is marked `Reassigned` and a fresh pending one replaces it.
    pub async fn reassign(
        &self,
        request_id: &Uuid,
        approver_users: Vec<String>,
        approver_roles: Vec<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let mut request = self
            .store
            .get(request_id)
            .await
            .map_err(|e| ApprovalError::Storage(e.to_string()))?
            .ok_or(ApprovalError::NotFound)?;
        if !request.is_pending() {
            return Err(ApprovalError::NotPending);
        }
        request.status = ApprovalStatus::Reassigned;
        self.store
            .update(&request)
            .await
            .map_err(|e| ApprovalError::Storage(e.to_string()))?;

        let mut replacement = ApprovalRequest::new(
            request.instance_id,
            &request.step_id,
            &request.prompt,
            request.required_approvals,
            request.expires_at,
        );
        replacement.approver_users = approver_users;
        replacement.approver_roles = approver_roles;
        self.store
            .create(&replacement)
            .await
            .map_err(|e| ApprovalError::Storage(e.to_string()))?;
        info!(
            from = %request.id,
            to = %replacement.id,
            "approval request reassigned"
        );
        Ok(replacement)
    }

    /// Pending requests the user may decide on.
    pub async fn pending_for(
        &self,
        user: &str,
        roles: &[String],
    ) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        self.store
            .list_pending_for_user(user, roles)
            .await
            .map_err(|e| ApprovalError::Storage(e.to_string()))
    }
}

fn is_expired(request: &ApprovalRequest) -> bool {
    request.expires_at.is_some_and(|at| at <= Utc::now())
}

fn is_eligible(request: &ApprovalRequest, user: &str, roles: &[String]) -> bool {
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
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use stepwise_types::error::RepositoryError;

    use crate::step::test_support::RecordingSink;

    #[derive(Default)]
    struct MemApprovals {
        rows: Mutex<Vec<ApprovalRequest>>,
    }

    impl ApprovalStore for MemApprovals {
        async fn create(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
            self.rows.lock().unwrap().push(request.clone());
            Ok(())
        }

        async fn get(&self, id: &Uuid) -> Result<Option<ApprovalRequest>, RepositoryError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.id == *id)
                .cloned())
        }

        async fn update(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
            let mut rows = self.rows.lock().unwrap();
            match rows.iter_mut().find(|r| r.id == request.id) {
                Some(row) => {
                    *row = request.clone();
                    Ok(())
                }
                None => Err(RepositoryError::NotFound),
            }
        }

        async fn list_pending_for_user(
            &self,
            user: &str,
            roles: &[String],
        ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.is_pending() && is_eligible(r, user, roles))
                .cloned()
                .collect())
        }

        async fn find_for_step(
            &self,
            instance_id: &Uuid,
            step_id: &str,
        ) -> Result<Option<ApprovalRequest>, RepositoryError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.instance_id == *instance_id && r.step_id == step_id)
                .max_by_key(|r| r.created_at)
                .cloned())
        }
    }

    fn service() -> (
        ApprovalService<MemApprovals, RecordingSink>,
        Arc<MemApprovals>,
    ) {
        let store = Arc::new(MemApprovals::default());
        (
            ApprovalService::new(store.clone(), Arc::new(RecordingSink::default())),
            store,
        )
    }

    async fn seed(store: &MemApprovals, required: u32) -> ApprovalRequest {
        let mut request =
            ApprovalRequest::new(Uuid::now_v7(), "approve", "Approve order?", required, None);
        request.approver_roles = vec!["manager".to_string()];
        store.create(&request).await.unwrap();
        request
    }

    #[tokio::test]
    async fn single_approval_resolves_request() {
        let (service, store) = service();
        let request = seed(&store, 1).await;
        let updated = service
            .record_decision(
                &request.id,
                "alice",
                &["manager".to_string()],
                Decision::Approved,
                None,
            )
            .await
            .unwrap();
        assert_eq!(updated.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn threshold_requires_distinct_approvers() {
        let (service, store) = service();
        let request = seed(&store, 2).await;
        let roles = vec!["manager".to_string()];

        let after_first = service
            .record_decision(&request.id, "alice", &roles, Decision::Approved, None)
            .await
            .unwrap();
        assert_eq!(after_first.status, ApprovalStatus::Pending);

        let err = service
            .record_decision(&request.id, "alice", &roles, Decision::Approved, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::AlreadyDecided(_)));

        let after_second = service
            .record_decision(&request.id, "bob", &roles, Decision::Approved, None)
            .await
            .unwrap();
        assert_eq!(after_second.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn rejection_wins_immediately() {
        let (service, store) = service();
        let request = seed(&store, 3).await;
        let updated = service
            .record_decision(
                &request.id,
                "carol",
                &["manager".to_string()],
                Decision::Rejected,
                Some("missing invoice".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, ApprovalStatus::Rejected);

        let err = service
            .record_decision(
                &request.id,
                "dave",
                &["manager".to_string()],
                Decision::Approved,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotPending));
    }

    #[tokio::test]
    async fn ineligible_user_rejected() {
        let (service, store) = service();
        let request = seed(&store, 1).await;
        let err = service
            .record_decision(
                &request.id,
                "mallory",
                &["intern".to_string()],
                Decision::Approved,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotEligible(_)));
    }

    #[tokio::test]
    async fn expired_request_closes_on_decision() {
        let (service, store) = service();
        let mut request =
            ApprovalRequest::new(Uuid::now_v7(), "approve", "Approve?", 1, None);
        request.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        store.create(&request).await.unwrap();

        let err = service
            .record_decision(&request.id, "alice", &[], Decision::Approved, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotPending));
        let stored = store.get(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ApprovalStatus::Expired);
    }

    #[tokio::test]
    async fn reassign_replaces_pending_request() {
        let (service, store) = service();
        let request = seed(&store, 1).await;
        let replacement = service
            .reassign(&request.id, vec!["erin".to_string()], vec![])
            .await
            .unwrap();
        assert!(replacement.is_pending());
        assert_eq!(replacement.approver_users, vec!["erin".to_string()]);

        let original = store.get(&request.id).await.unwrap().unwrap();
        assert_eq!(original.status, ApprovalStatus::Reassigned);

        // Only the replacement is decidable.
        let pending = service.pending_for("erin", &[]).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, replacement.id);
    }
}
