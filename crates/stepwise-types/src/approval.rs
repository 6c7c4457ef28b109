//! Approval requests raised by human and wait-for-approval steps.
//!
//! A request collects decisions until the approval threshold is met, a
//! rejection arrives, or the request expires. Exactly one pending request
//! exists per suspended step; the resolving decision carries enough state
//! for the orchestrator to resume the instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Approval Request
// ---------------------------------------------------------------------------

/// A pending or resolved approval gate for one suspended step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub step_id: String,
    /// Prompt shown to approvers, already resolved against the context.
    pub prompt: String,
    pub required_approvals: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approver_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approver_users: Vec<String>,
    /// Decisions recorded so far, in arrival order.
    #[serde(default)]
    pub decisions: Vec<ApprovalDecision>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    /// A fresh pending request for the given step.
    pub fn new(
        instance_id: Uuid,
        step_id: &str,
        prompt: &str,
        required_approvals: u32,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            step_id: step_id.to_string(),
            prompt: prompt.to_string(),
            required_approvals: required_approvals.max(1),
            approver_roles: Vec::new(),
            approver_users: Vec::new(),
            decisions: Vec::new(),
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
            expires_at,
        }
    }

    /// Count of approve decisions recorded so far.
    pub fn approvals_count(&self) -> u32 {
        self.decisions
            .iter()
            .filter(|d| d.decision == Decision::Approved)
            .count() as u32
    }

    /// Whether the given user has already recorded a decision.
    pub fn has_decided(&self, user: &str) -> bool {
        self.decisions.iter().any(|d| d.decided_by == user)
    }

    /// Whether the request is still open for decisions.
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }
}

/// One approver's decision on a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub decided_by: String,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Outcome of a single decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

/// Overall status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    /// Superseded by a reassignment to different approvers.
    Reassigned,
    Expired,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_request_is_pending() {
        let request = ApprovalRequest::new(Uuid::now_v7(), "approve", "Approve?", 2, None);
        assert!(request.is_pending());
        assert_eq!(request.required_approvals, 2);
        assert_eq!(request.approvals_count(), 0);
    }

    #[test]
    fn required_approvals_floor_is_one() {
        let request = ApprovalRequest::new(Uuid::now_v7(), "approve", "Approve?", 0, None);
        assert_eq!(request.required_approvals, 1);
    }

    #[test]
    fn counts_only_approvals() {
        let mut request = ApprovalRequest::new(Uuid::now_v7(), "approve", "Approve?", 2, None);
        request.decisions.push(ApprovalDecision {
            decided_by: "alice".to_string(),
            decision: Decision::Approved,
            comment: None,
            decided_at: Utc::now(),
        });
        request.decisions.push(ApprovalDecision {
            decided_by: "bob".to_string(),
            decision: Decision::Rejected,
            comment: Some("needs review".to_string()),
            decided_at: Utc::now(),
        });
        assert_eq!(request.approvals_count(), 1);
        assert!(request.has_decided("alice"));
        assert!(request.has_decided("bob"));
        assert!(!request.has_decided("carol"));
    }

    #[test]
    fn status_wire_names() {
        let text = serde_json::to_string(&ApprovalStatus::Reassigned).unwrap();
        assert_eq!(text, "\"reassigned\"");
        let parsed: ApprovalStatus = serde_json::from_str("\"expired\"").unwrap();
        assert_eq!(parsed, ApprovalStatus::Expired);
    }
}
