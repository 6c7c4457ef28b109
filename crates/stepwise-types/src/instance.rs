//! Workflow instance records.
//!
//! An instance is the durable execution state of one workflow run: its
//! status, variables, per-step execution history, and position in the graph.
//! The record is checkpointed before and after every step so a crashed or
//! suspended run resumes from the last persisted state. `revision` guards
//! concurrent writers: every persisted update increments it, and stores
//! reject updates whose expected revision is stale.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Instance
// ---------------------------------------------------------------------------

/// Durable state of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: Uuid,
    /// Definition identity and the version pinned at start.
    pub workflow_id: Uuid,
    pub workflow_version: u32,
    pub status: InstanceStatus,
    /// Step the walk is positioned at; `None` once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    /// Instance variables, mutated by steps as the walk progresses.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Trigger payload captured at start, immutable thereafter.
    #[serde(default)]
    pub input: Value,
    /// Append-only per-step execution history.
    #[serde(default)]
    pub step_executions: Vec<StepExecution>,
    /// Ids of steps that completed successfully, in completion order.
    #[serde(default)]
    pub completed_step_ids: Vec<String>,
    /// Most recent failure, kept for diagnostics and compensate routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<InstanceError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency revision, incremented on every persisted write.
    #[serde(default)]
    pub revision: u64,
}

impl WorkflowInstance {
    /// A fresh pending instance for the given definition version.
    pub fn new(workflow_id: Uuid, workflow_version: u32, input: Value) -> Self {
        let now = Utc::now();
        Self {
            instance_id: Uuid::now_v7(),
            workflow_id,
            workflow_version,
            status: InstanceStatus::Pending,
            current_step_id: None,
            variables: HashMap::new(),
            input,
            step_executions: Vec::new(),
            completed_step_ids: Vec::new(),
            last_error: None,
            initiated_by: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            revision: 0,
        }
    }

    /// Whether the instance has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            InstanceStatus::Completed
                | InstanceStatus::Failed
                | InstanceStatus::Cancelled
                | InstanceStatus::TimedOut
        )
    }

    /// Latest completed output per step id, for `{{steps.<id>.output}}`
    /// references. Later executions of the same step shadow earlier ones.
    pub fn step_outputs(&self) -> HashMap<String, Value> {
        let mut outputs = HashMap::new();
        for exec in &self.step_executions {
            if exec.status == StepExecutionStatus::Completed {
                if let Some(output) = &exec.output {
                    outputs.insert(exec.step_id.clone(), output.clone());
                }
            }
        }
        outputs
    }

    /// Number of executions recorded for a step (for loop and retry caps).
    pub fn execution_count(&self, step_id: &str) -> usize {
        self.step_executions
            .iter()
            .filter(|e| e.step_id == step_id)
            .count()
    }
}

/// Instance lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created but not yet started.
    Pending,
    /// Actively walking the graph.
    Running,
    /// Suspended awaiting an external event or approval.
    Waiting,
    /// Administratively paused; resumable.
    Paused,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

// ---------------------------------------------------------------------------
// Step executions
// ---------------------------------------------------------------------------

/// One execution attempt of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub step_id: String,
    pub status: StepExecutionStatus,
    /// Resolved input snapshot, when the step kind captures one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// How many retries preceded this attempt.
    #[serde(default)]
    pub retry_count: u32,
}

impl StepExecution {
    /// A running execution record for the given step.
    pub fn started(step_id: &str, input: Option<Value>) -> Self {
        Self {
            id: Uuid::now_v7(),
            step_id: step_id.to_string(),
            status: StepExecutionStatus::Running,
            input,
            output: None,
            error_code: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            retry_count: 0,
        }
    }

    /// Mark completed with the given output.
    pub fn complete(&mut self, output: Option<Value>) {
        let now = Utc::now();
        self.status = StepExecutionStatus::Completed;
        self.output = output;
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
        self.completed_at = Some(now);
    }

    /// Mark failed with an error code and message.
    pub fn fail(&mut self, code: impl Into<String>, message: impl Into<String>) {
        let now = Utc::now();
        self.status = StepExecutionStatus::Failed;
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
        self.completed_at = Some(now);
    }
}

/// Status of one step execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    Running,
    Completed,
    Failed,
    Skipped,
    /// Suspended mid-step (wait/approval); resumes on signal.
    Waiting,
}

/// The failure an instance last saw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub code: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_instance_is_pending() {
        let instance = WorkflowInstance::new(Uuid::now_v7(), 1, json!({"orderId": "o-1"}));
        assert_eq!(instance.status, InstanceStatus::Pending);
        assert_eq!(instance.revision, 0);
        assert!(!instance.is_terminal());
        assert!(instance.current_step_id.is_none());
    }

    #[test]
    fn terminal_statuses() {
        let mut instance = WorkflowInstance::new(Uuid::now_v7(), 1, Value::Null);
        for status in [
            InstanceStatus::Completed,
            InstanceStatus::Failed,
            InstanceStatus::Cancelled,
            InstanceStatus::TimedOut,
        ] {
            instance.status = status;
            assert!(instance.is_terminal());
        }
        for status in [
            InstanceStatus::Pending,
            InstanceStatus::Running,
            InstanceStatus::Waiting,
            InstanceStatus::Paused,
        ] {
            instance.status = status;
            assert!(!instance.is_terminal());
        }
    }

    #[test]
    fn step_outputs_take_latest_completed() {
        let mut instance = WorkflowInstance::new(Uuid::now_v7(), 1, Value::Null);

        let mut first = StepExecution::started("fetch", None);
        first.complete(Some(json!({"status": 200})));
        instance.step_executions.push(first);

        let mut failed = StepExecution::started("fetch", None);
        failed.fail("HTTP_500", "server error");
        instance.step_executions.push(failed);

        let mut second = StepExecution::started("fetch", None);
        second.complete(Some(json!({"status": 201})));
        instance.step_executions.push(second);

        let outputs = instance.step_outputs();
        assert_eq!(outputs.get("fetch"), Some(&json!({"status": 201})));
        assert_eq!(instance.execution_count("fetch"), 3);
    }

    #[test]
    fn execution_lifecycle_records_duration() {
        let mut exec = StepExecution::started("a", Some(json!({"k": 1})));
        assert_eq!(exec.status, StepExecutionStatus::Running);
        exec.complete(Some(json!("done")));
        assert_eq!(exec.status, StepExecutionStatus::Completed);
        assert!(exec.duration_ms.is_some());
        assert!(exec.completed_at.is_some());
    }

    #[test]
    fn instance_json_roundtrip() {
        let mut instance = WorkflowInstance::new(Uuid::now_v7(), 2, json!({"a": 1}));
        instance.status = InstanceStatus::Waiting;
        instance.current_step_id = Some("approve".to_string());
        instance.variables.insert("amount".to_string(), json!(1500));
        instance.revision = 4;

        let text = serde_json::to_string(&instance).unwrap();
        assert!(text.contains("\"waiting\""));
        let parsed: WorkflowInstance = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.status, InstanceStatus::Waiting);
        assert_eq!(parsed.revision, 4);
        assert_eq!(parsed.current_step_id.as_deref(), Some("approve"));
    }
}
