//! Workflow definition types.
//!
//! A `WorkflowDefinition` is an immutable, versioned snapshot of a process
//! graph. Each structural edit produces a new version; activation flips
//! exactly one version to `Active`. Step configuration is a closed sum type
//! (`StepConfig`), so a step without its required config block is
//! unrepresentable and dispatch over step kinds is exhaustive.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::condition::Condition;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// An immutable, versioned snapshot of a process graph.
///
/// `workflow_id` is stable across versions; `version` increases monotonically.
/// At most one version per workflow holds status `Active` at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable identity shared by all versions of this workflow.
    pub workflow_id: Uuid,
    /// Monotonically increasing version number (1-based).
    pub version: u32,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Lifecycle status of this version.
    pub status: WorkflowStatus,
    /// Ordered list of steps forming the workflow graph.
    pub steps: Vec<WorkflowStep>,
    /// Trigger configurations (manual, event, schedule).
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    /// Declared instance variables (name -> type/default/required).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, VariableDeclaration>,
    /// Execution settings for instances of this definition.
    #[serde(default)]
    pub settings: WorkflowSettings,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Optional category for grouping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Identity that created this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Look up a step by id.
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// The first step by ascending `order` (the default entry point).
    pub fn first_step(&self) -> Option<&WorkflowStep> {
        self.steps.iter().min_by_key(|s| s.order)
    }

    /// The next step after `order` by ascending `order`.
    pub fn next_step_by_order(&self, order: i32) -> Option<&WorkflowStep> {
        self.steps
            .iter()
            .filter(|s| s.order > order)
            .min_by_key(|s| s.order)
    }
}

/// Lifecycle status of a workflow definition version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Inactive,
    Deprecated,
}

/// Declaration of an instance variable in a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDeclaration {
    /// Expected value type.
    #[serde(rename = "type", default)]
    pub var_type: VariableType,
    /// Default value applied when the trigger supplies none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Whether a value must be present when an instance starts.
    #[serde(default)]
    pub required: bool,
}

/// Value type of a declared variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

/// Execution settings for instances of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Maximum wall-clock duration for a single instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
    /// Safety valve: maximum step executions per instance walk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    /// Whether parallel steps may fan out concurrently.
    #[serde(default = "default_true")]
    pub parallel_execution: bool,
    /// Retention period for completed instance records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_duration_secs: None,
            max_steps: None,
            parallel_execution: true,
            retention_days: None,
        }
    }
}

/// How a workflow can be triggered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Manually triggered via API.
    Manual {},
    /// Started when a matching event arrives.
    Event {
        event_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<Condition>,
    },
    /// Started on a cron schedule.
    Schedule { cron: String },
}

// ---------------------------------------------------------------------------
// Workflow Step
// ---------------------------------------------------------------------------

/// A node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// User-defined step id, unique within a definition.
    pub id: String,
    /// Human-readable step name.
    pub name: String,
    /// Default sequencing position (ascending).
    pub order: i32,
    /// Step-kind-specific configuration.
    pub config: StepConfig,
    /// Outgoing transitions, evaluated by ascending priority.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<StepTransition>,
    /// Error-handling policy consulted when this step fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorPolicy>,
    /// Disabled steps are skipped without executing.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Step-kind-specific configuration payload, internally tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Side-effecting action (HTTP call, event publish, data store op).
    Action { action: ActionConfig },
    /// Conditional routing over a transitions-shaped list.
    Decision { conditions: Vec<StepTransition> },
    /// Suspend until an external event or approval arrives.
    Wait { wait: WaitConfig },
    /// Evaluate an expression against the execution context.
    Transform {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_variable: Option<String>,
    },
    /// Run a sandboxed script against the execution context.
    Script {
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_variable: Option<String>,
    },
    /// Resolve a map of expressions into instance variables.
    SetVariables { variables: HashMap<String, Value> },
    /// Pause the instance for a fixed duration.
    Delay {
        /// A number of seconds, or an expression string resolving to one.
        delay_seconds: Value,
    },
    /// End the instance successfully without walking further.
    Terminate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Fan out branches and join on a condition.
    Parallel {
        branches: Vec<ParallelBranch>,
        #[serde(default)]
        join: JoinCondition,
    },
    /// Iterate body steps over a collection.
    Loop {
        /// Expression resolving to the collection to iterate.
        collection: String,
        /// Variable bound to the current item inside the body.
        item_variable: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index_variable: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parallelism: Option<u32>,
        /// Step ids executed for each item, in order.
        body: Vec<String>,
    },
    /// Invoke another workflow by id.
    Subworkflow {
        workflow_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u32>,
        /// Child input variables, values resolved against the parent context.
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        input_mapping: HashMap<String, Value>,
        /// Parent variable name -> expression over the child's final variables.
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        output_mapping: HashMap<String, String>,
        #[serde(default = "default_true")]
        wait_for_completion: bool,
    },
    /// Human approval gate.
    Human {
        prompt: String,
        #[serde(default = "default_one")]
        required_approvals: u32,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        approver_roles: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        approver_users: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    /// Reroute to an earlier step a bounded number of times.
    Retry {
        step_id: String,
        #[serde(default = "default_retry_attempts")]
        max_attempts: u32,
    },
    /// Execute the listed steps in order, then continue.
    Compensate { steps: Vec<String> },
}

fn default_one() -> u32 {
    1
}

fn default_retry_attempts() -> u32 {
    3
}

impl StepConfig {
    /// The wire tag for this step kind, as used in logs and error codes.
    pub fn kind(&self) -> &'static str {
        match self {
            StepConfig::Action { .. } => "action",
            StepConfig::Decision { .. } => "decision",
            StepConfig::Wait { .. } => "wait",
            StepConfig::Transform { .. } => "transform",
            StepConfig::Script { .. } => "script",
            StepConfig::SetVariables { .. } => "set_variables",
            StepConfig::Delay { .. } => "delay",
            StepConfig::Terminate { .. } => "terminate",
            StepConfig::Parallel { .. } => "parallel",
            StepConfig::Loop { .. } => "loop",
            StepConfig::Subworkflow { .. } => "subworkflow",
            StepConfig::Human { .. } => "human",
            StepConfig::Retry { .. } => "retry",
            StepConfig::Compensate { .. } => "compensate",
        }
    }
}

/// Action payload for `StepConfig::Action`, tagged by action `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfig {
    /// Outbound HTTP request with templated url/headers/body.
    HttpRequest {
        method: String,
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<HttpAuth>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        /// Status codes treated as success (default 200/201/202/204).
        #[serde(default = "default_valid_status_codes")]
        valid_status_codes: Vec<u16>,
    },
    /// Publish a notification to the event sink.
    PublishEvent {
        event_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
        #[serde(default)]
        data: Value,
    },
    /// Query a named document store.
    StoreQuery {
        store: String,
        query: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        parameters: HashMap<String, Value>,
    },
    /// Upsert a document into a named store.
    StoreUpsert { store: String, document: Value },
    /// Delete a document from a named store by key.
    StoreDelete {
        store: String,
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partition: Option<String>,
    },
}

fn default_valid_status_codes() -> Vec<u16> {
    vec![200, 201, 202, 204]
}

/// Authentication applied to an HTTP action. Secret values are templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HttpAuth {
    Bearer { token: String },
    Basic { username: String, password: String },
    ApiKey { header: String, value: String },
}

/// Wait configuration for `StepConfig::Wait`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitConfig {
    /// Suspend until a named external event is delivered.
    Event { event_name: String },
    /// Suspend until the approval request resolves.
    Approval {
        prompt: String,
        #[serde(default = "default_one")]
        required_approvals: u32,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        approver_roles: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        approver_users: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
}

/// One parallel branch: a named, ordered list of step ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelBranch {
    pub id: String,
    pub steps: Vec<String>,
}

/// Join condition for a parallel step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JoinCondition {
    /// All branches must complete successfully.
    #[default]
    All,
    /// The first successful branch satisfies the join.
    Any,
    /// At least `n` branches must complete successfully.
    Count { n: u32 },
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// An outgoing edge from a step, optionally guarded by a condition.
///
/// Transitions are evaluated in ascending `priority` order (unset priority
/// sorts last). A transition with no condition and `is_default = false`
/// matches unconditionally; `is_default` transitions are only taken when no
/// other transition matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTransition {
    pub target_step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default)]
    pub is_default: bool,
}

// ---------------------------------------------------------------------------
// Error policy
// ---------------------------------------------------------------------------

/// What to do when a step fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPolicy {
    pub action: ErrorAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Target for `ErrorAction::Goto`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_step_id: Option<String>,
}

/// Failure handling action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    /// Proceed as if the step had succeeded.
    Skip,
    /// Re-execute the step per the retry policy.
    Retry,
    /// Reroute to `fallback_step_id`.
    Goto,
    /// Run compensation, then fail the instance.
    Compensate,
    /// Fail the instance.
    Fail,
}

/// Retry policy for `ErrorAction::Retry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default)]
    pub initial_delay_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_seconds: Option<u64>,
    /// Error codes eligible for retry. Empty means any error retries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retryable_errors: Vec<String>,
}

impl RetryPolicy {
    /// Backoff delay in seconds before the given retry (0-based retry count).
    pub fn delay_seconds(&self, retry_count: u32) -> u64 {
        let base = match self.backoff {
            BackoffKind::Fixed => self.initial_delay_seconds,
            BackoffKind::Exponential => self
                .initial_delay_seconds
                .saturating_mul(2u64.saturating_pow(retry_count)),
        };
        match self.max_delay_seconds {
            Some(cap) => base.min(cap),
            None => base,
        }
    }

    /// Whether an error code is eligible for retry under this policy.
    pub fn retries(&self, code: &str) -> bool {
        self.retryable_errors.is_empty() || self.retryable_errors.iter().any(|c| c == code)
    }
}

/// Backoff growth for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
