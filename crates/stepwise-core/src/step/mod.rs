//! Step execution: result contract, dispatcher, and next-step resolution.
//!
//! Executor failures never propagate as `Err` past the dispatcher. Every
//! step resolves to a `StepResult`; the orchestrator's error-policy logic is
//! the single place that decides retry/skip/fail.

pub mod action;
pub mod basic;
pub mod script;
pub mod transform;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use stepwise_types::workflow::{StepConfig, WorkflowStep};
use tracing::warn;

use crate::condition::find_matching_transition;
use crate::context::ExecutionContext;
use crate::repository::{DocumentStore, EventSink, HttpCaller};

// ---------------------------------------------------------------------------
// Step result contract
// ---------------------------------------------------------------------------

/// A typed step failure, identified by a stable code string.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub code: String,
    pub message: String,
}

impl StepFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Approval gate parameters, resolved against the context.
#[derive(Debug, Clone)]
pub struct ApprovalGate {
    pub prompt: String,
    pub required_approvals: u32,
    pub approver_roles: Vec<String>,
    pub approver_users: Vec<String>,
    pub timeout_secs: Option<u64>,
}

/// A step that cannot complete inside the dispatcher hands control back to
/// the orchestrator with one of these signals.
#[derive(Debug, Clone)]
pub enum OrchestrationSignal {
    /// Suspend until the named external event is delivered.
    WaitEvent { event_name: String },
    /// Suspend until the approval gate resolves.
    WaitApproval(ApprovalGate),
    /// Sleep for the resolved duration, then continue.
    Delay { seconds: u64 },
    /// Fan out the step's branches; config read by the orchestrator.
    Parallel,
    /// Iterate the step's body; config read by the orchestrator.
    Loop,
    /// Invoke a child workflow; config read by the orchestrator.
    Subworkflow,
    /// Reroute to an earlier step, bounded by max_attempts.
    RetryRoute { step_id: String, max_attempts: u32 },
    /// Execute the listed steps in order, then continue.
    Compensate { steps: Vec<String> },
}

/// Outcome of one step execution attempt.
#[derive(Debug, Clone, Default)]
pub struct StepResult {
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<StepFailure>,
    /// Merged into instance variables on success.
    pub variable_updates: HashMap<String, Value>,
    /// Explicit routing, taking precedence over transitions.
    pub next_step_id: Option<String>,
    /// Present when the orchestrator must take over.
    pub signal: Option<OrchestrationSignal>,
    /// End the walk successfully without visiting further steps.
    pub should_terminate: bool,
    /// The step was disabled and not executed.
    pub skipped: bool,
}

impl StepResult {
    pub fn ok(output: Option<Value>) -> Self {
        Self {
            success: true,
            output,
            ..Default::default()
        }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(StepFailure::new(code, message)),
            ..Default::default()
        }
    }

    pub fn skipped() -> Self {
        Self {
            success: true,
            skipped: true,
            ..Default::default()
        }
    }

    pub fn signal(signal: OrchestrationSignal) -> Self {
        Self {
            success: true,
            signal: Some(signal),
            ..Default::default()
        }
    }

    pub fn with_variables(mut self, updates: HashMap<String, Value>) -> Self {
        self.variable_updates = updates;
        self
    }

    pub fn with_next_step(mut self, next: Option<String>) -> Self {
        self.next_step_id = next;
        self
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes a step to its executor by config variant.
///
/// Collaborators are injected once at construction; the runner itself is
/// cheap to clone behind the `Arc`s.
pub struct StepRunner<H, E, D> {
    http: Arc<H>,
    events: Arc<E>,
    documents: Arc<D>,
}

impl<H, E, D> Clone for StepRunner<H, E, D> {
    fn clone(&self) -> Self {
        Self {
            http: self.http.clone(),
            events: self.events.clone(),
            documents: self.documents.clone(),
        }
    }
}

impl<H, E, D> StepRunner<H, E, D>
where
    H: HttpCaller,
    E: EventSink,
    D: DocumentStore,
{
    pub fn new(http: Arc<H>, events: Arc<E>, documents: Arc<D>) -> Self {
        Self {
            http,
            events,
            documents,
        }
    }

    /// Execute one step against the context.
    ///
    /// Disabled steps short-circuit to a skipped success. Anything an
    /// executor cannot express as a more specific code surfaces as
    /// `STEP_EXECUTION_ERROR`; the method itself never fails.
    pub async fn execute_step(&self, step: &WorkflowStep, ctx: &ExecutionContext) -> StepResult {
        if !step.enabled {
            warn!(step_id = %step.id, "step disabled, skipping");
            return StepResult::skipped();
        }

        match &step.config {
            StepConfig::Action { action } => {
                action::run_action(
                    action,
                    ctx,
                    self.http.as_ref(),
                    self.events.as_ref(),
                    self.documents.as_ref(),
                )
                .await
            }
            StepConfig::Decision { conditions } => basic::run_decision(conditions, ctx),
            StepConfig::Wait { wait } => basic::run_wait(wait, ctx),
            StepConfig::Transform {
                expression,
                output_variable,
            } => transform::run_transform(expression, output_variable.as_deref(), ctx),
            StepConfig::Script {
                source,
                timeout_secs,
                output_variable,
            } => script::run_script(source, *timeout_secs, output_variable.as_deref(), ctx).await,
            StepConfig::SetVariables { variables } => basic::run_set_variables(variables, ctx),
            StepConfig::Delay { delay_seconds } => basic::run_delay(delay_seconds, ctx),
            StepConfig::Terminate { reason } => basic::run_terminate(reason.as_deref()),
            StepConfig::Parallel { .. } => StepResult::signal(OrchestrationSignal::Parallel),
            StepConfig::Loop { .. } => StepResult::signal(OrchestrationSignal::Loop),
            StepConfig::Subworkflow { .. } => StepResult::signal(OrchestrationSignal::Subworkflow),
            StepConfig::Human {
                prompt,
                required_approvals,
                approver_roles,
                approver_users,
                timeout_secs,
            } => basic::run_human(
                prompt,
                *required_approvals,
                approver_roles,
                approver_users,
                *timeout_secs,
                ctx,
            ),
            StepConfig::Retry {
                step_id,
                max_attempts,
            } => StepResult::signal(OrchestrationSignal::RetryRoute {
                step_id: step_id.clone(),
                max_attempts: *max_attempts,
            }),
            StepConfig::Compensate { steps } => {
                StepResult::signal(OrchestrationSignal::Compensate {
                    steps: steps.clone(),
                })
            }
        }
    }
}

/// Next-step precedence: explicit result routing, then transitions, then the
/// next step by ascending order, then none (graph end).
pub fn determine_next_step(
    current: &WorkflowStep,
    all_steps: &[WorkflowStep],
    ctx: &ExecutionContext,
    result: &StepResult,
) -> Option<String> {
    if let Some(next) = &result.next_step_id {
        return Some(next.clone());
    }
    if !current.transitions.is_empty() {
        if let Some(target) = find_matching_transition(&current.transitions, ctx) {
            return Some(target);
        }
        // Transitions exist but none matched: end of branch.
        return None;
    }
    all_steps
        .iter()
        .filter(|s| s.order > current.order)
        .min_by_key(|s| s.order)
        .map(|s| s.id.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use serde_json::json;
    use stepwise_types::condition::{ComparisonOp, Condition};
    use stepwise_types::workflow::StepTransition;

    fn runner() -> StepRunner<ScriptedHttp, RecordingSink, CannedDocuments> {
        StepRunner::new(
            Arc::new(ScriptedHttp::default()),
            Arc::new(RecordingSink::default()),
            Arc::new(CannedDocuments::default()),
        )
    }

    fn step(id: &str, order: i32, config: StepConfig) -> WorkflowStep {
        WorkflowStep {
            id: id.to_string(),
            name: id.to_string(),
            order,
            config,
            transitions: vec![],
            on_error: None,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn disabled_step_is_skipped() {
        let mut s = step("a", 1, StepConfig::Terminate { reason: None });
        s.enabled = false;
        let result = runner().execute_step(&s, &ExecutionContext::default()).await;
        assert!(result.success);
        assert!(result.skipped);
        assert!(!result.should_terminate);
    }

    #[tokio::test]
    async fn orchestration_step_kinds_signal() {
        let s = step(
            "p",
            1,
            StepConfig::Parallel {
                branches: vec![],
                join: Default::default(),
            },
        );
        let result = runner().execute_step(&s, &ExecutionContext::default()).await;
        assert!(result.success);
        assert!(matches!(result.signal, Some(OrchestrationSignal::Parallel)));

        let s = step(
            "r",
            2,
            StepConfig::Retry {
                step_id: "earlier".to_string(),
                max_attempts: 2,
            },
        );
        let result = runner().execute_step(&s, &ExecutionContext::default()).await;
        match result.signal {
            Some(OrchestrationSignal::RetryRoute { step_id, max_attempts }) => {
                assert_eq!(step_id, "earlier");
                assert_eq!(max_attempts, 2);
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[test]
    fn next_step_precedence() {
        let steps = vec![
            step("a", 1, StepConfig::Terminate { reason: None }),
            step("b", 2, StepConfig::Terminate { reason: None }),
            step("c", 3, StepConfig::Terminate { reason: None }),
        ];
        let ctx = ExecutionContext::default();

        // Explicit routing wins.
        let result = StepResult::ok(None).with_next_step(Some("c".to_string()));
        assert_eq!(
            determine_next_step(&steps[0], &steps, &ctx, &result).as_deref(),
            Some("c")
        );

        // Order fallback when nothing else routes.
        let plain = StepResult::ok(None);
        assert_eq!(
            determine_next_step(&steps[0], &steps, &ctx, &plain).as_deref(),
            Some("b")
        );

        // Last step by order ends the graph.
        assert!(determine_next_step(&steps[2], &steps, &ctx, &plain).is_none());
    }

    #[test]
    fn transitions_beat_order_and_unmatched_ends_branch() {
        let mut a = step("a", 1, StepConfig::Terminate { reason: None });
        a.transitions = vec![StepTransition {
            target_step_id: "c".to_string(),
            condition: Some(Condition::simple(
                json!("$.amount"),
                ComparisonOp::Gt,
                json!(100),
            )),
            priority: None,
            is_default: false,
        }];
        let steps = vec![
            a.clone(),
            step("b", 2, StepConfig::Terminate { reason: None }),
            step("c", 3, StepConfig::Terminate { reason: None }),
        ];
        let plain = StepResult::ok(None);

        let mut ctx = ExecutionContext::default();
        ctx.variables.insert("amount".to_string(), json!(500));
        assert_eq!(
            determine_next_step(&a, &steps, &ctx, &plain).as_deref(),
            Some("c")
        );

        // Condition false and no default: branch ends, no order fallback.
        ctx.variables.insert("amount".to_string(), json!(5));
        assert!(determine_next_step(&a, &steps, &ctx, &plain).is_none());
    }
}
