//! Executors for the variable, routing, and suspension step kinds.

use std::collections::HashMap;

use serde_json::{Value, json};
use stepwise_types::workflow::{StepTransition, WaitConfig};
use tracing::debug;

use crate::condition::find_matching_transition;
use crate::context::ExecutionContext;
use crate::expression::{resolve_object, resolve_template};
use crate::functions::coerce_number;
use crate::step::{ApprovalGate, OrchestrationSignal, StepResult};

/// Resolve a map of expressions into variable updates.
pub fn run_set_variables(
    variables: &HashMap<String, Value>,
    ctx: &ExecutionContext,
) -> StepResult {
    let mut updates = HashMap::with_capacity(variables.len());
    for (name, expr) in variables {
        match resolve_object(expr, ctx) {
            Ok(value) => {
                updates.insert(name.clone(), value);
            }
            Err(err) => {
                return StepResult::failed(
                    "TRANSFORM_ERROR",
                    format!("failed to resolve variable '{name}': {err}"),
                );
            }
        }
    }
    let output = Value::Object(updates.clone().into_iter().collect());
    let mut result = StepResult::ok(Some(output)).with_variables(updates);
    result.skipped = false;
    result
}

/// Route via a transitions-shaped condition list.
pub fn run_decision(conditions: &[StepTransition], ctx: &ExecutionContext) -> StepResult {
    if conditions.is_empty() {
        return StepResult::failed(
            "MISSING_DECISION_CONFIG",
            "decision step has no conditions",
        );
    }
    let matched = find_matching_transition(conditions, ctx);
    debug!(target = ?matched, "decision resolved");
    let output = json!({ "matched": matched });
    StepResult::ok(Some(output)).with_next_step(matched)
}

/// Hand control to the orchestrator for an event or approval suspension.
pub fn run_wait(wait: &WaitConfig, ctx: &ExecutionContext) -> StepResult {
    match wait {
        WaitConfig::Event { event_name } => {
            let event_name = match resolve_template(event_name, ctx) {
                Ok(name) => name,
                Err(err) => return StepResult::failed("TRANSFORM_ERROR", err.to_string()),
            };
            StepResult::signal(OrchestrationSignal::WaitEvent { event_name })
        }
        WaitConfig::Approval {
            prompt,
            required_approvals,
            approver_roles,
            approver_users,
            timeout_secs,
        } => run_human(
            prompt,
            *required_approvals,
            approver_roles,
            approver_users,
            *timeout_secs,
            ctx,
        ),
    }
}

/// Human approval gate: resolve the prompt and suspend.
pub fn run_human(
    prompt: &str,
    required_approvals: u32,
    approver_roles: &[String],
    approver_users: &[String],
    timeout_secs: Option<u64>,
    ctx: &ExecutionContext,
) -> StepResult {
    let prompt = match resolve_template(prompt, ctx) {
        Ok(p) => p,
        Err(err) => return StepResult::failed("TRANSFORM_ERROR", err.to_string()),
    };
    StepResult::signal(OrchestrationSignal::WaitApproval(ApprovalGate {
        prompt,
        required_approvals: required_approvals.max(1),
        approver_roles: approver_roles.to_vec(),
        approver_users: approver_users.to_vec(),
        timeout_secs,
    }))
}

/// Resolve the delay duration; the orchestrator performs the sleep.
pub fn run_delay(delay_seconds: &Value, ctx: &ExecutionContext) -> StepResult {
    let resolved = match delay_seconds {
        Value::String(expr) => match crate::expression::resolve_value(expr, ctx) {
            Ok(value) => value,
            Err(err) => return StepResult::failed("TRANSFORM_ERROR", err.to_string()),
        },
        other => other.clone(),
    };
    match coerce_number(&resolved) {
        Some(seconds) if seconds >= 0.0 => StepResult::signal(OrchestrationSignal::Delay {
            seconds: seconds as u64,
        }),
        _ => StepResult::failed(
            "MISSING_DELAY_CONFIG",
            format!("delay_seconds did not resolve to a non-negative number: {resolved}"),
        ),
    }
}

/// End the walk successfully.
pub fn run_terminate(reason: Option<&str>) -> StepResult {
    let mut result = StepResult::ok(reason.map(|r| json!({ "reason": r })));
    result.should_terminate = true;
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_types::condition::{ComparisonOp, Condition};

    fn ctx_with(name: &str, value: Value) -> ExecutionContext {
        let mut ctx = ExecutionContext::default();
        ctx.variables.insert(name.to_string(), value);
        ctx
    }

    #[test]
    fn set_variables_resolves_templates() {
        let ctx = ctx_with("name", json!("World"));
        let result = run_set_variables(
            &HashMap::from([("greeting".to_string(), json!("Hello, {{$.name}}!"))]),
            &ctx,
        );
        assert!(result.success);
        assert_eq!(
            result.variable_updates.get("greeting"),
            Some(&json!("Hello, World!"))
        );
        assert_eq!(result.output.unwrap()["greeting"], json!("Hello, World!"));
    }

    #[test]
    fn decision_routes_and_requires_conditions() {
        let ctx = ctx_with("amount", json!(1500));
        let conditions = vec![
            StepTransition {
                target_step_id: "high".to_string(),
                condition: Some(Condition::simple(
                    json!("$.amount"),
                    ComparisonOp::Gt,
                    json!(1000),
                )),
                priority: Some(1),
                is_default: false,
            },
            StepTransition {
                target_step_id: "low".to_string(),
                condition: None,
                priority: None,
                is_default: true,
            },
        ];
        let result = run_decision(&conditions, &ctx);
        assert!(result.success);
        assert_eq!(result.next_step_id.as_deref(), Some("high"));

        let empty = run_decision(&[], &ctx);
        assert!(!empty.success);
        assert_eq!(
            empty.error.unwrap().code,
            "MISSING_DECISION_CONFIG".to_string()
        );
    }

    #[test]
    fn wait_event_resolves_name() {
        let ctx = ctx_with("topic", json!("payment"));
        let result = run_wait(
            &WaitConfig::Event {
                event_name: "{{$.topic}}.settled".to_string(),
            },
            &ctx,
        );
        match result.signal {
            Some(OrchestrationSignal::WaitEvent { event_name }) => {
                assert_eq!(event_name, "payment.settled");
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[test]
    fn human_gate_resolves_prompt_and_floors_approvals() {
        let ctx = ctx_with("orderId", json!("o-3"));
        let result = run_human("Approve {{$.orderId}}?", 0, &[], &[], None, &ctx);
        match result.signal {
            Some(OrchestrationSignal::WaitApproval(gate)) => {
                assert_eq!(gate.prompt, "Approve o-3?");
                assert_eq!(gate.required_approvals, 1);
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[test]
    fn delay_accepts_numbers_and_expressions() {
        let ctx = ctx_with("pause", json!(7));
        for config in [json!(5), json!("5"), json!("$.pause")] {
            let result = run_delay(&config, &ctx);
            assert!(matches!(
                result.signal,
                Some(OrchestrationSignal::Delay { .. })
            ));
        }
        let bad = run_delay(&json!("$.not_a_number"), &ctx);
        assert!(!bad.success);
    }

    #[test]
    fn terminate_sets_flag() {
        let result = run_terminate(Some("done early"));
        assert!(result.success);
        assert!(result.should_terminate);
    }
}
