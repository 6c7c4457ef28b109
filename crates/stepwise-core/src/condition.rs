//! Condition evaluation and transition resolution.
//!
//! Conditions never raise: operand resolution failures degrade to null and
//! invalid regex patterns evaluate false, so a bad condition routes rather
//! than crashes an instance.

use regex::Regex;
use serde_json::Value;
use stepwise_types::condition::{ComparisonOp, Condition, SimpleCondition};
use stepwise_types::workflow::StepTransition;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::expression::resolve_operand;
use crate::functions::{coerce_number, to_text};

// ---------------------------------------------------------------------------
// Condition evaluation
// ---------------------------------------------------------------------------

/// Evaluate a condition tree against the context.
pub fn evaluate_condition(condition: &Condition, ctx: &ExecutionContext) -> bool {
    match condition {
        Condition::Simple(simple) => evaluate_simple(simple, ctx),
        Condition::Compound(compound) => {
            let mut iter = compound.conditions.iter();
            match compound.operator {
                stepwise_types::condition::BoolOp::And => {
                    iter.all(|c| evaluate_condition(c, ctx))
                }
                stepwise_types::condition::BoolOp::Or => {
                    iter.any(|c| evaluate_condition(c, ctx))
                }
            }
        }
        Condition::Not(not) => !evaluate_condition(&not.condition, ctx),
    }
}

fn evaluate_simple(simple: &SimpleCondition, ctx: &ExecutionContext) -> bool {
    let left = resolve_lenient(&simple.left, ctx);
    let right = simple
        .right
        .as_ref()
        .map(|r| resolve_lenient(r, ctx))
        .unwrap_or(Value::Null);

    match simple.operator {
        ComparisonOp::Eq => loose_eq(&left, &right),
        ComparisonOp::Neq => !loose_eq(&left, &right),
        ComparisonOp::Gt => numeric_cmp(&left, &right).is_some_and(|o| o.is_gt()),
        ComparisonOp::Gte => numeric_cmp(&left, &right).is_some_and(|o| o.is_ge()),
        ComparisonOp::Lt => numeric_cmp(&left, &right).is_some_and(|o| o.is_lt()),
        ComparisonOp::Lte => numeric_cmp(&left, &right).is_some_and(|o| o.is_le()),
        ComparisonOp::Contains => match &left {
            Value::Array(items) => items.iter().any(|item| loose_eq(item, &right)),
            other => to_text(other).contains(&to_text(&right)),
        },
        ComparisonOp::StartsWith => to_text(&left).starts_with(&to_text(&right)),
        ComparisonOp::EndsWith => to_text(&left).ends_with(&to_text(&right)),
        ComparisonOp::In => match &right {
            Value::Array(items) => items.iter().any(|item| loose_eq(item, &left)),
            _ => false,
        },
        ComparisonOp::NotIn => match &right {
            Value::Array(items) => !items.iter().any(|item| loose_eq(item, &left)),
            _ => true,
        },
        // Absent and explicit null are both "does not exist".
        ComparisonOp::Exists => !left.is_null(),
        ComparisonOp::NotExists => left.is_null(),
        ComparisonOp::Regex => match Regex::new(&to_text(&right)) {
            Ok(pattern) => pattern.is_match(&to_text(&left)),
            Err(err) => {
                debug!(pattern = %to_text(&right), %err, "invalid regex in condition");
                false
            }
        },
    }
}

/// Resolve an operand, degrading evaluation errors to null.
fn resolve_lenient(operand: &Value, ctx: &ExecutionContext) -> Value {
    match resolve_operand(operand, ctx) {
        Ok(value) => value,
        Err(err) => {
            debug!(%err, "operand resolution failed, treating as null");
            Value::Null
        }
    }
}

/// Equality with numeric coercion: "5" == 5, true == 1.
fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (coerce_number(a), coerce_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn numeric_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    let x = coerce_number(a)?;
    let y = coerce_number(b)?;
    x.partial_cmp(&y)
}

// ---------------------------------------------------------------------------
// Transition resolution
// ---------------------------------------------------------------------------

/// Candidate transitions sorted by ascending priority, unset last. Stable,
/// so declaration order breaks ties.
fn sorted<'a>(transitions: &'a [StepTransition]) -> Vec<&'a StepTransition> {
    let mut sorted: Vec<&StepTransition> = transitions.iter().collect();
    sorted.sort_by_key(|t| t.priority.unwrap_or(i32::MAX));
    sorted
}

/// The single transition to take, if any.
///
/// First pass walks non-default transitions in priority order: a transition
/// with a condition matches when it evaluates true; one without a condition
/// always matches. If nothing matched, a transition flagged `is_default` is
/// the fallback. Otherwise none (end of branch; the caller decides).
pub fn find_matching_transition(
    transitions: &[StepTransition],
    ctx: &ExecutionContext,
) -> Option<String> {
    let sorted = sorted(transitions);
    for transition in &sorted {
        if transition.is_default {
            continue;
        }
        let matches = match &transition.condition {
            Some(condition) => evaluate_condition(condition, ctx),
            None => true,
        };
        if matches {
            return Some(transition.target_step_id.clone());
        }
    }
    sorted
        .iter()
        .find(|t| t.is_default)
        .map(|t| t.target_step_id.clone())
}

/// Every matching non-default transition in priority order; the default
/// alone when nothing else matches.
pub fn find_all_matching_transitions(
    transitions: &[StepTransition],
    ctx: &ExecutionContext,
) -> Vec<String> {
    let sorted = sorted(transitions);
    let mut matches: Vec<String> = sorted
        .iter()
        .filter(|t| !t.is_default)
        .filter(|t| match &t.condition {
            Some(condition) => evaluate_condition(condition, ctx),
            None => true,
        })
        .map(|t| t.target_step_id.clone())
        .collect();
    if matches.is_empty() {
        if let Some(default) = sorted.iter().find(|t| t.is_default) {
            matches.push(default.target_step_id.clone());
        }
    }
    matches
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
