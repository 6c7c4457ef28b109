//! Sandboxed script step executor.
//!
//! Scripts are untrusted step code. Instead of handing them to a host
//! evaluator, the executor interprets a small statement language over the
//! expression engine:
//!
//! ```text
//! let subtotal = {{fn.sum($.order.lines)}}
//! let label = {{fn.concat('order-', input.orderId)}}
//! return {{fn.round($.subtotal, 2)}}
//! ```
//!
//! One statement per line (`let <name> = <expr>`, `<name> = <expr>`,
//! `return <expr>`; `//` comments and blank lines ignored). The only
//! reachable surface is the expression grammar and its built-in function
//! table; there is no host access of any kind. A statement budget plus a
//! wall-clock timeout raced on a blocking task bound execution, and both
//! report as `SCRIPT_ERROR` rather than hanging the caller.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::expression::resolve_expression;
use crate::step::StepResult;

const DEFAULT_TIMEOUT_SECS: u64 = 5;
const STATEMENT_BUDGET: usize = 1_000;

pub async fn run_script(
    source: &str,
    timeout_secs: Option<u64>,
    output_variable: Option<&str>,
    ctx: &ExecutionContext,
) -> StepResult {
    let timeout = Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
    let source = source.to_string();
    let ctx = ctx.clone();

    let handle = tokio::task::spawn_blocking(move || interpret(&source, &ctx));
    let outcome = match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_err)) => {
            return StepResult::failed("SCRIPT_ERROR", format!("script task failed: {join_err}"));
        }
        Err(_) => {
            debug!(timeout_secs = timeout.as_secs(), "script timed out");
            return StepResult::failed(
                "SCRIPT_ERROR",
                format!("script exceeded its {}s timeout", timeout.as_secs()),
            );
        }
    };

    match outcome {
        Ok(value) => {
            let mut result = StepResult::ok(Some(value.clone()));
            if let Some(name) = output_variable {
                result = result.with_variables(HashMap::from([(name.to_string(), value)]));
            }
            result
        }
        Err(message) => StepResult::failed("SCRIPT_ERROR", message),
    }
}

/// Run the statement list. Local bindings shadow instance variables for the
/// rest of the script but never escape it.
fn interpret(source: &str, ctx: &ExecutionContext) -> Result<Value, String> {
    let mut scope = ctx.clone();
    let mut statements = 0usize;

    for (line_no, raw) in source.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        statements += 1;
        if statements > STATEMENT_BUDGET {
            return Err(format!("statement budget of {STATEMENT_BUDGET} exceeded"));
        }

        if let Some(expr) = line.strip_prefix("return ") {
            return eval(expr, &scope).map_err(|e| at(line_no, &e));
        }
        if line == "return" {
            return Ok(Value::Null);
        }

        let assignment = line.strip_prefix("let ").unwrap_or(line);
        let Some((name, expr)) = assignment.split_once('=') else {
            return Err(at(line_no, &format!("unrecognized statement '{line}'")));
        };
        let name = name.trim();
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(at(line_no, &format!("invalid identifier '{name}'")));
        }
        let value = eval(expr.trim(), &scope).map_err(|e| at(line_no, &e))?;
        scope.variables.insert(name.to_string(), value);
    }

    Ok(Value::Null)
}

fn eval(expr: &str, scope: &ExecutionContext) -> Result<Value, String> {
    let root = scope.to_combined_object();
    resolve_expression(expr, &root, scope).map_err(|e| e.to_string())
}

fn at(line_no: usize, message: &str) -> String {
    format!("line {}: {message}", line_no + 1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::default();
        ctx.variables
            .insert("order".to_string(), json!({"lines": [10, 20, 12.5]}));
        ctx.input = json!({"orderId": "o-42"});
        ctx
    }

    #[tokio::test]
    async fn script_computes_and_stores_output() {
        let source = r#"
            // add up the order lines
            let subtotal = {{fn.sum($.order.lines)}}
            let label = {{fn.concat('order-', input.orderId)}}
            return {{fn.concat($.label, ': ', fn.toString($.subtotal))}}
        "#;
        let result = run_script(source, None, Some("summary"), &ctx()).await;
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.output, Some(json!("order-o-42: 42.5")));
        assert_eq!(
            result.variable_updates.get("summary"),
            Some(&json!("order-o-42: 42.5"))
        );
    }

    #[tokio::test]
    async fn locals_shadow_but_do_not_escape() {
        let source = "let order = 'shadowed'\nreturn $.order";
        let ctx = ctx();
        let result = run_script(source, None, None, &ctx).await;
        assert_eq!(result.output, Some(json!("shadowed")));
        // Only the declared output variable would be merged; locals are not.
        assert!(result.variable_updates.is_empty());
    }

    #[tokio::test]
    async fn script_without_return_yields_null() {
        let result = run_script("let x = 1", None, None, &ctx()).await;
        assert!(result.success);
        assert_eq!(result.output, Some(Value::Null));
    }

    #[tokio::test]
    async fn parse_error_is_script_error() {
        let result = run_script("this is not a statement", None, None, &ctx()).await;
        assert!(!result.success);
        let failure = result.error.unwrap();
        assert_eq!(failure.code, "SCRIPT_ERROR");
        assert!(failure.message.contains("line 1"));
    }

    #[tokio::test]
    async fn bad_function_call_is_script_error() {
        let result = run_script("return {{fn.nope()}}", None, None, &ctx()).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, "SCRIPT_ERROR");
    }

    #[tokio::test]
    async fn statement_budget_bounds_execution() {
        let mut source = String::new();
        for i in 0..1_100 {
            source.push_str(&format!("let v{i} = {i}\n"));
        }
        let result = run_script(&source, None, None, &ctx()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().message.contains("budget"));
    }
}
