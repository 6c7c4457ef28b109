//! Transform step executor.
//!
//! Evaluates an expression against the combined context object (variables
//! flattened to the root alongside `steps`, `input`, and `env`). Evaluation
//! failures become a typed `TRANSFORM_ERROR` result, never a crash.

use std::collections::HashMap;

use crate::context::ExecutionContext;
use crate::expression::resolve_expression;
use crate::step::StepResult;

pub fn run_transform(
    expression: &str,
    output_variable: Option<&str>,
    ctx: &ExecutionContext,
) -> StepResult {
    let root = ctx.to_combined_object();
    match resolve_expression(expression, &root, ctx) {
        Ok(value) => {
            let mut result = StepResult::ok(Some(value.clone()));
            if let Some(name) = output_variable {
                result = result.with_variables(HashMap::from([(name.to_string(), value)]));
            }
            result
        }
        Err(err) => StepResult::failed("TRANSFORM_ERROR", err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::default();
        ctx.variables
            .insert("order".to_string(), json!({"total": 120, "lines": [1, 2, 3]}));
        ctx.step_outputs
            .insert("fetch".to_string(), json!({"status": 200}));
        ctx.input = json!({"region": "eu"});
        ctx
    }

    #[test]
    fn transform_reads_combined_root() {
        let ctx = ctx();
        let result = run_transform("$.order.total", Some("total"), &ctx);
        assert!(result.success);
        assert_eq!(result.output, Some(json!(120)));
        assert_eq!(result.variable_updates.get("total"), Some(&json!(120)));

        let from_steps = run_transform("$.steps.fetch.status", None, &ctx);
        assert_eq!(from_steps.output, Some(json!(200)));
        assert!(from_steps.variable_updates.is_empty());

        let from_input = run_transform("$.input.region", None, &ctx);
        assert_eq!(from_input.output, Some(json!("eu")));
    }

    #[test]
    fn transform_functions_work() {
        let ctx = ctx();
        let result = run_transform("{{fn.sum($.order.lines)}}", Some("sum"), &ctx);
        assert!(result.success);
        assert_eq!(result.output, Some(json!(6)));
    }

    #[test]
    fn transform_error_is_typed() {
        let ctx = ctx();
        let result = run_transform("{{fn.bogus()}}", None, &ctx);
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, "TRANSFORM_ERROR");
    }

    #[test]
    fn missing_path_resolves_null_not_error() {
        let ctx = ctx();
        let result = run_transform("$.not.there", Some("x"), &ctx);
        assert!(result.success);
        assert_eq!(result.output, Some(serde_json::Value::Null));
    }
}
