//! Execution context for expression and condition evaluation.
//!
//! Ephemeral, never persisted: rebuilt per step from the current instance
//! state. Environment values are injected explicitly per execution rather
//! than read from the process, so tests and multi-tenant hosts control
//! exactly what `{{env.*}}` can see.

use std::collections::HashMap;

use serde_json::{Map, Value};
use stepwise_types::instance::WorkflowInstance;

/// Snapshot of everything expressions may reference for one step evaluation.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Instance variables (the execution's working memory).
    pub variables: HashMap<String, Value>,
    /// Latest completed output per step id.
    pub step_outputs: HashMap<String, Value>,
    /// Trigger input, immutable for the life of the instance.
    pub input: Value,
    /// Environment values exposed to `{{env.*}}`.
    pub env: HashMap<String, String>,
}

impl ExecutionContext {
    /// Build a context from the current instance state.
    pub fn from_instance(instance: &WorkflowInstance, env: &HashMap<String, String>) -> Self {
        Self {
            variables: instance.variables.clone(),
            step_outputs: instance.step_outputs(),
            input: instance.input.clone(),
            env: env.clone(),
        }
    }

    /// Combined object for transform/script evaluation: variables flattened
    /// to the root, with `steps`, `input`, and `env` nested under reserved
    /// keys. A variable named like a reserved key is shadowed by it.
    pub fn to_combined_object(&self) -> Value {
        let mut root = Map::new();
        for (name, value) in &self.variables {
            root.insert(name.clone(), value.clone());
        }
        let mut steps = Map::new();
        for (step_id, output) in &self.step_outputs {
            steps.insert(step_id.clone(), output.clone());
        }
        root.insert("steps".to_string(), Value::Object(steps));
        root.insert("input".to_string(), self.input.clone());
        let env: Map<String, Value> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        root.insert("env".to_string(), Value::Object(env));
        Value::Object(root)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_types::instance::StepExecution;
    use uuid::Uuid;

    #[test]
    fn context_from_instance_derives_step_outputs() {
        let mut instance = WorkflowInstance::new(Uuid::now_v7(), 1, json!({"orderId": "o-9"}));
        instance.variables.insert("amount".to_string(), json!(42));
        let mut exec = StepExecution::started("fetch", None);
        exec.complete(Some(json!({"status": 200})));
        instance.step_executions.push(exec);

        let ctx = ExecutionContext::from_instance(&instance, &HashMap::new());
        assert_eq!(ctx.variables.get("amount"), Some(&json!(42)));
        assert_eq!(ctx.step_outputs.get("fetch"), Some(&json!({"status": 200})));
        assert_eq!(ctx.input, json!({"orderId": "o-9"}));
    }

    #[test]
    fn combined_object_flattens_variables() {
        let ctx = ExecutionContext {
            variables: HashMap::from([("amount".to_string(), json!(10))]),
            step_outputs: HashMap::from([("s1".to_string(), json!("out"))]),
            input: json!({"k": true}),
            env: HashMap::from([("REGION".to_string(), "eu".to_string())]),
        };
        let combined = ctx.to_combined_object();
        assert_eq!(combined["amount"], json!(10));
        assert_eq!(combined["steps"]["s1"], json!("out"));
        assert_eq!(combined["input"]["k"], json!(true));
        assert_eq!(combined["env"]["REGION"], json!("eu"));
    }
}
