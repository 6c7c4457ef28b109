//! Structural validation of workflow definitions.
//!
//! Runs before a version activates. Validation is a full sweep: all issues
//! are collected and reported together rather than failing on the first one.

use std::collections::HashSet;

use serde_json::Value;
use stepwise_types::workflow::{
    StepConfig, VariableType, WorkflowDefinition, WorkflowStep,
};

/// One structural problem found in a definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Stable machine-readable code.
    pub code: &'static str,
    /// Step id the issue is anchored to, when step-scoped.
    pub step_id: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn workflow(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            step_id: None,
            message: message.into(),
        }
    }

    fn step(code: &'static str, step_id: &str, message: impl Into<String>) -> Self {
        Self {
            code,
            step_id: Some(step_id.to_string()),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.step_id {
            Some(step_id) => write!(f, "[{}] step '{step_id}': {}", self.code, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

/// Collect every structural issue in the definition. An empty result means
/// the definition is activatable.
pub fn validate_definition(definition: &WorkflowDefinition) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if definition.name.trim().is_empty() {
        issues.push(ValidationIssue::workflow("EMPTY_NAME", "workflow name is empty"));
    }
    if definition.steps.is_empty() {
        issues.push(ValidationIssue::workflow("NO_STEPS", "workflow has no steps"));
    }

    let mut seen = HashSet::new();
    for step in &definition.steps {
        if !seen.insert(step.id.as_str()) {
            issues.push(ValidationIssue::step(
                "DUPLICATE_STEP_ID",
                &step.id,
                "step id is declared more than once",
            ));
        }
    }
    let known: HashSet<&str> = definition.steps.iter().map(|s| s.id.as_str()).collect();

    for step in &definition.steps {
        check_step(step, &known, &mut issues);
    }

    for (name, declaration) in &definition.variables {
        if let Some(default) = &declaration.default {
            if !value_matches_type(default, declaration.var_type) {
                issues.push(ValidationIssue::workflow(
                    "VARIABLE_TYPE_MISMATCH",
                    format!(
                        "variable '{name}' default does not match its declared type {:?}",
                        declaration.var_type
                    ),
                ));
            }
        }
    }

    if definition.settings.max_steps == Some(0) {
        issues.push(ValidationIssue::workflow(
            "INVALID_SETTINGS",
            "settings.max_steps must be at least 1",
        ));
    }
    if definition.settings.max_duration_secs == Some(0) {
        issues.push(ValidationIssue::workflow(
            "INVALID_SETTINGS",
            "settings.max_duration_secs must be at least 1",
        ));
    }

    issues
}

fn require_target(
    step: &WorkflowStep,
    known: &HashSet<&str>,
    issues: &mut Vec<ValidationIssue>,
    target: &str,
    what: &str,
) {
    if !known.contains(target) {
        issues.push(ValidationIssue::step(
            "DANGLING_TARGET",
            &step.id,
            format!("{what} references unknown step '{target}'"),
        ));
    }
}

fn check_step(step: &WorkflowStep, known: &HashSet<&str>, issues: &mut Vec<ValidationIssue>) {
    for transition in &step.transitions {
        require_target(step, known, issues, &transition.target_step_id, "transition");
    }
    if let Some(policy) = &step.on_error {
        if let Some(fallback) = &policy.fallback_step_id {
            require_target(step, known, issues, fallback, "on_error fallback");
        }
    }

    match &step.config {
        StepConfig::Decision { conditions } => {
            if conditions.is_empty() {
                issues.push(ValidationIssue::step(
                    "EMPTY_DECISION",
                    &step.id,
                    "decision step has no conditions",
                ));
            }
            for condition in conditions {
                require_target(
                    step,
                    known,
                    issues,
                    &condition.target_step_id,
                    "decision condition",
                );
            }
        }
        StepConfig::Parallel { branches, .. } => {
            let mut branch_ids = HashSet::new();
            for branch in branches {
                if !branch_ids.insert(branch.id.as_str()) {
                    issues.push(ValidationIssue::step(
                        "DUPLICATE_BRANCH_ID",
                        &step.id,
                        format!("branch id '{}' is declared more than once", branch.id),
                    ));
                }
                if branch.steps.is_empty() {
                    issues.push(ValidationIssue::step(
                        "EMPTY_BRANCH",
                        &step.id,
                        format!("branch '{}' has no steps", branch.id),
                    ));
                }
                for target in &branch.steps {
                    require_target(step, known, issues, target, "parallel branch");
                }
            }
        }
        StepConfig::Loop { body, .. } => {
            if body.is_empty() {
                issues.push(ValidationIssue::step(
                    "EMPTY_LOOP_BODY",
                    &step.id,
                    "loop step has no body steps",
                ));
            }
            for target in body {
                require_target(step, known, issues, target, "loop body");
            }
        }
        StepConfig::Compensate { steps } => {
            for target in steps {
                require_target(step, known, issues, target, "compensation");
            }
        }
        StepConfig::Retry {
            step_id: target, ..
        } => {
            require_target(step, known, issues, target, "retry");
            if target == &step.id {
                issues.push(ValidationIssue::step(
                    "SELF_RETRY",
                    &step.id,
                    "retry step targets itself",
                ));
            }
        }
        StepConfig::Human {
            required_approvals, ..
        } => {
            if *required_approvals == 0 {
                issues.push(ValidationIssue::step(
                    "INVALID_APPROVALS",
                    &step.id,
                    "required_approvals must be at least 1",
                ));
            }
        }
        _ => {}
    }
}

fn value_matches_type(value: &Value, var_type: VariableType) -> bool {
    match var_type {
        VariableType::String => value.is_string(),
        VariableType::Number => value.is_number(),
        VariableType::Boolean => value.is_boolean(),
        VariableType::Object => value.is_object(),
        VariableType::Array => value.is_array(),
        VariableType::Any => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;
    use stepwise_types::workflow::{
        ParallelBranch, StepTransition, VariableDeclaration, WorkflowSettings, WorkflowStatus,
    };
    use uuid::Uuid;

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

    fn definition(steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        WorkflowDefinition {
            workflow_id: Uuid::now_v7(),
            version: 1,
            name: "wf".to_string(),
            description: None,
            status: WorkflowStatus::Draft,
            steps,
            triggers: vec![],
            variables: HashMap::new(),
            settings: WorkflowSettings::default(),
            tags: vec![],
            category: None,
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn codes(issues: &[ValidationIssue]) -> Vec<&'static str> {
        issues.iter().map(|i| i.code).collect()
    }

    #[test]
    fn valid_definition_passes() {
        let def = definition(vec![
            step("a", 1, StepConfig::SetVariables { variables: HashMap::new() }),
            step("b", 2, StepConfig::Terminate { reason: None }),
        ]);
        assert!(validate_definition(&def).is_empty());
    }

    #[test]
    fn empty_workflow_flagged() {
        let def = definition(vec![]);
        assert!(codes(&validate_definition(&def)).contains(&"NO_STEPS"));
    }

    #[test]
    fn duplicate_step_ids_flagged() {
        let def = definition(vec![
            step("a", 1, StepConfig::Terminate { reason: None }),
            step("a", 2, StepConfig::Terminate { reason: None }),
        ]);
        assert!(codes(&validate_definition(&def)).contains(&"DUPLICATE_STEP_ID"));
    }

    #[test]
    fn dangling_transition_flagged() {
        let mut a = step("a", 1, StepConfig::Terminate { reason: None });
        a.transitions = vec![StepTransition {
            target_step_id: "ghost".to_string(),
            condition: None,
            priority: None,
            is_default: false,
        }];
        let issues = validate_definition(&definition(vec![a]));
        assert!(codes(&issues).contains(&"DANGLING_TARGET"));
        assert_eq!(issues[0].step_id.as_deref(), Some("a"));
    }

    #[test]
    fn empty_decision_flagged() {
        let def = definition(vec![step(
            "d",
            1,
            StepConfig::Decision { conditions: vec![] },
        )]);
        assert!(codes(&validate_definition(&def)).contains(&"EMPTY_DECISION"));
    }

    #[test]
    fn parallel_branch_problems_flagged() {
        let def = definition(vec![
            step(
                "p",
                1,
                StepConfig::Parallel {
                    branches: vec![
                        ParallelBranch { id: "b1".to_string(), steps: vec![] },
                        ParallelBranch {
                            id: "b1".to_string(),
                            steps: vec!["ghost".to_string()],
                        },
                    ],
                    join: Default::default(),
                },
            ),
        ]);
        let found = codes(&validate_definition(&def));
        assert!(found.contains(&"EMPTY_BRANCH"));
        assert!(found.contains(&"DUPLICATE_BRANCH_ID"));
        assert!(found.contains(&"DANGLING_TARGET"));
    }

    #[test]
    fn self_retry_flagged() {
        let def = definition(vec![step(
            "r",
            1,
            StepConfig::Retry {
                step_id: "r".to_string(),
                max_attempts: 2,
            },
        )]);
        assert!(codes(&validate_definition(&def)).contains(&"SELF_RETRY"));
    }

    #[test]
    fn variable_default_type_mismatch_flagged() {
        let mut def = definition(vec![step("a", 1, StepConfig::Terminate { reason: None })]);
        def.variables.insert(
            "amount".to_string(),
            VariableDeclaration {
                var_type: VariableType::Number,
                default: Some(json!("not-a-number")),
                required: false,
            },
        );
        assert!(codes(&validate_definition(&def)).contains(&"VARIABLE_TYPE_MISMATCH"));
    }

    #[test]
    fn zero_settings_flagged() {
        let mut def = definition(vec![step("a", 1, StepConfig::Terminate { reason: None })]);
        def.settings.max_steps = Some(0);
        assert!(codes(&validate_definition(&def)).contains(&"INVALID_SETTINGS"));
    }
}
