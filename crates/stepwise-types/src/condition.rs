//! Condition tree used by transitions, decision steps, and event triggers.
//!
//! Conditions form a recursive union: a simple comparison, a boolean
//! combination (`and`/`or`), or a negation (`not`). The JSON shape is
//! discriminated by field layout rather than an explicit tag, so the serde
//! representation is untagged with the more specific variants listed first.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// A condition tree evaluated against an execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    // Order matters: Not and Compound carry distinguishing fields
    // (`condition`, `conditions`) and must be tried before Simple.
    Not(NotCondition),
    Compound(CompoundCondition),
    Simple(SimpleCondition),
}

impl Condition {
    /// Convenience constructor for a simple comparison.
    pub fn simple(left: Value, operator: ComparisonOp, right: Value) -> Self {
        Condition::Simple(SimpleCondition {
            left,
            operator,
            right: Some(right),
        })
    }

    /// Convenience constructor for a unary operator (exists/notExists).
    pub fn unary(left: Value, operator: ComparisonOp) -> Self {
        Condition::Simple(SimpleCondition {
            left,
            operator,
            right: None,
        })
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Condition::Compound(CompoundCondition {
            operator: BoolOp::And,
            conditions,
        })
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Condition::Compound(CompoundCondition {
            operator: BoolOp::Or,
            conditions,
        })
    }

    pub fn negate(condition: Condition) -> Self {
        Condition::Not(NotCondition {
            operator: NotOp::Not,
            condition: Box::new(condition),
        })
    }
}

/// Negation of a nested condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotCondition {
    pub operator: NotOp,
    pub condition: Box<Condition>,
}

/// The only legal operator for `NotCondition`; keeps the untagged
/// discrimination unambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotOp {
    Not,
}

/// Boolean combination of nested conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompoundCondition {
    pub operator: BoolOp,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoolOp {
    And,
    Or,
}

/// A single comparison between two operands.
///
/// Operands may be literals or expression strings; resolution happens at
/// evaluation time. `right` is absent for unary operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleCondition {
    pub left: Value,
    pub operator: ComparisonOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<Value>,
}

/// Comparison operators, camelCase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComparisonOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    Exists,
    NotExists,
    Regex,
}

impl ComparisonOp {
    /// Unary operators take no right-hand operand.
    pub fn is_unary(&self) -> bool {
        matches!(self, ComparisonOp::Exists | ComparisonOp::NotExists)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn simple_condition_parses() {
        let text = r#"{"left": "$.amount", "operator": "gt", "right": 1000}"#;
        let cond: Condition = serde_json::from_str(text).unwrap();
        match cond {
            Condition::Simple(s) => {
                assert_eq!(s.operator, ComparisonOp::Gt);
                assert_eq!(s.right, Some(json!(1000)));
            }
            _ => panic!("expected simple"),
        }
    }

    #[test]
    fn camel_case_operator_names() {
        let text = r#"{"left": "$.name", "operator": "startsWith", "right": "ord-"}"#;
        let cond: Condition = serde_json::from_str(text).unwrap();
        assert!(matches!(
            cond,
            Condition::Simple(SimpleCondition {
                operator: ComparisonOp::StartsWith,
                ..
            })
        ));

        let text = r#"{"left": "$.user", "operator": "notExists"}"#;
        let cond: Condition = serde_json::from_str(text).unwrap();
        match cond {
            Condition::Simple(s) => {
                assert_eq!(s.operator, ComparisonOp::NotExists);
                assert!(s.right.is_none());
            }
            _ => panic!("expected simple"),
        }
    }

    #[test]
    fn compound_condition_parses() {
        let text = r#"{
            "operator": "and",
            "conditions": [
                {"left": "$.amount", "operator": "gt", "right": 100},
                {"left": "$.region", "operator": "in", "right": ["eu", "us"]}
            ]
        }"#;
        let cond: Condition = serde_json::from_str(text).unwrap();
        match cond {
            Condition::Compound(c) => {
                assert_eq!(c.operator, BoolOp::And);
                assert_eq!(c.conditions.len(), 2);
            }
            _ => panic!("expected compound"),
        }
    }

    #[test]
    fn not_condition_parses() {
        let text = r#"{
            "operator": "not",
            "condition": {"left": "$.flag", "operator": "eq", "right": true}
        }"#;
        let cond: Condition = serde_json::from_str(text).unwrap();
        match cond {
            Condition::Not(n) => {
                assert!(matches!(*n.condition, Condition::Simple(_)));
            }
            _ => panic!("expected not"),
        }
    }

    #[test]
    fn nested_tree_roundtrip() {
        let cond = Condition::or(vec![
            Condition::simple(json!("$.amount"), ComparisonOp::Gte, json!(500)),
            Condition::negate(Condition::unary(json!("$.owner"), ComparisonOp::Exists)),
        ]);
        let text = serde_json::to_string(&cond).unwrap();
        let parsed: Condition = serde_json::from_str(&text).unwrap();
        match parsed {
            Condition::Compound(c) => {
                assert_eq!(c.operator, BoolOp::Or);
                assert!(matches!(c.conditions[1], Condition::Not(_)));
            }
            _ => panic!("expected compound"),
        }
    }
}
