//! Expression resolver.
//!
//! Resolves variable references against an execution context:
//!
//! - `$.path` and `$.path[0].field` walk dotted/indexed paths over the
//!   instance variables;
//! - `{{steps.<id>.<path>}}` reads derived step outputs, `{{input.<path>}}`
//!   the trigger input, `{{env.<NAME>}}` the injected environment;
//! - `{{fn.<name>(args...)}}` invokes the built-in function table;
//! - a plain string with no recognized marker resolves to itself.
//!
//! Missing paths resolve to `Value::Null`, and templates render null as the
//! empty string. The only typed failure is a malformed or unknown function
//! invocation.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::context::ExecutionContext;
use crate::functions::{call_function, to_text};

/// Evaluation failure. Only function invocations can produce one; path
/// resolution degrades to null instead.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("bad call to '{name}': {reason}")]
    BadFunctionCall { name: String, reason: String },
}

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Resolve a single string expression to a value.
///
/// A string that is exactly one `{{...}}` marker yields the marker's value
/// with its type preserved; a string containing embedded markers yields the
/// interpolated string; `$.path` yields the variable at that path.
pub fn resolve_value(expr: &str, ctx: &ExecutionContext) -> Result<Value, EvalError> {
    let trimmed = expr.trim();
    if let Some(path) = trimmed.strip_prefix("$.") {
        return Ok(lookup_path(&variables_root(ctx), path));
    }
    if let Some(inner) = single_marker(trimmed) {
        return resolve_marker(inner, ctx);
    }
    if trimmed.contains("{{") {
        return resolve_template(expr, ctx).map(Value::String);
    }
    Ok(Value::String(expr.to_string()))
}

/// Interpolate every `{{...}}` marker in a string, rendering null as "".
pub fn resolve_template(template: &str, ctx: &ExecutionContext) -> Result<String, EvalError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let value = resolve_marker(after[..end].trim(), ctx)?;
                out.push_str(&to_text(&value));
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated marker, keep the tail verbatim.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Recursively resolve every string leaf of a JSON value.
pub fn resolve_object(value: &Value, ctx: &ExecutionContext) -> Result<Value, EvalError> {
    match value {
        Value::String(s) => resolve_value(s, ctx),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_object(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), resolve_object(item, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Resolve an expression against a combined root object (variables flattened
/// to the root alongside `steps`/`input`/`env`). Used by transform and
/// script evaluation, where `$.` addresses the combined object.
pub fn resolve_expression(
    expr: &str,
    root: &Value,
    ctx: &ExecutionContext,
) -> Result<Value, EvalError> {
    let trimmed = expr.trim();
    if let Some(path) = trimmed.strip_prefix("$.") {
        return Ok(lookup_path(root, path));
    }
    if trimmed == "$" {
        return Ok(root.clone());
    }
    resolve_value(expr, ctx)
}

/// Resolve an operand that may be a literal or an expression string.
pub fn resolve_operand(operand: &Value, ctx: &ExecutionContext) -> Result<Value, EvalError> {
    match operand {
        Value::String(s) => resolve_value(s, ctx),
        other => Ok(other.clone()),
    }
}

// ---------------------------------------------------------------------------
// Marker resolution
// ---------------------------------------------------------------------------

/// The inner content when the whole string is a single `{{...}}` marker.
fn single_marker(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    // Reject strings like "{{a}} and {{b}}".
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn resolve_marker(content: &str, ctx: &ExecutionContext) -> Result<Value, EvalError> {
    if let Some(call) = content.strip_prefix("fn.") {
        return resolve_function_call(call, ctx);
    }
    if let Some(path) = content.strip_prefix("steps.") {
        return Ok(resolve_step_path(path, ctx));
    }
    if content == "input" {
        return Ok(ctx.input.clone());
    }
    if let Some(path) = content.strip_prefix("input.") {
        return Ok(lookup_path(&ctx.input, path));
    }
    if let Some(name) = content.strip_prefix("env.") {
        return Ok(ctx
            .env
            .get(name)
            .map(|v| Value::String(v.clone()))
            .unwrap_or(Value::Null));
    }
    if let Some(path) = content.strip_prefix("$.") {
        return Ok(lookup_path(&variables_root(ctx), path));
    }
    // Bare name: a dotted path over the variables.
    Ok(lookup_path(&variables_root(ctx), content))
}

fn resolve_step_path(path: &str, ctx: &ExecutionContext) -> Value {
    let (step_id, rest) = match path.split_once('.') {
        Some((id, rest)) => (id, Some(rest)),
        None => (path, None),
    };
    let Some(output) = ctx.step_outputs.get(step_id) else {
        return Value::Null;
    };
    match rest {
        None | Some("output") => output.clone(),
        Some(rest) => {
            // Accept both `steps.<id>.<path>` and `steps.<id>.output.<path>`.
            let rest = rest.strip_prefix("output.").unwrap_or(rest);
            lookup_path(output, rest)
        }
    }
}

fn variables_root(ctx: &ExecutionContext) -> Value {
    let map: Map<String, Value> = ctx
        .variables
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Value::Object(map)
}

// ---------------------------------------------------------------------------
// Path lookup
// ---------------------------------------------------------------------------

/// Walk a dotted path with optional `[index]` segments. Missing segments
/// resolve to null.
pub fn lookup_path(root: &Value, path: &str) -> Value {
    let mut current = root.clone();
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        let (field, indices) = split_indices(segment);
        if !field.is_empty() {
            current = match current.get(field) {
                Some(v) => v.clone(),
                None => return Value::Null,
            };
        }
        for index in indices {
            current = match current.get(index) {
                Some(v) => v.clone(),
                None => return Value::Null,
            };
        }
    }
    current
}

/// Split `items[0][1]` into `("items", [0, 1])`. A malformed index makes the
/// whole segment resolve to nothing downstream.
fn split_indices(segment: &str) -> (&str, Vec<usize>) {
    match segment.find('[') {
        None => (segment, Vec::new()),
        Some(bracket) => {
            let field = &segment[..bracket];
            let mut indices = Vec::new();
            let mut rest = &segment[bracket..];
            while let Some(open) = rest.find('[') {
                let Some(close) = rest[open..].find(']') else {
                    break;
                };
                if let Ok(index) = rest[open + 1..open + close].parse::<usize>() {
                    indices.push(index);
                }
                rest = &rest[open + close + 1..];
            }
            (field, indices)
        }
    }
}

// ---------------------------------------------------------------------------
// Function invocation parsing
// ---------------------------------------------------------------------------

fn resolve_function_call(call: &str, ctx: &ExecutionContext) -> Result<Value, EvalError> {
    let open = call.find('(').ok_or_else(|| EvalError::BadFunctionCall {
        name: call.to_string(),
        reason: "missing '('".to_string(),
    })?;
    let name = call[..open].trim();
    let close = call.rfind(')').ok_or_else(|| EvalError::BadFunctionCall {
        name: name.to_string(),
        reason: "missing ')'".to_string(),
    })?;
    if close < open {
        return Err(EvalError::BadFunctionCall {
            name: name.to_string(),
            reason: "unbalanced parentheses".to_string(),
        });
    }
    let args_src = &call[open + 1..close];
    let mut args = Vec::new();
    for raw in split_args(args_src) {
        args.push(resolve_argument(raw.trim(), ctx)?);
    }
    call_function(name, &args)
}

/// Split an argument list at top-level commas, respecting quotes and
/// nested brackets.
fn split_args(src: &str) -> Vec<&str> {
    let trimmed = src.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0usize;
    for (i, c) in src.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    args.push(&src[start..i]);
                    start = i + 1;
                }
                _ => {}
            },
        }
    }
    args.push(&src[start..]);
    args
}

fn resolve_argument(raw: &str, ctx: &ExecutionContext) -> Result<Value, EvalError> {
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    // Quoted string literal.
    if (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
        || (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
    {
        return Ok(Value::String(raw[1..raw.len() - 1].to_string()));
    }
    // JSON scalar literals.
    match raw {
        "null" => return Ok(Value::Null),
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        _ => {}
    }
    if let Ok(n) = serde_json::from_str::<serde_json::Number>(raw) {
        return Ok(Value::Number(n));
    }
    // Nested invocation or reference.
    if raw.starts_with("fn.")
        || raw.starts_with("steps.")
        || raw.starts_with("input")
        || raw.starts_with("env.")
        || raw.starts_with("$.")
    {
        return resolve_marker(raw, ctx);
    }
    // Bare word: treat as a string literal.
    Ok(Value::String(raw.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            variables: HashMap::from([
                ("name".to_string(), json!("World")),
                ("amount".to_string(), json!(1500)),
                (
                    "order".to_string(),
                    json!({"items": [{"sku": "a-1"}, {"sku": "b-2"}], "total": 99.5}),
                ),
            ]),
            step_outputs: HashMap::from([(
                "fetch".to_string(),
                json!({"status": 200, "body": {"id": "o-7"}}),
            )]),
            input: json!({"orderId": "o-7", "region": "eu"}),
            env: HashMap::from([("API_TOKEN".to_string(), "secret-1".to_string())]),
        }
    }

    #[test]
    fn dollar_path_resolves_variables() {
        let ctx = ctx();
        assert_eq!(resolve_value("$.amount", &ctx).unwrap(), json!(1500));
        assert_eq!(
            resolve_value("$.order.items[1].sku", &ctx).unwrap(),
            json!("b-2")
        );
        assert_eq!(resolve_value("$.missing.deep", &ctx).unwrap(), Value::Null);
    }

    #[test]
    fn single_marker_preserves_type() {
        let ctx = ctx();
        assert_eq!(
            resolve_value("{{steps.fetch.status}}", &ctx).unwrap(),
            json!(200)
        );
        assert_eq!(
            resolve_value("{{steps.fetch.output.body.id}}", &ctx).unwrap(),
            json!("o-7")
        );
        assert_eq!(
            resolve_value("{{input.region}}", &ctx).unwrap(),
            json!("eu")
        );
        assert_eq!(
            resolve_value("{{env.API_TOKEN}}", &ctx).unwrap(),
            json!("secret-1")
        );
        assert_eq!(resolve_value("{{env.MISSING}}", &ctx).unwrap(), Value::Null);
    }

    #[test]
    fn template_interpolation() {
        let ctx = ctx();
        assert_eq!(
            resolve_template("Hello, {{$.name}}!", &ctx).unwrap(),
            "Hello, World!"
        );
        assert_eq!(
            resolve_template("order {{input.orderId}} is {{steps.fetch.status}}", &ctx).unwrap(),
            "order o-7 is 200"
        );
        // Null renders empty.
        assert_eq!(
            resolve_template("x={{$.nothing}};", &ctx).unwrap(),
            "x=;"
        );
    }

    #[test]
    fn plain_string_resolves_to_itself() {
        let ctx = ctx();
        assert_eq!(
            resolve_value("just a string", &ctx).unwrap(),
            json!("just a string")
        );
        assert_eq!(
            resolve_template("no markers here", &ctx).unwrap(),
            "no markers here"
        );
    }

    #[test]
    fn resolve_object_recurses_and_is_idempotent() {
        let ctx = ctx();
        let raw = json!({
            "url": "https://api/{{input.orderId}}",
            "nested": {"amount": "$.amount"},
            "list": ["{{input.region}}", 42]
        });
        let resolved = resolve_object(&raw, &ctx).unwrap();
        assert_eq!(resolved["url"], json!("https://api/o-7"));
        assert_eq!(resolved["nested"]["amount"], json!(1500));
        assert_eq!(resolved["list"][0], json!("eu"));

        // Resolving an already marker-free object changes nothing.
        let again = resolve_object(&resolved, &ctx).unwrap();
        assert_eq!(again, resolved);
    }

    #[test]
    fn function_invocations() {
        let ctx = ctx();
        assert_eq!(
            resolve_value("{{fn.upper($.name)}}", &ctx).unwrap(),
            json!("WORLD")
        );
        assert_eq!(
            resolve_value("{{fn.concat('id-', input.orderId)}}", &ctx).unwrap(),
            json!("id-o-7")
        );
        assert_eq!(
            resolve_value("{{fn.default($.missing, 'anon')}}", &ctx).unwrap(),
            json!("anon")
        );
        // Nested invocation.
        assert_eq!(
            resolve_value("{{fn.length(fn.split('a,b,c', ','))}}", &ctx).unwrap(),
            json!(3)
        );
    }

    #[test]
    fn malformed_function_is_a_typed_error() {
        let ctx = ctx();
        assert!(resolve_value("{{fn.upper}}", &ctx).is_err());
        assert!(resolve_value("{{fn.doesNotExist()}}", &ctx).is_err());
    }

    #[test]
    fn expression_against_combined_root() {
        let ctx = ctx();
        let root = json!({"amount": 1500, "steps": {"fetch": {"status": 200}}});
        assert_eq!(
            resolve_expression("$.steps.fetch.status", &root, &ctx).unwrap(),
            json!(200)
        );
        assert_eq!(resolve_expression("$", &root, &ctx).unwrap(), root);
    }

    #[test]
    fn split_args_respects_quotes_and_nesting() {
        assert_eq!(split_args("'a,b', 2"), vec!["'a,b'", " 2"]);
        assert_eq!(
            split_args("fn.split('a,b', ','), 'x'"),
            vec!["fn.split('a,b', ',')", " 'x'"]
        );
        assert!(split_args("  ").is_empty());
    }
}
