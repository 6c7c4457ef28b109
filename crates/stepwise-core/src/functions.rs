//! Built-in function table for `{{fn.<name>(...)}}` invocations.
//!
//! Functions receive already-resolved argument values and return a JSON
//! value. Arity and argument-type violations are the one place the
//! expression engine surfaces a typed error instead of degrading to null.

use chrono::{DateTime, Datelike, Duration, Months, Utc};
use serde_json::{Number, Value, json};
use uuid::Uuid;

use crate::expression::EvalError;

/// Invoke a built-in by name. Unknown names and malformed invocations
/// produce `EvalError`; everything else returns a value.
pub fn call_function(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match name {
        // Date math
        "now" => Ok(Value::String(Utc::now().to_rfc3339())),
        "today" => Ok(Value::String(Utc::now().date_naive().to_string())),
        "dateAdd" => date_add(name, args),
        "dateDiff" => date_diff(name, args),
        "formatDate" => format_date(name, args),

        // Identifiers
        "uuid" => Ok(Value::String(Uuid::now_v7().to_string())),
        "randomInt" => random_int(name, args),

        // String ops
        "upper" => Ok(Value::String(to_text(arg(name, args, 0)?).to_uppercase())),
        "lower" => Ok(Value::String(to_text(arg(name, args, 0)?).to_lowercase())),
        "trim" => Ok(Value::String(to_text(arg(name, args, 0)?).trim().to_string())),
        "split" => {
            let text = to_text(arg(name, args, 0)?);
            let sep = to_text(arg(name, args, 1)?);
            let parts: Vec<Value> = if sep.is_empty() {
                text.chars().map(|c| Value::String(c.to_string())).collect()
            } else {
                text.split(sep.as_str())
                    .map(|p| Value::String(p.to_string()))
                    .collect()
            };
            Ok(Value::Array(parts))
        }
        "join" => {
            let items = as_array(name, arg(name, args, 0)?)?;
            let sep = args.get(1).map(to_text).unwrap_or_default();
            let joined = items.iter().map(to_text).collect::<Vec<_>>().join(&sep);
            Ok(Value::String(joined))
        }
        "concat" => {
            let mut out = String::new();
            for value in args {
                out.push_str(&to_text(value));
            }
            Ok(Value::String(out))
        }
        "substring" => substring(name, args),
        "replace" => {
            let text = to_text(arg(name, args, 0)?);
            let from = to_text(arg(name, args, 1)?);
            let to = to_text(arg(name, args, 2)?);
            Ok(Value::String(text.replace(&from, &to)))
        }
        "startsWith" => {
            let text = to_text(arg(name, args, 0)?);
            Ok(Value::Bool(text.starts_with(&to_text(arg(name, args, 1)?))))
        }
        "endsWith" => {
            let text = to_text(arg(name, args, 0)?);
            Ok(Value::Bool(text.ends_with(&to_text(arg(name, args, 1)?))))
        }
        "contains" => {
            let haystack = arg(name, args, 0)?;
            let needle = arg(name, args, 1)?;
            let found = match haystack {
                Value::Array(items) => items.contains(needle),
                other => to_text(other).contains(&to_text(needle)),
            };
            Ok(Value::Bool(found))
        }
        "length" => {
            let len = match arg(name, args, 0)? {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                Value::Null => 0,
                other => to_text(other).chars().count(),
            };
            Ok(json!(len))
        }

        // Numeric aggregates
        "sum" => numeric_fold(name, args, |acc, n| acc + n, 0.0),
        "avg" => {
            let numbers = numeric_args(name, args)?;
            if numbers.is_empty() {
                return Ok(Value::Null);
            }
            Ok(number(numbers.iter().sum::<f64>() / numbers.len() as f64))
        }
        "min" => {
            let numbers = numeric_args(name, args)?;
            Ok(numbers
                .into_iter()
                .reduce(f64::min)
                .map(number)
                .unwrap_or(Value::Null))
        }
        "max" => {
            let numbers = numeric_args(name, args)?;
            Ok(numbers
                .into_iter()
                .reduce(f64::max)
                .map(number)
                .unwrap_or(Value::Null))
        }
        "count" => {
            let count = match arg(name, args, 0)? {
                Value::Array(a) => a.len(),
                Value::Null => 0,
                _ => 1,
            };
            Ok(json!(count))
        }
        "round" => {
            let n = to_number(name, arg(name, args, 0)?)?;
            let digits = match args.get(1) {
                Some(d) => to_number(name, d)? as i32,
                None => 0,
            };
            let factor = 10f64.powi(digits);
            Ok(number((n * factor).round() / factor))
        }
        "abs" => {
            let n = to_number(name, arg(name, args, 0)?)?;
            Ok(number(n.abs()))
        }

        // Null safety
        "default" | "coalesce" => Ok(args
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null)),
        "ifThen" => {
            let cond = truthy(arg(name, args, 0)?);
            if cond {
                Ok(arg(name, args, 1)?.clone())
            } else {
                Ok(args.get(2).cloned().unwrap_or(Value::Null))
            }
        }
        "isNull" => Ok(Value::Bool(arg(name, args, 0)?.is_null())),
        "isNotNull" => Ok(Value::Bool(!arg(name, args, 0)?.is_null())),
        "isEmpty" => {
            let empty = match arg(name, args, 0)? {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                Value::Array(a) => a.is_empty(),
                Value::Object(o) => o.is_empty(),
                _ => false,
            };
            Ok(Value::Bool(empty))
        }

        // Type coercion
        "stringify" => serde_json::to_string(arg(name, args, 0)?)
            .map(Value::String)
            .map_err(|e| EvalError::BadFunctionCall {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        "parse" => {
            let text = to_text(arg(name, args, 0)?);
            serde_json::from_str(&text).map_err(|e| EvalError::BadFunctionCall {
                name: name.to_string(),
                reason: format!("invalid JSON: {e}"),
            })
        }
        "toNumber" => to_number(name, arg(name, args, 0)?).map(number),
        "toString" => Ok(Value::String(to_text(arg(name, args, 0)?))),
        "toBoolean" => Ok(Value::Bool(truthy(arg(name, args, 0)?))),

        other => Err(EvalError::UnknownFunction(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Date helpers
// ---------------------------------------------------------------------------

fn parse_date(name: &str, value: &Value) -> Result<DateTime<Utc>, EvalError> {
    let text = to_text(value);
    if let Ok(dt) = DateTime::parse_from_rfc3339(&text) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(date) = text.parse::<chrono::NaiveDate>() {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc());
        }
    }
    Err(EvalError::BadFunctionCall {
        name: name.to_string(),
        reason: format!("'{text}' is not a date"),
    })
}

fn date_add(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    let date = parse_date(name, arg(name, args, 0)?)?;
    let amount = to_number(name, arg(name, args, 1)?)? as i64;
    let unit = to_text(arg(name, args, 2)?);
    let result = match unit.as_str() {
        "seconds" => date + Duration::seconds(amount),
        "minutes" => date + Duration::minutes(amount),
        "hours" => date + Duration::hours(amount),
        "days" => date + Duration::days(amount),
        "months" => {
            if amount >= 0 {
                date + Months::new(amount as u32)
            } else {
                date - Months::new(amount.unsigned_abs() as u32)
            }
        }
        "years" => {
            let months = amount * 12;
            if months >= 0 {
                date + Months::new(months as u32)
            } else {
                date - Months::new(months.unsigned_abs() as u32)
            }
        }
        other => {
            return Err(EvalError::BadFunctionCall {
                name: name.to_string(),
                reason: format!("unknown unit '{other}'"),
            });
        }
    };
    Ok(Value::String(result.to_rfc3339()))
}

fn date_diff(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    let a = parse_date(name, arg(name, args, 0)?)?;
    let b = parse_date(name, arg(name, args, 1)?)?;
    let unit = args.get(2).map(to_text).unwrap_or_else(|| "days".to_string());
    let delta = b - a;
    let diff = match unit.as_str() {
        "seconds" => delta.num_seconds(),
        "minutes" => delta.num_minutes(),
        "hours" => delta.num_hours(),
        "days" => delta.num_days(),
        "years" => (b.year() - a.year()) as i64,
        other => {
            return Err(EvalError::BadFunctionCall {
                name: name.to_string(),
                reason: format!("unknown unit '{other}'"),
            });
        }
    };
    Ok(json!(diff))
}

fn format_date(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    let date = parse_date(name, arg(name, args, 0)?)?;
    let format = to_text(arg(name, args, 1)?);
    Ok(Value::String(date.format(&format).to_string()))
}

// ---------------------------------------------------------------------------
// Numeric helpers
// ---------------------------------------------------------------------------

fn random_int(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    let min = to_number(name, arg(name, args, 0)?)? as i64;
    let max = to_number(name, arg(name, args, 1)?)? as i64;
    if max <= min {
        return Err(EvalError::BadFunctionCall {
            name: name.to_string(),
            reason: "max must be greater than min".to_string(),
        });
    }
    let span = (max - min) as u128;
    let raw = Uuid::new_v4().as_u128() % span;
    Ok(json!(min + raw as i64))
}

fn substring(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    let text = to_text(arg(name, args, 0)?);
    let chars: Vec<char> = text.chars().collect();
    let start = (to_number(name, arg(name, args, 1)?)? as usize).min(chars.len());
    let end = match args.get(2) {
        Some(e) => (to_number(name, e)? as usize).clamp(start, chars.len()),
        None => chars.len(),
    };
    Ok(Value::String(chars[start..end].iter().collect()))
}

/// Aggregate arguments: a single array argument spreads, otherwise the
/// arguments themselves are the values.
fn numeric_args(name: &str, args: &[Value]) -> Result<Vec<f64>, EvalError> {
    let values: Vec<&Value> = match args {
        [Value::Array(items)] => items.iter().collect(),
        other => other.iter().collect(),
    };
    values
        .into_iter()
        .filter(|v| !v.is_null())
        .map(|v| to_number(name, v))
        .collect()
}

fn numeric_fold(
    name: &str,
    args: &[Value],
    fold: fn(f64, f64) -> f64,
    init: f64,
) -> Result<Value, EvalError> {
    let numbers = numeric_args(name, args)?;
    Ok(number(numbers.into_iter().fold(init, fold)))
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        json!(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Coercion helpers (shared with the condition evaluator)
// ---------------------------------------------------------------------------

/// String form of a value: strings verbatim, everything else compact JSON.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Numeric coercion: numbers as-is, bools to 0/1, parseable strings parsed.
pub fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn to_number(name: &str, value: &Value) -> Result<f64, EvalError> {
    coerce_number(value).ok_or_else(|| EvalError::BadFunctionCall {
        name: name.to_string(),
        reason: format!("'{}' is not a number", to_text(value)),
    })
}

/// Truthiness: null/false/0/""/[]/{} are false, everything else true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn arg<'a>(name: &str, args: &'a [Value], index: usize) -> Result<&'a Value, EvalError> {
    args.get(index).ok_or_else(|| EvalError::BadFunctionCall {
        name: name.to_string(),
        reason: format!("missing argument {}", index + 1),
    })
}

fn as_array<'a>(name: &str, value: &'a Value) -> Result<&'a Vec<Value>, EvalError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(EvalError::BadFunctionCall {
            name: name.to_string(),
            reason: format!("expected an array, got '{}'", to_text(other)),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_functions() {
        assert_eq!(
            call_function("upper", &[json!("hello")]).unwrap(),
            json!("HELLO")
        );
        assert_eq!(
            call_function("split", &[json!("a,b,c"), json!(",")]).unwrap(),
            json!(["a", "b", "c"])
        );
        assert_eq!(
            call_function("join", &[json!(["a", "b"]), json!("-")]).unwrap(),
            json!("a-b")
        );
        assert_eq!(
            call_function("substring", &[json!("workflow"), json!(0), json!(4)]).unwrap(),
            json!("work")
        );
        assert_eq!(
            call_function("replace", &[json!("a-b"), json!("-"), json!("_")]).unwrap(),
            json!("a_b")
        );
        assert_eq!(call_function("length", &[json!([1, 2, 3])]).unwrap(), json!(3));
    }

    #[test]
    fn numeric_functions() {
        assert_eq!(
            call_function("sum", &[json!([1, 2, 3])]).unwrap(),
            json!(6)
        );
        assert_eq!(
            call_function("avg", &[json!([2, 4])]).unwrap(),
            json!(3)
        );
        assert_eq!(call_function("min", &[json!([5, 2, 9])]).unwrap(), json!(2));
        assert_eq!(call_function("max", &[json!(5), json!(9)]).unwrap(), json!(9));
        assert_eq!(
            call_function("round", &[json!(3.456), json!(2)]).unwrap(),
            json!(3.46)
        );
        assert_eq!(call_function("abs", &[json!(-4)]).unwrap(), json!(4));
    }

    #[test]
    fn null_safety_functions() {
        assert_eq!(
            call_function("default", &[Value::Null, json!("fallback")]).unwrap(),
            json!("fallback")
        );
        assert_eq!(
            call_function("coalesce", &[Value::Null, Value::Null, json!(7)]).unwrap(),
            json!(7)
        );
        assert_eq!(
            call_function("ifThen", &[json!(true), json!("yes"), json!("no")]).unwrap(),
            json!("yes")
        );
        assert_eq!(call_function("isNull", &[Value::Null]).unwrap(), json!(true));
        assert_eq!(call_function("isEmpty", &[json!("")]).unwrap(), json!(true));
        assert_eq!(call_function("isEmpty", &[json!([1])]).unwrap(), json!(false));
    }

    #[test]
    fn coercion_functions() {
        assert_eq!(
            call_function("toNumber", &[json!("12.5")]).unwrap(),
            json!(12.5)
        );
        assert_eq!(
            call_function("toString", &[json!(42)]).unwrap(),
            json!("42")
        );
        assert_eq!(
            call_function("toBoolean", &[json!("")]).unwrap(),
            json!(false)
        );
        assert_eq!(
            call_function("parse", &[json!("{\"a\":1}")]).unwrap(),
            json!({"a": 1})
        );
        assert_eq!(
            call_function("stringify", &[json!({"a": 1})]).unwrap(),
            json!("{\"a\":1}")
        );
    }

    #[test]
    fn date_functions() {
        let added = call_function(
            "dateAdd",
            &[json!("2026-01-01T00:00:00Z"), json!(2), json!("days")],
        )
        .unwrap();
        assert!(added.as_str().unwrap().starts_with("2026-01-03"));

        let diff = call_function(
            "dateDiff",
            &[
                json!("2026-01-01T00:00:00Z"),
                json!("2026-01-11T00:00:00Z"),
                json!("days"),
            ],
        )
        .unwrap();
        assert_eq!(diff, json!(10));

        let formatted = call_function(
            "formatDate",
            &[json!("2026-03-05T10:30:00Z"), json!("%Y/%m/%d")],
        )
        .unwrap();
        assert_eq!(formatted, json!("2026/03/05"));
    }

    #[test]
    fn random_int_stays_in_range() {
        for _ in 0..50 {
            let n = call_function("randomInt", &[json!(5), json!(10)])
                .unwrap()
                .as_i64()
                .unwrap();
            assert!((5..10).contains(&n));
        }
    }

    #[test]
    fn unknown_function_is_a_typed_error() {
        let err = call_function("nope", &[]).unwrap_err();
        assert!(matches!(err, EvalError::UnknownFunction(_)));
    }

    #[test]
    fn bad_arity_is_a_typed_error() {
        let err = call_function("split", &[json!("a,b")]).unwrap_err();
        assert!(matches!(err, EvalError::BadFunctionCall { .. }));
    }

    #[test]
    fn uuid_and_now_produce_values() {
        let id = call_function("uuid", &[]).unwrap();
        assert_eq!(id.as_str().unwrap().len(), 36);
        let now = call_function("now", &[]).unwrap();
        assert!(now.as_str().unwrap().contains('T'));
    }
}
