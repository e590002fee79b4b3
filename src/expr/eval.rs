//! Evaluator for change and filter expressions

use std::cmp::Ordering;

use chrono::{Datelike, Timelike};
use thiserror::Error;

use super::ast::*;
use super::env::Environment;
use crate::record::{Record, Value, format_time};

/// Builtin functions callable from expressions.
pub const BUILTINS: &[&str] = &[
    "abs", "bool", "ceil", "float", "floor", "int", "len", "lower", "max", "min", "round",
    "str", "strftime", "upper",
];

/// An expression failed to evaluate.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Evaluate an expression in an environment.
pub fn eval(expr: &Expr, env: &Environment<'_>) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),

        Expr::Name(name) => env.lookup(name).ok_or_else(|| {
            if env.definitions().function(name).is_some() || BUILTINS.contains(&name.as_str()) {
                EvalError::new(format!("'{}' is a function, call it with (...)", name))
            } else {
                EvalError::new(format!("unknown name '{}'", name))
            }
        }),

        Expr::List(items) => eval_args(items, env).map(Value::List),

        Expr::Unary { op, expr } => {
            let value = eval(expr, env)?;
            eval_unary(*op, &value)
        }

        Expr::Binary { left, op, right } => {
            let left_val = eval(left, env)?;
            let right_val = eval(right, env)?;
            eval_binary(&left_val, *op, &right_val)
        }

        Expr::Compare { first, rest } => {
            // a < b < c means a < b and b < c, with b evaluated once
            let mut left = eval(first, env)?;
            for (op, right_expr) in rest {
                let right = eval(right_expr, env)?;
                if !eval_compare(&left, *op, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }

        Expr::Logical { left, op, right } => {
            let left_val = eval(left, env)?;
            match op {
                LogicOp::And if !left_val.is_truthy() => Ok(left_val),
                LogicOp::Or if left_val.is_truthy() => Ok(left_val),
                _ => eval(right, env),
            }
        }

        Expr::Not(inner) => Ok(Value::Bool(!eval(inner, env)?.is_truthy())),

        Expr::Conditional {
            condition,
            then_expr,
            else_expr,
        } => {
            if eval(condition, env)?.is_truthy() {
                eval(then_expr, env)
            } else {
                eval(else_expr, env)
            }
        }

        Expr::Call { func, args } => {
            let args = eval_args(args, env)?;
            call_function(func, args, env)
        }

        Expr::Method { target, name, args } => match borrowed_row(target, env) {
            Some(record) => record_method(record, name, &eval_args(args, env)?),
            None => {
                let target = eval(target, env)?;
                let args = eval_args(args, env)?;
                call_method(&target, name, &args)
            }
        },

        Expr::Attr { target, name } => match borrowed_row(target, env) {
            Some(record) => record_field(record, name),
            None => get_attr(&eval(target, env)?, name),
        },

        Expr::Index { target, index } => match borrowed_row(target, env) {
            Some(record) => record_item(record, &eval(index, env)?),
            None => {
                let target = eval(target, env)?;
                let index = eval(index, env)?;
                get_index(&target, &index)
            }
        },
    }
}

/// The record behind a bare `row`, used in place instead of copied into a map.
fn borrowed_row<'a>(target: &Expr, env: &Environment<'a>) -> Option<&'a Record> {
    match target {
        Expr::Name(name) if name == "row" && !env.is_local(name) => env.row(),
        _ => None,
    }
}

fn eval_args(args: &[Expr], env: &Environment<'_>) -> Result<Vec<Value>, EvalError> {
    args.iter().map(|arg| eval(arg, env)).collect()
}

fn eval_unary(op: UnaryOp, value: &Value) -> Result<Value, EvalError> {
    match (op, value) {
        (UnaryOp::Neg, Value::Int(i)) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| EvalError::new("integer overflow")),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Pos, Value::Int(_) | Value::Float(_)) => Ok(value.clone()),
        _ => Err(EvalError::new(format!(
            "bad operand type for unary {}: {}",
            if op == UnaryOp::Neg { "-" } else { "+" },
            value.type_name()
        ))),
    }
}

/// Evaluate an arithmetic operation
fn eval_binary(left: &Value, op: BinaryOp, right: &Value) -> Result<Value, EvalError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => int_op(*a, op, *b),
        (Value::Str(a), Value::Str(b)) if op == BinaryOp::Add => Ok(Value::Str(format!("{a}{b}"))),
        (Value::List(a), Value::List(b)) if op == BinaryOp::Add => {
            Ok(Value::List(a.iter().chain(b).cloned().collect()))
        }
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => float_op(a, op, b),
            _ => Err(EvalError::new(format!(
                "unsupported operand types for {}: {} and {}",
                op,
                left.type_name(),
                right.type_name()
            ))),
        },
    }
}

fn int_op(a: i64, op: BinaryOp, b: i64) -> Result<Value, EvalError> {
    let overflow = || EvalError::new("integer overflow");
    let zero_div = || EvalError::new("division by zero");

    let result = match op {
        BinaryOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinaryOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinaryOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinaryOp::Div => {
            if b == 0 {
                return Err(zero_div());
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinaryOp::FloorDiv => {
            if b == 0 {
                return Err(zero_div());
            }
            let q = a.checked_div(b).ok_or_else(overflow)?;
            // Round toward negative infinity
            if a % b != 0 && ((a < 0) != (b < 0)) {
                q - 1
            } else {
                q
            }
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(zero_div());
            }
            // Result takes the sign of the divisor
            let r = a.checked_rem(b).ok_or_else(overflow)?;
            if r != 0 && ((r < 0) != (b < 0)) {
                r + b
            } else {
                r
            }
        }
        BinaryOp::Pow => match u32::try_from(b) {
            Ok(exp) => a.checked_pow(exp).ok_or_else(overflow)?,
            Err(_) => return Ok(Value::Float((a as f64).powf(b as f64))),
        },
    };
    Ok(Value::Int(result))
}

fn float_op(a: f64, op: BinaryOp, b: f64) -> Result<Value, EvalError> {
    let needs_divisor = matches!(op, BinaryOp::Div | BinaryOp::FloorDiv | BinaryOp::Mod);
    if needs_divisor && b == 0.0 {
        return Err(EvalError::new("division by zero"));
    }
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::FloorDiv => (a / b).floor(),
        BinaryOp::Mod => a - b * (a / b).floor(),
        BinaryOp::Pow => a.powf(b),
    };
    Ok(Value::Float(result))
}

/// Evaluate a single comparison
fn eval_compare(left: &Value, op: CompareOp, right: &Value) -> Result<bool, EvalError> {
    match op {
        CompareOp::Eq => Ok(values_equal(left, right)),
        CompareOp::Ne => Ok(!values_equal(left, right)),
        CompareOp::Lt => Ok(compare_ordered(left, right)? == Ordering::Less),
        CompareOp::Le => Ok(compare_ordered(left, right)? != Ordering::Greater),
        CompareOp::Gt => Ok(compare_ordered(left, right)? == Ordering::Greater),
        CompareOp::Ge => Ok(compare_ordered(left, right)? != Ordering::Less),
        CompareOp::In => contains(right, left),
        CompareOp::NotIn => contains(right, left).map(|found| !found),
    }
}

/// Equality with int/float coercion; other mixed types are unequal.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            left.as_f64() == right.as_f64()
        }
        _ => left == right,
    }
}

/// Ordering for numbers, strings, timestamps and bools.
fn compare_ordered(left: &Value, right: &Value) -> Result<Ordering, EvalError> {
    let ordering = match (left, right) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => {
                return Err(EvalError::new(format!(
                    "cannot compare {} and {}",
                    left.type_name(),
                    right.type_name()
                )));
            }
        },
    };
    ordering.ok_or_else(|| EvalError::new("cannot order NaN"))
}

fn contains(container: &Value, item: &Value) -> Result<bool, EvalError> {
    match (container, item) {
        (Value::List(items), _) => Ok(items.iter().any(|v| values_equal(v, item))),
        (Value::Str(haystack), Value::Str(needle)) => Ok(haystack.contains(needle.as_str())),
        (Value::Map(record), Value::Str(key)) => Ok(record.contains(key)),
        _ => Err(EvalError::new(format!(
            "'in' needs a list, map or string on the right, got {} in {}",
            item.type_name(),
            container.type_name()
        ))),
    }
}

/// Call a helper function from the definitions, or a builtin.
fn call_function(name: &str, args: Vec<Value>, env: &Environment<'_>) -> Result<Value, EvalError> {
    let Some(function) = env.definitions().function(name) else {
        return call_builtin(name, &args);
    };

    if args.len() != function.params.len() {
        return Err(EvalError::new(format!(
            "{}() takes {} argument(s), {} given",
            name,
            function.params.len(),
            args.len()
        )));
    }
    let locals: Vec<(String, Value)> = function.params.iter().cloned().zip(args).collect();
    let frame = env.call_frame(&locals)?;
    eval(&function.body, &frame).map_err(|e| EvalError::new(format!("in {}(): {}", name, e)))
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match (name, args) {
        ("abs", [Value::Int(i)]) => i
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| EvalError::new("integer overflow")),
        ("abs", [Value::Float(f)]) => Ok(Value::Float(f.abs())),
        ("bool", [v]) => Ok(Value::Bool(v.is_truthy())),
        ("ceil", [Value::Int(i)]) | ("floor", [Value::Int(i)]) => Ok(Value::Int(*i)),
        ("ceil", [Value::Float(f)]) => float_to_int(f.ceil()).map(Value::Int),
        ("floor", [Value::Float(f)]) => float_to_int(f.floor()).map(Value::Int),
        ("float", [v]) => to_float(v).map(Value::Float),
        ("int", [v]) => to_int(v).map(Value::Int),
        ("len", [v]) => length(v).map(Value::Int),
        ("lower", [Value::Str(s)]) => Ok(Value::Str(s.to_lowercase())),
        ("upper", [Value::Str(s)]) => Ok(Value::Str(s.to_uppercase())),
        ("max", _) => extremum(name, args, Ordering::Greater),
        ("min", _) => extremum(name, args, Ordering::Less),
        ("round", [Value::Int(i)]) => Ok(Value::Int(*i)),
        ("round", [Value::Float(f)]) => float_to_int(f.round_ties_even()).map(Value::Int),
        ("round", [Value::Int(i), Value::Int(n)]) if *n >= 0 => Ok(Value::Int(*i)),
        ("round", [v @ (Value::Int(_) | Value::Float(_)), Value::Int(n)]) => {
            let x = v.as_f64().unwrap_or_default();
            let digits = (*n).clamp(-308, 308) as i32;
            let factor = 10f64.powi(digits);
            Ok(Value::Float((x * factor).round_ties_even() / factor))
        }
        ("str", [v]) => Ok(Value::Str(v.to_string())),
        ("strftime", [Value::Timestamp(ts), Value::Str(pattern)]) => format_time(ts, pattern)
            .map(Value::Str)
            .ok_or_else(|| EvalError::new(format!("invalid time format '{}'", pattern))),
        _ if BUILTINS.contains(&name) => Err(EvalError::new(format!(
            "{}() does not accept ({})",
            name,
            args.iter()
                .map(Value::type_name)
                .collect::<Vec<_>>()
                .join(", ")
        ))),
        _ => Err(EvalError::new(format!("unknown function '{}'", name))),
    }
}

fn float_to_int(f: f64) -> Result<i64, EvalError> {
    // i64::MAX as f64 rounds up to 2^63, hence the strict upper bound
    if f.is_finite() && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Ok(f as i64)
    } else {
        Err(EvalError::new(format!("cannot convert {} to int", f)))
    }
}

fn to_int(value: &Value) -> Result<i64, EvalError> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Float(f) => float_to_int(f.trunc()),
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| EvalError::new(format!("invalid literal for int(): '{}'", s))),
        other => Err(EvalError::new(format!(
            "int() argument must be a number or string, not {}",
            other.type_name()
        ))),
    }
}

fn to_float(value: &Value) -> Result<f64, EvalError> {
    match value {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(f) => Ok(*f),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| EvalError::new(format!("could not convert string to float: '{}'", s))),
        other => Err(EvalError::new(format!(
            "float() argument must be a number or string, not {}",
            other.type_name()
        ))),
    }
}

fn length(value: &Value) -> Result<i64, EvalError> {
    let len = match value {
        Value::Str(s) => s.chars().count(),
        Value::List(items) => items.len(),
        Value::Map(record) => record.len(),
        other => {
            return Err(EvalError::new(format!(
                "object of type {} has no len()",
                other.type_name()
            )));
        }
    };
    Ok(len as i64)
}

/// max()/min() over arguments, or over a single list argument.
fn extremum(name: &str, args: &[Value], wanted: Ordering) -> Result<Value, EvalError> {
    let items = match args {
        [Value::List(items)] => items.as_slice(),
        _ => args,
    };
    let Some((first, rest)) = items.split_first() else {
        return Err(EvalError::new(format!("{}() of an empty sequence", name)));
    };
    let mut best = first;
    for item in rest {
        if compare_ordered(item, best)? == wanted {
            best = item;
        }
    }
    Ok(best.clone())
}

fn call_method(target: &Value, name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match (target, name, args) {
        (Value::Map(record), _, _) => record_method(record, name, args),
        (Value::Str(s), "lower", []) => Ok(Value::Str(s.to_lowercase())),
        (Value::Str(s), "upper", []) => Ok(Value::Str(s.to_uppercase())),
        (Value::Str(s), "strip", []) => Ok(Value::Str(s.trim().to_string())),
        (Value::Str(s), "startswith", [Value::Str(prefix)]) => {
            Ok(Value::Bool(s.starts_with(prefix.as_str())))
        }
        (Value::Str(s), "endswith", [Value::Str(suffix)]) => {
            Ok(Value::Bool(s.ends_with(suffix.as_str())))
        }
        (Value::Timestamp(ts), "strftime", [Value::Str(pattern)]) => format_time(ts, pattern)
            .map(Value::Str)
            .ok_or_else(|| EvalError::new(format!("invalid time format '{}'", pattern))),
        _ => Err(no_method(target.type_name(), name, args)),
    }
}

fn record_method(record: &Record, name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match (name, args) {
        ("get", [Value::Str(key)]) => Ok(record.get(key).cloned().unwrap_or(Value::Null)),
        ("get", [Value::Str(key), default]) => {
            Ok(record.get(key).cloned().unwrap_or_else(|| default.clone()))
        }
        ("keys", []) => Ok(Value::List(
            record.iter().map(|(k, _)| Value::Str(k.to_string())).collect(),
        )),
        _ => Err(no_method("map", name, args)),
    }
}

fn no_method(type_name: &str, name: &str, args: &[Value]) -> EvalError {
    EvalError::new(format!(
        "{} has no method {}() taking {} argument(s)",
        type_name,
        name,
        args.len()
    ))
}

fn record_field(record: &Record, name: &str) -> Result<Value, EvalError> {
    record
        .get(name)
        .cloned()
        .ok_or_else(|| EvalError::new(format!("no field '{}'", name)))
}

fn record_item(record: &Record, index: &Value) -> Result<Value, EvalError> {
    match index {
        Value::Str(key) => record
            .get(key)
            .cloned()
            .ok_or_else(|| EvalError::new(format!("key '{}' not found", key))),
        _ => Err(EvalError::new(format!(
            "map cannot be indexed by {}",
            index.type_name()
        ))),
    }
}

fn get_attr(target: &Value, name: &str) -> Result<Value, EvalError> {
    match target {
        Value::Map(record) => record_field(record, name),
        Value::Timestamp(ts) => {
            let part = match name {
                "year" => i64::from(ts.year()),
                "month" => i64::from(ts.month()),
                "day" => i64::from(ts.day()),
                "hour" => i64::from(ts.hour()),
                "minute" => i64::from(ts.minute()),
                "second" => i64::from(ts.second()),
                "weekday" => i64::from(ts.weekday().num_days_from_monday()),
                _ => return Err(EvalError::new(format!("timestamp has no attribute '{}'", name))),
            };
            Ok(Value::Int(part))
        }
        other => Err(EvalError::new(format!(
            "{} has no attribute '{}'",
            other.type_name(),
            name
        ))),
    }
}

fn get_index(target: &Value, index: &Value) -> Result<Value, EvalError> {
    match (target, index) {
        (Value::Map(record), _) => record_item(record, index),
        (Value::List(items), Value::Int(i)) => resolve_index(*i, items.len())
            .map(|idx| items[idx].clone())
            .ok_or_else(|| EvalError::new("list index out of range")),
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            resolve_index(*i, chars.len())
                .map(|idx| Value::Str(chars[idx].to_string()))
                .ok_or_else(|| EvalError::new("string index out of range"))
        }
        _ => Err(EvalError::new(format!(
            "{} cannot be indexed by {}",
            target.type_name(),
            index.type_name()
        ))),
    }
}

/// Negative indexes count from the end.
fn resolve_index(i: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let idx = if i < 0 { i + len } else { i };
    if (0..len).contains(&idx) {
        usize::try_from(idx).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::env::Definitions;
    use crate::expr::parser::parse_expression;
    use crate::record::Record;
    use chrono::{TimeZone, Utc};

    fn eval_with(text: &str, record: &Record, defs: &Definitions) -> Result<Value, EvalError> {
        let expr = parse_expression(text).unwrap();
        eval(&expr, &Environment::for_record(defs, record))
    }

    fn eval_on(text: &str, record: &Record) -> Result<Value, EvalError> {
        eval_with(text, record, &Definitions::new())
    }

    fn eval_str(text: &str) -> Result<Value, EvalError> {
        eval_on(text, &Record::new())
    }

    fn vessel() -> Record {
        Record::from_pairs([
            ("mmsi", Value::from("123456789")),
            ("lat", Value::Float(54.3)),
            ("lon", Value::Float(-12.7)),
            ("speed", Value::Float(1.1)),
            ("course", Value::Int(270)),
            (
                "timestamp",
                Value::Timestamp(Utc.with_ymd_and_hms(2014, 6, 1, 12, 30, 0).unwrap()),
            ),
        ])
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval_str("1 + 2 * 3").unwrap(), Value::Int(7));
        assert_eq!(eval_str("7 / 2").unwrap(), Value::Float(3.5));
        assert_eq!(eval_str("7 // 2").unwrap(), Value::Int(3));
        assert_eq!(eval_str("-7 // 2").unwrap(), Value::Int(-4));
        assert_eq!(eval_str("-7 % 3").unwrap(), Value::Int(2));
        assert_eq!(eval_str("7 % -3").unwrap(), Value::Int(-2));
        assert_eq!(eval_str("2 ** 10").unwrap(), Value::Int(1024));
        assert_eq!(eval_str("2 ** -1").unwrap(), Value::Float(0.5));
        assert_eq!(eval_str("-2 ** 2").unwrap(), Value::Int(-4));
        assert_eq!(eval_str("1 + 0.5").unwrap(), Value::Float(1.5));
        assert_eq!(eval_str("-7.5 // 2").unwrap(), Value::Float(-4.0));
        assert_eq!(eval_str("'ab' + 'cd'").unwrap(), Value::Str("abcd".into()));
    }

    #[test]
    fn test_arithmetic_errors() {
        assert!(eval_str("1 / 0").is_err());
        assert!(eval_str("1.0 // 0").is_err());
        assert!(eval_str("5 % 0").is_err());
        assert!(eval_str("9223372036854775807 + 1").is_err());
        assert!(eval_str("'a' - 1").is_err());
        assert!(eval_str("-'a'").is_err());
    }

    #[test]
    fn test_comparisons() {
        let rec = vessel();
        assert_eq!(eval_on("speed < 1.9", &rec).unwrap(), Value::Bool(true));
        assert_eq!(eval_on("0.5 < speed < 1.0", &rec).unwrap(), Value::Bool(false));
        assert_eq!(eval_on("0.5 < speed < 10", &rec).unwrap(), Value::Bool(true));
        assert_eq!(eval_on("course == 270.0", &rec).unwrap(), Value::Bool(true));
        assert_eq!(eval_on("mmsi == 123456789", &rec).unwrap(), Value::Bool(false));
        assert_eq!(eval_on("mmsi >= '1'", &rec).unwrap(), Value::Bool(true));
        assert!(eval_on("mmsi < 5", &rec).is_err());
    }

    #[test]
    fn test_membership() {
        let rec = vessel();
        assert_eq!(
            eval_on("mmsi in ['123456789', '987654321']", &rec).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(eval_on("mmsi not in ['1']", &rec).unwrap(), Value::Bool(true));
        assert_eq!(eval_on("'lat' in row", &rec).unwrap(), Value::Bool(true));
        assert_eq!(eval_on("'678' in mmsi", &rec).unwrap(), Value::Bool(true));
        assert!(eval_on("1 in 2", &rec).is_err());
    }

    #[test]
    fn test_bounding_box() {
        let rec = vessel();
        let expr = "-20 <= lon <= 30 and 50 <= lat <= 60";
        assert_eq!(eval_on(expr, &rec).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_logic_short_circuits() {
        // The right side would fail with an unknown name
        assert_eq!(eval_str("false and missing").unwrap(), Value::Bool(false));
        assert_eq!(eval_str("1 or missing").unwrap(), Value::Int(1));
        assert_eq!(eval_str("0 or 'x'").unwrap(), Value::Str("x".into()));
        assert_eq!(eval_str("not 0").unwrap(), Value::Bool(true));
        assert!(eval_str("true and missing").is_err());
    }

    #[test]
    fn test_conditional() {
        let rec = vessel();
        assert_eq!(
            eval_on("'slow' if speed < 2 else 'fast'", &rec).unwrap(),
            Value::Str("slow".into())
        );
    }

    #[test]
    fn test_row_access() {
        let rec = vessel();
        assert_eq!(
            eval_on("round(row.get('lat', 0) / 10) * 10", &rec).unwrap(),
            Value::Int(50)
        );
        assert_eq!(eval_on("row.get('draught', -1)", &rec).unwrap(), Value::Int(-1));
        assert_eq!(eval_on("row.get('draught')", &rec).unwrap(), Value::Null);
        assert_eq!(eval_on("row['course']", &rec).unwrap(), Value::Int(270));
        assert_eq!(eval_on("row.course", &rec).unwrap(), Value::Int(270));
        assert!(eval_on("row['draught']", &rec).is_err());
    }

    #[test]
    fn test_row_passed_as_argument() {
        // Inside the helper `row` is a parameter holding a copy of the record
        let defs = Definitions::parse(
            "lat_of(row) = row.get('lat')\ncourse_of(row) = row['course']\nspeed_of(row) = row.speed",
        )
        .unwrap();
        let rec = vessel();
        assert_eq!(
            eval_with("lat_of(row)", &rec, &defs).unwrap(),
            eval_on("row.get('lat')", &rec).unwrap()
        );
        assert_eq!(eval_with("course_of(row)", &rec, &defs).unwrap(), Value::Int(270));
        assert_eq!(
            eval_with("speed_of(row)", &rec, &defs).unwrap(),
            eval_on("row.speed", &rec).unwrap()
        );
        assert!(eval_with("lat_of(1)", &rec, &defs).is_err());
    }

    #[test]
    fn test_row_misuse_errors() {
        let rec = vessel();
        let err = eval_on("row.nope()", &rec).unwrap_err();
        assert_eq!(err.message, "map has no method nope() taking 0 argument(s)");
        let err = eval_on("row[1]", &rec).unwrap_err();
        assert_eq!(err.message, "map cannot be indexed by int");
        let err = eval_on("row.draught", &rec).unwrap_err();
        assert_eq!(err.message, "no field 'draught'");
        assert_eq!(
            eval_on("row.keys()", &Record::from_pairs([("a", 1i64)])).unwrap(),
            Value::List(vec![Value::Str("a".into())])
        );
    }

    #[test]
    fn test_unknown_name_is_error() {
        let err = eval_on("heading > 3", &vessel()).unwrap_err();
        assert!(err.message.contains("unknown name 'heading'"), "{}", err);
        let err = eval_on("round", &vessel()).unwrap_err();
        assert!(err.message.contains("is a function"), "{}", err);
    }

    #[test]
    fn test_builtins() {
        assert_eq!(eval_str("abs(-3)").unwrap(), Value::Int(3));
        // Halves round to even
        assert_eq!(eval_str("round(2.5)").unwrap(), Value::Int(2));
        assert_eq!(eval_str("round(3.5)").unwrap(), Value::Int(4));
        assert_eq!(eval_str("round(-2.5)").unwrap(), Value::Int(-2));
        assert_eq!(eval_str("round(3.14159, 2)").unwrap(), Value::Float(3.14));
        assert_eq!(eval_str("floor(-1.5)").unwrap(), Value::Int(-2));
        assert_eq!(eval_str("ceil(1.2)").unwrap(), Value::Int(2));
        assert_eq!(eval_str("int('42')").unwrap(), Value::Int(42));
        assert_eq!(eval_str("int(-3.9)").unwrap(), Value::Int(-3));
        assert_eq!(eval_str("float('1.5')").unwrap(), Value::Float(1.5));
        assert_eq!(eval_str("str(10.0)").unwrap(), Value::Str("10.0".into()));
        assert_eq!(eval_str("len('abc')").unwrap(), Value::Int(3));
        assert_eq!(eval_str("max(1, 5.5, 3)").unwrap(), Value::Float(5.5));
        assert_eq!(eval_str("min([4, 2, 8])").unwrap(), Value::Int(2));
        assert_eq!(eval_str("upper('ab')").unwrap(), Value::Str("AB".into()));
        assert_eq!(eval_str("bool([])").unwrap(), Value::Bool(false));
        assert!(eval_str("int('x')").is_err());
        assert!(eval_str("max([])").is_err());
        assert!(eval_str("len(3)").is_err());
        assert!(eval_str("open('/etc/passwd')").is_err());
        assert!(eval_str("round('a')").is_err());
    }

    #[test]
    fn test_string_methods() {
        assert_eq!(eval_str("' Ab '.strip().lower()").unwrap(), Value::Str("ab".into()));
        assert_eq!(eval_str("'abc'.startswith('ab')").unwrap(), Value::Bool(true));
        assert_eq!(eval_str("'abc'.endswith('x')").unwrap(), Value::Bool(false));
        assert_eq!(eval_str("'abc'[-1]").unwrap(), Value::Str("c".into()));
        assert!(eval_str("'abc'.split(',')").is_err());
    }

    #[test]
    fn test_timestamp_access() {
        let rec = vessel();
        assert_eq!(
            eval_on("timestamp.strftime('%Y-%m')", &rec).unwrap(),
            Value::Str("2014-06".into())
        );
        assert_eq!(
            eval_on("strftime(timestamp, '%H')", &rec).unwrap(),
            Value::Str("12".into())
        );
        assert_eq!(eval_on("timestamp.month", &rec).unwrap(), Value::Int(6));
        assert_eq!(eval_on("timestamp.weekday", &rec).unwrap(), Value::Int(6));
        assert!(eval_on("timestamp.strftime('%Q')", &rec).is_err());
    }

    #[test]
    fn test_list_indexing() {
        assert_eq!(eval_str("[1, 2, 3][0]").unwrap(), Value::Int(1));
        assert_eq!(eval_str("[1, 2, 3][-1]").unwrap(), Value::Int(3));
        assert!(eval_str("[1, 2, 3][3]").is_err());
        assert_eq!(
            eval_str("[1] + [2]").unwrap(),
            Value::List(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn test_helper_functions() {
        let defs =
            Definitions::parse("cell = 10\ngrid(x) = round(x / cell) * cell\nfast(s) = s > 10")
                .unwrap();
        let rec = vessel();
        assert_eq!(eval_with("grid(lat)", &rec, &defs).unwrap(), Value::Int(50));
        assert_eq!(eval_with("grid(lon)", &rec, &defs).unwrap(), Value::Int(-10));
        assert_eq!(eval_with("fast(speed)", &rec, &defs).unwrap(), Value::Bool(false));
        assert!(eval_with("grid(1, 2)", &rec, &defs).is_err());
    }

    #[test]
    fn test_helper_cannot_see_record_fields() {
        let defs = Definitions::parse("peek() = speed").unwrap();
        let err = eval_with("peek()", &vessel(), &defs).unwrap_err();
        assert!(err.message.contains("unknown name 'speed'"), "{}", err);
    }

    #[test]
    fn test_recursion_is_bounded() {
        let defs = Definitions::parse("loop(n) = loop(n + 1)").unwrap();
        let err = eval_with("loop(0)", &Record::new(), &defs).unwrap_err();
        assert!(err.message.contains("maximum call depth"), "{}", err);
    }

    #[test]
    fn test_call_count_is_bounded() {
        // Stays under the depth limit but doubles the calls at every level
        let defs = Definitions::parse("f(n) = 0 if n == 0 else f(n - 1) + f(n - 1)").unwrap();
        let err = eval_with("f(60)", &Record::new(), &defs).unwrap_err();
        assert!(err.message.contains("call limit"), "{}", err);

        // The budget is per evaluation
        for _ in 0..3 {
            assert_eq!(eval_with("f(10)", &Record::new(), &defs).unwrap(), Value::Int(0));
        }
    }

    #[test]
    fn test_recursion_terminates_with_conditional() {
        let defs = Definitions::parse("fact(n) = 1 if n <= 1 else n * fact(n - 1)").unwrap();
        assert_eq!(
            eval_with("fact(5)", &Record::new(), &defs).unwrap(),
            Value::Int(120)
        );
    }
}
