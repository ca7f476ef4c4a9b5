use chrono::{DateTime, Datelike, Duration, SecondsFormat, Timelike, Utc};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

use super::parser::{BinaryOp, Expr};
use super::Context;
use crate::datetime::{format_datetime, parse_datetime, value_to_datetime, IsoDuration};

const DAY_DELTA_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.%f%z";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EvalError {
    /// A root identifier that is not in the context
    Unbound(String),
    Failed(String),
}

type EvalResult<T> = std::result::Result<T, EvalError>;

fn fail<T>(message: impl Into<String>) -> EvalResult<T> {
    Err(EvalError::Failed(message.into()))
}

/// Runtime value. Datetimes and durations are first-class so that
/// `now_utc() - duration('P1D')` works without string round trips.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Val {
    Undefined,
    Json(Value),
    DateTime(DateTime<Utc>),
    Duration(IsoDuration),
}

impl Val {
    pub(crate) fn truthy(&self) -> bool {
        match self {
            Val::Undefined => false,
            Val::DateTime(_) => true,
            Val::Duration(d) => !d.is_zero(),
            Val::Json(v) => match v {
                Value::Null => false,
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
                Value::String(s) => !s.is_empty(),
                Value::Array(a) => !a.is_empty(),
                Value::Object(o) => !o.is_empty(),
            },
        }
    }

    pub(crate) fn into_json(self) -> Value {
        match self {
            Val::Undefined => Value::Null,
            Val::Json(v) => v,
            Val::DateTime(dt) => Value::String(render_datetime(&dt)),
            Val::Duration(d) => Value::String(d.to_string()),
        }
    }

    /// Text form used when an expression sits inside a larger string.
    pub(crate) fn render(&self) -> String {
        match self {
            Val::Undefined | Val::Json(Value::Null) => String::new(),
            Val::Json(Value::String(s)) => s.clone(),
            Val::Json(other) => other.to_string(),
            Val::DateTime(dt) => render_datetime(dt),
            Val::Duration(d) => d.to_string(),
        }
    }

    fn is_missing(&self) -> bool {
        matches!(self, Val::Undefined | Val::Json(Value::Null))
    }
}

fn render_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub(crate) fn evaluate(expr: &Expr, ctx: &Context) -> EvalResult<Val> {
    if let Some(found) = path_ref(expr, ctx)? {
        return Ok(found.map_or(Val::Undefined, |v| Val::Json(v.clone())));
    }

    match expr {
        Expr::Literal(v) => Ok(Val::Json(v.clone())),
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(evaluate(item, ctx)?.into_json());
            }
            Ok(Val::Json(Value::Array(out)))
        }
        Expr::Dict(pairs) => {
            let mut out = Map::new();
            for (k, v) in pairs {
                out.insert(evaluate(k, ctx)?.render(), evaluate(v, ctx)?.into_json());
            }
            Ok(Val::Json(Value::Object(out)))
        }
        Expr::Name(name) => Err(EvalError::Unbound(name.clone())),
        Expr::Attr(target, name) => attribute(evaluate(target, ctx)?, name),
        Expr::Index(target, index) => {
            let target = evaluate(target, ctx)?;
            let key = evaluate(index, ctx)?;
            match target {
                Val::Json(v) => Ok(child(&v, &key).map_or(Val::Undefined, |c| Val::Json(c.clone()))),
                Val::Undefined => Ok(Val::Undefined),
                other => fail(format!("cannot index into {:?}", other)),
            }
        }
        Expr::Call(name, args) => {
            let args = evaluate_all(args, ctx)?;
            call_function(name, args, ctx)
        }
        Expr::Method(target, name, args) => {
            let target = evaluate(target, ctx)?;
            let args = evaluate_all(args, ctx)?;
            call_method(target, name, args)
        }
        Expr::Filter(target, name, args) => {
            if name == "default" {
                let value = match evaluate(target, ctx) {
                    Ok(v) => v,
                    Err(EvalError::Unbound(_)) => Val::Undefined,
                    Err(e) => return Err(e),
                };
                if value.is_missing() {
                    return match args.first() {
                        Some(fallback) => evaluate(fallback, ctx),
                        None => Ok(Val::Json(Value::String(String::new()))),
                    };
                }
                return Ok(value);
            }
            let value = evaluate(target, ctx)?;
            let args = evaluate_all(args, ctx)?;
            apply_filter(name, value, args)
        }
        Expr::Neg(inner) => {
            let value = evaluate(inner, ctx)?;
            match (number(&value), value) {
                (Some(Num::Int(i)), _) => int_val(i.checked_neg()),
                (Some(Num::Float(f)), _) => float_val(-f),
                (None, Val::Duration(d)) => Ok(Val::Duration(d.negated())),
                (None, other) => fail(format!("cannot negate {:?}", other)),
            }
        }
        Expr::Not(inner) => Ok(Val::Json(Value::Bool(!evaluate(inner, ctx)?.truthy()))),
        Expr::And(a, b) => {
            let left = evaluate(a, ctx)?;
            if !left.truthy() {
                return Ok(left);
            }
            evaluate(b, ctx)
        }
        Expr::Or(a, b) => {
            let left = evaluate(a, ctx)?;
            if left.truthy() {
                return Ok(left);
            }
            evaluate(b, ctx)
        }
        Expr::Conditional {
            then,
            condition,
            otherwise,
        } => {
            if evaluate(condition, ctx)?.truthy() {
                evaluate(then, ctx)
            } else {
                match otherwise {
                    Some(e) => evaluate(e, ctx),
                    None => Ok(Val::Undefined),
                }
            }
        }
        Expr::Binary(op, a, b) => binary(*op, evaluate(a, ctx)?, evaluate(b, ctx)?),
    }
}

fn evaluate_all(exprs: &[Expr], ctx: &Context) -> EvalResult<Vec<Val>> {
    exprs.iter().map(|e| evaluate(e, ctx)).collect()
}

/// Resolves `root.a['b'][0]` chains by reference so only the final value
/// is cloned. `Ok(None)` means the expression is not a plain path.
fn path_ref<'a>(expr: &Expr, ctx: &'a Context) -> EvalResult<Option<Option<&'a Value>>> {
    match expr {
        Expr::Name(name) => match ctx.get(name) {
            Some(v) => Ok(Some(Some(v))),
            None => Err(EvalError::Unbound(name.clone())),
        },
        Expr::Attr(target, name) => Ok(path_ref(target, ctx)?
            .map(|found| found.and_then(|v| child(v, &Val::Json(Value::String(name.clone())))))),
        Expr::Index(target, index) => match path_ref(target, ctx)? {
            Some(found) => {
                let key = evaluate(index, ctx)?;
                Ok(Some(found.and_then(|v| child(v, &key))))
            }
            None => Ok(None),
        },
        _ => Ok(None),
    }
}

fn child<'a>(value: &'a Value, key: &Val) -> Option<&'a Value> {
    match (value, key) {
        (Value::Object(map), key) => map.get(&key.render()),
        (Value::Array(items), Val::Json(Value::Number(n))) => {
            let i = n.as_i64()?;
            let len = items.len() as i64;
            let idx = if i < 0 { len + i } else { i };
            if idx < 0 {
                None
            } else {
                items.get(idx as usize)
            }
        }
        _ => None,
    }
}

fn attribute(target: Val, name: &str) -> EvalResult<Val> {
    match target {
        Val::Undefined => Ok(Val::Undefined),
        Val::Json(v) => Ok(child(&v, &Val::Json(Value::String(name.to_string())))
            .map_or(Val::Undefined, |c| Val::Json(c.clone()))),
        Val::DateTime(dt) => {
            let part = match name {
                "year" => dt.year() as i64,
                "month" => dt.month() as i64,
                "day" => dt.day() as i64,
                "hour" => dt.hour() as i64,
                "minute" => dt.minute() as i64,
                "second" => dt.second() as i64,
                _ => return Ok(Val::Undefined),
            };
            Ok(Val::Json(Value::from(part)))
        }
        Val::Duration(_) => Ok(Val::Undefined),
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn number(val: &Val) -> Option<Num> {
    match val {
        Val::Json(Value::Number(n)) => match n.as_i64() {
            Some(i) => Some(Num::Int(i)),
            None => n.as_f64().map(Num::Float),
        },
        Val::Json(Value::Bool(b)) => Some(Num::Int(*b as i64)),
        _ => None,
    }
}

fn float_val(f: f64) -> EvalResult<Val> {
    match Number::from_f64(f) {
        Some(n) => Ok(Val::Json(Value::Number(n))),
        None => fail("arithmetic produced a non-finite number"),
    }
}

fn as_datetime(val: &Val) -> Option<DateTime<Utc>> {
    match val {
        Val::DateTime(dt) => Some(*dt),
        Val::Json(v) => value_to_datetime(v, &[]),
        _ => None,
    }
}

fn binary(op: BinaryOp, a: Val, b: Val) -> EvalResult<Val> {
    match op {
        BinaryOp::Eq => Ok(Val::Json(Value::Bool(equals(&a, &b)))),
        BinaryOp::Ne => Ok(Val::Json(Value::Bool(!equals(&a, &b)))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&a, &b)
                .ok_or_else(|| EvalError::Failed(format!("cannot compare {:?} and {:?}", a, b)))?;
            let result = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Val::Json(Value::Bool(result)))
        }
        BinaryOp::In => Ok(Val::Json(Value::Bool(contains(&b, &a)))),
        BinaryOp::NotIn => Ok(Val::Json(Value::Bool(!contains(&b, &a)))),
        BinaryOp::Concat => Ok(Val::Json(Value::String(a.render() + &b.render()))),
        _ => arithmetic(op, a, b),
    }
}

fn arithmetic(op: BinaryOp, a: Val, b: Val) -> EvalResult<Val> {
    match (op, &a, &b) {
        (BinaryOp::Add, Val::DateTime(dt), Val::Duration(d))
        | (BinaryOp::Add, Val::Duration(d), Val::DateTime(dt)) => {
            return d
                .add_to(*dt)
                .map(Val::DateTime)
                .ok_or_else(|| EvalError::Failed("datetime out of range".into()));
        }
        (BinaryOp::Sub, Val::DateTime(dt), Val::Duration(d)) => {
            return d
                .sub_from(*dt)
                .map(Val::DateTime)
                .ok_or_else(|| EvalError::Failed("datetime out of range".into()));
        }
        (BinaryOp::Sub, Val::DateTime(x), Val::DateTime(y)) => {
            return Ok(Val::Duration(IsoDuration::from_fixed(*x - *y)));
        }
        (BinaryOp::Add, Val::Duration(x), Val::Duration(y)) => {
            return Ok(Val::Duration(IsoDuration {
                months: x.months + y.months,
                fixed: x.fixed + y.fixed,
            }));
        }
        (BinaryOp::Add | BinaryOp::Sub, Val::Json(Value::String(s)), Val::Duration(_)) => {
            return match parse_datetime(s, &[]) {
                Some(dt) => arithmetic(op, Val::DateTime(dt), b.clone()),
                None => fail(format!("'{}' is not a datetime", s)),
            };
        }
        (BinaryOp::Add, Val::Json(Value::String(x)), Val::Json(Value::String(y))) => {
            return Ok(Val::Json(Value::String(format!("{}{}", x, y))));
        }
        (BinaryOp::Add, Val::Json(Value::Array(x)), Val::Json(Value::Array(y))) => {
            let mut joined = x.clone();
            joined.extend(y.iter().cloned());
            return Ok(Val::Json(Value::Array(joined)));
        }
        _ => {}
    }

    let (x, y) = match (number(&a), number(&b)) {
        (Some(x), Some(y)) => (x, y),
        _ => return fail(format!("unsupported operands {:?} and {:?}", a, b)),
    };

    match (op, x, y) {
        (BinaryOp::Add, Num::Int(i), Num::Int(j)) => int_val(i.checked_add(j)),
        (BinaryOp::Sub, Num::Int(i), Num::Int(j)) => int_val(i.checked_sub(j)),
        (BinaryOp::Mul, Num::Int(i), Num::Int(j)) => int_val(i.checked_mul(j)),
        (BinaryOp::FloorDiv, Num::Int(i), Num::Int(j)) => {
            if j == 0 {
                return fail("division by zero");
            }
            int_val(Some(i.div_euclid(j)))
        }
        (BinaryOp::Mod, Num::Int(i), Num::Int(j)) => {
            if j == 0 {
                return fail("division by zero");
            }
            int_val(Some(i.rem_euclid(j)))
        }
        (BinaryOp::Add, x, y) => float_val(x.as_f64() + y.as_f64()),
        (BinaryOp::Sub, x, y) => float_val(x.as_f64() - y.as_f64()),
        (BinaryOp::Mul, x, y) => float_val(x.as_f64() * y.as_f64()),
        (BinaryOp::Div, x, y) => {
            if y.as_f64() == 0.0 {
                return fail("division by zero");
            }
            float_val(x.as_f64() / y.as_f64())
        }
        (BinaryOp::FloorDiv, x, y) => {
            if y.as_f64() == 0.0 {
                return fail("division by zero");
            }
            float_val((x.as_f64() / y.as_f64()).floor())
        }
        (BinaryOp::Mod, x, y) => {
            if y.as_f64() == 0.0 {
                return fail("division by zero");
            }
            float_val(x.as_f64().rem_euclid(y.as_f64()))
        }
        _ => fail(format!("unsupported operator {:?}", op)),
    }
}

fn int_val(result: Option<i64>) -> EvalResult<Val> {
    match result {
        Some(i) => Ok(Val::Json(Value::from(i))),
        None => fail("integer overflow"),
    }
}

fn compare(a: &Val, b: &Val) -> Option<Ordering> {
    match (a, b) {
        (Val::DateTime(x), Val::DateTime(y)) => Some(x.cmp(y)),
        (Val::DateTime(x), other) => as_datetime(other).map(|y| x.cmp(&y)),
        (other, Val::DateTime(y)) => as_datetime(other).map(|x| x.cmp(y)),
        (Val::Duration(x), Val::Duration(y)) if x.months == y.months => Some(x.fixed.cmp(&y.fixed)),
        (Val::Json(Value::String(x)), Val::Json(Value::String(y))) => Some(x.cmp(y)),
        _ => match (number(a), number(b)) {
            (Some(Num::Int(i)), Some(Num::Int(j))) => Some(i.cmp(&j)),
            (Some(x), Some(y)) => x.as_f64().partial_cmp(&y.as_f64()),
            _ => None,
        },
    }
}

fn equals(a: &Val, b: &Val) -> bool {
    if a.is_missing() && b.is_missing() {
        return true;
    }
    match (a, b) {
        (Val::Json(Value::Number(_)), Val::Json(Value::Number(_)))
        | (Val::DateTime(_), Val::DateTime(_)) => compare(a, b) == Some(Ordering::Equal),
        (Val::Json(x), Val::Json(y)) => x == y,
        (Val::Duration(x), Val::Duration(y)) => x == y,
        _ => false,
    }
}

fn contains(haystack: &Val, needle: &Val) -> bool {
    match haystack {
        Val::Json(Value::String(s)) => s.contains(&needle.render()),
        Val::Json(Value::Array(items)) => items
            .iter()
            .any(|item| equals(&Val::Json(item.clone()), needle)),
        Val::Json(Value::Object(map)) => map.contains_key(&needle.render()),
        _ => false,
    }
}

fn string_arg(args: &[Val], i: usize, what: &str) -> EvalResult<String> {
    match args.get(i) {
        Some(Val::Json(Value::String(s))) => Ok(s.clone()),
        Some(other) if !other.is_missing() => Ok(other.render()),
        _ => fail(format!("{} expects a string argument", what)),
    }
}

fn to_int(val: &Val) -> EvalResult<i64> {
    match val {
        Val::Undefined | Val::Json(Value::Null) => Ok(0),
        Val::Json(Value::String(s)) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Ok(i);
            }
            s.parse::<f64>()
                .map(|f| f.trunc() as i64)
                .map_err(|_| EvalError::Failed(format!("'{}' is not a number", s)))
        }
        other => match number(other) {
            Some(Num::Int(i)) => Ok(i),
            Some(Num::Float(f)) => Ok(f.trunc() as i64),
            None => fail(format!("cannot convert {:?} to int", other)),
        },
    }
}

fn to_float(val: &Val) -> EvalResult<f64> {
    match val {
        Val::Undefined | Val::Json(Value::Null) => Ok(0.0),
        Val::Json(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| EvalError::Failed(format!("'{}' is not a number", s))),
        other => number(other)
            .map(Num::as_f64)
            .ok_or_else(|| EvalError::Failed(format!("cannot convert {:?} to float", other))),
    }
}

fn require_datetime(val: &Val, what: &str) -> EvalResult<DateTime<Utc>> {
    as_datetime(val).ok_or_else(|| EvalError::Failed(format!("{}: {:?} is not a datetime", what, val)))
}

fn format_with(dt: &DateTime<Utc>, format: &str) -> EvalResult<Val> {
    format_datetime(dt, format)
        .map(|s| Val::Json(Value::String(s)))
        .map_err(|e| EvalError::Failed(e.to_string()))
}

fn call_function(name: &str, args: Vec<Val>, ctx: &Context) -> EvalResult<Val> {
    match name {
        "now_utc" => Ok(Val::DateTime(ctx.now())),
        "today_utc" => Ok(Val::Json(Value::String(ctx.now().format("%Y-%m-%d").to_string()))),
        "format_datetime" => {
            let value = args
                .first()
                .ok_or_else(|| EvalError::Failed("format_datetime expects a value".into()))?;
            let dt = require_datetime(value, "format_datetime")?;
            format_with(&dt, &string_arg(&args, 1, "format_datetime")?)
        }
        "duration" => {
            let text = string_arg(&args, 0, "duration")?;
            IsoDuration::parse(&text)
                .map(Val::Duration)
                .map_err(|e| EvalError::Failed(e.to_string()))
        }
        "day_delta" => {
            let days = args.first().map(to_float).transpose()?.unwrap_or(0.0);
            let format = match args.get(1) {
                Some(_) => string_arg(&args, 1, "day_delta")?,
                None => DAY_DELTA_FORMAT.to_string(),
            };
            let shifted = ctx.now() + Duration::microseconds((days * 86_400e6) as i64);
            format_with(&shifted, &format)
        }
        "max" | "min" => {
            let single_list = matches!(args.as_slice(), [Val::Json(Value::Array(_))]);
            let candidates: Vec<Val> = if single_list {
                match args.into_iter().next() {
                    Some(Val::Json(Value::Array(items))) => items.into_iter().map(Val::Json).collect(),
                    _ => Vec::new(),
                }
            } else {
                args
            };
            let mut best: Option<Val> = None;
            for candidate in candidates {
                best = Some(match best {
                    None => candidate,
                    Some(current) => {
                        let ordering = compare(&candidate, &current).ok_or_else(|| {
                            EvalError::Failed(format!("{} received incomparable values", name))
                        })?;
                        let better = if name == "max" {
                            ordering == Ordering::Greater
                        } else {
                            ordering == Ordering::Less
                        };
                        if better {
                            candidate
                        } else {
                            current
                        }
                    }
                });
            }
            best.ok_or_else(|| EvalError::Failed(format!("{} expects arguments", name)))
        }
        "str" => Ok(Val::Json(Value::String(
            args.first().map(Val::render).unwrap_or_default(),
        ))),
        "int" => {
            let value = args.into_iter().next().unwrap_or(Val::Undefined);
            Ok(Val::Json(Value::from(to_int(&value)?)))
        }
        "float" => {
            let value = args.into_iter().next().unwrap_or(Val::Undefined);
            float_val(to_float(&value)?)
        }
        "timestamp" => {
            let value = args.into_iter().next().unwrap_or(Val::Undefined);
            Ok(Val::Json(Value::from(require_datetime(&value, "timestamp")?.timestamp())))
        }
        other => fail(format!("unknown function '{}'", other)),
    }
}

fn call_method(target: Val, name: &str, args: Vec<Val>) -> EvalResult<Val> {
    match name {
        "get" => {
            let key = args
                .first()
                .ok_or_else(|| EvalError::Failed("get expects a key".into()))?;
            match &target {
                Val::Json(Value::Object(map)) => Ok(match map.get(&key.render()) {
                    Some(v) => Val::Json(v.clone()),
                    None => args.get(1).cloned().unwrap_or(Val::Json(Value::Null)),
                }),
                Val::Undefined | Val::Json(Value::Null) => {
                    Ok(args.get(1).cloned().unwrap_or(Val::Undefined))
                }
                other => fail(format!("cannot call get on {:?}", other)),
            }
        }
        "strftime" => {
            let dt = require_datetime(&target, "strftime")?;
            format_with(&dt, &string_arg(&args, 0, "strftime")?)
        }
        "isoformat" => {
            let dt = require_datetime(&target, "isoformat")?;
            Ok(Val::Json(Value::String(
                dt.to_rfc3339_opts(SecondsFormat::AutoSi, false),
            )))
        }
        "date" => {
            let dt = require_datetime(&target, "date")?;
            Ok(Val::Json(Value::String(dt.format("%Y-%m-%d").to_string())))
        }
        "timestamp" => {
            let dt = require_datetime(&target, "timestamp")?;
            float_val(dt.timestamp_millis() as f64 / 1000.0)
        }
        "keys" | "values" => match &target {
            Val::Json(Value::Object(map)) => Ok(Val::Json(Value::Array(if name == "keys" {
                map.keys().cloned().map(Value::String).collect()
            } else {
                map.values().cloned().collect()
            }))),
            other => fail(format!("cannot call {} on {:?}", name, other)),
        },
        "lower" | "upper" | "strip" | "startswith" | "endswith" | "split" | "replace" => {
            let text = match &target {
                Val::Json(Value::String(s)) => s.clone(),
                other => return fail(format!("cannot call {} on {:?}", name, other)),
            };
            Ok(Val::Json(match name {
                "lower" => Value::String(text.to_lowercase()),
                "upper" => Value::String(text.to_uppercase()),
                "strip" => Value::String(text.trim().to_string()),
                "startswith" => Value::Bool(text.starts_with(&string_arg(&args, 0, name)?)),
                "endswith" => Value::Bool(text.ends_with(&string_arg(&args, 0, name)?)),
                "split" => {
                    let parts: Vec<Value> = match args.first() {
                        Some(_) => {
                            let sep = string_arg(&args, 0, name)?;
                            text.split(sep.as_str())
                                .map(|p| Value::String(p.to_string()))
                                .collect()
                        }
                        None => text
                            .split_whitespace()
                            .map(|p| Value::String(p.to_string()))
                            .collect(),
                    };
                    Value::Array(parts)
                }
                _ => {
                    let from = string_arg(&args, 0, name)?;
                    let to = string_arg(&args, 1, name).unwrap_or_default();
                    Value::String(text.replace(&from, &to))
                }
            }))
        }
        other => fail(format!("unknown method '{}'", other)),
    }
}

fn apply_filter(name: &str, value: Val, args: Vec<Val>) -> EvalResult<Val> {
    match name {
        "string" => Ok(Val::Json(Value::String(value.render()))),
        "int" => Ok(Val::Json(Value::from(to_int(&value)?))),
        "float" => float_val(to_float(&value)?),
        "length" | "count" => {
            let len = match &value {
                Val::Json(Value::String(s)) => s.chars().count(),
                Val::Json(Value::Array(a)) => a.len(),
                Val::Json(Value::Object(o)) => o.len(),
                Val::Undefined | Val::Json(Value::Null) => 0,
                other => return fail(format!("{:?} has no length", other)),
            };
            Ok(Val::Json(Value::from(len as u64)))
        }
        "lower" => Ok(Val::Json(Value::String(value.render().to_lowercase()))),
        "upper" => Ok(Val::Json(Value::String(value.render().to_uppercase()))),
        "trim" => Ok(Val::Json(Value::String(value.render().trim().to_string()))),
        "tojson" => Ok(Val::Json(Value::String(value.into_json().to_string()))),
        "urlencode" => Ok(Val::Json(Value::String(
            urlencoding::encode(&value.render()).into_owned(),
        ))),
        "first" | "last" => match value {
            Val::Json(Value::Array(items)) => {
                let item = if name == "first" {
                    items.into_iter().next()
                } else {
                    items.into_iter().last()
                };
                Ok(item.map_or(Val::Undefined, Val::Json))
            }
            other => fail(format!("{} expects a list, got {:?}", name, other)),
        },
        "join" => match value {
            Val::Json(Value::Array(items)) => {
                let sep = match args.first() {
                    Some(_) => string_arg(&args, 0, "join")?,
                    None => String::new(),
                };
                let parts: Vec<String> = items.into_iter().map(|v| Val::Json(v).render()).collect();
                Ok(Val::Json(Value::String(parts.join(&sep))))
            }
            other => fail(format!("join expects a list, got {:?}", other)),
        },
        other => fail(format!("unknown filter '{}'", other)),
    }
}
