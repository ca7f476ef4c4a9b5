//! `{{ expression }}` templates evaluated against a slice-scoped context.
//!
//! Templates are compiled once when the manifest is lowered and evaluated
//! many times (per request, per page). A template consisting of a single
//! expression yields a typed JSON value; anything else renders to a string.
//!
//! Evaluation is pure: the only notion of time comes from the context's
//! `now`, which the reader takes from its [`Clock`](tributary::Clock).

mod eval;
mod lexer;
mod parser;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tributary::error::{Result, SourceError};

use eval::{evaluate, EvalError};
use lexer::{split_segments, tokenize, RawSegment};
use parser::Expr;

/// Named roots visible to templates (`config`, `stream_slice`, ...).
#[derive(Debug, Clone)]
pub struct Context {
    roots: HashMap<String, Value>,
    now: DateTime<Utc>,
}

impl Context {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            roots: HashMap::new(),
            now,
        }
    }

    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.roots.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.roots.get(name)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Expr(Expr),
}

/// A compiled template. Maps and lists are compiled element-wise so nested
/// request bodies can be templated.
#[derive(Debug, Clone, PartialEq)]
pub struct Template(Node);

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Raw(Value),
    Text(Vec<Segment>),
    Object(Vec<(String, Node)>),
    Array(Vec<Node>),
}

impl Template {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(Template(Node::parse(text)?))
    }

    pub fn compile(value: &Value) -> Result<Self> {
        Ok(Template(Node::compile(value)?))
    }

    pub fn literal(text: &str) -> Self {
        Template(Node::Text(vec![Segment::Literal(text.to_string())]))
    }

    pub fn eval(&self, ctx: &Context) -> Result<Value> {
        self.0.eval(ctx)
    }

    /// Evaluate to text. `None` when the result is null or empty.
    pub fn eval_string(&self, ctx: &Context) -> Result<Option<String>> {
        Ok(value_to_param(&self.0.eval(ctx)?))
    }

    /// Evaluate as a condition.
    pub fn eval_bool(&self, ctx: &Context) -> Result<bool> {
        match &self.0 {
            Node::Text(segments) => match segments.as_slice() {
                [Segment::Expr(expr)] => Ok(evaluate(expr, ctx).map_err(runtime_error)?.truthy()),
                _ => Ok(truthy(&self.0.eval(ctx)?)),
            },
            node => Ok(truthy(&node.eval(ctx)?)),
        }
    }

    /// True if `name` is used as a root identifier in any expression.
    pub fn references(&self, name: &str) -> bool {
        self.0.references(name)
    }
}

impl Node {
    fn parse(text: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let raw = split_segments(text).map_err(|e| manifest_error(text, e))?;
        for segment in raw {
            segments.push(match segment {
                RawSegment::Literal(s) => Segment::Literal(s),
                RawSegment::Expr(source) => {
                    let tokens = tokenize(&source).map_err(|e| manifest_error(text, e))?;
                    Segment::Expr(parser::parse(tokens).map_err(|e| manifest_error(text, e))?)
                }
            });
        }
        Ok(Node::Text(segments))
    }

    fn compile(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Self::parse(s),
            Value::Object(map) => {
                let mut entries = Vec::with_capacity(map.len());
                for (k, v) in map {
                    entries.push((k.clone(), Self::compile(v)?));
                }
                Ok(Node::Object(entries))
            }
            Value::Array(items) => Ok(Node::Array(
                items.iter().map(Self::compile).collect::<Result<_>>()?,
            )),
            other => Ok(Node::Raw(other.clone())),
        }
    }

    fn eval(&self, ctx: &Context) -> Result<Value> {
        match self {
            Node::Raw(v) => Ok(v.clone()),
            Node::Text(segments) => match segments.as_slice() {
                [] => Ok(Value::String(String::new())),
                [Segment::Expr(expr)] => Ok(evaluate(expr, ctx).map_err(runtime_error)?.into_json()),
                _ => {
                    let mut out = String::new();
                    for segment in segments {
                        match segment {
                            Segment::Literal(s) => out.push_str(s),
                            Segment::Expr(expr) => {
                                out.push_str(&evaluate(expr, ctx).map_err(runtime_error)?.render())
                            }
                        }
                    }
                    Ok(Value::String(out))
                }
            },
            Node::Object(entries) => {
                let mut out = Map::new();
                for (k, v) in entries {
                    out.insert(k.clone(), v.eval(ctx)?);
                }
                Ok(Value::Object(out))
            }
            Node::Array(items) => Ok(Value::Array(
                items.iter().map(|t| t.eval(ctx)).collect::<Result<_>>()?,
            )),
        }
    }

    fn references(&self, name: &str) -> bool {
        match self {
            Node::Raw(_) => false,
            Node::Text(segments) => segments.iter().any(|s| match s {
                Segment::Literal(_) => false,
                Segment::Expr(expr) => expr.references(name),
            }),
            Node::Object(entries) => entries.iter().any(|(_, t)| t.references(name)),
            Node::Array(items) => items.iter().any(|t| t.references(name)),
        }
    }
}

/// Scan every string in a raw manifest subtree for templates that use
/// `name` as a root identifier. Unparseable strings fall back to a plain
/// substring check inside `{{ }}`.
pub fn references_identifier(value: &Value, name: &str) -> bool {
    match value {
        Value::String(s) if s.contains("{{") => match Template::parse(s) {
            Ok(template) => template.references(name),
            Err(_) => s.contains(name),
        },
        Value::Object(map) => map.values().any(|v| references_identifier(v, name)),
        Value::Array(items) => items.iter().any(|v| references_identifier(v, name)),
        _ => false,
    }
}

/// Text form of an evaluated value for query strings, headers and form
/// bodies. Null and empty strings are omitted.
pub fn value_to_param(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "False" && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn manifest_error(template: &str, err: anyhow::Error) -> SourceError {
    SourceError::Manifest(format!("invalid template '{}': {}", template, err))
}

fn runtime_error(err: EvalError) -> SourceError {
    match err {
        EvalError::Unbound(name) => {
            SourceError::Interpolation(format!("'{}' is not defined", name))
        }
        EvalError::Failed(message) => SourceError::Interpolation(message),
    }
}
