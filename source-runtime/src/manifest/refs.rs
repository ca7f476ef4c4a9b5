//! `$ref` resolution and `$parameters` merging over the raw manifest tree.

use serde_json::{Map, Value};
use tributary::error::{Result, SourceError};

const REF_KEY: &str = "$ref";
pub const PARAMETERS_KEY: &str = "$parameters";

/// Replace every reference in `manifest` with the value it points to.
///
/// `{"$ref": "#/definitions/x", ...}` objects are replaced by the target,
/// with the sibling keys laid over it. Plain strings of the form
/// `"#/definitions/x"` are replaced by the target value.
pub fn resolve_references(manifest: &Value) -> Result<Value> {
    let mut stack = Vec::new();
    resolve(manifest, manifest, &mut stack)
}

fn resolve(node: &Value, root: &Value, stack: &mut Vec<String>) -> Result<Value> {
    match node {
        Value::Object(map) => {
            if let Some(reference) = map.get(REF_KEY) {
                let path = reference
                    .as_str()
                    .ok_or_else(|| SourceError::Manifest(format!("$ref must be a string, got {}", reference)))?;
                let target = follow(path, root, stack)?;
                let mut merged = match target {
                    Value::Object(target) => target,
                    other if map.len() == 1 => return Ok(other),
                    other => {
                        return Err(SourceError::Manifest(format!(
                            "'{}' resolves to {} and cannot take sibling keys",
                            path, other
                        )))
                    }
                };
                for (key, value) in map {
                    if key != REF_KEY {
                        merged.insert(key.clone(), resolve(value, root, stack)?);
                    }
                }
                return Ok(Value::Object(merged));
            }
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), resolve(value, root, stack)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(item, root, stack))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::String(text) if is_reference(text) => follow(text, root, stack),
        other => Ok(other.clone()),
    }
}

fn is_reference(text: &str) -> bool {
    text.starts_with("#/") || (text.starts_with("*ref(") && text.ends_with(')'))
}

/// Resolve the target of `path`, itself fully resolved.
fn follow(path: &str, root: &Value, stack: &mut Vec<String>) -> Result<Value> {
    if stack.iter().any(|p| p == path) {
        stack.push(path.to_string());
        return Err(SourceError::Manifest(format!(
            "circular reference: {}",
            stack.join(" -> ")
        )));
    }
    let segments: Vec<&str> = if let Some(pointer) = path.strip_prefix("#/") {
        pointer.split('/').collect()
    } else {
        let inner = &path["*ref(".len()..path.len() - 1];
        inner.split('.').collect()
    };

    let mut target = root;
    for segment in &segments {
        let segment = segment.replace("~1", "/").replace("~0", "~");
        target = match target {
            Value::Object(map) => map.get(&segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(|| SourceError::Manifest(format!("unresolved reference '{}'", path)))?;
    }

    stack.push(path.to_string());
    let resolved = resolve(target, root, stack);
    stack.pop();
    resolved
}

/// `$parameters` of a component: the inherited ones overlaid with its own.
pub fn merge_parameters(inherited: &Map<String, Value>, component: &Value) -> Map<String, Value> {
    let mut merged = inherited.clone();
    if let Some(Value::Object(own)) = component.get(PARAMETERS_KEY) {
        for (key, value) in own {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}
