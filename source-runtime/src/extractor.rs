//! Record extraction from a decoded response body.

use chrono::SecondsFormat;
use serde_json::{Map, Value};
use tributary::error::Result;

use crate::datetime::value_to_datetime;
use crate::interpolation::{Context, Template};

/// Fields rewritten to RFC 3339 by `normalize_datetimes`.
const DATETIME_FIELDS: [&str; 4] = ["last_seen", "created", "updated_at", "last_authenticated"];

#[derive(Debug, Clone, Default)]
pub struct RecordSelector {
    field_path: Vec<Template>,
    record_filter: Option<Template>,
    flatten_nested: bool,
    normalize_datetimes: bool,
}

impl RecordSelector {
    pub fn new(field_path: Vec<Template>) -> Self {
        Self {
            field_path,
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, condition: Template) -> Self {
        self.record_filter = Some(condition);
        self
    }

    pub fn with_flatten_nested(mut self, flatten: bool) -> Self {
        self.flatten_nested = flatten;
        self
    }

    pub fn with_normalize_datetimes(mut self, normalize: bool) -> Self {
        self.normalize_datetimes = normalize;
        self
    }

    /// Walk `field_path` over `body` and return the surviving records.
    pub fn select(&self, body: &Value, ctx: &Context) -> Result<Vec<Map<String, Value>>> {
        let mut nodes: Vec<&Value> = vec![body];
        for component in &self.field_path {
            let key = component.eval_string(ctx)?.unwrap_or_default();
            nodes = step(nodes, &key);
        }

        let mut records = Vec::new();
        for node in nodes {
            match node {
                Value::Object(map) => records.push(map.clone()),
                Value::Array(items) => {
                    records.extend(items.iter().filter_map(|v| v.as_object().cloned()))
                }
                _ => {}
            }
        }

        if let Some(condition) = &self.record_filter {
            let mut kept = Vec::with_capacity(records.len());
            let mut ctx = ctx.clone();
            for record in records {
                ctx.set("record", Value::Object(record.clone()));
                if condition.eval_bool(&ctx)? {
                    kept.push(record);
                }
            }
            records = kept;
        }

        if self.flatten_nested {
            records = records.into_iter().map(flatten).collect();
        }
        if self.normalize_datetimes {
            records.iter_mut().for_each(normalize_datetimes);
        }
        Ok(records)
    }
}

fn step<'a>(nodes: Vec<&'a Value>, key: &str) -> Vec<&'a Value> {
    let mut next = Vec::new();
    for node in nodes {
        if key == "*" {
            match node {
                Value::Array(items) => next.extend(items.iter()),
                Value::Object(map) => next.extend(map.values()),
                _ => {}
            }
            continue;
        }
        let (name, flatten_array) = match key.strip_suffix("[]") {
            Some(name) => (name, true),
            None => (key, false),
        };
        let child = match node {
            Value::Object(map) => map.get(name),
            Value::Array(items) => name.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match child {
            Some(Value::Array(items)) if flatten_array => next.extend(items.iter()),
            Some(value) => next.push(value),
            None => {}
        }
    }
    next
}

/// `{"a": {"b": 1}}` becomes `{"a.b": 1}`. Arrays are left alone.
fn flatten(record: Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in record {
        flatten_into(&mut out, key, value);
    }
    out
}

fn flatten_into(out: &mut Map<String, Value>, prefix: String, value: Value) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                flatten_into(out, format!("{}.{}", prefix, key), child);
            }
        }
        other => {
            out.insert(prefix, other);
        }
    }
}

fn normalize_datetimes(record: &mut Map<String, Value>) {
    for field in DATETIME_FIELDS {
        if let Some(value) = record.get_mut(field) {
            if let Some(dt) = value_to_datetime(value, &[]) {
                *value = Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn selector(path: &[&str]) -> RecordSelector {
        RecordSelector::new(path.iter().map(|p| Template::parse(p).unwrap()).collect())
    }

    fn ctx() -> Context {
        Context::new(Utc::now()).with("config", json!({"root": "data"}))
    }

    fn ids(records: &[Map<String, Value>]) -> Vec<Value> {
        records.iter().map(|r| r["id"].clone()).collect()
    }

    #[test]
    fn test_field_path() {
        let body = json!({"data": {"items": [{"id": 1}, {"id": 2}, "skip"]}});
        let records = selector(&["{{ config.root }}", "items"]).select(&body, &ctx()).unwrap();
        assert_eq!(ids(&records), vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_empty_path_and_object_body() {
        let records = selector(&[]).select(&json!([{"id": 1}]), &ctx()).unwrap();
        assert_eq!(ids(&records), vec![json!(1)]);
        let records = selector(&[]).select(&json!({"id": 7}), &ctx()).unwrap();
        assert_eq!(ids(&records), vec![json!(7)]);
    }

    #[test]
    fn test_missing_key_is_empty() {
        let records = selector(&["nope"]).select(&json!({"data": []}), &ctx()).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_wildcard_and_array_suffix() {
        let body = json!({
            "groups": {
                "a": {"members": [{"id": 1}, {"id": 2}]},
                "b": {"members": [{"id": 3}]}
            }
        });
        let records = selector(&["groups", "*", "members[]"]).select(&body, &ctx()).unwrap();
        assert_eq!(ids(&records), vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_record_filter() {
        let body = json!([{"id": 1, "active": true}, {"id": 2, "active": false}]);
        let records = selector(&[])
            .with_filter(Template::parse("{{ record.active }}").unwrap())
            .select(&body, &ctx())
            .unwrap();
        assert_eq!(ids(&records), vec![json!(1)]);
    }

    #[test]
    fn test_flatten_and_normalize() {
        let body = json!([{
            "id": 1,
            "owner": {"name": "ryuji", "team": {"code": "P5"}},
            "updated_at": 1720569600,
            "created": "2024-07-10 00:00:00",
            "tags": ["a"]
        }]);
        let records = selector(&[])
            .with_flatten_nested(true)
            .with_normalize_datetimes(true)
            .select(&body, &ctx())
            .unwrap();
        assert_eq!(
            Value::Object(records[0].clone()),
            json!({
                "id": 1,
                "owner.name": "ryuji",
                "owner.team.code": "P5",
                "updated_at": "2024-07-10T00:00:00Z",
                "created": "2024-07-10T00:00:00Z",
                "tags": ["a"]
            })
        );
    }
}
