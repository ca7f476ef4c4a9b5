// Shared helpers for the source-runtime integration tests

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use futures::StreamExt;
use serde_json::{json, Value};
use source_runtime::http::ReqwestSender;
use source_runtime::{DeclarativeSource, Manifest, Source};
use std::sync::Arc;
use tributary::config::{ConnectorConfig, HttpConfig, RuntimeConfig};
use tributary::protocol::ConfiguredCatalog;
use tributary::state::StateManager;
use tributary::{FixedClock, SourceError, SyncMode};

/// Incremental `events` stream: 15-day windows from `config.start_date`,
/// lookback P5D, day granularity.
pub const EVENTS_MANIFEST: &str = r##"
version: "1.0.0"
definitions:
  requester:
    url_base: "{{ config.base_url }}"
    http_method: GET
  selector:
    extractor:
      field_path: ["data"]
streams:
  - name: events
    primary_key: id
    retriever:
      requester:
        $ref: "#/definitions/requester"
        path: "/events"
      record_selector:
        $ref: "#/definitions/selector"
    incremental_sync:
      type: DatetimeBasedCursor
      cursor_field: updated_at
      datetime_format: "%Y-%m-%d"
      start_datetime: "{{ config.start_date }}"
      step: P15D
      cursor_granularity: P1D
      lookback_window: P5D
      start_time_option:
        field_name: from_date
        inject_into: request_parameter
      end_time_option:
        field_name: to_date
        inject_into: request_parameter
"##;

/// Runtime settings with retries off.
pub fn runtime() -> RuntimeConfig {
    RuntimeConfig {
        http: HttpConfig {
            max_retries: 0,
            backoff_factor_secs: 0.0,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn source(manifest: &str) -> DeclarativeSource {
    let runtime = runtime();
    let sender = Arc::new(ReqwestSender::new(&runtime.http).unwrap());
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 9, 10, 0, 0, 0).unwrap()));
    DeclarativeSource::with_parts(Manifest::from_yaml(manifest).unwrap(), runtime, clock, sender)
}

pub fn config(base_url: &str) -> ConnectorConfig {
    ConnectorConfig::from_value(json!({
        "base_url": base_url,
        "start_date": "2024-07-01",
    }))
    .unwrap()
}

pub fn catalog(streams: &[(&str, SyncMode)]) -> ConfiguredCatalog {
    ConfiguredCatalog::from_streams(streams.iter().map(|(name, mode)| (name.to_string(), *mode)))
}

/// `[{type: STREAM, stream: {stream_descriptor, stream_state}}]`
pub fn state_for(stream: &str, stream_state: Value) -> StateManager {
    StateManager::from_value(json!([{
        "type": "STREAM",
        "stream": {"stream_descriptor": {"name": stream}, "stream_state": stream_state},
    }]))
    .unwrap()
}

/// Everything a read produced.
pub struct Output {
    pub messages: Vec<Value>,
    pub error: Option<SourceError>,
}

impl Output {
    pub fn records(&self, stream: &str) -> Vec<Value> {
        self.messages
            .iter()
            .filter(|m| m["type"] == "RECORD" && m["record"]["stream"] == stream)
            .map(|m| m["record"]["data"].clone())
            .collect()
    }

    pub fn states(&self, stream: &str) -> Vec<Value> {
        self.messages
            .iter()
            .filter(|m| m["type"] == "STATE" && m["state"]["stream"]["stream_descriptor"]["name"] == stream)
            .map(|m| m["state"]["stream"]["stream_state"].clone())
            .collect()
    }

    pub fn statuses(&self, stream: &str) -> Vec<String> {
        self.messages
            .iter()
            .filter(|m| {
                m["type"] == "TRACE"
                    && m["trace"]["type"] == "STREAM_STATUS"
                    && m["trace"]["stream_status"]["stream_descriptor"]["name"] == stream
            })
            .map(|m| m["trace"]["stream_status"]["status"].as_str().unwrap().to_string())
            .collect()
    }

    pub fn errors(&self) -> Vec<Value> {
        self.messages
            .iter()
            .filter(|m| m["type"] == "TRACE" && m["trace"]["type"] == "ERROR")
            .map(|m| m["trace"]["error"].clone())
            .collect()
    }
}

pub async fn read(
    source: &DeclarativeSource,
    config: &ConnectorConfig,
    catalog: ConfiguredCatalog,
    state: StateManager,
) -> Output {
    let mut messages = Vec::new();
    let mut error = None;
    let mut items = source.read(config, catalog, state);
    while let Some(item) = items.next().await {
        match item {
            Ok(message) => messages.push(serde_json::to_value(&message).unwrap()),
            Err(e) => error = Some(e),
        }
    }
    Output { messages, error }
}

/// `(start, end)` pairs of a date-range state.
pub fn intervals(state: &Value) -> Vec<(String, String)> {
    state["slices"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| {
            (
                s["start"].as_str().unwrap().to_string(),
                s["end"].as_str().unwrap().to_string(),
            )
        })
        .collect()
}
