// Integration tests for manifest loading, concurrency and check/discover

mod common;

use common::*;
use serde_json::json;
use source_runtime::interpolation::Context;
use source_runtime::reader::ConcurrentReader;
use source_runtime::{Manifest, Source};
use std::io::Write;
use tributary::SyncMode;

const CONCURRENT_MANIFEST: &str = r##"
version: "1.0.0"
definitions:
  base:
    retriever:
      requester:
        url_base: "{{ config.base_url }}"
      record_selector:
        extractor:
          field_path: ["data"]
streams:
  - $ref: "#/definitions/base"
    name: users
    $parameters:
      path: "/users"
  - $ref: "#/definitions/base"
    name: teams
    $parameters:
      path: "/teams"
check:
  stream_names: ["users"]
concurrency_level:
  default_concurrency: "{{ config.num_workers }}"
  max_concurrency: 2
"##;

/// S6: requested workers are clamped to max_concurrency.
#[test]
fn test_concurrency_is_clamped() {
    let manifest = Manifest::from_yaml(CONCURRENT_MANIFEST).unwrap();
    let ctx = Context::new(chrono::Utc::now()).with("config", json!({"num_workers": 10}));
    let concurrency = manifest.concurrency(&ctx).unwrap();
    assert_eq!(concurrency, 2);

    let reader = ConcurrentReader::new(concurrency);
    assert_eq!(reader.concurrency(), 2);
    assert_eq!(reader.initial_partitions(), 1);
}

#[test]
fn test_concurrency_within_bounds() {
    let manifest = Manifest::from_yaml(&CONCURRENT_MANIFEST.replace("max_concurrency: 2", "max_concurrency: 25")).unwrap();
    for (workers, concurrency, initial) in [(20, 20, 10), (1, 1, 1)] {
        let ctx = Context::new(chrono::Utc::now()).with("config", json!({"num_workers": workers}));
        let reader = ConcurrentReader::new(manifest.concurrency(&ctx).unwrap());
        assert_eq!(reader.concurrency(), concurrency);
        assert_eq!(reader.initial_partitions(), initial);
    }
}

#[tokio::test]
async fn test_concurrent_streams_read_with_parameters_path() {
    let mut server = mockito::Server::new_async().await;
    let users = server
        .mock("GET", "/users")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data": [{"id": 1}, {"id": 2}]}"#)
        .create_async()
        .await;
    let teams = server
        .mock("GET", "/teams")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data": [{"id": "a"}]}"#)
        .create_async()
        .await;

    let source = source(CONCURRENT_MANIFEST);
    let mut config = config(&server.url()).to_value();
    config["num_workers"] = json!(10);
    let config = tributary::config::ConnectorConfig::from_value(config).unwrap();
    let output = read(
        &source,
        &config,
        catalog(&[("users", SyncMode::FullRefresh), ("teams", SyncMode::FullRefresh)]),
        Default::default(),
    )
    .await;

    assert!(output.error.is_none(), "{:?}", output.error);
    users.assert_async().await;
    teams.assert_async().await;
    assert_eq!(output.records("users").len(), 2);
    assert_eq!(output.records("teams").len(), 1);
    assert_eq!(
        output.states("users").pop(),
        Some(json!({"__ab_full_refresh_sync_complete": true}))
    );
    assert_eq!(output.statuses("teams"), vec!["STARTED", "RUNNING", "COMPLETE"]);
}

#[tokio::test]
async fn test_check_uses_check_streams() {
    let mut server = mockito::Server::new_async().await;
    let users = server
        .mock("GET", "/users")
        .with_status(401)
        .with_body("Unable to authenticate you")
        .create_async()
        .await;

    let source = source(CONCURRENT_MANIFEST);
    let status = serde_json::to_value(source.check(&config(&server.url())).await).unwrap();
    users.assert_async().await;
    assert_eq!(status["connectionStatus"]["status"], json!("FAILED"));
    assert!(status["connectionStatus"]["message"]
        .as_str()
        .unwrap()
        .starts_with("Unable to connect to stream users"));
}

#[test]
fn test_discover_reports_cursor_and_keys() {
    let catalog = source(EVENTS_MANIFEST).discover();
    assert_eq!(catalog.streams.len(), 1);
    let events = &catalog.streams[0];
    assert_eq!(events.name, "events");
    assert_eq!(events.supported_sync_modes, vec![SyncMode::FullRefresh, SyncMode::Incremental]);
    assert_eq!(events.default_cursor_field, Some(vec!["updated_at".to_string()]));
    assert_eq!(events.source_defined_primary_key, Some(vec![vec!["id".to_string()]]));
}

#[test]
fn test_load_manifest_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(EVENTS_MANIFEST.as_bytes()).unwrap();
    let manifest = Manifest::load(file.path()).unwrap();
    assert!(manifest.stream("events").is_some());

    let missing = Manifest::load("/nonexistent/manifest.yaml").unwrap_err();
    assert!(missing.to_string().contains("Failed to read manifest"));
}

#[test]
fn test_circular_reference_is_rejected() {
    let manifest = r##"
definitions:
  a:
    $ref: "#/definitions/b"
  b:
    $ref: "#/definitions/a"
streams: []
"##;
    let err = Manifest::from_yaml(manifest).unwrap_err();
    assert!(err.to_string().contains("circular reference"), "{}", err);
}
