// Integration tests for incremental datetime streams against a mock API

mod common;

use common::*;
use mockito::{Matcher, Mock, ServerGuard};
use serde_json::json;
use std::io::Write;
use tributary::{SourceError, SyncMode};

async fn window(server: &mut ServerGuard, from: &str, to: &str, updated_at: &str, id: u32) -> Mock {
    server
        .mock("GET", "/events")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("from_date".into(), from.into()),
            Matcher::UrlEncoded("to_date".into(), to.into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"data": [{"id": id, "updated_at": updated_at}]}).to_string())
        .create_async()
        .await
}

/// S1: no state reads every window and ends with one merged interval.
#[tokio::test]
async fn test_first_sync_reads_all_windows() {
    let mut server = mockito::Server::new_async().await;
    let mocks = vec![
        window(&mut server, "2024-07-01", "2024-07-15", "2024-07-10", 1).await,
        window(&mut server, "2024-07-16", "2024-07-30", "2024-07-20", 2).await,
        window(&mut server, "2024-07-31", "2024-08-14", "2024-08-01", 3).await,
        window(&mut server, "2024-08-15", "2024-08-29", "2024-08-20", 4).await,
        window(&mut server, "2024-08-30", "2024-09-10", "2024-09-05", 5).await,
    ];

    let source = source(EVENTS_MANIFEST);
    let output = read(
        &source,
        &config(&server.url()),
        catalog(&[("events", SyncMode::Incremental)]),
        Default::default(),
    )
    .await;

    assert!(output.error.is_none(), "{:?}", output.error);
    for mock in &mocks {
        mock.assert_async().await;
    }
    let mut ids: Vec<u64> = output
        .records("events")
        .iter()
        .map(|r| r["id"].as_u64().unwrap())
        .collect();
    ids.sort();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);

    let states = output.states("events");
    assert!(!states.is_empty());
    assert_eq!(
        states.last().unwrap(),
        &json!({
            "state_type": "date-range",
            "slices": [{
                "start": "2024-07-01",
                "end": "2024-09-10",
                "most_recent_cursor_value": "2024-09-05"
            }]
        })
    );
    assert_eq!(output.statuses("events"), vec!["STARTED", "RUNNING", "COMPLETE"]);
}

/// S2: resuming fills the holes and re-reads the tail from end - lookback.
#[tokio::test]
async fn test_resume_fills_holes() {
    let mut server = mockito::Server::new_async().await;
    let mocks = vec![
        window(&mut server, "2024-07-01", "2024-07-15", "2024-07-02", 1).await,
        window(&mut server, "2024-08-15", "2024-08-29", "2024-08-16", 2).await,
        window(&mut server, "2024-09-04", "2024-09-10", "2024-09-08", 3).await,
    ];
    let state = state_for(
        "events",
        json!({
            "state_type": "date-range",
            "slices": [
                {"start": "2024-07-16", "end": "2024-07-30"},
                {"start": "2024-07-31", "end": "2024-08-14"},
                {"start": "2024-08-30", "end": "2024-09-09"}
            ]
        }),
    );

    let source = source(EVENTS_MANIFEST);
    let output = read(
        &source,
        &config(&server.url()),
        catalog(&[("events", SyncMode::Incremental)]),
        state,
    )
    .await;

    assert!(output.error.is_none(), "{:?}", output.error);
    for mock in &mocks {
        mock.assert_async().await;
    }
    assert_eq!(output.records("events").len(), 3);
    let last = output.states("events").pop().unwrap();
    assert_eq!(intervals(&last), vec![("2024-07-01".to_string(), "2024-09-10".to_string())]);
    assert_eq!(last["slices"][0]["most_recent_cursor_value"], json!("2024-09-09"));
}

/// S3: a legacy `{cursor_field: value}` state is migrated to a date range.
#[tokio::test]
async fn test_legacy_state_is_migrated() {
    let mut server = mockito::Server::new_async().await;
    let mocks = vec![
        window(&mut server, "2024-08-01", "2024-08-15", "2024-08-07", 1).await,
        window(&mut server, "2024-08-16", "2024-08-30", "2024-08-20", 2).await,
        window(&mut server, "2024-08-31", "2024-09-10", "2024-09-01", 3).await,
    ];

    let source = source(EVENTS_MANIFEST);
    let output = read(
        &source,
        &config(&server.url()),
        catalog(&[("events", SyncMode::Incremental)]),
        state_for("events", json!({"updated_at": "2024-08-06"})),
    )
    .await;

    assert!(output.error.is_none(), "{:?}", output.error);
    for mock in &mocks {
        mock.assert_async().await;
    }
    let last = output.states("events").pop().unwrap();
    assert_eq!(last["state_type"], json!("date-range"));
    assert_eq!(intervals(&last), vec![("2024-07-01".to_string(), "2024-09-10".to_string())]);
}

/// S4: a failing partition fails the stream without publishing its window.
#[tokio::test]
async fn test_failing_partition_keeps_state_behind_work() {
    let mut server = mockito::Server::new_async().await;
    window(&mut server, "2024-07-01", "2024-07-15", "2024-07-10", 1).await;
    window(&mut server, "2024-07-16", "2024-07-30", "2024-07-20", 2).await;
    let _broken = server
        .mock("GET", "/events")
        .match_query(Matcher::UrlEncoded("from_date".into(), "2024-07-31".into()))
        .with_status(400)
        .with_body(r#"{"error": "bad request"}"#)
        .create_async()
        .await;
    window(&mut server, "2024-08-15", "2024-08-29", "2024-08-20", 4).await;
    window(&mut server, "2024-08-30", "2024-09-10", "2024-09-05", 5).await;

    let source = source(EVENTS_MANIFEST);
    let output = read(
        &source,
        &config(&server.url()),
        catalog(&[("events", SyncMode::Incremental)]),
        Default::default(),
    )
    .await;

    match &output.error {
        Some(SourceError::SyncFailed(streams)) => assert_eq!(streams, &vec!["events".to_string()]),
        other => panic!("expected a failed sync, got {:?}", other),
    }
    let errors = output.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["failure_type"], json!("system_error"));
    assert_eq!(output.statuses("events").last().map(String::as_str), Some("INCOMPLETE"));

    let last = output.states("events").pop().unwrap();
    let published = intervals(&last);
    assert_eq!(published[0], ("2024-07-01".to_string(), "2024-07-30".to_string()));
    assert!(
        !published
            .iter()
            .any(|(start, end)| start.as_str() <= "2024-08-14" && end.as_str() >= "2024-07-31"),
        "failed window published: {:?}",
        published
    );
}

/// S4 with three workers: the windows either side of the failure are read
/// and published, the failed one stays a gap.
#[tokio::test]
async fn test_failing_partition_leaves_gap_between_neighbours() {
    let mut server = mockito::Server::new_async().await;
    window(&mut server, "2024-07-28", "2024-08-11", "2024-08-01", 1).await;
    let _broken = server
        .mock("GET", "/events")
        .match_query(Matcher::UrlEncoded("from_date".into(), "2024-08-12".into()))
        .with_status(400)
        .with_chunked_body(|w| {
            std::thread::sleep(std::time::Duration::from_millis(300));
            w.write_all(br#"{"error": "bad request"}"#)
        })
        .create_async()
        .await;
    window(&mut server, "2024-08-27", "2024-09-10", "2024-09-01", 3).await;

    let manifest = format!(
        "{}concurrency_level:\n  default_concurrency: 3\n  max_concurrency: 3\n",
        EVENTS_MANIFEST
    );
    let source = source(&manifest);
    let mut config = config(&server.url()).to_value();
    config["start_date"] = json!("2024-07-28");
    let config = tributary::config::ConnectorConfig::from_value(config).unwrap();
    let output = read(
        &source,
        &config,
        catalog(&[("events", SyncMode::Incremental)]),
        Default::default(),
    )
    .await;

    assert!(matches!(output.error, Some(SourceError::SyncFailed(_))));
    let mut ids: Vec<u64> = output
        .records("events")
        .iter()
        .map(|r| r["id"].as_u64().unwrap())
        .collect();
    ids.sort();
    assert_eq!(ids, vec![1, 3]);

    let last = output.states("events").pop().unwrap();
    assert_eq!(
        intervals(&last),
        vec![
            ("2024-07-28".to_string(), "2024-08-11".to_string()),
            ("2024-08-27".to_string(), "2024-09-10".to_string()),
        ]
    );
    assert_eq!(output.statuses("events").last().map(String::as_str), Some("INCOMPLETE"));
}

/// Records outside their window are dropped; records without a cursor
/// value are kept.
#[tokio::test]
async fn test_out_of_window_records_are_dropped() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/events")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({"data": [
                {"id": 1, "updated_at": "2024-01-01"},
                {"id": 2},
            ]})
            .to_string(),
        )
        .expect(5)
        .create_async()
        .await;

    let source = source(EVENTS_MANIFEST);
    let output = read(
        &source,
        &config(&server.url()),
        catalog(&[("events", SyncMode::Incremental)]),
        Default::default(),
    )
    .await;

    assert!(output.error.is_none(), "{:?}", output.error);
    let records = output.records("events");
    assert_eq!(records.len(), 5);
    assert!(records.iter().all(|r| r["id"] == 2));
}
