//! In-process HTTP fakes for unit tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tributary::config::{ConnectorConfig, HttpConfig, RuntimeConfig};
use tributary::FixedClock;

use crate::http::{HttpClient, HttpResponse, HttpSender, TransportError};
use crate::requester::HttpRequest;
use crate::stream::ReadContext;

pub(crate) type Reply = std::result::Result<HttpResponse, TransportError>;

/// The frozen "now" used across runtime tests.
pub(crate) fn frozen_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 10, 0, 0, 0).unwrap()
}

/// Runtime settings with retries off and no backoff.
pub(crate) fn fast_runtime() -> RuntimeConfig {
    RuntimeConfig {
        http: HttpConfig {
            max_retries: 0,
            backoff_factor_secs: 0.0,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A read context that cannot reach the network.
pub(crate) fn read_context(config: Value) -> Arc<ReadContext> {
    read_context_with(Arc::new(ScriptedSender::new(Vec::new())), config)
}

pub(crate) fn read_context_with(sender: Arc<dyn HttpSender>, config: Value) -> Arc<ReadContext> {
    let runtime = fast_runtime();
    Arc::new(ReadContext::new(
        &ConnectorConfig::from_value(config).unwrap(),
        Arc::new(FixedClock::new(frozen_now())),
        HttpClient::new(sender, runtime.http.clone()),
        runtime,
    ))
}

/// Replays canned replies in order; records what was sent.
pub(crate) struct ScriptedSender {
    script: Mutex<VecDeque<Reply>>,
    sent: Mutex<Vec<(Instant, HttpRequest)>>,
}

impl ScriptedSender {
    pub(crate) fn new(script: Vec<Reply>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn sent(&self) -> Vec<HttpRequest> {
        self.sent.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
    }

    pub(crate) fn sent_at(&self) -> Vec<Instant> {
        self.sent.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }
}

#[async_trait]
impl HttpSender for ScriptedSender {
    async fn send(&self, request: &HttpRequest) -> Reply {
        self.sent
            .lock()
            .unwrap()
            .push((Instant::now(), request.clone()));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Other("script exhausted".into())))
    }
}

/// Answers each request with a closure; safe under concurrent workers.
pub(crate) struct RoutedSender<F> {
    route: F,
    sent: Mutex<Vec<HttpRequest>>,
}

impl<F> RoutedSender<F>
where
    F: Fn(&HttpRequest) -> Reply + Send + Sync,
{
    pub(crate) fn new(route: F) -> Self {
        Self {
            route,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn sent(&self) -> Vec<HttpRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl<F> HttpSender for RoutedSender<F>
where
    F: Fn(&HttpRequest) -> Reply + Send + Sync,
{
    async fn send(&self, request: &HttpRequest) -> Reply {
        self.sent.lock().unwrap().push(request.clone());
        (self.route)(request)
    }
}
