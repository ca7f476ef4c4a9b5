use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use tributary::config::HttpConfig;
use tributary::error::{Result, SourceError};
use tributary::rate_limit::{interval_for, RequestPacer};
use tributary::FailureType;

use crate::error_handler::{ErrorHandler, ResponseAction};
use crate::interpolation::Context;
use crate::requester::{HttpMethod, HttpRequest, RequestBody};

/// A response with its body read into memory. Header names are lowercase.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Body as JSON. An empty body is `null`.
    pub fn json(&self) -> Option<Value> {
        if self.body.trim().is_empty() {
            return Some(Value::Null);
        }
        serde_json::from_str(&self.body).ok()
    }

    /// Headers exposed to templates as `headers`.
    pub fn headers_value(&self) -> Value {
        Value::Object(
            self.headers
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }
}

/// Failure below the HTTP layer.
#[derive(Debug)]
pub enum TransportError {
    Timeout(String),
    Connect(String),
    Body(String),
    Other(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Other(_))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout(e) => write!(f, "Request timed out: {}", e),
            TransportError::Connect(e) => write!(f, "Connection failed: {}", e),
            TransportError::Body(e) => write!(f, "Failed to read response body: {}", e),
            TransportError::Other(e) => write!(f, "Request failed: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            TransportError::Connect(e.to_string())
        } else if e.is_body() || e.is_decode() {
            TransportError::Body(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

/// Transport seam. One send, no retries.
#[async_trait]
pub trait HttpSender: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError>;
}

/// [`HttpSender`] over a shared `reqwest::Client`.
pub struct ReqwestSender {
    client: Client,
}

impl ReqwestSender {
    pub fn new(config: &HttpConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpSender for ReqwestSender {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };
        let mut builder = self.client.request(method, request.url.as_str());
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            Some(RequestBody::Json(body)) => builder.json(body),
            Some(RequestBody::Form(form)) => builder.form(form),
            None => builder,
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Outcome of a request after classification and retries.
#[derive(Debug, Clone, PartialEq)]
pub enum Exchange {
    Success { response: HttpResponse, body: Value },
    Ignored { timezone_mismatch: bool },
}

/// Sends requests with pacing, classification and retry.
pub struct HttpClient {
    sender: Arc<dyn HttpSender>,
    pacer: RequestPacer,
    config: HttpConfig,
}

impl HttpClient {
    pub fn new(sender: Arc<dyn HttpSender>, config: HttpConfig) -> Self {
        Self {
            sender,
            pacer: RequestPacer::new(),
            config,
        }
    }

    pub fn from_config(config: &HttpConfig) -> anyhow::Result<Self> {
        Ok(Self::new(Arc::new(ReqwestSender::new(config)?), config.clone()))
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Send `request` until it succeeds, is ignored, fails, or the retry
    /// budget runs out. `reqs_per_hour` paces every attempt on the
    /// stream's own schedule.
    pub async fn execute(
        &self,
        stream: &str,
        request: &HttpRequest,
        handler: &ErrorHandler,
        reqs_per_hour: Option<f64>,
        ctx: &Context,
    ) -> Result<Exchange> {
        let budget = handler.max_retries(&self.config);
        let pacing = reqs_per_hour.and_then(interval_for);
        let mut attempt: u32 = 0;
        let mut parse_retried = false;

        loop {
            if let Some(interval) = pacing {
                self.pacer.wait(stream, interval).await;
            }
            debug!(
                stream = %stream,
                method = %request.method,
                url = %request.full_url(),
                attempt = attempt,
                "Sending request"
            );

            let (wait, reason) = match self.sender.send(request).await {
                Err(e) if e.is_retryable() => (handler.backoff(None, attempt, &self.config), e.to_string()),
                Err(e) => {
                    return Err(SourceError::request(FailureType::SystemError, e.to_string()));
                }
                Ok(response) => match handler.classify(&response, ctx) {
                    ResponseAction::Success => match response.json() {
                        Some(body) => return Ok(Exchange::Success { response, body }),
                        None if !parse_retried => {
                            parse_retried = true;
                            (
                                handler.backoff(Some(&response), attempt, &self.config),
                                format!("status {} with a body that is not JSON", response.status),
                            )
                        }
                        None => {
                            return Err(SourceError::request(
                                FailureType::SystemError,
                                format!("Response from {} is not valid JSON", request.url),
                            ));
                        }
                    },
                    ResponseAction::Retry { after } => (
                        after
                            .map(|after| after.min(self.config.max_backoff()))
                            .unwrap_or_else(|| handler.backoff(Some(&response), attempt, &self.config)),
                        format!("status {}", response.status),
                    ),
                    ResponseAction::Ignore { timezone_mismatch } => {
                        warn!(
                            stream = %stream,
                            status = response.status,
                            url = %request.url,
                            "Ignoring response"
                        );
                        return Ok(Exchange::Ignored { timezone_mismatch });
                    }
                    ResponseAction::Fail {
                        failure_type,
                        message,
                    } => return Err(SourceError::request(failure_type, message)),
                },
            };

            if attempt >= budget {
                return Err(SourceError::request(
                    FailureType::TransientError,
                    format!(
                        "Giving up on {} after {} retries: {}",
                        request.url, budget, reason
                    ),
                ));
            }
            attempt += 1;
            warn!(
                stream = %stream,
                attempt = attempt,
                wait_ms = wait.as_millis() as u64,
                reason = %reason,
                "Retrying request"
            );
            tokio::time::sleep(wait).await;
        }
    }
}
