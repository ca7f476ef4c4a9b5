//! Response classification and backoff.
//!
//! Manifest response filters are consulted first, in declared order; the
//! first match decides. Anything they do not match falls through to the
//! built-in table:
//!
//! ```text
//!   2xx                                     → Success
//!   429, 500-504                            → Retry (Retry-After, else backoff)
//!   401 "Unable to authenticate"            → Fail (config_error)
//!   402                                     → Fail (transient_error)
//!   400 "to_date cannot be later than today"→ Ignore + timezone mismatch
//!   anything else                           → Fail (system_error)
//! ```

use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tributary::config::HttpConfig;
use tributary::FailureType;

use crate::http::HttpResponse;
use crate::interpolation::{Context, Template};

const TIMEZONE_MISMATCH: &str = "to_date cannot be later than today";
const UNABLE_TO_AUTHENTICATE: &str = "Unable to authenticate";

/// What to do with a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseAction {
    Success,
    Retry { after: Option<Duration> },
    Ignore { timezone_mismatch: bool },
    Fail { failure_type: FailureType, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterAction {
    Success,
    Fail,
    Ignore,
    Retry,
    RateLimited,
}

/// One manifest `response_filters` entry.
#[derive(Debug, Clone)]
pub struct ResponseFilter {
    pub http_codes: Vec<u16>,
    pub error_message_contains: Option<String>,
    pub predicate: Option<Template>,
    pub action: FilterAction,
    pub failure_type: Option<FailureType>,
    pub error_message: Option<Template>,
}

impl ResponseFilter {
    fn matches(&self, response: &HttpResponse, ctx: &Context) -> bool {
        if self.http_codes.is_empty()
            && self.error_message_contains.is_none()
            && self.predicate.is_none()
        {
            return false;
        }
        if !self.http_codes.is_empty() && !self.http_codes.contains(&response.status) {
            return false;
        }
        if let Some(needle) = &self.error_message_contains {
            if !response.body.contains(needle.as_str()) {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            return predicate.eval_bool(ctx).unwrap_or(false);
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    Constant { seconds: f64 },
    Exponential { factor: f64 },
    WaitTimeFromHeader { header: String },
}

impl BackoffStrategy {
    fn wait(&self, response: Option<&HttpResponse>, attempt: u32) -> Option<f64> {
        match self {
            BackoffStrategy::Constant { seconds } => Some(*seconds),
            BackoffStrategy::Exponential { factor } => Some(factor * 2f64.powi(attempt as i32)),
            BackoffStrategy::WaitTimeFromHeader { header } => response
                .and_then(|r| r.header(header))
                .and_then(|v| v.trim().parse::<f64>().ok()),
        }
    }
}

/// Per-requester classification and retry policy.
#[derive(Debug, Clone, Default)]
pub struct ErrorHandler {
    pub filters: Vec<ResponseFilter>,
    pub backoff_strategies: Vec<BackoffStrategy>,
    pub max_retries: Option<u32>,
}

impl ErrorHandler {
    /// Classify a response. `ctx` is the request context; `response` and
    /// `headers` are added for filter predicates and messages.
    pub fn classify(&self, response: &HttpResponse, ctx: &Context) -> ResponseAction {
        if !self.filters.is_empty() {
            let mut ctx = ctx.clone();
            ctx.set("response", response.json().unwrap_or(Value::Null));
            ctx.set("headers", response.headers_value());
            for filter in &self.filters {
                if filter.matches(response, &ctx) {
                    return self.filter_action(filter, response, &ctx);
                }
            }
        }
        default_action(response)
    }

    fn filter_action(
        &self,
        filter: &ResponseFilter,
        response: &HttpResponse,
        ctx: &Context,
    ) -> ResponseAction {
        match filter.action {
            FilterAction::Success => ResponseAction::Success,
            FilterAction::Ignore => ResponseAction::Ignore {
                timezone_mismatch: false,
            },
            FilterAction::Retry | FilterAction::RateLimited => ResponseAction::Retry {
                after: retry_after(response),
            },
            FilterAction::Fail => {
                let message = filter
                    .error_message
                    .as_ref()
                    .and_then(|t| t.eval_string(ctx).ok().flatten())
                    .unwrap_or_else(|| default_message(response));
                ResponseAction::Fail {
                    failure_type: filter.failure_type.unwrap_or(FailureType::SystemError),
                    message,
                }
            }
        }
    }

    pub fn max_retries(&self, http: &HttpConfig) -> u32 {
        self.max_retries.unwrap_or(http.max_retries)
    }

    /// Wait before retry number `attempt` (0-based) when the server gave no
    /// Retry-After hint.
    pub fn backoff(&self, response: Option<&HttpResponse>, attempt: u32, http: &HttpConfig) -> Duration {
        let seconds = self
            .backoff_strategies
            .iter()
            .find_map(|s| s.wait(response, attempt))
            .unwrap_or_else(|| {
                let base = http.backoff_factor_secs * 2f64.powi(attempt as i32);
                base + rand::thread_rng().gen_range(0.0..=0.25) * base
            });
        let wait = if seconds.is_nan() { 0.0 } else { seconds.max(0.0) };
        Duration::try_from_secs_f64(wait)
            .unwrap_or(Duration::MAX)
            .min(http.max_backoff())
    }
}

fn default_action(response: &HttpResponse) -> ResponseAction {
    match response.status {
        200..=299 => ResponseAction::Success,
        429 | 500..=504 => ResponseAction::Retry {
            after: retry_after(response),
        },
        401 if response.body.contains(UNABLE_TO_AUTHENTICATE) => ResponseAction::Fail {
            failure_type: FailureType::ConfigError,
            message: "Unable to authenticate, check your credentials".into(),
        },
        402 => ResponseAction::Fail {
            failure_type: FailureType::TransientError,
            message: "Payment required: the account's plan does not allow this request".into(),
        },
        400 if response.body.contains(TIMEZONE_MISMATCH) => ResponseAction::Ignore {
            timezone_mismatch: true,
        },
        _ => ResponseAction::Fail {
            failure_type: FailureType::SystemError,
            message: default_message(response),
        },
    }
}

fn default_message(response: &HttpResponse) -> String {
    let body: String = response.body.chars().take(200).collect();
    format!("Request failed with status {}: {}", response.status, body)
}

/// Seconds from a `Retry-After` header. Values too large for a
/// `Duration` are ignored; callers cap the wait.
pub fn retry_after(response: &HttpResponse) -> Option<Duration> {
    let value = response.header("retry-after")?.trim();
    let seconds = value.parse::<f64>().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: BTreeMap::new(),
            body: body.to_string(),
        }
    }

    fn ctx() -> Context {
        Context::new(Utc::now()).with("config", json!({}))
    }

    #[test]
    fn test_default_table() {
        let handler = ErrorHandler::default();
        assert_eq!(handler.classify(&response(200, "[]"), &ctx()), ResponseAction::Success);
        assert_eq!(
            handler.classify(&response(503, ""), &ctx()),
            ResponseAction::Retry { after: None }
        );
        assert!(matches!(
            handler.classify(&response(401, "Unable to authenticate you"), &ctx()),
            ResponseAction::Fail { failure_type: FailureType::ConfigError, .. }
        ));
        assert!(matches!(
            handler.classify(&response(402, ""), &ctx()),
            ResponseAction::Fail { failure_type: FailureType::TransientError, .. }
        ));
        assert_eq!(
            handler.classify(
                &response(400, r#"{"error": "to_date cannot be later than today"}"#),
                &ctx()
            ),
            ResponseAction::Ignore { timezone_mismatch: true }
        );
        assert!(matches!(
            handler.classify(&response(404, "nope"), &ctx()),
            ResponseAction::Fail { failure_type: FailureType::SystemError, .. }
        ));
    }

    #[test]
    fn test_retry_after_header() {
        let mut resp = response(429, "");
        resp.headers.insert("retry-after".into(), "3".into());
        assert_eq!(
            ErrorHandler::default().classify(&resp, &ctx()),
            ResponseAction::Retry { after: Some(Duration::from_secs(3)) }
        );
    }

    #[test]
    fn test_unrepresentable_retry_after_is_ignored() {
        for value in ["1e300", "-4", "inf", "NaN"] {
            let mut resp = response(429, "");
            resp.headers.insert("retry-after".into(), value.into());
            assert_eq!(retry_after(&resp), None, "{}", value);
        }
    }

    #[test]
    fn test_backoff_is_capped_by_max_backoff() {
        let http = HttpConfig {
            backoff_factor_secs: 1e300,
            max_backoff_secs: 30.0,
            ..Default::default()
        };
        let wait = ErrorHandler::default().backoff(None, 10, &http);
        assert_eq!(wait, Duration::from_secs(30));
    }

    #[test]
    fn test_filters_take_precedence() {
        let handler = ErrorHandler {
            filters: vec![
                ResponseFilter {
                    http_codes: vec![403],
                    error_message_contains: None,
                    predicate: None,
                    action: FilterAction::Fail,
                    failure_type: Some(FailureType::ConfigError),
                    error_message: Some(
                        Template::parse("Forbidden: {{ response.detail }}").unwrap(),
                    ),
                },
                ResponseFilter {
                    http_codes: vec![],
                    error_message_contains: None,
                    predicate: Some(Template::parse("{{ response.status == 'busy' }}").unwrap()),
                    action: FilterAction::RateLimited,
                    failure_type: None,
                    error_message: None,
                },
                ResponseFilter {
                    http_codes: vec![500],
                    error_message_contains: Some("archived".into()),
                    predicate: None,
                    action: FilterAction::Ignore,
                    failure_type: None,
                    error_message: None,
                },
            ],
            ..Default::default()
        };

        assert_eq!(
            handler.classify(&response(403, r#"{"detail": "scope"}"#), &ctx()),
            ResponseAction::Fail {
                failure_type: FailureType::ConfigError,
                message: "Forbidden: scope".into()
            }
        );
        assert_eq!(
            handler.classify(&response(200, r#"{"status": "busy"}"#), &ctx()),
            ResponseAction::Retry { after: None }
        );
        assert_eq!(
            handler.classify(&response(500, "project archived"), &ctx()),
            ResponseAction::Ignore { timezone_mismatch: false }
        );
        // Unmatched falls through to the default table
        assert_eq!(
            handler.classify(&response(500, "boom"), &ctx()),
            ResponseAction::Retry { after: None }
        );
    }

    #[test]
    fn test_backoff_strategies() {
        let http = HttpConfig {
            max_backoff_secs: 30.0,
            ..Default::default()
        };
        let handler = ErrorHandler {
            backoff_strategies: vec![BackoffStrategy::Constant { seconds: 2.0 }],
            ..Default::default()
        };
        assert_eq!(handler.backoff(None, 3, &http), Duration::from_secs(2));

        let handler = ErrorHandler {
            backoff_strategies: vec![BackoffStrategy::Exponential { factor: 10.0 }],
            ..Default::default()
        };
        assert_eq!(handler.backoff(None, 1, &http), Duration::from_secs(20));
        // Capped
        assert_eq!(handler.backoff(None, 4, &http), Duration::from_secs(30));

        let handler = ErrorHandler {
            backoff_strategies: vec![
                BackoffStrategy::WaitTimeFromHeader { header: "X-Wait".into() },
                BackoffStrategy::Constant { seconds: 1.0 },
            ],
            ..Default::default()
        };
        let mut resp = response(429, "");
        resp.headers.insert("x-wait".into(), "7".into());
        assert_eq!(handler.backoff(Some(&resp), 0, &http), Duration::from_secs(7));
        assert_eq!(handler.backoff(None, 0, &http), Duration::from_secs(1));
    }

    #[test]
    fn test_default_backoff_has_bounded_jitter() {
        let http = HttpConfig {
            backoff_factor_secs: 4.0,
            max_backoff_secs: 300.0,
            ..Default::default()
        };
        let wait = ErrorHandler::default().backoff(None, 1, &http);
        assert!(wait >= Duration::from_secs(8));
        assert!(wait <= Duration::from_secs(10));
    }
}
