//! Request construction: manifest templates, slice options, pagination and
//! authentication folded into one [`HttpRequest`].

mod auth;

pub use auth::{
    ApiKeyAuthenticator, Authenticator, BasicHttpAuthenticator, BearerAuthenticator, NoAuth,
};

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tributary::error::{Result, SourceError};

use crate::error_handler::ErrorHandler;
use crate::interpolation::{value_to_param, Context, Template};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum HttpMethod {
    #[default]
    #[serde(rename = "GET", alias = "get")]
    Get,
    #[serde(rename = "POST", alias = "post")]
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
        }
    }
}

/// Where a request option value is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectInto {
    RequestParameter,
    Header,
    BodyData,
    BodyJson,
}

/// A named slot in the outgoing request (`start_time_option`,
/// `page_size_option`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RequestOption {
    pub field_name: String,
    pub inject_into: InjectInto,
}

/// Key/value contributions to a request from one component.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub params: Map<String, Value>,
    pub headers: Map<String, Value>,
    pub body_json: Map<String, Value>,
    pub body_data: Map<String, Value>,
}

impl RequestOptions {
    pub fn inject(&mut self, option: &RequestOption, value: Value) {
        let target = match option.inject_into {
            InjectInto::RequestParameter => &mut self.params,
            InjectInto::Header => &mut self.headers,
            InjectInto::BodyData => &mut self.body_data,
            InjectInto::BodyJson => &mut self.body_json,
        };
        target.insert(option.field_name.clone(), value);
    }

    /// Overlay `other` on top of `self`; later writers win.
    pub fn merge(&mut self, other: &RequestOptions) {
        for (target, source) in [
            (&mut self.params, &other.params),
            (&mut self.headers, &other.headers),
            (&mut self.body_json, &other.body_json),
            (&mut self.body_data, &other.body_data),
        ] {
            for (k, v) in source {
                target.insert(k.clone(), v.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
            && self.headers.is_empty()
            && self.body_json.is_empty()
            && self.body_data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    Form(BTreeMap<String, String>),
}

/// A fully resolved request, ready for an [`HttpSender`](crate::http::HttpSender).
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<RequestBody>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// URL with the query string appended, keys in sorted order.
    pub fn full_url(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        let encoded = serde_urlencoded::to_string(&self.query).unwrap_or_default();
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.url, separator, encoded)
    }
}

/// Pagination contribution for one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageRequest {
    pub options: RequestOptions,
    /// Replaces the templated path (or the whole URL when absolute)
    pub path: Option<String>,
}

/// The request half of a stream's retriever.
pub struct Requester {
    url_base: Template,
    path: Template,
    method: HttpMethod,
    params: Option<Template>,
    headers: Option<Template>,
    body_json: Option<Template>,
    body_data: Option<Template>,
    authenticator: Arc<dyn Authenticator>,
    error_handler: ErrorHandler,
    reqs_per_hour: Option<f64>,
}

impl fmt::Debug for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requester")
            .field("method", &self.method)
            .field("authenticator", &self.authenticator)
            .field("reqs_per_hour", &self.reqs_per_hour)
            .finish_non_exhaustive()
    }
}

/// Templated parts of a requester, compiled by the manifest factory.
pub struct RequesterParts {
    pub url_base: Template,
    pub path: Template,
    pub method: HttpMethod,
    pub params: Option<Template>,
    pub headers: Option<Template>,
    pub body_json: Option<Template>,
    pub body_data: Option<Template>,
    pub authenticator: Arc<dyn Authenticator>,
    pub error_handler: ErrorHandler,
    pub reqs_per_hour: Option<f64>,
}

impl Requester {
    pub fn new(parts: RequesterParts) -> Self {
        Self {
            url_base: parts.url_base,
            path: parts.path,
            method: parts.method,
            params: parts.params,
            headers: parts.headers,
            body_json: parts.body_json,
            body_data: parts.body_data,
            authenticator: parts.authenticator,
            error_handler: parts.error_handler,
            reqs_per_hour: parts.reqs_per_hour,
        }
    }

    pub fn error_handler(&self) -> &ErrorHandler {
        &self.error_handler
    }

    pub fn reqs_per_hour(&self) -> Option<f64> {
        self.reqs_per_hour
    }

    /// Build the request for one page of one slice.
    ///
    /// Manifest maps are applied first, then `slice_options` (router and
    /// cursor), then the page options, then the authenticator.
    pub fn build(
        &self,
        ctx: &Context,
        slice_options: &RequestOptions,
        page: &PageRequest,
    ) -> Result<HttpRequest> {
        let mut options = RequestOptions {
            params: eval_map(self.params.as_ref(), ctx, "request_parameters")?,
            headers: eval_map(self.headers.as_ref(), ctx, "request_headers")?,
            body_json: eval_map(self.body_json.as_ref(), ctx, "request_body_json")?,
            body_data: eval_map(self.body_data.as_ref(), ctx, "request_body_data")?,
        };
        options.merge(slice_options);
        options.merge(&page.options);

        let url = match &page.path {
            Some(path) => join_url(&self.url_base.eval_string(ctx)?.unwrap_or_default(), path),
            None => join_url(
                &self.url_base.eval_string(ctx)?.unwrap_or_default(),
                &self.path.eval_string(ctx)?.unwrap_or_default(),
            ),
        };

        let mut request = HttpRequest::new(self.method, url);
        request.query = to_strings(&options.params);
        request.headers = to_strings(&options.headers);

        let body_json = strip_nulls(options.body_json);
        request.body = match (body_json.is_empty(), options.body_data.is_empty()) {
            (true, true) => None,
            (false, true) => Some(RequestBody::Json(Value::Object(body_json))),
            (true, false) => Some(RequestBody::Form(to_strings(&options.body_data))),
            (false, false) => {
                return Err(SourceError::Manifest(
                    "request_body_json and request_body_data cannot both be set".into(),
                ))
            }
        };

        self.authenticator.apply(&mut request, ctx)?;
        Ok(request)
    }
}

fn eval_map(template: Option<&Template>, ctx: &Context, what: &str) -> Result<Map<String, Value>> {
    let template = match template {
        Some(t) => t,
        None => return Ok(Map::new()),
    };
    match template.eval(ctx)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        // A single template may render a whole mapping as JSON text
        Value::String(s) if s.trim().is_empty() => Ok(Map::new()),
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err(SourceError::Manifest(format!("{} must be a mapping, got '{}'", what, s))),
        },
        other => Err(SourceError::Manifest(format!("{} must be a mapping, got {}", what, other))),
    }
}

fn to_strings(map: &Map<String, Value>) -> BTreeMap<String, String> {
    map.iter()
        .filter_map(|(k, v)| value_to_param(v).map(|v| (k.clone(), v)))
        .collect()
}

fn strip_nulls(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .filter(|(_, v)| !v.is_null() && v.as_str() != Some(""))
        .collect()
}

/// Join a base URL and a path. An absolute path replaces the base.
pub fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    if path.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
