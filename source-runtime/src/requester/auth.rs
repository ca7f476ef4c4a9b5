use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use std::fmt;
use tributary::error::Result;

use super::{HttpRequest, InjectInto, RequestBody, RequestOption};
use crate::interpolation::{Context, Template};

/// Static request authentication. Receives the finished request and
/// mutates it in place.
pub trait Authenticator: Send + Sync + fmt::Debug {
    fn apply(&self, request: &mut HttpRequest, ctx: &Context) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn apply(&self, _request: &mut HttpRequest, _ctx: &Context) -> Result<()> {
        Ok(())
    }
}

/// `Authorization: Bearer <token>`
pub struct BearerAuthenticator {
    token: Template,
}

impl BearerAuthenticator {
    pub fn new(token: Template) -> Self {
        Self { token }
    }
}

impl fmt::Debug for BearerAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerAuthenticator")
    }
}

impl Authenticator for BearerAuthenticator {
    fn apply(&self, request: &mut HttpRequest, ctx: &Context) -> Result<()> {
        let token = self.token.eval_string(ctx)?.unwrap_or_default();
        request
            .headers
            .insert("Authorization".into(), format!("Bearer {}", token));
        Ok(())
    }
}

/// API key placed in a header (default) or any other request option.
pub struct ApiKeyAuthenticator {
    token: Template,
    option: RequestOption,
}

impl ApiKeyAuthenticator {
    pub fn new(token: Template, option: RequestOption) -> Self {
        Self { token, option }
    }
}

impl fmt::Debug for ApiKeyAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyAuthenticator")
            .field("field_name", &self.option.field_name)
            .finish()
    }
}

impl Authenticator for ApiKeyAuthenticator {
    fn apply(&self, request: &mut HttpRequest, ctx: &Context) -> Result<()> {
        let token = self.token.eval_string(ctx)?.unwrap_or_default();
        let name = self.option.field_name.clone();
        match self.option.inject_into {
            InjectInto::Header => {
                request.headers.insert(name, token);
            }
            InjectInto::RequestParameter => {
                request.query.insert(name, token);
            }
            InjectInto::BodyData => match &mut request.body {
                Some(RequestBody::Form(form)) => {
                    form.insert(name, token);
                }
                _ => request.body = Some(RequestBody::Form([(name, token)].into())),
            },
            InjectInto::BodyJson => match &mut request.body {
                Some(RequestBody::Json(Value::Object(body))) => {
                    body.insert(name, Value::String(token));
                }
                _ => {
                    let mut body = serde_json::Map::new();
                    body.insert(name, Value::String(token));
                    request.body = Some(RequestBody::Json(Value::Object(body)));
                }
            },
        }
        Ok(())
    }
}

/// `Authorization: Basic base64(username:password)`
pub struct BasicHttpAuthenticator {
    username: Template,
    password: Template,
}

impl BasicHttpAuthenticator {
    pub fn new(username: Template, password: Template) -> Self {
        Self { username, password }
    }
}

impl fmt::Debug for BasicHttpAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BasicHttpAuthenticator")
    }
}

impl Authenticator for BasicHttpAuthenticator {
    fn apply(&self, request: &mut HttpRequest, ctx: &Context) -> Result<()> {
        let username = self.username.eval_string(ctx)?.unwrap_or_default();
        let password = self.password.eval_string(ctx)?.unwrap_or_default();
        let encoded = STANDARD.encode(format!("{}:{}", username, password));
        request
            .headers
            .insert("Authorization".into(), format!("Basic {}", encoded));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requester::HttpMethod;
    use chrono::Utc;
    use serde_json::json;

    fn ctx() -> Context {
        Context::new(Utc::now()).with(
            "config",
            json!({"api_key": "k-123", "username": "joker", "password": "arsene"}),
        )
    }

    fn request() -> HttpRequest {
        HttpRequest::new(HttpMethod::Get, "https://api.example.com/items")
    }

    #[test]
    fn test_api_key_in_query() {
        let auth = ApiKeyAuthenticator::new(
            Template::parse("{{ config.api_key }}").unwrap(),
            RequestOption {
                field_name: "api_key".into(),
                inject_into: InjectInto::RequestParameter,
            },
        );
        let mut req = request();
        auth.apply(&mut req, &ctx()).unwrap();
        assert_eq!(req.query.get("api_key").map(String::as_str), Some("k-123"));
        assert!(req.headers.is_empty());
    }

    #[test]
    fn test_api_key_in_header() {
        let auth = ApiKeyAuthenticator::new(
            Template::parse("Token {{ config.api_key }}").unwrap(),
            RequestOption {
                field_name: "X-Api-Key".into(),
                inject_into: InjectInto::Header,
            },
        );
        let mut req = request();
        auth.apply(&mut req, &ctx()).unwrap();
        assert_eq!(
            req.headers.get("X-Api-Key").map(String::as_str),
            Some("Token k-123")
        );
    }

    #[test]
    fn test_basic_auth() {
        let auth = BasicHttpAuthenticator::new(
            Template::parse("{{ config.username }}").unwrap(),
            Template::parse("{{ config.password }}").unwrap(),
        );
        let mut req = request();
        auth.apply(&mut req, &ctx()).unwrap();
        // base64("joker:arsene")
        assert_eq!(
            req.headers.get("Authorization").map(String::as_str),
            Some("Basic am9rZXI6YXJzZW5l")
        );
    }
}
