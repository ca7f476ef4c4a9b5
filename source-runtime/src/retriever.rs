//! One page at a time: build, send, extract, advance.

use serde_json::{Map, Value};
use tributary::error::Result;

use crate::extractor::RecordSelector;
use crate::http::{Exchange, HttpClient};
use crate::interpolation::Context;
use crate::paginator::{PageState, Paginator};
use crate::requester::{RequestOptions, Requester};

/// What one fetched page produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Page {
    Records {
        records: Vec<Map<String, Value>>,
        has_more: bool,
    },
    /// The response was ignored; the slice ends with no further pages.
    Ignored { timezone_mismatch: bool },
}

#[derive(Debug)]
pub struct SimpleRetriever {
    pub requester: Requester,
    pub paginator: Paginator,
    pub selector: RecordSelector,
}

impl SimpleRetriever {
    pub fn new(requester: Requester, paginator: Paginator, selector: RecordSelector) -> Self {
        Self {
            requester,
            paginator,
            selector,
        }
    }

    pub fn first_page(&self, ctx: &Context) -> Result<PageState> {
        self.paginator.start(ctx)
    }

    /// Fetch the page described by `page` and move `page` to the next one.
    ///
    /// `ctx` is the slice-scoped context; the page roots (`next_page_token`,
    /// `response`, `headers`, `last_record`, `last_page_size`) are added here.
    pub async fn fetch(
        &self,
        http: &HttpClient,
        stream: &str,
        ctx: &Context,
        slice_options: &RequestOptions,
        page: &mut PageState,
        max_pages_per_slice: u64,
    ) -> Result<Page> {
        let mut ctx = ctx.clone();
        ctx.set("next_page_token", next_page_token(page));

        let request = self
            .requester
            .build(&ctx, slice_options, &self.paginator.page_request(page))?;
        let exchange = http
            .execute(
                stream,
                &request,
                self.requester.error_handler(),
                self.requester.reqs_per_hour(),
                &ctx,
            )
            .await?;

        let (response, body) = match exchange {
            Exchange::Ignored { timezone_mismatch } => return Ok(Page::Ignored { timezone_mismatch }),
            Exchange::Success { response, body } => (response, body),
        };

        ctx.set("response", body.clone());
        ctx.set("headers", response.headers_value());
        let records = self.selector.select(&body, &ctx)?;

        ctx.set("last_page_size", Value::from(records.len()));
        ctx.set(
            "last_record",
            records.last().cloned().map(Value::Object).unwrap_or(Value::Null),
        );
        let has_more = self
            .paginator
            .advance(page, &records, &ctx, max_pages_per_slice)?;
        Ok(Page::Records { records, has_more })
    }
}

fn next_page_token(page: &PageState) -> Value {
    match &page.token {
        Some(token) => {
            let mut map = Map::new();
            map.insert("next_page_token".into(), token.clone());
            Value::Object(map)
        }
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_handler::ErrorHandler;
    use crate::http::HttpResponse;
    use crate::interpolation::Template;
    use crate::paginator::{PageTokenOption, PaginationStrategy};
    use crate::requester::{HttpMethod, InjectInto, NoAuth, RequestOption, RequesterParts};
    use crate::testing::ScriptedSender;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;
    use tributary::config::HttpConfig;

    fn retriever(paginator: Paginator) -> SimpleRetriever {
        let requester = Requester::new(RequesterParts {
            url_base: Template::literal("https://api.example.com"),
            path: Template::literal("/users"),
            method: HttpMethod::Get,
            params: None,
            headers: None,
            body_json: None,
            body_data: None,
            authenticator: Arc::new(NoAuth),
            error_handler: ErrorHandler::default(),
            reqs_per_hour: None,
        });
        SimpleRetriever::new(
            requester,
            paginator,
            RecordSelector::new(vec![Template::literal("data")]),
        )
    }

    fn client(sender: Arc<ScriptedSender>) -> HttpClient {
        HttpClient::new(
            sender,
            HttpConfig {
                max_retries: 0,
                backoff_factor_secs: 0.0,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_cursor_pagination_walks_pages() {
        let paginator = Paginator::new(
            PaginationStrategy::Cursor {
                cursor_value: Template::parse("{{ response.next }}").unwrap(),
                stop_condition: None,
                page_size: None,
            },
            Some(PageTokenOption::Request(RequestOption {
                field_name: "after".into(),
                inject_into: InjectInto::RequestParameter,
            })),
            None,
            None,
        );
        let sender = Arc::new(ScriptedSender::new(vec![
            Ok(HttpResponse::new(200, r#"{"data": [{"id": 1}], "next": "c2"}"#)),
            Ok(HttpResponse::new(200, r#"{"data": [{"id": 2}], "next": null}"#)),
        ]));
        let http = client(sender.clone());
        let retriever = retriever(paginator);
        let ctx = Context::new(Utc::now()).with("config", json!({}));

        let mut page = retriever.first_page(&ctx).unwrap();
        let mut ids = Vec::new();
        loop {
            match retriever
                .fetch(&http, "users", &ctx, &RequestOptions::default(), &mut page, 100)
                .await
                .unwrap()
            {
                Page::Records { records, has_more } => {
                    ids.extend(records.iter().map(|r| r["id"].clone()));
                    if !has_more {
                        break;
                    }
                }
                Page::Ignored { .. } => panic!("unexpected ignore"),
            }
        }

        assert_eq!(ids, vec![json!(1), json!(2)]);
        let sent = sender.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].query.get("after").is_none());
        assert_eq!(sent[1].query.get("after").map(String::as_str), Some("c2"));
    }

    #[tokio::test]
    async fn test_ignored_response() {
        let sender = Arc::new(ScriptedSender::new(vec![Ok(HttpResponse::new(
            400,
            r#"{"error": "to_date cannot be later than today"}"#,
        ))]));
        let http = client(sender);
        let retriever = retriever(Paginator::none());
        let ctx = Context::new(Utc::now()).with("config", json!({}));
        let mut page = retriever.first_page(&ctx).unwrap();
        let outcome = retriever
            .fetch(&http, "users", &ctx, &RequestOptions::default(), &mut page, 100)
            .await
            .unwrap();
        assert_eq!(outcome, Page::Ignored { timezone_mismatch: true });
    }
}
