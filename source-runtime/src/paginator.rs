//! Next-page token computation and injection.

use serde_json::{Map, Value};
use tracing::warn;
use tributary::error::{Result, SourceError};

use crate::interpolation::{Context, Template};
use crate::requester::{PageRequest, RequestOption};

#[derive(Debug, Clone)]
pub enum PaginationStrategy {
    /// `offset += page_size` while pages come back full
    Offset {
        page_size: Option<Template>,
        max_records: Option<Template>,
        inject_on_first_request: bool,
    },
    /// `page += 1` until an empty or short page, or the declared total
    PageIncrement {
        page_size: Option<Template>,
        start_from_page: i64,
        inject_on_first_request: bool,
        total_pages: Option<Template>,
    },
    /// Token read from the response
    Cursor {
        cursor_value: Template,
        stop_condition: Option<Template>,
        page_size: Option<Template>,
    },
}

#[derive(Debug, Clone)]
pub enum PageTokenOption {
    Request(RequestOption),
    /// The token replaces the request path (or the whole URL)
    Path,
}

/// Progress through the pages of one slice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageState {
    pub token: Option<Value>,
    pub page_size: Option<i64>,
    pub pages_fetched: u64,
    pub records_seen: u64,
    max_records: Option<u64>,
}

/// A paginator with no strategy fetches exactly one page.
#[derive(Debug, Clone, Default)]
pub struct Paginator {
    strategy: Option<PaginationStrategy>,
    page_token_option: Option<PageTokenOption>,
    page_size_option: Option<RequestOption>,
    max_pages: Option<u64>,
}

impl Paginator {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(
        strategy: PaginationStrategy,
        page_token_option: Option<PageTokenOption>,
        page_size_option: Option<RequestOption>,
        max_pages: Option<u64>,
    ) -> Self {
        Self {
            strategy: Some(strategy),
            page_token_option,
            page_size_option,
            max_pages,
        }
    }

    /// State before the first request of a slice.
    pub fn start(&self, ctx: &Context) -> Result<PageState> {
        let mut state = PageState::default();
        let strategy = match &self.strategy {
            Some(s) => s,
            None => return Ok(state),
        };
        match strategy {
            PaginationStrategy::Offset {
                page_size,
                max_records,
                inject_on_first_request,
            } => {
                state.page_size = eval_int(page_size.as_ref(), ctx, "page_size")?;
                state.max_records = eval_int(max_records.as_ref(), ctx, "max_records")?
                    .map(|n| n.max(0) as u64);
                if *inject_on_first_request {
                    state.token = Some(Value::from(0));
                }
            }
            PaginationStrategy::PageIncrement {
                page_size,
                start_from_page,
                inject_on_first_request,
                ..
            } => {
                state.page_size = eval_int(page_size.as_ref(), ctx, "page_size")?;
                if *inject_on_first_request {
                    state.token = Some(Value::from(*start_from_page));
                }
            }
            PaginationStrategy::Cursor { page_size, .. } => {
                state.page_size = eval_int(page_size.as_ref(), ctx, "page_size")?;
            }
        }
        Ok(state)
    }

    /// Request options for the page described by `state`.
    pub fn page_request(&self, state: &PageState) -> PageRequest {
        let mut page = PageRequest::default();
        if let (Some(option), Some(size)) = (&self.page_size_option, state.page_size) {
            page.options.inject(option, Value::from(size));
        }
        if let Some(token) = &state.token {
            match &self.page_token_option {
                Some(PageTokenOption::Request(option)) => page.options.inject(option, token.clone()),
                Some(PageTokenOption::Path) => {
                    page.path = token.as_str().map(str::to_string).or_else(|| Some(token.to_string()))
                }
                None => {}
            }
        }
        page
    }

    /// Fold a fetched page into `state`. Returns false when pagination is
    /// over. `ctx` carries `response`, `headers`, `last_record` and
    /// `last_page_size`.
    pub fn advance(
        &self,
        state: &mut PageState,
        records: &[Map<String, Value>],
        ctx: &Context,
        max_pages_per_slice: u64,
    ) -> Result<bool> {
        state.pages_fetched += 1;
        state.records_seen += records.len() as u64;

        let strategy = match &self.strategy {
            Some(s) => s,
            None => return Ok(false),
        };

        let next = match strategy {
            PaginationStrategy::Offset { .. } => {
                let reached_max = state.max_records.map_or(false, |m| state.records_seen >= m);
                let full_page = match state.page_size {
                    Some(size) => records.len() as i64 == size && size > 0,
                    None => !records.is_empty(),
                };
                if reached_max || !full_page {
                    None
                } else {
                    let offset = state.token.as_ref().and_then(Value::as_i64).unwrap_or(0);
                    let step = state.page_size.unwrap_or(records.len() as i64);
                    Some(Value::from(offset + step))
                }
            }
            PaginationStrategy::PageIncrement {
                start_from_page,
                total_pages,
                ..
            } => {
                let total = match total_pages {
                    Some(t) => eval_int_value(&t.eval(ctx)?),
                    None => None,
                };
                let short_page = state
                    .page_size
                    .map_or(false, |size| (records.len() as i64) < size);
                if records.is_empty()
                    || short_page
                    || total.map_or(false, |t| state.pages_fetched as i64 >= t)
                {
                    None
                } else {
                    let page = state
                        .token
                        .as_ref()
                        .and_then(Value::as_i64)
                        .unwrap_or(*start_from_page);
                    Some(Value::from(page + 1))
                }
            }
            PaginationStrategy::Cursor {
                cursor_value,
                stop_condition,
                ..
            } => {
                let stop = match stop_condition {
                    Some(t) => t.eval_bool(ctx)?,
                    None => false,
                };
                if stop {
                    None
                } else {
                    match cursor_value.eval(ctx)? {
                        Value::Null => None,
                        Value::String(s) if s.is_empty() => None,
                        value => Some(value),
                    }
                }
            }
        };

        let next = match next {
            Some(token) if self.max_pages.map_or(false, |m| state.pages_fetched >= m) => {
                warn!(pages = state.pages_fetched, token = %token, "Stopping at max_pages");
                None
            }
            Some(token) if state.pages_fetched >= max_pages_per_slice => {
                warn!(
                    pages = state.pages_fetched,
                    token = %token,
                    "Stopping at max_pages_per_slice"
                );
                None
            }
            other => other,
        };

        let more = next.is_some();
        state.token = next;
        Ok(more)
    }
}

fn eval_int(template: Option<&Template>, ctx: &Context, what: &str) -> Result<Option<i64>> {
    match template {
        None => Ok(None),
        Some(t) => {
            let value = t.eval(ctx)?;
            match eval_int_value(&value) {
                Some(n) => Ok(Some(n)),
                None if value.is_null() => Ok(None),
                None => Err(SourceError::Manifest(format!(
                    "{} must be an integer, got {}",
                    what, value
                ))),
            }
        }
    }
}

fn eval_int_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
