//! Serde shapes of the (reference-resolved) manifest. Templates stay as
//! raw strings or values here; the factory compiles them.

use serde::Deserialize;
use serde_json::{Map, Value};
use tributary::FailureType;

use crate::error_handler::FilterAction;
use crate::requester::{HttpMethod, RequestOption};

#[derive(Debug, Deserialize)]
pub struct ManifestModel {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub streams: Vec<Value>,
    #[serde(default)]
    pub check: Option<CheckModel>,
    #[serde(default)]
    pub concurrency_level: Option<ConcurrencyLevelModel>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CheckModel {
    #[serde(default)]
    pub stream_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConcurrencyLevelModel {
    pub default_concurrency: Value,
    #[serde(default)]
    pub max_concurrency: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct StreamModel {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub primary_key: Option<Value>,
    #[serde(default)]
    pub path: Option<String>,
    pub retriever: RetrieverModel,
    #[serde(default)]
    pub incremental_sync: Option<DatetimeCursorModel>,
    #[serde(default)]
    pub schema_loader: Option<SchemaLoaderModel>,
}

#[derive(Debug, Deserialize)]
pub struct RetrieverModel {
    pub requester: RequesterModel,
    #[serde(default)]
    pub record_selector: RecordSelectorModel,
    #[serde(default)]
    pub paginator: Option<PaginatorModel>,
    /// A router object, a list of routers, or the substream shorthand
    #[serde(default)]
    pub partition_router: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct RequesterModel {
    #[serde(default)]
    pub url_base: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub http_method: HttpMethod,
    #[serde(default)]
    pub authenticator: Option<AuthenticatorModel>,
    #[serde(default)]
    pub request_parameters: Option<Value>,
    #[serde(default)]
    pub request_headers: Option<Value>,
    #[serde(default)]
    pub request_body_json: Option<Value>,
    #[serde(default)]
    pub request_body_data: Option<Value>,
    #[serde(default)]
    pub error_handler: Option<ErrorHandlerModel>,
    #[serde(default)]
    pub reqs_per_hour: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AuthenticatorModel {
    NoAuth,
    BearerAuthenticator {
        api_token: String,
    },
    ApiKeyAuthenticator {
        api_token: String,
        /// Older manifests name the header directly
        #[serde(default)]
        header: Option<String>,
        #[serde(default)]
        inject_into: Option<RequestOption>,
    },
    BasicHttpAuthenticator {
        username: String,
        #[serde(default)]
        password: String,
    },
}

#[derive(Debug, Default, Deserialize)]
pub struct ErrorHandlerModel {
    #[serde(default)]
    pub response_filters: Vec<ResponseFilterModel>,
    #[serde(default)]
    pub backoff_strategies: Vec<BackoffStrategyModel>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseFilterModel {
    #[serde(default)]
    pub http_codes: Vec<u16>,
    #[serde(default)]
    pub error_message_contains: Option<String>,
    #[serde(default)]
    pub predicate: Option<String>,
    pub action: FilterAction,
    #[serde(default)]
    pub failure_type: Option<FailureType>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum BackoffStrategyModel {
    ConstantBackoffStrategy { backoff_time_in_seconds: Value },
    ExponentialBackoffStrategy {
        #[serde(default)]
        factor: Option<Value>,
    },
    WaitTimeFromHeader { header: String },
}

#[derive(Debug, Default, Deserialize)]
pub struct RecordSelectorModel {
    #[serde(default)]
    pub extractor: ExtractorModel,
    #[serde(default)]
    pub record_filter: Option<RecordFilterModel>,
    #[serde(default)]
    pub flatten_nested: bool,
    #[serde(default)]
    pub normalize_datetimes: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExtractorModel {
    #[serde(default)]
    pub field_path: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecordFilterModel {
    pub condition: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum PaginatorModel {
    NoPagination,
    DefaultPaginator {
        pagination_strategy: PaginationStrategyModel,
        #[serde(default)]
        page_token_option: Option<PageTokenOptionModel>,
        #[serde(default)]
        page_size_option: Option<RequestOption>,
        #[serde(default)]
        max_pages: Option<u64>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum PaginationStrategyModel {
    CursorPagination {
        cursor_value: String,
        #[serde(default)]
        stop_condition: Option<String>,
        #[serde(default)]
        page_size: Option<Value>,
    },
    OffsetIncrement {
        #[serde(default)]
        page_size: Option<Value>,
        #[serde(default)]
        max_records: Option<Value>,
        #[serde(default)]
        inject_on_first_request: bool,
    },
    PageIncrement {
        #[serde(default)]
        page_size: Option<Value>,
        #[serde(default)]
        start_from_page: i64,
        #[serde(default)]
        inject_on_first_request: bool,
        #[serde(default)]
        total_pages: Option<Value>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum PageTokenOptionModel {
    RequestOption(RequestOption),
    RequestPath,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum DatetimeBoundModel {
    Text(String),
    MinMax {
        datetime: String,
        #[serde(default)]
        datetime_format: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
pub struct DatetimeCursorModel {
    pub cursor_field: String,
    pub start_datetime: DatetimeBoundModel,
    #[serde(default)]
    pub end_datetime: Option<DatetimeBoundModel>,
    #[serde(default = "default_datetime_format")]
    pub datetime_format: String,
    #[serde(default)]
    pub cursor_datetime_formats: Vec<String>,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub cursor_granularity: Option<String>,
    #[serde(default)]
    pub lookback_window: Option<String>,
    #[serde(default)]
    pub partition_field_start: Option<String>,
    #[serde(default)]
    pub partition_field_end: Option<String>,
    #[serde(default)]
    pub start_time_option: Option<RequestOption>,
    #[serde(default)]
    pub end_time_option: Option<RequestOption>,
}

fn default_datetime_format() -> String {
    "%Y-%m-%dT%H:%M:%SZ".to_string()
}

#[derive(Debug, Deserialize)]
pub struct SchemaLoaderModel {
    #[serde(default)]
    pub schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ListPartitionRouterModel {
    pub values: Value,
    pub cursor_field: String,
    #[serde(default)]
    pub request_option: Option<RequestOption>,
}

#[derive(Debug, Deserialize)]
pub struct ParentStreamConfigModel {
    /// A stream definition, or the name of a manifest stream
    pub stream: Value,
    pub parent_key: String,
    pub partition_field: String,
    #[serde(default)]
    pub request_option: Option<RequestOption>,
    #[serde(default)]
    pub incremental_dependency: bool,
}

/// Substream shorthand: `{parent_stream, parent_key, partition_field}`.
#[derive(Debug, Deserialize)]
pub struct ShorthandSubstreamModel {
    pub parent_stream: Value,
    pub parent_key: String,
    pub partition_field: String,
    #[serde(default)]
    pub request_option: Option<RequestOption>,
    #[serde(default)]
    pub incremental_dependency: bool,
}

impl From<ShorthandSubstreamModel> for ParentStreamConfigModel {
    fn from(model: ShorthandSubstreamModel) -> Self {
        Self {
            stream: model.parent_stream,
            parent_key: model.parent_key,
            partition_field: model.partition_field,
            request_option: model.request_option,
            incremental_dependency: model.incremental_dependency,
        }
    }
}

/// `$parameters` of a component, if any.
pub fn parameters_of(component: &Value) -> Map<String, Value> {
    component
        .get(super::refs::PARAMETERS_KEY)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}
