//! Lowers the reference-resolved manifest tree into runtime components.

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use tributary::error::{Result, SourceError};

use super::model::*;
use super::refs::merge_parameters;
use crate::cursor::DatetimeCursorDefinition;
use crate::error_handler::{BackoffStrategy, ErrorHandler, ResponseFilter};
use crate::extractor::RecordSelector;
use crate::interpolation::{references_identifier, Template};
use crate::paginator::{PageTokenOption, PaginationStrategy, Paginator};
use crate::partition_router::{
    CartesianProductRouter, ListPartitionRouter, ParentStreamConfig, PartitionRouter,
    SubstreamPartitionRouter,
};
use crate::requester::{
    ApiKeyAuthenticator, Authenticator, BasicHttpAuthenticator, BearerAuthenticator, InjectInto,
    NoAuth, RequestOption, Requester, RequesterParts,
};
use crate::retriever::SimpleRetriever;
use crate::stream::DeclarativeStream;

const STREAM_STATE: &str = "stream_state";

/// Builds streams from raw definitions. Streams referenced by name as a
/// parent are built once and shared.
pub struct ComponentFactory<'a> {
    by_name: HashMap<String, &'a Value>,
    built: HashMap<String, Arc<DeclarativeStream>>,
    building: Vec<String>,
}

impl<'a> ComponentFactory<'a> {
    pub fn new(streams: &'a [Value]) -> Self {
        let by_name = streams
            .iter()
            .filter_map(|raw| declared_name(raw).map(|name| (name, raw)))
            .collect();
        Self {
            by_name,
            built: HashMap::new(),
            building: Vec::new(),
        }
    }

    /// Build the manifest stream called `name`.
    pub fn stream_by_name(&mut self, name: &str) -> Result<Arc<DeclarativeStream>> {
        if let Some(stream) = self.built.get(name) {
            return Ok(stream.clone());
        }
        if self.building.iter().any(|n| n == name) {
            let mut chain = self.building.clone();
            chain.push(name.to_string());
            return Err(SourceError::Manifest(format!(
                "circular parent stream: {}",
                chain.join(" -> ")
            )));
        }
        let raw = *self
            .by_name
            .get(name)
            .ok_or_else(|| SourceError::Manifest(format!("unknown stream '{}'", name)))?;

        self.building.push(name.to_string());
        let stream = self.build_stream(raw, &Map::new());
        self.building.pop();

        let stream = Arc::new(stream?);
        self.built.insert(name.to_string(), stream.clone());
        Ok(stream)
    }

    fn build_stream(&mut self, raw: &Value, inherited: &Map<String, Value>) -> Result<DeclarativeStream> {
        let stream_params = merge_parameters(inherited, raw);
        let name = raw
            .get("name")
            .and_then(Value::as_str)
            .or_else(|| stream_params.get("name").and_then(Value::as_str))
            .ok_or_else(|| SourceError::Manifest("stream without a name".into()))?
            .to_string();
        let model: StreamModel = from_raw(raw, &name)?;
        debug!(stream = %name, "Lowering stream");

        let raw_retriever = &raw["retriever"];
        let retriever_params = merge_parameters(&stream_params, raw_retriever);
        let raw_requester = &raw_retriever["requester"];
        let params = merge_parameters(&retriever_params, raw_requester);

        let requester = build_requester(
            model.retriever.requester,
            model.path.as_deref(),
            &params,
            &name,
        )?;
        let paginator = match model.retriever.paginator {
            Some(paginator) => build_paginator(paginator)?,
            None => Paginator::none(),
        };
        let selector = build_selector(model.retriever.record_selector)?;

        let router = match &model.retriever.partition_router {
            Some(raw_router) => Some(self.build_router(raw_router, &params, &name)?),
            None => None,
        };
        let incremental = model
            .incremental_sync
            .map(build_datetime_cursor)
            .transpose()?;

        let primary_key = match model.primary_key.as_ref().or_else(|| params.get("primary_key")) {
            Some(key) => normalize_primary_key(key, &name)?,
            None => Vec::new(),
        };
        let json_schema = model
            .schema_loader
            .and_then(|loader| loader.schema)
            .unwrap_or_else(default_schema);
        let uses_stream_state = references_identifier(raw_requester, STREAM_STATE)
            || references_identifier(&raw_retriever["paginator"], STREAM_STATE);

        Ok(DeclarativeStream {
            name,
            primary_key,
            json_schema,
            retriever: SimpleRetriever::new(requester, paginator, selector),
            incremental,
            router,
            parameters: Value::Object(params),
            uses_stream_state,
        })
    }

    fn build_router(
        &mut self,
        raw: &Value,
        inherited: &Map<String, Value>,
        stream: &str,
    ) -> Result<Arc<dyn PartitionRouter>> {
        if let Value::Array(items) = raw {
            let routers = items
                .iter()
                .map(|item| self.build_router(item, inherited, stream))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Arc::new(CartesianProductRouter { routers }));
        }
        let params = merge_parameters(inherited, raw);
        let kind = raw.get("type").and_then(Value::as_str);
        match kind {
            Some("ListPartitionRouter") => {
                let model: ListPartitionRouterModel = from_raw(raw, stream)?;
                Ok(Arc::new(ListPartitionRouter {
                    values: Template::compile(&model.values)?,
                    cursor_field: model.cursor_field,
                    request_option: model.request_option,
                    parameters: Value::Object(params),
                }))
            }
            Some("SubstreamPartitionRouter") => {
                let configs = raw
                    .get("parent_stream_configs")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        SourceError::Manifest(format!(
                            "stream '{}': SubstreamPartitionRouter needs parent_stream_configs",
                            stream
                        ))
                    })?;
                let mut parents = Vec::with_capacity(configs.len());
                for config in configs {
                    let model: ParentStreamConfigModel = from_raw(config, stream)?;
                    parents.push(self.build_parent(model, &params, stream)?);
                }
                Ok(Arc::new(SubstreamPartitionRouter { parents }))
            }
            Some("CartesianProductStreamSlicer") => {
                let slicers = raw.get("stream_slicers").cloned().unwrap_or(Value::Array(Vec::new()));
                self.build_router(&slicers, &params, stream)
            }
            None if raw.get("parent_stream").is_some() => {
                let model: ShorthandSubstreamModel = from_raw(raw, stream)?;
                let parent = self.build_parent(model.into(), &params, stream)?;
                Ok(Arc::new(SubstreamPartitionRouter { parents: vec![parent] }))
            }
            other => Err(SourceError::Manifest(format!(
                "stream '{}': unsupported partition router {}",
                stream,
                other.unwrap_or("<untyped>")
            ))),
        }
    }

    fn build_parent(
        &mut self,
        model: ParentStreamConfigModel,
        inherited: &Map<String, Value>,
        stream: &str,
    ) -> Result<ParentStreamConfig> {
        let parent = match &model.stream {
            Value::String(name) => self.stream_by_name(name)?,
            Value::Object(_) => Arc::new(self.build_stream(&model.stream, inherited)?),
            other => {
                return Err(SourceError::Manifest(format!(
                    "stream '{}': parent stream must be a definition or a name, got {}",
                    stream, other
                )))
            }
        };
        Ok(ParentStreamConfig {
            stream: parent,
            parent_key: model.parent_key,
            partition_field: model.partition_field,
            request_option: model.request_option,
            incremental_dependency: model.incremental_dependency,
        })
    }
}

fn declared_name(raw: &Value) -> Option<String> {
    raw.get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| parameters_of(raw).get("name").and_then(Value::as_str).map(str::to_string))
}

fn from_raw<T: DeserializeOwned>(raw: &Value, stream: &str) -> Result<T> {
    serde_json::from_value(raw.clone())
        .map_err(|e| SourceError::Manifest(format!("stream '{}': {}", stream, e)))
}

fn template(text: &str) -> Result<Template> {
    Template::parse(text)
}

fn optional_template(value: Option<Value>) -> Result<Option<Template>> {
    value.as_ref().map(Template::compile).transpose()
}

fn build_requester(
    model: RequesterModel,
    stream_path: Option<&str>,
    params: &Map<String, Value>,
    stream: &str,
) -> Result<Requester> {
    let url_base = model
        .url_base
        .or_else(|| params.get("url_base").and_then(Value::as_str).map(str::to_string))
        .ok_or_else(|| SourceError::Manifest(format!("stream '{}': requester needs url_base", stream)))?;
    let path = model
        .path
        .or_else(|| stream_path.map(str::to_string))
        .or_else(|| params.get("path").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();

    let authenticator: Arc<dyn Authenticator> = match model.authenticator {
        None | Some(AuthenticatorModel::NoAuth) => Arc::new(NoAuth),
        Some(AuthenticatorModel::BearerAuthenticator { api_token }) => {
            Arc::new(BearerAuthenticator::new(template(&api_token)?))
        }
        Some(AuthenticatorModel::ApiKeyAuthenticator {
            api_token,
            header,
            inject_into,
        }) => {
            let option = match (inject_into, header) {
                (Some(option), _) => option,
                (None, Some(header)) => RequestOption {
                    field_name: header,
                    inject_into: InjectInto::Header,
                },
                (None, None) => {
                    return Err(SourceError::Manifest(format!(
                        "stream '{}': ApiKeyAuthenticator needs header or inject_into",
                        stream
                    )))
                }
            };
            Arc::new(ApiKeyAuthenticator::new(template(&api_token)?, option))
        }
        Some(AuthenticatorModel::BasicHttpAuthenticator { username, password }) => Arc::new(
            BasicHttpAuthenticator::new(template(&username)?, template(&password)?),
        ),
    };

    let error_handler = match model.error_handler {
        Some(handler) => build_error_handler(handler, stream)?,
        None => ErrorHandler::default(),
    };

    Ok(Requester::new(RequesterParts {
        url_base: template(&url_base)?,
        path: template(&path)?,
        method: model.http_method,
        params: optional_template(model.request_parameters)?,
        headers: optional_template(model.request_headers)?,
        body_json: optional_template(model.request_body_json)?,
        body_data: optional_template(model.request_body_data)?,
        authenticator,
        error_handler,
        reqs_per_hour: model.reqs_per_hour,
    }))
}

fn build_error_handler(model: ErrorHandlerModel, stream: &str) -> Result<ErrorHandler> {
    let filters = model
        .response_filters
        .into_iter()
        .map(|filter| {
            Ok(ResponseFilter {
                http_codes: filter.http_codes,
                error_message_contains: filter.error_message_contains,
                predicate: filter.predicate.as_deref().map(template).transpose()?,
                action: filter.action,
                failure_type: filter.failure_type,
                error_message: filter.error_message.as_deref().map(template).transpose()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let backoff_strategies = model
        .backoff_strategies
        .into_iter()
        .map(|strategy| {
            Ok(match strategy {
                BackoffStrategyModel::ConstantBackoffStrategy { backoff_time_in_seconds } => {
                    BackoffStrategy::Constant {
                        seconds: number(&backoff_time_in_seconds, "backoff_time_in_seconds", stream)?,
                    }
                }
                BackoffStrategyModel::ExponentialBackoffStrategy { factor } => BackoffStrategy::Exponential {
                    factor: match factor {
                        Some(factor) => number(&factor, "factor", stream)?,
                        None => 5.0,
                    },
                },
                BackoffStrategyModel::WaitTimeFromHeader { header } => {
                    BackoffStrategy::WaitTimeFromHeader { header }
                }
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ErrorHandler {
        filters,
        backoff_strategies,
        max_retries: model.max_retries,
    })
}

fn number(value: &Value, field: &str, stream: &str) -> Result<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| {
        SourceError::Manifest(format!("stream '{}': {} must be a number, got {}", stream, field, value))
    })
}

fn build_paginator(model: PaginatorModel) -> Result<Paginator> {
    let (strategy, page_token_option, page_size_option, max_pages) = match model {
        PaginatorModel::NoPagination => return Ok(Paginator::none()),
        PaginatorModel::DefaultPaginator {
            pagination_strategy,
            page_token_option,
            page_size_option,
            max_pages,
        } => (pagination_strategy, page_token_option, page_size_option, max_pages),
    };

    let strategy = match strategy {
        PaginationStrategyModel::CursorPagination {
            cursor_value,
            stop_condition,
            page_size,
        } => PaginationStrategy::Cursor {
            cursor_value: template(&cursor_value)?,
            stop_condition: stop_condition.as_deref().map(template).transpose()?,
            page_size: optional_template(page_size)?,
        },
        PaginationStrategyModel::OffsetIncrement {
            page_size,
            max_records,
            inject_on_first_request,
        } => PaginationStrategy::Offset {
            page_size: optional_template(page_size)?,
            max_records: optional_template(max_records)?,
            inject_on_first_request,
        },
        PaginationStrategyModel::PageIncrement {
            page_size,
            start_from_page,
            inject_on_first_request,
            total_pages,
        } => PaginationStrategy::PageIncrement {
            page_size: optional_template(page_size)?,
            start_from_page,
            inject_on_first_request,
            total_pages: optional_template(total_pages)?,
        },
    };
    let page_token_option = page_token_option.map(|option| match option {
        PageTokenOptionModel::RequestOption(option) => PageTokenOption::Request(option),
        PageTokenOptionModel::RequestPath => PageTokenOption::Path,
    });
    Ok(Paginator::new(strategy, page_token_option, page_size_option, max_pages))
}

fn build_selector(model: RecordSelectorModel) -> Result<RecordSelector> {
    let path = model
        .extractor
        .field_path
        .iter()
        .map(|segment| template(segment))
        .collect::<Result<Vec<_>>>()?;
    let mut selector = RecordSelector::new(path)
        .with_flatten_nested(model.flatten_nested)
        .with_normalize_datetimes(model.normalize_datetimes);
    if let Some(filter) = model.record_filter {
        selector = selector.with_filter(template(&filter.condition)?);
    }
    Ok(selector)
}

fn build_datetime_cursor(model: DatetimeCursorModel) -> Result<DatetimeCursorDefinition> {
    let (start, start_format) = bound(model.start_datetime)?;
    let (end, end_format) = match model.end_datetime {
        Some(end) => {
            let (end, format) = bound(end)?;
            (Some(end), format)
        }
        None => (None, None),
    };
    Ok(DatetimeCursorDefinition {
        cursor_field: model.cursor_field,
        start,
        start_format,
        end,
        end_format,
        step: model.step.as_deref().map(template).transpose()?,
        lookback: model.lookback_window.as_deref().map(template).transpose()?,
        granularity: model.cursor_granularity.as_deref().map(template).transpose()?,
        datetime_format: model.datetime_format,
        cursor_datetime_formats: model.cursor_datetime_formats,
        partition_field_start: model.partition_field_start.unwrap_or_else(|| "start_time".into()),
        partition_field_end: model.partition_field_end.unwrap_or_else(|| "end_time".into()),
        start_time_option: model.start_time_option,
        end_time_option: model.end_time_option,
    })
}

fn bound(model: DatetimeBoundModel) -> Result<(Template, Option<String>)> {
    match model {
        DatetimeBoundModel::Text(text) => Ok((template(&text)?, None)),
        DatetimeBoundModel::MinMax {
            datetime,
            datetime_format,
        } => Ok((template(&datetime)?, datetime_format)),
    }
}

/// `"id"` → `[["id"]]`, `["a", "b"]` → `[["a"], ["b"]]`, nested lists as-is.
fn normalize_primary_key(value: &Value, stream: &str) -> Result<Vec<Vec<String>>> {
    let invalid = || SourceError::Manifest(format!("stream '{}': invalid primary_key {}", stream, value));
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(key) if key.is_empty() => Ok(Vec::new()),
        Value::String(key) => Ok(vec![vec![key.clone()]]),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(key) => Ok(vec![key.clone()]),
                Value::Array(path) => path
                    .iter()
                    .map(|p| p.as_str().map(str::to_string).ok_or_else(invalid))
                    .collect(),
                _ => Err(invalid()),
            })
            .collect(),
        _ => Err(invalid()),
    }
}

fn default_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "properties": {},
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Value {
        json!({
            "name": "users",
            "primary_key": "id",
            "$parameters": {"path": "/users"},
            "retriever": {
                "requester": {
                    "url_base": "https://api.example.com",
                    "authenticator": {"type": "BearerAuthenticator", "api_token": "{{ config.token }}"},
                },
                "record_selector": {"extractor": {"field_path": ["data"]}},
            },
        })
    }

    #[test]
    fn test_parent_referenced_by_name_is_shared() {
        let streams = vec![
            users(),
            json!({
                "name": "posts",
                "retriever": {
                    "requester": {"url_base": "https://api.example.com", "path": "/users/{{ stream_partition.user_id }}/posts"},
                    "partition_router": {
                        "type": "SubstreamPartitionRouter",
                        "parent_stream_configs": [
                            {"stream": "users", "parent_key": "id", "partition_field": "user_id"}
                        ],
                    },
                },
            }),
        ];
        let mut factory = ComponentFactory::new(&streams);
        let users = factory.stream_by_name("users").unwrap();
        let posts = factory.stream_by_name("posts").unwrap();

        assert!(posts.is_substream());
        assert!(!users.is_substream());
        assert_eq!(users.primary_key, vec![vec!["id".to_string()]]);
        assert_eq!(users.parameters["path"], json!("/users"));
        assert!(!posts.uses_stream_state);
        assert!(Arc::ptr_eq(&users, &factory.stream_by_name("users").unwrap()));
    }

    #[test]
    fn test_stream_state_detection() {
        let streams = vec![json!({
            "name": "events",
            "retriever": {
                "requester": {
                    "url_base": "https://api.example.com",
                    "path": "/events",
                    "request_parameters": {"since": "{{ stream_state.updated_at }}"},
                },
            },
        })];
        let stream = ComponentFactory::new(&streams).stream_by_name("events").unwrap();
        assert!(stream.uses_stream_state);
    }

    #[test]
    fn test_circular_parents_rejected() {
        let substream = |name: &str, parent: &str| {
            json!({
                "name": name,
                "retriever": {
                    "requester": {"url_base": "https://api.example.com"},
                    "partition_router": {"parent_stream": parent, "parent_key": "id", "partition_field": "pid"},
                },
            })
        };
        let streams = vec![substream("a", "b"), substream("b", "a")];
        let err = ComponentFactory::new(&streams).stream_by_name("a").unwrap_err();
        assert!(err.to_string().contains("a -> b -> a"), "{}", err);
    }

    #[test]
    fn test_api_key_needs_a_destination() {
        let streams = vec![json!({
            "name": "s",
            "retriever": {
                "requester": {
                    "url_base": "https://api.example.com",
                    "authenticator": {"type": "ApiKeyAuthenticator", "api_token": "k"},
                },
            },
        })];
        let err = ComponentFactory::new(&streams).stream_by_name("s").unwrap_err();
        assert!(matches!(err, SourceError::Manifest(_)));
    }

    #[test]
    fn test_primary_key_shapes() {
        assert_eq!(normalize_primary_key(&json!(["a", "b"]), "s").unwrap(), vec![vec!["a".to_string()], vec!["b".to_string()]]);
        assert_eq!(
            normalize_primary_key(&json!([["a", "b"]]), "s").unwrap(),
            vec![vec!["a".to_string(), "b".to_string()]]
        );
        assert!(normalize_primary_key(&json!(3), "s").is_err());
    }
}
