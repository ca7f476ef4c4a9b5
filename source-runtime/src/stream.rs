//! A declared stream and the per-read machinery around it.
//!
//! ```text
//!   DeclarativeStream ──open()──▶ OpenStream { run, cursor }
//!                                     │
//!      partitions() ─▶ cursor.stream_slices() ─▶ SliceReader::next_page()
//!                                     │
//!                          cursor.close_partition()
//! ```

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tributary::config::{ConnectorConfig, RuntimeConfig};
use tributary::error::{Result, SourceError};
use tributary::protocol::StreamDefinition;
use tributary::{Clock, Message, Record, StreamSlice, SyncMode};

use crate::cursor::{
    Cursor, DatetimeCursor, DatetimeCursorDefinition, DatetimeParams, FullRefreshCursor,
    InnerCursorFactory, PerPartitionCursor, RecordPosition,
};
use crate::http::HttpClient;
use crate::interpolation::Context;
use crate::paginator::PageState;
use crate::partition_router::PartitionRouter;
use crate::requester::RequestOptions;
use crate::retriever::{Page, SimpleRetriever};

/// Shared, read-only services for one sync, plus the parent states that
/// substream routers hand back to their children.
pub struct ReadContext {
    config: Value,
    clock: Arc<dyn Clock>,
    http: HttpClient,
    runtime: RuntimeConfig,
    parent_states: DashMap<String, Map<String, Value>>,
}

impl ReadContext {
    pub fn new(
        config: &ConnectorConfig,
        clock: Arc<dyn Clock>,
        http: HttpClient,
        runtime: RuntimeConfig,
    ) -> Self {
        Self {
            config: config.to_value(),
            clock,
            http,
            runtime,
            parent_states: DashMap::new(),
        }
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn emitted_at(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    /// `config` and `parameters` roots, with `now` from the clock.
    pub fn template_context(&self, parameters: &Value) -> Context {
        Context::new(self.now())
            .with("config", self.config.clone())
            .with("parameters", parameters.clone())
    }

    /// Remember the final state of `parent` as read on behalf of `child`.
    pub fn record_parent_state(&self, child: &str, parent: &str, state: Value) {
        self.parent_states
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string(), state);
    }

    pub fn take_parent_state(&self, child: &str) -> Option<Value> {
        self.parent_states
            .remove(child)
            .map(|(_, states)| Value::Object(states))
    }
}

/// A stream as lowered from the manifest.
#[derive(Debug)]
pub struct DeclarativeStream {
    pub name: String,
    pub primary_key: Vec<Vec<String>>,
    pub json_schema: Value,
    pub retriever: SimpleRetriever,
    pub incremental: Option<DatetimeCursorDefinition>,
    pub router: Option<Arc<dyn PartitionRouter>>,
    pub parameters: Value,
    /// The requester or paginator interpolates `stream_state`
    pub uses_stream_state: bool,
}

impl DeclarativeStream {
    pub fn is_substream(&self) -> bool {
        self.router.as_ref().map_or(false, |r| r.is_substream())
    }

    pub fn definition(&self) -> StreamDefinition {
        let mut supported_sync_modes = vec![SyncMode::FullRefresh];
        if self.incremental.is_some() {
            supported_sync_modes.push(SyncMode::Incremental);
        }
        StreamDefinition {
            name: self.name.clone(),
            namespace: None,
            json_schema: self.json_schema.clone(),
            supported_sync_modes,
            source_defined_cursor: self.incremental.as_ref().map(|_| true),
            default_cursor_field: self
                .incremental
                .as_ref()
                .map(|definition| vec![definition.cursor_field.clone()]),
            source_defined_primary_key: (!self.primary_key.is_empty()).then(|| self.primary_key.clone()),
        }
    }

    /// Set up a read: resolve the cursor and seed it from `state`.
    /// Incoming state is ignored for full refresh.
    pub fn open(
        self: &Arc<Self>,
        read: Arc<ReadContext>,
        sync_mode: SyncMode,
        state: Option<&Value>,
    ) -> Result<OpenStream> {
        let state = match sync_mode {
            SyncMode::Incremental => state,
            SyncMode::FullRefresh => None,
        };
        let ctx = read.template_context(&self.parameters);
        let params = match &self.incremental {
            Some(definition) => Some(definition.resolve(&ctx)?),
            None => None,
        };

        let cursor: Box<dyn Cursor> = match (&self.router, &params) {
            (None, Some(params)) => Box::new(DatetimeCursor::new(params.clone(), state)?),
            (None, None) => Box::new(FullRefreshCursor::new()),
            (Some(_), Some(params)) => {
                let params = params.clone();
                let factory: InnerCursorFactory = Arc::new(move |inner: Option<&Value>| {
                    Ok(Box::new(DatetimeCursor::new(params.clone(), inner)?) as Box<dyn Cursor>)
                });
                Box::new(PerPartitionCursor::new(factory, state)?)
            }
            (Some(_), None) => {
                let factory: InnerCursorFactory = Arc::new(|_inner: Option<&Value>| {
                    Ok(Box::new(FullRefreshCursor::new()) as Box<dyn Cursor>)
                });
                Box::new(PerPartitionCursor::new(factory, state)?)
            }
        };

        let parent_state = state.and_then(|s| s.get("parent_state")).cloned();
        Ok(OpenStream {
            run: Arc::new(StreamRun {
                stream: self.clone(),
                read,
                params,
                warned_missing_cursor: AtomicBool::new(false),
                timezone_mismatch: AtomicBool::new(false),
            }),
            cursor,
            parent_state,
        })
    }
}

/// A stream opened for one read.
pub struct OpenStream {
    pub run: Arc<StreamRun>,
    pub cursor: Box<dyn Cursor>,
    /// `parent_state` found in the incoming state, for substream routers
    pub parent_state: Option<Value>,
}

impl OpenStream {
    pub fn partitions(&self) -> BoxStream<'static, Result<StreamSlice>> {
        self.run.partitions(self.parent_state.clone())
    }

    /// Carry the parent states gathered by the router into the cursor.
    pub fn absorb_parent_state(&mut self) {
        if let Some(parent_state) = self.run.read.take_parent_state(&self.run.stream.name) {
            self.cursor.set_parent_state(parent_state);
        }
    }
}

/// Result of reading one slice to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceOutcome {
    pub records: u64,
    pub most_recent: Option<DateTime<Utc>>,
}

/// Per-read view of a stream shared by every worker reading its slices.
pub struct StreamRun {
    stream: Arc<DeclarativeStream>,
    read: Arc<ReadContext>,
    params: Option<Arc<DatetimeParams>>,
    warned_missing_cursor: AtomicBool,
    timezone_mismatch: AtomicBool,
}

impl StreamRun {
    pub fn name(&self) -> &str {
        &self.stream.name
    }

    pub fn stream(&self) -> &Arc<DeclarativeStream> {
        &self.stream
    }

    pub fn read_context(&self) -> &Arc<ReadContext> {
        &self.read
    }

    pub fn partitions(&self, parent_state: Option<Value>) -> BoxStream<'static, Result<StreamSlice>> {
        match &self.stream.router {
            Some(router) => router.partitions(self.read.clone(), &self.stream.name, parent_state),
            None => stream::once(async { Ok(StreamSlice::default()) }).boxed(),
        }
    }

    pub fn is_timezone_mismatched(&self) -> bool {
        self.timezone_mismatch.load(Ordering::SeqCst)
    }

    pub fn timezone_error(&self) -> SourceError {
        SourceError::Config(format!(
            "Stream '{}' requested data later than the API's current date; check the timezone of end_date and the API account",
            self.stream.name
        ))
    }

    pub fn slice_reader(self: &Arc<Self>, slice: StreamSlice, stream_state: Value) -> Result<SliceReader> {
        let mut ctx = self.read.template_context(&self.stream.parameters);
        ctx.set("stream_state", stream_state);
        ctx.set("stream_slice", slice.to_value());
        ctx.set("stream_partition", Value::Object(slice.partition.clone()));
        ctx.set("stream_interval", Value::Object(slice.cursor_slice.clone()));

        let mut options = RequestOptions::default();
        if let Some(router) = &self.stream.router {
            options.merge(&router.request_options(&slice));
        }
        if let Some(params) = &self.params {
            options.merge(&params.request_options(&slice));
        }

        let page = self.stream.retriever.first_page(&ctx)?;
        Ok(SliceReader {
            run: self.clone(),
            slice,
            ctx,
            options,
            page,
            finished: false,
            outcome: SliceOutcome {
                records: 0,
                most_recent: None,
            },
        })
    }

    /// Read `slice` to the end, sending RECORD messages to `out`.
    ///
    /// `None` means the slice must not be closed: the stream hit a
    /// timezone mismatch before or while reading it.
    pub async fn read_slice_into(
        self: &Arc<Self>,
        slice: StreamSlice,
        stream_state: Value,
        out: &mpsc::Sender<Message>,
    ) -> Result<Option<SliceOutcome>> {
        if self.is_timezone_mismatched() {
            debug!(stream = %self.stream.name, "Skipping slice after timezone mismatch");
            return Ok(None);
        }
        let mut reader = self.slice_reader(slice, stream_state)?;
        while let Some(records) = reader.next_page().await? {
            for record in records {
                let message = record.into_message(self.read.emitted_at());
                if out.send(message).await.is_err() {
                    return Err(SourceError::Other(anyhow::anyhow!("output channel closed")));
                }
            }
        }
        if self.is_timezone_mismatched() {
            return Ok(None);
        }
        Ok(Some(reader.outcome()))
    }
}

/// Pages through one slice.
pub struct SliceReader {
    run: Arc<StreamRun>,
    slice: StreamSlice,
    ctx: Context,
    options: RequestOptions,
    page: PageState,
    finished: bool,
    outcome: SliceOutcome,
}

impl SliceReader {
    pub fn slice(&self) -> &StreamSlice {
        &self.slice
    }

    pub fn outcome(&self) -> SliceOutcome {
        self.outcome
    }

    /// Records of the next page, or `None` once the slice is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Record>>> {
        if self.finished {
            return Ok(None);
        }
        let run = &self.run;
        let page = run
            .stream
            .retriever
            .fetch(
                run.read.http(),
                &run.stream.name,
                &self.ctx,
                &self.options,
                &mut self.page,
                run.read.runtime().reader.max_pages_per_slice,
            )
            .await?;

        let (records, has_more) = match page {
            Page::Ignored { timezone_mismatch } => {
                self.finished = true;
                if timezone_mismatch {
                    run.timezone_mismatch.store(true, Ordering::SeqCst);
                }
                return Ok(Some(Vec::new()));
            }
            Page::Records { records, has_more } => (records, has_more),
        };
        self.finished = !has_more;

        let mut kept = Vec::with_capacity(records.len());
        for data in records {
            if let Some(params) = &run.params {
                match params.position(&self.slice, &data) {
                    RecordPosition::Inside(value) => {
                        self.outcome.most_recent = self.outcome.most_recent.max(Some(value));
                    }
                    RecordPosition::Outside(value) => {
                        warn!(
                            stream = %run.stream.name,
                            cursor_field = %params.cursor_field,
                            cursor_value = %value,
                            slice = %self.slice.to_value(),
                            "Dropping record outside of its slice"
                        );
                        continue;
                    }
                    RecordPosition::Missing | RecordPosition::Unparseable => {
                        if !run.warned_missing_cursor.swap(true, Ordering::SeqCst) {
                            warn!(
                                stream = %run.stream.name,
                                cursor_field = %params.cursor_field,
                                "Record has no usable cursor value"
                            );
                        }
                    }
                }
            }
            kept.push(Record::new(&run.stream.name, data, self.slice.clone()));
        }
        self.outcome.records += kept.len() as u64;
        Ok(Some(kept))
    }
}
