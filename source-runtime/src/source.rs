//! Source entry points: check, discover and read over a lowered manifest.

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use tributary::config::{ConnectorConfig, RuntimeConfig};
use tributary::error::{Result, SourceError};
use tributary::protocol::{validate_catalog, Catalog, ConfiguredCatalog, Status, StreamStatus};
use tributary::state::StateManager;
use tributary::{Clock, Message, StreamDescriptor, SyncMode, SystemClock};

use crate::http::{HttpClient, HttpSender, ReqwestSender};
use crate::manifest::Manifest;
use crate::reader::{read_synchronous, ConcurrentReader};
use crate::stream::{DeclarativeStream, OpenStream, ReadContext};

/// The operations a source connector exposes to the platform.
///
/// # Lifecycle
/// 1. `check` validates the configuration against the API
/// 2. `discover` reports the streams and their schemas
/// 3. `read` syncs the configured catalog, resuming from `state`
#[async_trait]
pub trait Source: Send + Sync {
    /// One request per check stream. Returns a CONNECTION_STATUS message.
    async fn check(&self, config: &ConnectorConfig) -> Message;

    fn discover(&self) -> Catalog;

    /// Lazily read the catalog. Messages arrive in emission order; the
    /// stream ends with an `Err(SourceError::SyncFailed)` item when any
    /// stream failed.
    fn read(
        &self,
        config: &ConnectorConfig,
        catalog: ConfiguredCatalog,
        state: StateManager,
    ) -> BoxStream<'static, Result<Message>>;
}

/// A source driven entirely by a manifest.
#[derive(Clone)]
pub struct DeclarativeSource {
    manifest: Arc<Manifest>,
    runtime: RuntimeConfig,
    clock: Arc<dyn Clock>,
    sender: Arc<dyn HttpSender>,
}

impl DeclarativeSource {
    pub fn new(manifest: Manifest, runtime: RuntimeConfig) -> anyhow::Result<Self> {
        let sender = Arc::new(ReqwestSender::new(&runtime.http)?);
        Ok(Self::with_parts(manifest, runtime, Arc::new(SystemClock), sender))
    }

    /// Build with an explicit clock and transport.
    pub fn with_parts(
        manifest: Manifest,
        runtime: RuntimeConfig,
        clock: Arc<dyn Clock>,
        sender: Arc<dyn HttpSender>,
    ) -> Self {
        Self {
            manifest: Arc::new(manifest),
            runtime,
            clock,
            sender,
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn read_context(&self, config: &ConnectorConfig) -> Arc<ReadContext> {
        let http = HttpClient::new(self.sender.clone(), self.runtime.http.clone());
        Arc::new(ReadContext::new(config, self.clock.clone(), http, self.runtime.clone()))
    }

    async fn check_stream(&self, read: &Arc<ReadContext>, stream: &Arc<DeclarativeStream>) -> Result<()> {
        let mut open = stream.open(read.clone(), SyncMode::FullRefresh, None)?;
        let mut partitions = open.partitions();
        let partition = match partitions.next().await {
            Some(partition) => partition?,
            None => return Ok(()),
        };
        drop(partitions);
        let slice = match open.cursor.stream_slices(&partition)?.into_iter().next() {
            Some(slice) => slice,
            None => return Ok(()),
        };
        let stream_state = open.cursor.template_state(&slice);
        let mut reader = open.run.slice_reader(slice, stream_state)?;
        reader.next_page().await?;
        if open.run.is_timezone_mismatched() {
            return Err(open.run.timezone_error());
        }
        Ok(())
    }

    async fn run_read(
        self,
        read: Arc<ReadContext>,
        catalog: ConfiguredCatalog,
        state: StateManager,
        out: mpsc::Sender<Message>,
    ) -> Vec<String> {
        let mut concurrent = Vec::new();
        let mut synchronous = Vec::new();
        let mut failed = Vec::new();

        for configured in &catalog.streams {
            let name = &configured.stream.name;
            let stream = match self.manifest.stream(name) {
                Some(stream) => stream,
                None => {
                    warn!(stream = %name, "Stream in catalog but not in manifest; skipping");
                    continue;
                }
            };
            let descriptor = StreamDescriptor::new(name.as_str());
            let mode = configured.sync_mode;
            match stream.open(read.clone(), mode, state.get(&descriptor)) {
                Ok(open) if is_synchronous(stream, mode) => synchronous.push(open),
                Ok(open) => concurrent.push(open),
                Err(e) => {
                    report_open_failure(&read, descriptor, &e, &out).await;
                    failed.push(name.clone());
                }
            }
        }

        if !concurrent.is_empty() {
            let concurrency = match self.manifest.concurrency(&read.template_context(&serde_json::Value::Null)) {
                Ok(concurrency) => concurrency,
                Err(e) => {
                    error!(error = %e, "Cannot resolve concurrency level");
                    let names = concurrent.iter().map(|o: &OpenStream| o.run.name().to_string());
                    failed.extend(names);
                    report_global(&read, &e, &out).await;
                    return failed;
                }
            };
            let reader = ConcurrentReader::new(concurrency);
            info!(
                streams = concurrent.len(),
                concurrency = reader.concurrency(),
                initial_partitions = reader.initial_partitions(),
                "Reading concurrent streams"
            );
            failed.extend(reader.read(concurrent, &out).await);
        }

        for open in synchronous {
            if let Some(name) = read_synchronous(open, &out).await {
                failed.push(name);
            }
        }
        failed
    }
}

/// Streams that must be read one slice at a time, in order.
fn is_synchronous(stream: &DeclarativeStream, mode: SyncMode) -> bool {
    stream.uses_stream_state
        || (mode == SyncMode::FullRefresh && stream.router.is_some())
        || stream.is_substream()
}

async fn report_open_failure(
    read: &ReadContext,
    descriptor: StreamDescriptor,
    e: &SourceError,
    out: &mpsc::Sender<Message>,
) {
    error!(stream = %descriptor.name, error = %e, "Cannot open stream");
    let emitted_at = read.emitted_at();
    let messages = [
        Message::stream_status(descriptor.clone(), StreamStatus::Started, emitted_at),
        Message::error(
            Some(descriptor.clone()),
            format!("Stream '{}' failed: {}", descriptor.name, e),
            Some(format!("{:?}", e)),
            e.failure_type(),
            emitted_at,
        ),
        Message::stream_status(descriptor, StreamStatus::Incomplete, emitted_at),
    ];
    for message in messages {
        let _ = out.send(message).await;
    }
}

async fn report_global(read: &ReadContext, e: &SourceError, out: &mpsc::Sender<Message>) {
    let _ = out
        .send(Message::error(None, e.to_string(), Some(format!("{:?}", e)), e.failure_type(), read.emitted_at()))
        .await;
}

#[async_trait]
impl Source for DeclarativeSource {
    async fn check(&self, config: &ConnectorConfig) -> Message {
        let read = self.read_context(config);
        let streams: Vec<&Arc<DeclarativeStream>> = if self.manifest.check_streams.is_empty() {
            self.manifest.streams.iter().filter(|s| !s.is_substream()).collect()
        } else {
            let mut selected = Vec::new();
            for name in &self.manifest.check_streams {
                match self.manifest.stream(name) {
                    Some(stream) => selected.push(stream),
                    None => {
                        return Message::connection_status(
                            Status::Failed,
                            Some(format!("Check stream '{}' is not defined in the manifest", name)),
                        )
                    }
                }
            }
            selected
        };

        for stream in streams {
            if let Err(e) = self.check_stream(&read, stream).await {
                warn!(stream = %stream.name, error = %e, "Check failed");
                return Message::connection_status(
                    Status::Failed,
                    Some(format!("Unable to connect to stream {} - {}", stream.name, e)),
                );
            }
            info!(stream = %stream.name, "Check passed");
        }
        Message::connection_status(Status::Succeeded, None)
    }

    fn discover(&self) -> Catalog {
        Catalog {
            streams: self.manifest.streams.iter().map(|s| s.definition()).collect(),
        }
    }

    fn read(
        &self,
        config: &ConnectorConfig,
        catalog: ConfiguredCatalog,
        state: StateManager,
    ) -> BoxStream<'static, Result<Message>> {
        if let Err(e) = validate_catalog(&catalog) {
            let err = SourceError::Config(format!("Invalid catalog: {}", e));
            return stream::once(future::ready(Err(err))).boxed();
        }

        let read = self.read_context(config);
        let (tx, rx) = mpsc::channel(self.runtime.reader.output_buffer.max(1));
        let handle = tokio::spawn(self.clone().run_read(read, catalog, state, tx));

        let outcome = async move {
            match handle.await {
                Ok(failed) if failed.is_empty() => None,
                Ok(failed) => Some(Err(SourceError::SyncFailed(failed))),
                Err(e) => Some(Err(SourceError::Other(anyhow::anyhow!("read task failed: {}", e)))),
            }
        };
        ReceiverStream::new(rx)
            .map(Ok)
            .chain(stream::once(outcome).filter_map(future::ready))
            .boxed()
    }
}
