//! Stream readers.
//!
//! ```text
//!  ┌──────────── one concurrent stream ─────────────┐
//!  │ generator ──slices──▶ dispatcher ──permit──▶ worker ... worker
//!  │  (router +            (bounded queue)           │          │
//!  │   cursor slices)                                ▼          ▼
//!  │                            completion serializer (owns cursor folding)
//!  └──────────────────────────────────┬─────────────────────────┘
//!                                     ▼
//!                      out: RECORD / STATE / TRACE messages
//! ```
//!
//! Workers from every concurrent stream share one semaphore. A stream's
//! cursor is only touched under its mutex; STATE is emitted by the
//! serializer after the partitions it covers closed.

use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use tributary::error::{Result, SourceError};
use tributary::protocol::StreamStatus;
use tributary::{Message, StreamDescriptor, StreamSlice};

use crate::cursor::Cursor;
use crate::stream::{OpenStream, SliceOutcome, StreamRun};

type Completion = (StreamSlice, Result<Option<SliceOutcome>>);

/// Reads a group of streams in parallel over a shared worker pool.
pub struct ConcurrentReader {
    concurrency: usize,
    initial_partitions: usize,
    workers: Arc<Semaphore>,
}

impl ConcurrentReader {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            concurrency,
            initial_partitions: (concurrency / 2).max(1),
            workers: Arc::new(Semaphore::new(concurrency)),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn initial_partitions(&self) -> usize {
        self.initial_partitions
    }

    /// Read `streams` in order of start. A stream starts once the previous
    /// one has queued all of its partitions; after any failure no further
    /// stream is started. Returns the names of failed streams.
    pub async fn read(&self, streams: Vec<OpenStream>, out: &mpsc::Sender<Message>) -> Vec<String> {
        let group_failed = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(streams.len());

        for open in streams {
            if group_failed.load(Ordering::SeqCst) {
                warn!(stream = %open.run.name(), "Not starting stream after an earlier failure");
                continue;
            }
            let (queued_tx, queued_rx) = oneshot::channel();
            let pipeline = StreamPipeline {
                workers: self.workers.clone(),
                queue_size: self.initial_partitions,
                out: out.clone(),
                group_failed: group_failed.clone(),
            };
            handles.push(tokio::spawn(pipeline.run(open, queued_tx)));
            let _ = queued_rx.await;
        }

        let mut failed = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Some(name)) => failed.push(name),
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Stream task panicked");
                    failed.push("<unknown>".to_string());
                }
            }
        }
        failed
    }
}

struct StreamPipeline {
    workers: Arc<Semaphore>,
    queue_size: usize,
    out: mpsc::Sender<Message>,
    group_failed: Arc<AtomicBool>,
}

impl StreamPipeline {
    async fn run(self, open: OpenStream, queued: oneshot::Sender<()>) -> Option<String> {
        let OpenStream {
            run,
            cursor,
            parent_state,
        } = open;
        let descriptor = StreamDescriptor::new(run.name());
        let emitted_at = || run.read_context().emitted_at();
        emit(&self.out, Message::stream_status(descriptor.clone(), StreamStatus::Started, emitted_at())).await;
        info!(stream = %run.name(), "Starting concurrent stream");

        let cursor: Arc<Mutex<Box<dyn Cursor>>> = Arc::new(Mutex::new(cursor));
        let stream_failed = Arc::new(AtomicBool::new(false));

        // Generator: router partitions → cursor slices → bounded queue
        let (slice_tx, mut slice_rx) = mpsc::channel::<Result<StreamSlice>>(self.queue_size);
        let generator = {
            let mut partitions = run.partitions(parent_state);
            let cursor = cursor.clone();
            tokio::spawn(async move {
                while let Some(partition) = partitions.next().await {
                    let slices = match partition {
                        Ok(partition) => cursor.lock().await.stream_slices(&partition),
                        Err(e) => Err(e),
                    };
                    let slices = match slices {
                        Ok(slices) => slices,
                        Err(e) => {
                            let _ = slice_tx.send(Err(e)).await;
                            return;
                        }
                    };
                    for slice in slices {
                        if slice_tx.send(Ok(slice)).await.is_err() {
                            return;
                        }
                    }
                }
            })
        };

        let (done_tx, done_rx) = mpsc::unbounded_channel::<Completion>();
        let serializer = tokio::spawn(serialize(
            run.clone(),
            cursor.clone(),
            done_rx,
            self.out.clone(),
            stream_failed.clone(),
            self.group_failed.clone(),
        ));

        // Dispatcher
        let mut failure: Option<SourceError> = None;
        let mut running = false;
        let mut workers = JoinSet::new();
        while let Some(item) = slice_rx.recv().await {
            reap_finished(&mut workers, &run, &stream_failed, &mut failure);
            if stream_failed.load(Ordering::SeqCst) {
                break;
            }
            let slice = match item {
                Ok(slice) => slice,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            if !running {
                running = true;
                emit(&self.out, Message::stream_status(descriptor.clone(), StreamStatus::Running, emitted_at())).await;
            }
            let permit = match self.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            reap_finished(&mut workers, &run, &stream_failed, &mut failure);
            if stream_failed.load(Ordering::SeqCst) {
                break;
            }
            let stream_state = cursor.lock().await.template_state(&slice);
            let run = run.clone();
            let out = self.out.clone();
            let done = done_tx.clone();
            let stream_failed = stream_failed.clone();
            workers.spawn(async move {
                debug!(stream = %run.name(), slice = %slice.to_value(), "Reading partition");
                let result = run.read_slice_into(slice.clone(), stream_state, &out).await;
                if result.is_err() {
                    stream_failed.store(true, Ordering::SeqCst);
                }
                // Report before the permit frees a slot for the dispatcher
                let _ = done.send((slice, result));
                drop(permit);
            });
        }
        drop(slice_rx);
        generator.abort();
        if let Err(e) = generator.await {
            if e.is_panic() {
                error!(stream = %run.name(), error = %e, "Partition generator panicked");
                failure.get_or_insert(SourceError::Other(anyhow::anyhow!("partition generator panicked: {}", e)));
            }
        }
        if failure.is_some() {
            self.group_failed.store(true, Ordering::SeqCst);
        }
        let _ = queued.send(());

        // In-flight workers drain; the serializer ends when the last one reports
        drop(done_tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                worker_lost(&run, e, &stream_failed, &mut failure);
            }
        }
        if failure.is_some() {
            self.group_failed.store(true, Ordering::SeqCst);
        }
        let (worker_failure, last_state) = match serializer.await {
            Ok(result) => result,
            Err(e) => (Some(SourceError::Other(anyhow::anyhow!("state serializer failed: {}", e))), None),
        };

        let mut cursor = cursor.lock().await;
        finish(
            &run,
            &mut **cursor,
            last_state,
            failure.or(worker_failure),
            &self.out,
            &self.group_failed,
        )
        .await
    }
}

/// Collect workers that already ended without blocking.
fn reap_finished(
    workers: &mut JoinSet<()>,
    run: &StreamRun,
    stream_failed: &AtomicBool,
    failure: &mut Option<SourceError>,
) {
    while let Some(joined) = workers.try_join_next() {
        if let Err(e) = joined {
            worker_lost(run, e, stream_failed, failure);
        }
    }
}

/// A worker that panicked never reported its partition: fail the stream.
fn worker_lost(run: &StreamRun, e: JoinError, stream_failed: &AtomicBool, failure: &mut Option<SourceError>) {
    error!(stream = %run.name(), error = %e, "Partition worker panicked");
    stream_failed.store(true, Ordering::SeqCst);
    failure.get_or_insert(SourceError::Other(anyhow::anyhow!("partition worker panicked: {}", e)));
}

/// Folds completions into the cursor, one at a time, emitting STATE when
/// it changed. Returns the first worker failure and the last emitted state.
async fn serialize(
    run: Arc<StreamRun>,
    cursor: Arc<Mutex<Box<dyn Cursor>>>,
    mut done: mpsc::UnboundedReceiver<Completion>,
    out: mpsc::Sender<Message>,
    stream_failed: Arc<AtomicBool>,
    group_failed: Arc<AtomicBool>,
) -> (Option<SourceError>, Option<Value>) {
    let descriptor = StreamDescriptor::new(run.name());
    let mut failure: Option<SourceError> = None;
    let mut last_state: Option<Value> = None;

    while let Some((slice, result)) = done.recv().await {
        let outcome = match result {
            Ok(Some(outcome)) => outcome,
            Ok(None) => continue,
            Err(e) => {
                error!(stream = %run.name(), slice = %slice.to_value(), error = %e, "Partition failed");
                stream_failed.store(true, Ordering::SeqCst);
                group_failed.store(true, Ordering::SeqCst);
                failure.get_or_insert(e);
                continue;
            }
        };
        debug!(stream = %run.name(), records = outcome.records, "Partition complete");

        let mut cursor = cursor.lock().await;
        match cursor.close_partition(&slice, outcome.most_recent) {
            Ok(true) => {
                if let Some(state) = cursor.state() {
                    if last_state.as_ref() != Some(&state) {
                        emit(&out, Message::state(descriptor.clone(), state.clone())).await;
                        last_state = Some(state);
                    }
                }
            }
            Ok(false) => {}
            Err(e) => {
                stream_failed.store(true, Ordering::SeqCst);
                group_failed.store(true, Ordering::SeqCst);
                failure.get_or_insert(e);
            }
        }
    }
    (failure, last_state)
}

/// Read a stream one slice at a time, in order.
pub async fn read_synchronous(mut open: OpenStream, out: &mpsc::Sender<Message>) -> Option<String> {
    let run = open.run.clone();
    let descriptor = StreamDescriptor::new(run.name());
    let emitted_at = || run.read_context().emitted_at();
    emit(out, Message::stream_status(descriptor.clone(), StreamStatus::Started, emitted_at())).await;
    info!(stream = %run.name(), "Starting synchronous stream");

    let mut partitions = open.partitions();
    let mut last_state: Option<Value> = None;
    let mut failure: Option<SourceError> = None;
    let mut running = false;

    'partitions: while let Some(partition) = partitions.next().await {
        let slices = match partition.and_then(|p| open.cursor.stream_slices(&p)) {
            Ok(slices) => slices,
            Err(e) => {
                failure = Some(e);
                break;
            }
        };
        for slice in slices {
            if !running {
                running = true;
                emit(out, Message::stream_status(descriptor.clone(), StreamStatus::Running, emitted_at())).await;
            }
            let stream_state = open.cursor.template_state(&slice);
            let outcome = match run.read_slice_into(slice.clone(), stream_state, out).await {
                Ok(Some(outcome)) => outcome,
                Ok(None) => continue,
                Err(e) => {
                    error!(stream = %run.name(), slice = %slice.to_value(), error = %e, "Partition failed");
                    failure = Some(e);
                    break 'partitions;
                }
            };
            match open.cursor.close_partition(&slice, outcome.most_recent) {
                Ok(true) => {
                    if let Some(state) = open.cursor.state() {
                        if last_state.as_ref() != Some(&state) {
                            emit(out, Message::state(descriptor.clone(), state.clone())).await;
                            last_state = Some(state);
                        }
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    failure = Some(e);
                    break 'partitions;
                }
            }
        }
    }
    drop(partitions);

    let group_failed = AtomicBool::new(false);
    finish(&run, &mut *open.cursor, last_state, failure, out, &group_failed).await
}

/// Terminal messages for one stream. On failure the ERROR trace comes
/// first, then the last safe STATE, then INCOMPLETE.
async fn finish(
    run: &Arc<StreamRun>,
    cursor: &mut dyn Cursor,
    last_state: Option<Value>,
    failure: Option<SourceError>,
    out: &mpsc::Sender<Message>,
    group_failed: &AtomicBool,
) -> Option<String> {
    let descriptor = StreamDescriptor::new(run.name());
    let failure = match failure {
        None if run.is_timezone_mismatched() => Some(run.timezone_error()),
        other => other,
    };
    let emitted_at = run.read_context().emitted_at();

    match failure {
        None => {
            if let Some(parent_state) = run.read_context().take_parent_state(run.name()) {
                cursor.set_parent_state(parent_state);
            }
            if let Some(state) = cursor.state() {
                if last_state.as_ref() != Some(&state) {
                    emit(out, Message::state(descriptor.clone(), state)).await;
                }
            }
            info!(stream = %run.name(), "Stream complete");
            emit(out, Message::stream_status(descriptor, StreamStatus::Complete, emitted_at)).await;
            None
        }
        Some(e) => {
            group_failed.store(true, Ordering::SeqCst);
            error!(stream = %run.name(), error = %e, "Stream failed");
            emit(
                out,
                Message::error(
                    Some(descriptor.clone()),
                    format!("Stream '{}' failed: {}", run.name(), e),
                    Some(format!("{:?}", e)),
                    e.failure_type(),
                    emitted_at,
                ),
            )
            .await;
            if let Some(state) = cursor.state() {
                emit(out, Message::state(descriptor.clone(), state)).await;
            }
            emit(out, Message::stream_status(descriptor, StreamStatus::Incomplete, emitted_at)).await;
            Some(run.name().to_string())
        }
    }
}

async fn emit(out: &mpsc::Sender<Message>, message: Message) {
    if out.send(message).await.is_err() {
        debug!("Output closed; dropping message");
    }
}
