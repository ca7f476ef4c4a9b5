use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod catalog;

pub use catalog::{
    validate_catalog, Catalog, CatalogError, ConfiguredCatalog, ConfiguredStream,
    StreamDefinition, SyncMode,
};

use crate::error::FailureType;

/// Identifies a stream. State and traces are keyed by it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl StreamDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }
}

impl std::fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}.{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A protocol message as written to stdout, one JSON document per line.
///
/// The envelope is tagged by `type`; the payload lives under a key named
/// after the message kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "RECORD")]
    Record { record: RecordMessage },

    #[serde(rename = "STATE")]
    State { state: StateMessage },

    #[serde(rename = "TRACE")]
    Trace { trace: TraceMessage },

    #[serde(rename = "LOG")]
    Log { log: LogMessage },

    #[serde(rename = "CONNECTION_STATUS")]
    ConnectionStatus {
        #[serde(rename = "connectionStatus")]
        connection_status: ConnectionStatus,
    },

    #[serde(rename = "CATALOG")]
    Catalog { catalog: Catalog },
}

impl Message {
    pub fn record(stream: &str, data: Map<String, Value>, emitted_at: i64) -> Self {
        Message::Record {
            record: RecordMessage {
                stream: stream.to_string(),
                namespace: None,
                data,
                emitted_at,
            },
        }
    }

    pub fn state(descriptor: StreamDescriptor, stream_state: Value) -> Self {
        Message::State {
            state: StateMessage::stream(descriptor, stream_state),
        }
    }

    pub fn stream_status(
        descriptor: StreamDescriptor,
        status: StreamStatus,
        emitted_at: i64,
    ) -> Self {
        Message::Trace {
            trace: TraceMessage {
                trace_type: TraceType::StreamStatus,
                emitted_at,
                error: None,
                stream_status: Some(StreamStatusTrace {
                    stream_descriptor: descriptor,
                    status,
                }),
                estimate: None,
            },
        }
    }

    pub fn error(
        descriptor: Option<StreamDescriptor>,
        message: String,
        internal_message: Option<String>,
        failure_type: FailureType,
        emitted_at: i64,
    ) -> Self {
        Message::Trace {
            trace: TraceMessage {
                trace_type: TraceType::Error,
                emitted_at,
                error: Some(ErrorTrace {
                    message,
                    internal_message,
                    failure_type,
                    stream_descriptor: descriptor,
                }),
                stream_status: None,
                estimate: None,
            },
        }
    }

    pub fn connection_status(status: Status, message: Option<String>) -> Self {
        Message::ConnectionStatus {
            connection_status: ConnectionStatus { status, message },
        }
    }

    /// Serializes the message as a single NDJSON line (no trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordMessage {
    pub stream: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub data: Map<String, Value>,

    /// Unix epoch milliseconds
    pub emitted_at: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    Stream,
    Global,
    Legacy,
}

/// Checkpoint payload. Only per-stream state is produced; other kinds are
/// accepted on input and ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    #[serde(rename = "type")]
    pub state_type: StateType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamState>,
}

impl StateMessage {
    pub fn stream(descriptor: StreamDescriptor, stream_state: Value) -> Self {
        Self {
            state_type: StateType::Stream,
            stream: Some(StreamState {
                stream_descriptor: descriptor,
                stream_state,
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub stream_descriptor: StreamDescriptor,

    #[serde(default)]
    pub stream_state: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceType {
    Error,
    Estimate,
    StreamStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceMessage {
    #[serde(rename = "type")]
    pub trace_type: TraceType,

    pub emitted_at: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorTrace>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_status: Option<StreamStatusTrace>,

    /// Passed through untouched when present on input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorTrace {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_message: Option<String>,

    pub failure_type: FailureType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_descriptor: Option<StreamDescriptor>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamStatus {
    Started,
    Running,
    Complete,
    Incomplete,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamStatusTrace {
    pub stream_descriptor: StreamDescriptor,
    pub status: StreamStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub status: Status,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
