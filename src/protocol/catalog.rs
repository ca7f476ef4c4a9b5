use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    FullRefresh,
    Incremental,
}

/// A stream as advertised by `discover`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default)]
    pub json_schema: Value,

    #[serde(default)]
    pub supported_sync_modes: Vec<SyncMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_defined_cursor: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_cursor_field: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_defined_primary_key: Option<Vec<Vec<String>>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub streams: Vec<StreamDefinition>,
}

/// A stream selected for a sync, with the requested mode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredStream {
    pub stream: StreamDefinition,

    pub sync_mode: SyncMode,

    /// Destination hint, carried through untouched
    #[serde(default = "default_destination_sync_mode")]
    pub destination_sync_mode: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_field: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<Vec<Vec<String>>>,
}

fn default_destination_sync_mode() -> String {
    "append".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredCatalog {
    pub streams: Vec<ConfiguredStream>,
}

impl ConfiguredCatalog {
    /// Convenience constructor used by tests and the CLI.
    pub fn from_streams<I, S>(streams: I) -> Self
    where
        I: IntoIterator<Item = (S, SyncMode)>,
        S: Into<String>,
    {
        Self {
            streams: streams
                .into_iter()
                .map(|(name, sync_mode)| ConfiguredStream {
                    stream: StreamDefinition {
                        name: name.into(),
                        namespace: None,
                        json_schema: Value::Object(Default::default()),
                        supported_sync_modes: vec![sync_mode],
                        source_defined_cursor: None,
                        default_cursor_field: None,
                        source_defined_primary_key: None,
                    },
                    sync_mode,
                    destination_sync_mode: default_destination_sync_mode(),
                    cursor_field: None,
                    primary_key: None,
                })
                .collect(),
        }
    }
}

/// Catalog validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogError {
    EmptyStreamName,
    DuplicateStream(String),
    UnsupportedSyncMode { stream: String, mode: SyncMode },
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::EmptyStreamName => write!(f, "stream name is required"),
            CatalogError::DuplicateStream(s) => {
                write!(f, "stream '{}' is configured more than once", s)
            }
            CatalogError::UnsupportedSyncMode { stream, mode } => {
                write!(f, "stream '{}' does not support sync mode {:?}", stream, mode)
            }
        }
    }
}

impl std::error::Error for CatalogError {}

/// Validates a configured catalog before a read.
///
/// Rules:
/// - Every stream has a name
/// - A stream appears at most once (by name and namespace)
/// - The requested sync mode is one the stream advertises, when it
///   advertises any
pub fn validate_catalog(catalog: &ConfiguredCatalog) -> Result<(), CatalogError> {
    let mut seen = HashSet::new();
    for configured in &catalog.streams {
        let stream = &configured.stream;
        if stream.name.is_empty() {
            return Err(CatalogError::EmptyStreamName);
        }
        if !seen.insert((stream.namespace.clone(), stream.name.clone())) {
            return Err(CatalogError::DuplicateStream(stream.name.clone()));
        }
        if !stream.supported_sync_modes.is_empty()
            && !stream.supported_sync_modes.contains(&configured.sync_mode)
        {
            return Err(CatalogError::UnsupportedSyncMode {
                stream: stream.name.clone(),
                mode: configured.sync_mode,
            });
        }
    }
    Ok(())
}
