//! Manifest loading.
//!
//! ```text
//!   YAML ──serde_yaml──▶ JSON tree ──refs──▶ resolved tree
//!                                              │
//!                               model (serde) + factory
//!                                              ▼
//!                    Manifest { streams: Vec<Arc<DeclarativeStream>>, .. }
//! ```

mod factory;
mod model;
mod refs;

pub use factory::ComponentFactory;
pub use refs::{merge_parameters, resolve_references, PARAMETERS_KEY};

use anyhow::Context as _;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tributary::error::{Result, SourceError};

use crate::interpolation::{Context, Template};
use crate::stream::DeclarativeStream;
use model::ManifestModel;

/// A lowered manifest.
#[derive(Debug)]
pub struct Manifest {
    pub version: Option<String>,
    pub streams: Vec<Arc<DeclarativeStream>>,
    /// `check.stream_names`; empty means every non-substream stream
    pub check_streams: Vec<String>,
    pub concurrency: Option<ConcurrencyLevel>,
}

impl Manifest {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let tree: Value = serde_yaml::from_str(text)
            .map_err(|e| SourceError::Manifest(format!("not valid YAML: {}", e)))?;
        Self::from_value(tree)
    }

    pub fn from_value(tree: Value) -> Result<Self> {
        let resolved = resolve_references(&tree)?;
        let model: ManifestModel = serde_json::from_value(resolved)
            .map_err(|e| SourceError::Manifest(e.to_string()))?;

        let mut factory = ComponentFactory::new(&model.streams);
        let mut streams = Vec::with_capacity(model.streams.len());
        let mut seen = HashSet::new();
        for raw in &model.streams {
            let name = raw
                .get("name")
                .and_then(Value::as_str)
                .or_else(|| raw.get(PARAMETERS_KEY).and_then(|p| p.get("name")).and_then(Value::as_str))
                .ok_or_else(|| SourceError::Manifest("stream without a name".into()))?;
            if !seen.insert(name.to_string()) {
                return Err(SourceError::Manifest(format!("duplicate stream '{}'", name)));
            }
            streams.push(factory.stream_by_name(name)?);
        }

        let concurrency = model
            .concurrency_level
            .map(|level| {
                Ok::<_, SourceError>(ConcurrencyLevel {
                    default_concurrency: Template::compile(&level.default_concurrency)?,
                    max_concurrency: level.max_concurrency,
                })
            })
            .transpose()?;

        info!(streams = streams.len(), version = ?model.version, "Manifest loaded");
        Ok(Self {
            version: model.version,
            streams,
            check_streams: model.check.map(|c| c.stream_names).unwrap_or_default(),
            concurrency,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("Failed to load manifest {}", path.display()))
    }

    pub fn stream(&self, name: &str) -> Option<&Arc<DeclarativeStream>> {
        self.streams.iter().find(|s| s.name == name)
    }

    /// Worker count for the concurrent group. 1 without `concurrency_level`.
    pub fn concurrency(&self, ctx: &Context) -> Result<usize> {
        match &self.concurrency {
            Some(level) => level.concurrency(ctx),
            None => Ok(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConcurrencyLevel {
    pub default_concurrency: Template,
    pub max_concurrency: Option<u64>,
}

impl ConcurrencyLevel {
    /// Interpolated `default_concurrency`, floored and clamped to
    /// `[1, max_concurrency]`.
    pub fn concurrency(&self, ctx: &Context) -> Result<usize> {
        let value = self.default_concurrency.eval(ctx)?;
        let requested = match &value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .ok_or_else(|| SourceError::Config(format!("default_concurrency must be a number, got {}", value)))?;

        let mut concurrency = requested.floor().max(1.0) as u64;
        if let Some(max) = self.max_concurrency {
            concurrency = concurrency.min(max.max(1));
        }
        Ok(concurrency as usize)
    }
}
