mod connector;
pub mod runtime;

pub use connector::ConnectorConfig;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Runtime settings, independent of any one connector.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
}

/// HTTP client and retry policy
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Retries per request after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base of the exponential backoff (factor * 2^attempt)
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor_secs: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: f64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_factor() -> f64 {
    5.0
}

fn default_max_backoff() -> f64 {
    300.0
}

fn default_user_agent() -> String {
    format!("tributary/{}", env!("CARGO_PKG_VERSION"))
}

impl HttpConfig {
    /// Upper bound on any single wait between attempts.
    pub fn max_backoff(&self) -> Duration {
        Duration::try_from_secs_f64(self.max_backoff_secs.max(0.0)).unwrap_or(Duration::MAX)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
            backoff_factor_secs: default_backoff_factor(),
            max_backoff_secs: default_max_backoff(),
            user_agent: default_user_agent(),
        }
    }
}

/// Reader limits
#[derive(Debug, Clone, Deserialize)]
pub struct ReaderConfig {
    /// Capacity of the message channel between workers and the sink
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,
    /// Pages fetched for one slice before pagination is cut off
    #[serde(default = "default_max_pages")]
    pub max_pages_per_slice: u64,
}

fn default_output_buffer() -> usize {
    1000
}

fn default_max_pages() -> u64 {
    10_000
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            output_buffer: default_output_buffer(),
            max_pages_per_slice: default_max_pages(),
        }
    }
}

/// Load runtime configuration from a TOML file.
pub fn load_config(path: &str) -> Result<RuntimeConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read runtime config {}", path))?;
    let config: RuntimeConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.http.request_timeout_secs, 60);
        assert_eq!(config.http.max_retries, 5);
        assert_eq!(config.http.backoff_factor_secs, 5.0);
        assert_eq!(config.reader.output_buffer, 1000);
        assert_eq!(config.reader.max_pages_per_slice, 10_000);
        assert!(config.http.user_agent.starts_with("tributary/"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [http]
            request_timeout_secs = 10
            max_retries = 2
            backoff_factor_secs = 0.5

            [reader]
            max_pages_per_slice = 50
        "#;

        let config: RuntimeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.http.request_timeout_secs, 10);
        assert_eq!(config.http.max_retries, 2);
        assert_eq!(config.http.backoff_factor_secs, 0.5);
        assert_eq!(config.http.max_backoff_secs, 300.0);
        assert_eq!(config.reader.max_pages_per_slice, 50);
        assert_eq!(config.reader.output_buffer, 1000);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(config.http.max_retries, 5);
        assert_eq!(config.reader.output_buffer, 1000);
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[reader]\noutput_buffer = 8").unwrap();
        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.reader.output_buffer, 8);
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config("/nonexistent/runtime.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read runtime config"));
    }
}
