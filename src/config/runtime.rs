use super::RuntimeConfig;

impl RuntimeConfig {
    /// Build from env vars, falling back to defaults.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Overlay `TRIBUTARY_*` env vars onto an existing config. Unparseable
    /// values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_parse::<u64>("TRIBUTARY_REQUEST_TIMEOUT_SECS") {
            self.http.request_timeout_secs = n;
        }
        if let Some(n) = env_parse::<u32>("TRIBUTARY_MAX_RETRIES") {
            self.http.max_retries = n;
        }
        if let Some(n) = env_parse::<f64>("TRIBUTARY_BACKOFF_FACTOR_SECS") {
            self.http.backoff_factor_secs = n;
        }
        if let Some(n) = env_parse::<f64>("TRIBUTARY_MAX_BACKOFF_SECS") {
            self.http.max_backoff_secs = n;
        }
        if let Ok(v) = std::env::var("TRIBUTARY_USER_AGENT") {
            if !v.is_empty() {
                self.http.user_agent = v;
            }
        }
        if let Some(n) = env_parse::<usize>("TRIBUTARY_OUTPUT_BUFFER") {
            self.reader.output_buffer = n.max(1);
        }
        if let Some(n) = env_parse::<u64>("TRIBUTARY_MAX_PAGES_PER_SLICE") {
            self.reader.max_pages_per_slice = n;
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_overrides() {
        std::env::set_var("TRIBUTARY_MAX_RETRIES", "9");
        std::env::set_var("TRIBUTARY_OUTPUT_BUFFER", "not-a-number");
        let cfg = RuntimeConfig::from_env();
        std::env::remove_var("TRIBUTARY_MAX_RETRIES");
        std::env::remove_var("TRIBUTARY_OUTPUT_BUFFER");

        assert_eq!(cfg.http.max_retries, 9);
        assert_eq!(cfg.reader.output_buffer, 1000);
    }
}
