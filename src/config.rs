//! Runtime configuration loaded from environment variables
//!
//! Every option has a default except where noted; invalid values are
//! rejected up front so a run never starts with a half-valid config.

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Retry settings for platform requests
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first call (so at most `max_attempts + 1` calls)
    pub max_attempts: u32,
    pub base: Duration,
    pub max_delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub api_base_url: String,
    pub request_timeout: Duration,
    /// Maximum requests in flight (`C`)
    pub max_concurrency: usize,
    /// Minimum spacing between request starts across the process (`D`)
    pub min_request_spacing: Duration,
    /// Logical metric workers; may exceed `max_concurrency`
    pub workers: usize,
    pub metrics_ttl: Duration,
    pub state_file: PathBuf,
    pub run_timeout: Duration,
    /// Page budget per account and run
    pub max_pages: u32,
    pub page_limit: u32,
    pub retry: RetryConfig,
    pub heartbeat_interval: Duration,
    pub sheet_db_path: PathBuf,
    pub accounts_tab: String,
    pub metrics_tab: String,
}

impl RuntimeConfig {
    /// Load configuration from the process environment
    ///
    /// Environment variables:
    /// - `THREADS_API_BASE_URL` (default: https://graph.threads.net/v1.0)
    /// - `THREADS_REQUEST_TIMEOUT_SECS` (default: 30)
    /// - `THREADS_CONCURRENCY` (default: 5)
    /// - `THREADS_MIN_SPACING_MS` (default: 200)
    /// - `THREADS_WORKERS` (default: 2 x concurrency)
    /// - `THREADS_METRICS_TTL_MIN` (default: 60)
    /// - `THREADS_STATE_FILE` (default: state.json)
    /// - `THREADS_RUN_TIMEOUT_MIN` (default: 50)
    /// - `THREADS_MAX_PAGES` (default: 50)
    /// - `THREADS_PAGE_LIMIT` (default: 25)
    /// - `THREADS_RETRY_MAX_ATTEMPTS` (default: 3)
    /// - `THREADS_RETRY_BASE_MS` (default: 1000)
    /// - `THREADS_RETRY_MAX_DELAY_MS` (default: 30000)
    /// - `THREADS_HEARTBEAT_SECS` (default: 30)
    /// - `THREADS_SHEET_DB` (default: sheets.db)
    /// - `THREADS_ACCOUNTS_TAB` (default: accounts_threads)
    /// - `THREADS_METRICS_TAB` (default: posts_metrics)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_base_url = lookup("THREADS_API_BASE_URL")
            .unwrap_or_else(|| "https://graph.threads.net/v1.0".to_string())
            .trim_end_matches('/')
            .to_string();

        if !api_base_url.starts_with("http://") && !api_base_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "THREADS_API_BASE_URL must start with http:// or https://".to_string(),
            ));
        }

        let request_timeout_secs: u64 = parse_or(&lookup, "THREADS_REQUEST_TIMEOUT_SECS", 30)?;
        let max_concurrency: usize = parse_or(&lookup, "THREADS_CONCURRENCY", 5)?;
        let min_spacing_ms: i64 = parse_or(&lookup, "THREADS_MIN_SPACING_MS", 200)?;
        let workers: usize = parse_or(&lookup, "THREADS_WORKERS", max_concurrency.saturating_mul(2))?;
        let ttl_minutes: u64 = parse_or(&lookup, "THREADS_METRICS_TTL_MIN", 60)?;
        let run_timeout_minutes: u64 = parse_or(&lookup, "THREADS_RUN_TIMEOUT_MIN", 50)?;
        let max_pages: u32 = parse_or(&lookup, "THREADS_MAX_PAGES", 50)?;
        let page_limit: u32 = parse_or(&lookup, "THREADS_PAGE_LIMIT", 25)?;
        let max_attempts: u32 = parse_or(&lookup, "THREADS_RETRY_MAX_ATTEMPTS", 3)?;
        let retry_base_ms: u64 = parse_or(&lookup, "THREADS_RETRY_BASE_MS", 1_000)?;
        let retry_max_delay_ms: u64 = parse_or(&lookup, "THREADS_RETRY_MAX_DELAY_MS", 30_000)?;
        let heartbeat_secs: u64 = parse_or(&lookup, "THREADS_HEARTBEAT_SECS", 30)?;

        require_positive("THREADS_REQUEST_TIMEOUT_SECS", request_timeout_secs)?;
        require_positive("THREADS_CONCURRENCY", max_concurrency as u64)?;
        require_positive("THREADS_WORKERS", workers as u64)?;
        require_positive("THREADS_METRICS_TTL_MIN", ttl_minutes)?;
        require_positive("THREADS_RUN_TIMEOUT_MIN", run_timeout_minutes)?;
        require_positive("THREADS_MAX_PAGES", max_pages as u64)?;
        require_positive("THREADS_PAGE_LIMIT", page_limit as u64)?;
        require_positive("THREADS_HEARTBEAT_SECS", heartbeat_secs)?;

        if min_spacing_ms < 0 {
            return Err(ConfigError::InvalidValue(format!(
                "THREADS_MIN_SPACING_MS must not be negative, got {}",
                min_spacing_ms
            )));
        }

        if retry_max_delay_ms < retry_base_ms {
            return Err(ConfigError::InvalidValue(format!(
                "THREADS_RETRY_MAX_DELAY_MS ({}) must be >= THREADS_RETRY_BASE_MS ({})",
                retry_max_delay_ms, retry_base_ms
            )));
        }

        Ok(Self {
            api_base_url,
            request_timeout: Duration::from_secs(request_timeout_secs),
            max_concurrency,
            min_request_spacing: Duration::from_millis(min_spacing_ms as u64),
            workers,
            metrics_ttl: Duration::from_secs(ttl_minutes * 60),
            state_file: PathBuf::from(
                lookup("THREADS_STATE_FILE").unwrap_or_else(|| "state.json".to_string()),
            ),
            run_timeout: Duration::from_secs(run_timeout_minutes * 60),
            max_pages,
            page_limit,
            retry: RetryConfig {
                max_attempts,
                base: Duration::from_millis(retry_base_ms),
                max_delay: Duration::from_millis(retry_max_delay_ms),
            },
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            sheet_db_path: PathBuf::from(
                lookup("THREADS_SHEET_DB").unwrap_or_else(|| "sheets.db".to_string()),
            ),
            accounts_tab: non_empty_or(&lookup, "THREADS_ACCOUNTS_TAB", "accounts_threads")?,
            metrics_tab: non_empty_or(&lookup, "THREADS_METRICS_TAB", "posts_metrics")?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|_| {
            ConfigError::InvalidValue(format!("{} must be a number, got '{}'", key, raw))
        }),
    }
}

fn require_positive(key: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "{} must be a positive number",
            key
        )));
    }
    Ok(())
}

fn non_empty_or<F>(lookup: &F, key: &str, default: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default.to_string()),
        Some(value) if value.trim().is_empty() => Err(ConfigError::MissingVariable(key.to_string())),
        Some(value) => Ok(value.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<RuntimeConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RuntimeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.api_base_url, "https://graph.threads.net/v1.0");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.workers, 10);
        assert_eq!(config.min_request_spacing, Duration::from_millis(200));
        assert_eq!(config.metrics_ttl, Duration::from_secs(3600));
        assert_eq!(config.state_file, PathBuf::from("state.json"));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.accounts_tab, "accounts_threads");
        assert_eq!(config.metrics_tab, "posts_metrics");
    }

    #[test]
    fn test_custom_config() {
        let config = config_from(&[
            ("THREADS_API_BASE_URL", "http://localhost:9000/"),
            ("THREADS_CONCURRENCY", "2"),
            ("THREADS_MIN_SPACING_MS", "0"),
            ("THREADS_METRICS_TTL_MIN", "15"),
            ("THREADS_STATE_FILE", "/tmp/threads-state.json"),
            ("THREADS_RETRY_MAX_ATTEMPTS", "5"),
        ])
        .unwrap();

        assert_eq!(config.api_base_url, "http://localhost:9000");
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.workers, 4);
        assert_eq!(config.min_request_spacing, Duration::ZERO);
        assert_eq!(config.metrics_ttl, Duration::from_secs(900));
        assert_eq!(config.state_file, PathBuf::from("/tmp/threads-state.json"));
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            config_from(&[("THREADS_CONCURRENCY", "0")]),
            Err(ConfigError::InvalidValue(_))
        ));
        assert!(matches!(
            config_from(&[("THREADS_MIN_SPACING_MS", "-5")]),
            Err(ConfigError::InvalidValue(_))
        ));
        assert!(matches!(
            config_from(&[("THREADS_METRICS_TTL_MIN", "abc")]),
            Err(ConfigError::InvalidValue(_))
        ));
        assert!(matches!(
            config_from(&[("THREADS_API_BASE_URL", "graph.threads.net")]),
            Err(ConfigError::InvalidValue(_))
        ));
        assert!(matches!(
            config_from(&[("THREADS_RETRY_BASE_MS", "5000"), ("THREADS_RETRY_MAX_DELAY_MS", "100")]),
            Err(ConfigError::InvalidValue(_))
        ));
        assert_eq!(
            config_from(&[("THREADS_METRICS_TAB", "  ")]),
            Err(ConfigError::MissingVariable("THREADS_METRICS_TAB".to_string()))
        );
    }
}
