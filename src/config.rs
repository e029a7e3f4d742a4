//! Configuration for the shipper.
//!
//! Settings are read from `LOKI_SHIPPER_*` environment variables, validated,
//! and turned into the [`DispatcherConfig`] the delivery engine runs with.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::batcher::{
    BatchConfig, DEFAULT_MAX_BATCH_BYTES, DEFAULT_MAX_BATCH_ENTRIES, DEFAULT_MAX_BATCH_WAIT,
    DEFAULT_MAX_BUFFERED_BYTES, DEFAULT_MAX_LINE_BYTES,
};
use crate::client::PUSH_PATH;
use crate::dispatcher::{
    BackpressureMode, DispatcherConfig, DEFAULT_BLOCK_TIMEOUT, DEFAULT_WORKERS,
    DEFAULT_WORKER_QUEUE_CAPACITY,
};
use crate::entry::LabelPolicy;
use crate::sender::{
    RetryConfig, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF, DEFAULT_MAX_RETRIES,
    DEFAULT_MAX_RETRY_DURATION,
};

/// Default Loki base URL
const DEFAULT_URL: &str = "http://localhost:3100";

/// Default timeout for a single HTTP request in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Upper bound for the worker pool
const MAX_WORKERS: u64 = 64;

/// Authentication attached to every outbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    #[default]
    None,
    Basic {
        username: String,
        password: Option<String>,
    },
    Bearer(String),
}

/// Configuration for the shipper.
///
/// All settings can be configured via environment variables:
/// - `LOKI_SHIPPER_URL`: Loki base URL (default: http://localhost:3100)
/// - `LOKI_SHIPPER_TENANT_ID`: value for the `X-Scope-OrgID` header
/// - `LOKI_SHIPPER_USERNAME` / `LOKI_SHIPPER_PASSWORD`: basic auth
/// - `LOKI_SHIPPER_BEARER_TOKEN`: bearer auth
/// - `LOKI_SHIPPER_REQUEST_TIMEOUT_SECS`: per-request timeout (default: 10)
/// - `LOKI_SHIPPER_MAX_BATCH_BYTES`, `LOKI_SHIPPER_MAX_BATCH_ENTRIES`,
///   `LOKI_SHIPPER_MAX_BATCH_WAIT_MS`, `LOKI_SHIPPER_MAX_BUFFERED_BYTES`,
///   `LOKI_SHIPPER_MAX_LINE_BYTES`: batching limits
/// - `LOKI_SHIPPER_MAX_RETRIES`, `LOKI_SHIPPER_INITIAL_BACKOFF_MS`,
///   `LOKI_SHIPPER_MAX_BACKOFF_MS`, `LOKI_SHIPPER_MAX_RETRY_DURATION_SECS`: retry budget
/// - `LOKI_SHIPPER_BACKPRESSURE`: `block`, `drop_new` or `error` (default: block)
/// - `LOKI_SHIPPER_BLOCK_TIMEOUT_MS`: longest `block` wait (default: 5000)
/// - `LOKI_SHIPPER_COMPRESSION`: gzip payloads (default: true)
/// - `LOKI_SHIPPER_WORKERS`: flush workers (default: 2)
/// - `LOKI_SHIPPER_LABELS`: static labels for the binary, `k=v,k=v`
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the Loki server, without trailing slash
    pub url: String,

    /// Tenant sent as `X-Scope-OrgID`
    pub tenant_id: Option<String>,

    pub credentials: Credentials,

    /// Timeout for a single HTTP request
    pub request_timeout: Duration,

    pub batch: BatchConfig,

    pub retry: RetryConfig,

    pub backpressure: BackpressureMode,

    /// Longest time `enqueue` waits for space in `block` mode
    pub block_timeout: Duration,

    /// Gzip payloads when it makes them smaller
    pub compression: bool,

    /// Number of flush workers
    pub workers: usize,

    /// Labels the binary attaches to every line it reads
    pub static_labels: Vec<(String, String)>,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn new(message: impl Into<String>, env_var: Option<&str>) -> Self {
        Self {
            message: message.into(),
            env_var: env_var.map(str::to_string),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set to something unparsable or
    /// outside its allowed range, or if the settings contradict each other.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use loki_shipper::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Pushing to {}", config.push_url());
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = env::var("LOKI_SHIPPER_URL")
            .unwrap_or_else(|_| DEFAULT_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::new(
                format!("'{}' is not an http(s) URL", url),
                Some("LOKI_SHIPPER_URL"),
            ));
        }

        let tenant_id = non_empty_var("LOKI_SHIPPER_TENANT_ID");
        let credentials = Self::parse_credentials()?;

        let request_timeout = Duration::from_secs(parse_number(
            "LOKI_SHIPPER_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
            1,
            3_600,
        )?);

        let batch = BatchConfig {
            max_batch_bytes: parse_number(
                "LOKI_SHIPPER_MAX_BATCH_BYTES",
                DEFAULT_MAX_BATCH_BYTES as u64,
                1,
                u32::MAX as u64,
            )? as usize,
            max_batch_entries: parse_number(
                "LOKI_SHIPPER_MAX_BATCH_ENTRIES",
                DEFAULT_MAX_BATCH_ENTRIES as u64,
                1,
                1_000_000,
            )? as usize,
            max_batch_wait: Duration::from_millis(parse_number(
                "LOKI_SHIPPER_MAX_BATCH_WAIT_MS",
                DEFAULT_MAX_BATCH_WAIT.as_millis() as u64,
                1,
                3_600_000,
            )?),
            max_buffered_bytes: parse_number(
                "LOKI_SHIPPER_MAX_BUFFERED_BYTES",
                DEFAULT_MAX_BUFFERED_BYTES as u64,
                1,
                u64::MAX,
            )? as usize,
            max_line_bytes: parse_number(
                "LOKI_SHIPPER_MAX_LINE_BYTES",
                DEFAULT_MAX_LINE_BYTES as u64,
                1,
                u32::MAX as u64,
            )? as usize,
            labels: LabelPolicy::default(),
        };

        let retry = RetryConfig {
            initial_backoff: Duration::from_millis(parse_number(
                "LOKI_SHIPPER_INITIAL_BACKOFF_MS",
                DEFAULT_INITIAL_BACKOFF.as_millis() as u64,
                1,
                600_000,
            )?),
            max_backoff: Duration::from_millis(parse_number(
                "LOKI_SHIPPER_MAX_BACKOFF_MS",
                DEFAULT_MAX_BACKOFF.as_millis() as u64,
                1,
                3_600_000,
            )?),
            max_retries: parse_number(
                "LOKI_SHIPPER_MAX_RETRIES",
                DEFAULT_MAX_RETRIES as u64,
                0,
                1_000,
            )? as u32,
            max_retry_duration: Duration::from_secs(parse_number(
                "LOKI_SHIPPER_MAX_RETRY_DURATION_SECS",
                DEFAULT_MAX_RETRY_DURATION.as_secs(),
                1,
                86_400,
            )?),
            send_timeout: request_timeout,
        };

        let backpressure = match env::var("LOKI_SHIPPER_BACKPRESSURE") {
            Ok(value) => value
                .parse()
                .map_err(|e: String| ConfigError::new(e, Some("LOKI_SHIPPER_BACKPRESSURE")))?,
            Err(_) => BackpressureMode::default(),
        };

        let block_timeout = Duration::from_millis(parse_number(
            "LOKI_SHIPPER_BLOCK_TIMEOUT_MS",
            DEFAULT_BLOCK_TIMEOUT.as_millis() as u64,
            0,
            3_600_000,
        )?);

        let compression = parse_bool("LOKI_SHIPPER_COMPRESSION", true)?;
        let workers =
            parse_number("LOKI_SHIPPER_WORKERS", DEFAULT_WORKERS as u64, 1, MAX_WORKERS)? as usize;
        let static_labels = match env::var("LOKI_SHIPPER_LABELS") {
            Ok(value) => parse_labels(&value)
                .map_err(|e| ConfigError::new(e, Some("LOKI_SHIPPER_LABELS")))?,
            Err(_) => Vec::new(),
        };

        let config = Self {
            url,
            tenant_id,
            credentials,
            request_timeout,
            batch,
            retry,
            backpressure,
            block_timeout,
            compression,
            workers,
            static_labels,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check constraints spanning several settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.max_buffered_bytes < self.batch.max_line_bytes {
            return Err(ConfigError::new(
                format!(
                    "max buffered bytes {} is below max line bytes {}",
                    self.batch.max_buffered_bytes, self.batch.max_line_bytes
                ),
                Some("LOKI_SHIPPER_MAX_BUFFERED_BYTES"),
            ));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(ConfigError::new(
                "initial backoff exceeds max backoff",
                Some("LOKI_SHIPPER_INITIAL_BACKOFF_MS"),
            ));
        }
        if self.workers == 0 {
            return Err(ConfigError::new(
                "at least one worker is required",
                Some("LOKI_SHIPPER_WORKERS"),
            ));
        }
        Ok(())
    }

    /// Full URL of the push endpoint.
    pub fn push_url(&self) -> String {
        format!("{}{}", self.url, PUSH_PATH)
    }

    /// Settings for the delivery engine.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            batch: self.batch.clone(),
            retry: self.retry.clone(),
            backpressure: self.backpressure,
            block_timeout: self.block_timeout,
            compression: self.compression,
            workers: self.workers,
            worker_queue_capacity: DEFAULT_WORKER_QUEUE_CAPACITY,
        }
    }

    fn parse_credentials() -> Result<Credentials, ConfigError> {
        let username = non_empty_var("LOKI_SHIPPER_USERNAME");
        let password = non_empty_var("LOKI_SHIPPER_PASSWORD");
        let token = non_empty_var("LOKI_SHIPPER_BEARER_TOKEN");

        match (username, password, token) {
            (None, None, None) => Ok(Credentials::None),
            (None, None, Some(token)) => Ok(Credentials::Bearer(token)),
            (Some(username), password, None) => Ok(Credentials::Basic { username, password }),
            (None, Some(_), None) => Err(ConfigError::new(
                "password set without a username",
                Some("LOKI_SHIPPER_PASSWORD"),
            )),
            (_, _, Some(_)) => Err(ConfigError::new(
                "bearer token and basic auth are mutually exclusive",
                Some("LOKI_SHIPPER_BEARER_TOKEN"),
            )),
        }
    }
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            tenant_id: None,
            credentials: Credentials::None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            backpressure: BackpressureMode::default(),
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            compression: true,
            workers: DEFAULT_WORKERS,
            static_labels: Vec::new(),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a numeric variable with range validation.
fn parse_number<T>(env_var: &str, default: T, min: T, max: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + std::fmt::Display + Copy,
{
    match env::var(env_var) {
        Ok(value) => {
            let parsed: T = value.trim().parse().map_err(|_| {
                ConfigError::new(format!("'{}' is not a valid number", value), Some(env_var))
            })?;

            if parsed < min {
                return Err(ConfigError::new(
                    format!("{} is below minimum ({})", parsed, min),
                    Some(env_var),
                ));
            }
            if parsed > max {
                return Err(ConfigError::new(
                    format!("{} exceeds maximum ({})", parsed, max),
                    Some(env_var),
                ));
            }
            Ok(parsed)
        }
        Err(_) => Ok(default),
    }
}

fn parse_bool(env_var: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(env_var) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::new(
                format!("'{}' is not a valid boolean", value),
                Some(env_var),
            )),
        },
        Err(_) => Ok(default),
    }
}

/// Parse `k=v,k=v` into label pairs.
pub fn parse_labels(value: &str) -> Result<Vec<(String, String)>, String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                Ok((k.trim().to_string(), v.trim().to_string()))
            }
            _ => Err(format!("'{}' is not a name=value pair", pair)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-wide; serialize the tests touching them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.url, "http://localhost:3100");
        assert_eq!(config.push_url(), "http://localhost:3100/loki/api/v1/push");
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.backpressure, BackpressureMode::Block);
        assert!(config.compression);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = lock_env();
        let _guard1 = EnvGuard::remove("LOKI_SHIPPER_URL");
        let _guard2 = EnvGuard::remove("LOKI_SHIPPER_MAX_BATCH_ENTRIES");
        let _guard3 = EnvGuard::remove("LOKI_SHIPPER_BACKPRESSURE");

        let config = Config::from_env().expect("Should load with defaults");
        assert_eq!(config.url, "http://localhost:3100");
        assert_eq!(config.batch.max_batch_entries, DEFAULT_MAX_BATCH_ENTRIES);
        assert_eq!(config.batch.max_batch_wait, Duration::from_secs(1));
        assert_eq!(config.credentials, Credentials::None);
    }

    #[test]
    fn test_config_from_env_custom_values() {
        let _lock = lock_env();
        let _guard1 = EnvGuard::set("LOKI_SHIPPER_URL", "https://logs.example.com:3100/");
        let _guard2 = EnvGuard::set("LOKI_SHIPPER_MAX_BATCH_ENTRIES", "200");
        let _guard3 = EnvGuard::set("LOKI_SHIPPER_BACKPRESSURE", "drop_new");
        let _guard4 = EnvGuard::set("LOKI_SHIPPER_TENANT_ID", "team-a");
        let _guard5 = EnvGuard::set("LOKI_SHIPPER_MAX_BATCH_WAIT_MS", "250");
        let _guard6 = EnvGuard::set("LOKI_SHIPPER_COMPRESSION", "false");

        let config = Config::from_env().expect("Should load custom values");
        assert_eq!(config.url, "https://logs.example.com:3100"); // Trailing slash removed
        assert_eq!(
            config.push_url(),
            "https://logs.example.com:3100/loki/api/v1/push"
        );
        assert_eq!(config.batch.max_batch_entries, 200);
        assert_eq!(config.batch.max_batch_wait, Duration::from_millis(250));
        assert_eq!(config.backpressure, BackpressureMode::DropNew);
        assert_eq!(config.tenant_id.as_deref(), Some("team-a"));
        assert!(!config.compression);

        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.batch.max_batch_entries, 200);
        assert_eq!(dispatcher.backpressure, BackpressureMode::DropNew);
    }

    #[test]
    fn test_invalid_number() {
        let _lock = lock_env();
        let _guard = EnvGuard::set("LOKI_SHIPPER_MAX_BATCH_ENTRIES", "not_a_number");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("not a valid number"));
        assert_eq!(err.env_var.as_deref(), Some("LOKI_SHIPPER_MAX_BATCH_ENTRIES"));
    }

    #[test]
    fn test_number_below_minimum() {
        let _lock = lock_env();
        let _guard = EnvGuard::set("LOKI_SHIPPER_MAX_BATCH_ENTRIES", "0");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("below minimum"));
    }

    #[test]
    fn test_workers_exceed_max() {
        let _lock = lock_env();
        let _guard = EnvGuard::set("LOKI_SHIPPER_WORKERS", "999");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("exceeds maximum"));
    }

    #[test]
    fn test_invalid_backpressure_mode() {
        let _lock = lock_env();
        let _guard = EnvGuard::set("LOKI_SHIPPER_BACKPRESSURE", "spill");

        let err = Config::from_env().unwrap_err();
        assert_eq!(err.env_var.as_deref(), Some("LOKI_SHIPPER_BACKPRESSURE"));
    }

    #[test]
    fn test_invalid_url() {
        let _lock = lock_env();
        let _guard = EnvGuard::set("LOKI_SHIPPER_URL", "localhost:3100");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("not an http(s) URL"));
    }

    #[test]
    fn test_credentials_from_env() {
        let _lock = lock_env();
        let _guard1 = EnvGuard::set("LOKI_SHIPPER_USERNAME", "admin");
        let _guard2 = EnvGuard::set("LOKI_SHIPPER_PASSWORD", "password");
        let _guard3 = EnvGuard::remove("LOKI_SHIPPER_BEARER_TOKEN");

        let config = Config::from_env().unwrap();
        assert_eq!(
            config.credentials,
            Credentials::Basic {
                username: "admin".to_string(),
                password: Some("password".to_string()),
            }
        );
    }

    #[test]
    fn test_conflicting_credentials() {
        let _lock = lock_env();
        let _guard1 = EnvGuard::set("LOKI_SHIPPER_USERNAME", "admin");
        let _guard2 = EnvGuard::set("LOKI_SHIPPER_BEARER_TOKEN", "token");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("mutually exclusive"));
    }

    #[test]
    fn test_buffered_bytes_below_line_bytes() {
        let mut config = Config::default();
        config.batch.max_buffered_bytes = 10;
        config.batch.max_line_bytes = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_labels() {
        assert_eq!(
            parse_labels("app=api, env = prod,").unwrap(),
            vec![
                ("app".to_string(), "api".to_string()),
                ("env".to_string(), "prod".to_string()),
            ]
        );
        assert!(parse_labels("app").is_err());
        assert!(parse_labels("=x").is_err());
        assert!(parse_labels("").unwrap().is_empty());
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError {
            message: "test error".to_string(),
            env_var: Some("TEST_VAR".to_string()),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let error_no_var = ConfigError {
            message: "general error".to_string(),
            env_var: None,
        };
        assert_eq!(
            format!("{}", error_no_var),
            "Configuration error: general error"
        );
    }
}
