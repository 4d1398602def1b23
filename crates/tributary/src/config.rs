//! Configuration for the connection pool and the aggregating processor
//!
//! Both sections deserialize from YAML or JSON and are validated before any
//! pool or processor is constructed, so a bad value fails at startup instead
//! of on the first write.
//!
//! ```yaml
//! pool:
//!   name: events
//!   endpoints: ["ch-1:8123", "ch-2:8123"]
//!   max_size: 8
//! processor:
//!   max_package_size: 5000
//!   processing_thread_count: 4
//!   processing_queue_max_size: 64
//!   timer_period_ms: 1000
//! clickhouse:
//!   database: analytics
//!   user: ingest
//!   password: secret
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use validator::Validate;

use crate::error::{Error, Result};

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct PoolConfig {
    /// Pool name, used in log output
    #[serde(default = "default_pool_name")]
    #[validate(length(min = 1, max = 255))]
    pub name: String,

    /// Ordered list of equivalent backend endpoints
    #[validate(length(min = 1))]
    pub endpoints: Vec<String>,

    /// Maximum number of live connections
    #[serde(default = "default_max_size", alias = "connection_pool_max_size")]
    #[validate(range(min = 1))]
    pub max_size: usize,

    /// Maximum time to wait for a free slot when renting
    #[serde(default = "default_acquire_timeout_ms")]
    #[validate(range(min = 1))]
    pub acquire_timeout_ms: u64,
}

fn default_pool_name() -> String {
    "tributary".to_string()
}

fn default_max_size() -> usize {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: default_pool_name(),
            endpoints: Vec::new(),
            max_size: default_max_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl PoolConfig {
    /// Create a pool config for the given endpoints
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the pool name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Acquire timeout as a duration
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Validate field ranges and endpoint addresses
    pub fn validate_config(&self) -> Result<()> {
        self.validate()?;
        if let Some(pos) = self.endpoints.iter().position(|e| e.trim().is_empty()) {
            return Err(Error::config(format!("endpoint #{} is blank", pos)));
        }
        Ok(())
    }
}

/// Aggregating queue processor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ProcessorConfig {
    /// Processor name, used for worker thread names and log output
    #[serde(default = "default_processor_name")]
    #[validate(length(min = 1, max = 255))]
    pub name: String,

    /// Maximum number of items per package
    #[serde(default = "default_max_package_size")]
    #[validate(range(min = 1))]
    pub max_package_size: usize,

    /// Number of worker threads draining the processing queue
    #[serde(default = "default_processing_thread_count", alias = "processing_threads_count")]
    #[validate(range(min = 1, max = 1024))]
    pub processing_thread_count: usize,

    /// Capacity of the processing queue, in packages
    #[serde(default = "default_processing_queue_max_size", alias = "queue_max_size")]
    #[validate(range(min = 1))]
    pub processing_queue_max_size: usize,

    /// Period of the flush timer
    #[serde(default = "default_timer_period_ms")]
    #[validate(range(min = 1))]
    pub timer_period_ms: u64,
}

fn default_processor_name() -> String {
    "aggregating-queue-processor".to_string()
}

fn default_max_package_size() -> usize {
    1000
}

fn default_processing_thread_count() -> usize {
    2
}

fn default_processing_queue_max_size() -> usize {
    100
}

fn default_timer_period_ms() -> u64 {
    1000
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: default_processor_name(),
            max_package_size: default_max_package_size(),
            processing_thread_count: default_processing_thread_count(),
            processing_queue_max_size: default_processing_queue_max_size(),
            timer_period_ms: default_timer_period_ms(),
        }
    }
}

impl ProcessorConfig {
    /// Create a processor config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the processor name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set maximum package size
    pub fn with_max_package_size(mut self, size: usize) -> Self {
        self.max_package_size = size;
        self
    }

    /// Set worker thread count
    pub fn with_processing_thread_count(mut self, count: usize) -> Self {
        self.processing_thread_count = count;
        self
    }

    /// Set processing queue capacity
    pub fn with_processing_queue_max_size(mut self, size: usize) -> Self {
        self.processing_queue_max_size = size;
        self
    }

    /// Set timer period
    pub fn with_timer_period(mut self, period: Duration) -> Self {
        self.timer_period_ms = period.as_millis() as u64;
        self
    }

    /// Timer period as a duration
    pub fn timer_period(&self) -> Duration {
        Duration::from_millis(self.timer_period_ms)
    }

    /// Validate field ranges
    pub fn validate_config(&self) -> Result<()> {
        self.validate()?;
        Ok(())
    }
}

/// Settings for the ClickHouse HTTP connector
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ClickHouseConfig {
    /// Database statements run against
    #[serde(default = "default_database")]
    #[validate(length(min = 1, max = 255))]
    pub database: String,

    /// User for HTTP basic authentication
    #[serde(default = "default_user")]
    #[validate(length(min = 1, max = 255))]
    pub user: String,

    /// Password for HTTP basic authentication
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Timeout for establishing the TCP connection to an endpoint
    #[serde(default = "default_connect_timeout_ms")]
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,

    /// Timeout for a whole request, response body included
    #[serde(default = "default_request_timeout_ms")]
    #[validate(range(min = 1))]
    pub request_timeout_ms: u64,
}

fn default_database() -> String {
    "default".to_string()
}

fn default_user() -> String {
    "default".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            user: default_user(),
            password: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl fmt::Debug for ClickHouseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClickHouseConfig")
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

impl ClickHouseConfig {
    /// Settings with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the database
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set user and password
    pub fn with_credentials(mut self, user: impl Into<String>, password: Option<String>) -> Self {
        self.user = user.into();
        self.password = password;
        self
    }

    /// Set the TCP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the per-request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Top-level configuration file layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct IngestConfig {
    /// Connection pool section
    #[validate(nested)]
    pub pool: PoolConfig,

    /// Processor section
    #[serde(default)]
    #[validate(nested)]
    pub processor: ProcessorConfig,

    /// ClickHouse connector section
    #[serde(default)]
    #[validate(nested)]
    pub clickhouse: ClickHouseConfig,
}

impl IngestConfig {
    /// Parse and validate YAML
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(s)
            .map_err(|e| Error::config(format!("invalid YAML configuration: {}", e)))?;
        config.validate_config()?;
        Ok(config)
    }

    /// Parse and validate JSON
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)
            .map_err(|e| Error::config(format!("invalid JSON configuration: {}", e)))?;
        config.validate_config()?;
        Ok(config)
    }

    /// Load from a file; `.json` files are parsed as JSON, anything else as YAML
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read configuration {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_yaml_str(&content),
        }
    }

    /// Validate both sections
    pub fn validate_config(&self) -> Result<()> {
        self.pool.validate_config()?;
        self.processor.validate_config()?;
        self.clickhouse.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new(["ch-1:9000", "ch-2:9000"])
            .with_name("events")
            .with_max_size(4)
            .with_acquire_timeout(Duration::from_secs(5));

        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.name, "events");
        assert_eq!(config.max_size, 4);
        assert_eq!(config.acquire_timeout(), Duration::from_secs(5));
        assert!(config.validate_config().is_ok());
    }

    #[test]
    fn test_pool_config_rejects_empty_endpoints() {
        let err = PoolConfig::default().validate_config().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_pool_config_rejects_blank_endpoint() {
        let err = PoolConfig::new(["ch-1:9000", "  "])
            .validate_config()
            .unwrap_err();
        assert!(err.to_string().contains("#1"));
    }

    #[test]
    fn test_processor_config_rejects_zero_sizes() {
        assert!(ProcessorConfig::new()
            .with_max_package_size(0)
            .validate_config()
            .is_err());
        assert!(ProcessorConfig::new()
            .with_processing_thread_count(0)
            .validate_config()
            .is_err());
        assert!(ProcessorConfig::new()
            .with_processing_queue_max_size(0)
            .validate_config()
            .is_err());
        assert!(ProcessorConfig::new()
            .with_timer_period(Duration::ZERO)
            .validate_config()
            .is_err());
    }

    #[test]
    fn test_yaml_defaults() {
        let config = IngestConfig::from_yaml_str("pool:\n  endpoints: [\"a:1\"]\n").unwrap();
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.processor, ProcessorConfig::default());
        assert_eq!(config.clickhouse, ClickHouseConfig::default());
    }

    #[test]
    fn test_clickhouse_section() {
        let yaml = r#"
pool:
  endpoints: ["a:8123"]
clickhouse:
  database: analytics
  user: ingest
  password: hunter2
  request_timeout_ms: 1500
"#;
        let config = IngestConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.clickhouse.database, "analytics");
        assert_eq!(config.clickhouse.password.as_deref(), Some("hunter2"));
        assert_eq!(
            config.clickhouse.request_timeout(),
            Duration::from_millis(1500)
        );
        assert_eq!(config.clickhouse.connect_timeout(), Duration::from_secs(5));

        let debug = format!("{:?}", config.clickhouse);
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_yaml_aliases() {
        let yaml = r#"
pool:
  endpoints: ["a:1", "b:2"]
  connection_pool_max_size: 3
processor:
  max_package_size: 10
  processing_threads_count: 5
  queue_max_size: 7
  timer_period_ms: 250
"#;
        let config = IngestConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.pool.max_size, 3);
        assert_eq!(config.processor.processing_thread_count, 5);
        assert_eq!(config.processor.processing_queue_max_size, 7);
        assert_eq!(config.processor.timer_period(), Duration::from_millis(250));
    }
}
