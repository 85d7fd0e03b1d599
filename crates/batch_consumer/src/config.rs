//! Consumer configuration.
//!
//! Loaded from TOML; every section and field has a default, so an empty file
//! is a valid configuration.
//!
//! ```toml
//! queue = "reporting"
//!
//! [batch]
//! batch_size_limit = 100
//! batch_timeout_ms = 120000
//!
//! [processing]
//! operation_name = "Report Process"
//! sampling_rate = 1.0
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors from loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Every violation found, not just the first.
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Size and time flush policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Flush as soon as the open batch holds this many messages.
    ///
    /// Default: 100
    pub batch_size_limit: usize,

    /// Period of the flush timer. A non-empty batch is flushed on every tick.
    ///
    /// Default: 120000 (two minutes)
    pub batch_timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size_limit: 100,
            batch_timeout_ms: 120_000,
        }
    }
}

impl BatchConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

/// Batch processing and span recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Name of the aggregate span recorded per batch.
    pub operation_name: String,

    /// Fraction of spans exported, in `[0, 1]`.
    pub sampling_rate: f64,

    /// Record a consumer span per delivery as well.
    pub record_receive_spans: bool,

    /// Upper bound on one batch action run. Unbounded when absent.
    pub action_timeout_ms: Option<u64>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            operation_name: crate::processor::DEFAULT_OPERATION_NAME.to_string(),
            sampling_rate: 1.0,
            record_receive_spans: true,
            action_timeout_ms: None,
        }
    }
}

impl ProcessingConfig {
    pub fn action_timeout(&self) -> Option<Duration> {
        self.action_timeout_ms.map(Duration::from_millis)
    }
}

/// Delivery intake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// Deliveries handled concurrently. `1` handles them strictly in order.
    pub max_in_flight_deliveries: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_in_flight_deliveries: 1,
        }
    }
}

/// Log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset.
    pub filter: String,

    /// Colored output.
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "batch_consumer=info,trace_context=info".to_string(),
            ansi: true,
        }
    }
}

/// Top-level configuration of one consumer instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Queue to subscribe to.
    pub queue: String,
    pub batch: BatchConfig,
    pub processing: ProcessingConfig,
    pub intake: IntakeConfig,
    pub logging: LoggingConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: "reporting".to_string(),
            batch: BatchConfig::default(),
            processing: ProcessingConfig::default(),
            intake: IntakeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ConsumerConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Checks every constraint and returns all violations.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.queue.trim().is_empty() {
            errors.push("queue must not be empty".to_string());
        }
        if self.batch.batch_size_limit == 0 {
            errors.push("batch.batch_size_limit must be at least 1".to_string());
        }
        if self.batch.batch_timeout_ms == 0 {
            errors.push("batch.batch_timeout_ms must be at least 1".to_string());
        }
        if self.intake.max_in_flight_deliveries == 0 {
            errors.push("intake.max_in_flight_deliveries must be at least 1".to_string());
        }
        if self.processing.operation_name.trim().is_empty() {
            errors.push("processing.operation_name must not be empty".to_string());
        }
        if !(0.0..=1.0).contains(&self.processing.sampling_rate) {
            errors.push(format!(
                "processing.sampling_rate must be within [0, 1], got {}",
                self.processing.sampling_rate
            ));
        }
        if self.processing.action_timeout_ms == Some(0) {
            errors.push("processing.action_timeout_ms must be at least 1 when set".to_string());
        }
        if let Err(e) = tracing_subscriber::EnvFilter::try_new(&self.logging.filter) {
            errors.push(format!("logging.filter is not a valid filter: {}", e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_batch_size_limit(mut self, limit: usize) -> Self {
        self.batch.batch_size_limit = limit;
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch.batch_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.processing.operation_name = name.into();
        self
    }

    pub fn with_sampling_rate(mut self, rate: f64) -> Self {
        self.processing.sampling_rate = rate;
        self
    }

    pub fn with_receive_spans(mut self, enabled: bool) -> Self {
        self.processing.record_receive_spans = enabled;
        self
    }

    pub fn with_action_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.processing.action_timeout_ms =
            timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_max_in_flight_deliveries(mut self, max: usize) -> Self {
        self.intake.max_in_flight_deliveries = max;
        self
    }
}

/// Loads and validates configuration from a TOML file.
pub fn load_config(path: impl AsRef<Path>) -> Result<ConsumerConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    ConsumerConfig::from_toml(&content)
}
