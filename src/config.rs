//! # Configuration
//!
//! Layered configuration for the dispatch runtime:
//!
//! 1. built-in defaults
//! 2. `<dir>/base.toml` (optional)
//! 3. `<dir>/<environment>.toml` (optional)
//! 4. `FLASHCARDS__SECTION__KEY` environment variables
//!
//! ```rust,no_run
//! use flashcards_core::config::CoreConfig;
//!
//! # fn main() -> flashcards_core::Result<()> {
//! let config = CoreConfig::load("config", &CoreConfig::detect_environment())?;
//! println!("max concurrency: {}", config.dispatch.max_concurrency);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoreError, Result};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "FLASHCARDS";
const ENV_SEPARATOR: &str = "__";

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
    /// Connection name reported to the broker
    pub client_name: String,
    /// Default timeout for client-side request/reply calls
    pub request_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "memory://local".to_string(),
            client_name: "flashcards-core".to_string(),
            request_timeout_ms: 5_000,
        }
    }
}

impl BrokerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Settings of one message dispatch server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub topic: String,
    /// Competing-consumer group
    pub group: String,
    /// Maximum concurrently executing pipelines
    pub max_concurrency: usize,
    /// Poll interval of the keep-subscribed loop
    pub keepalive_interval_ms: u64,
    /// How long shutdown waits for in-flight executions
    pub graceful_shutdown_timeout_ms: u64,
    /// Close the broker client when the server closes
    pub owns_connection: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            topic: "flashcards".to_string(),
            group: "flashcards-workers".to_string(),
            max_concurrency: 64,
            keepalive_interval_ms: 1_000,
            graceful_shutdown_timeout_ms: 30_000,
            owns_connection: false,
        }
    }
}

impl DispatchConfig {
    pub fn new(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            ..Self::default()
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(CoreError::configuration("dispatch.topic cannot be empty"));
        }
        if self.group.trim().is_empty() {
            return Err(CoreError::configuration("dispatch.group cannot be empty"));
        }
        if self.max_concurrency < 1 {
            return Err(CoreError::configuration(
                "dispatch.max_concurrency must be at least 1",
            ));
        }
        if self.keepalive_interval_ms == 0 {
            return Err(CoreError::configuration(
                "dispatch.keepalive_interval_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Connection supervisor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Fixed delay between reconnect attempts
    pub reconnect_delay_ms: u64,
    pub ping_interval_ms: u64,
    /// How long a reconnecting client still counts as healthy
    pub health_grace_period_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 2_000,
            ping_interval_ms: 20_000,
            health_grace_period_ms: 30_000,
        }
    }
}

impl ConnectionConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn health_grace_period(&self) -> Duration {
        Duration::from_millis(self.health_grace_period_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reconnect_delay_ms == 0 {
            return Err(CoreError::configuration(
                "connection.reconnect_delay_ms must be greater than 0",
            ));
        }
        if self.ping_interval_ms == 0 {
            return Err(CoreError::configuration(
                "connection.ping_interval_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; derived from the environment when unset
    pub level: Option<String>,
    pub json: bool,
}

/// Complete runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub broker: BrokerConfig,
    pub dispatch: DispatchConfig,
    pub connection: ConnectionConfig,
    pub logging: LoggingConfig,
}

impl CoreConfig {
    /// Detect environment from FLASHCARDS_ENV or APP_ENV, defaulting to "development"
    pub fn detect_environment() -> String {
        std::env::var("FLASHCARDS_ENV")
            .or_else(|_| std::env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    /// Load configuration from `dir` for `environment`, with process environment
    /// overrides
    pub fn load(dir: impl AsRef<Path>, environment: &str) -> Result<Self> {
        Self::build(dir.as_ref(), environment, None)
    }

    /// Like [`CoreConfig::load`], reading overrides from `vars` instead of the process
    /// environment
    pub fn load_with_overrides(
        dir: impl AsRef<Path>,
        environment: &str,
        vars: HashMap<String, String>,
    ) -> Result<Self> {
        Self::build(dir.as_ref(), environment, Some(vars))
    }

    fn build(
        dir: &Path,
        environment: &str,
        vars: Option<HashMap<String, String>>,
    ) -> Result<Self> {
        let base = dir.join("base.toml");
        let overlay = dir.join(format!("{environment}.toml"));

        debug!(
            base = %base.display(),
            overlay = %overlay.display(),
            environment = %environment,
            "Loading configuration"
        );

        let config = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::from(base).required(false))
            .add_source(File::from(overlay).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true)
                    .source(vars),
            )
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        loaded.validate()?;

        info!(
            environment = %environment,
            topic = %loaded.dispatch.topic,
            group = %loaded.dispatch.group,
            max_concurrency = loaded.dispatch.max_concurrency,
            "Configuration loaded"
        );

        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker.client_name.trim().is_empty() {
            return Err(CoreError::configuration("broker.client_name cannot be empty"));
        }
        self.dispatch.validate()?;
        self.connection.validate()?;
        Ok(())
    }
}
