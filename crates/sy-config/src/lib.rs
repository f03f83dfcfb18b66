//! Switchyard Configuration
//!
//! TOML-backed engine configuration with serde defaults for every field and
//! `SWITCHYARD_*` environment overrides applied on top.
//!
//! ```toml
//! [redelivery]
//! maximum_redeliveries = 3
//! delay_pattern = "0:250;2:500"
//!
//! [shutdown]
//! timeout_secs = 30
//!
//! [[thread_pools]]
//! id = "fanout"
//! pool_size = 20
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigLoadError>;

// ============================================================================
// Sections
// ============================================================================

/// Defaults for the route-level redelivery error handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryConfig {
    /// -1 retries forever, 0 disables redelivery
    pub maximum_redeliveries: i32,
    pub redelivery_delay_ms: u64,
    pub maximum_redelivery_delay_ms: u64,
    pub back_off_multiplier: f64,
    pub use_exponential_back_off: bool,
    pub use_collision_avoidance: bool,
    pub collision_avoidance_factor: f64,
    /// `limit:delay` groups separated by `;`, e.g. `0:250;2:500`
    pub delay_pattern: Option<String>,
    pub allow_redelivery_while_stopping: bool,
    pub use_original_message: bool,
    pub dead_letter_handle_new_exception: bool,
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay_ms: 1000,
            maximum_redelivery_delay_ms: 60_000,
            back_off_multiplier: 2.0,
            use_exponential_back_off: false,
            use_collision_avoidance: false,
            collision_avoidance_factor: 0.15,
            delay_pattern: None,
            allow_redelivery_while_stopping: true,
            use_original_message: false,
            dead_letter_handle_new_exception: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub timeout_secs: u64,
    pub shutdown_now_on_timeout: bool,
    pub shutdown_routes_in_reverse_order: bool,
    pub poll_interval_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 45,
            shutdown_now_on_timeout: true,
            shutdown_routes_in_reverse_order: true,
            poll_interval_ms: 1000,
        }
    }
}

/// A named bounded pool used by parallel and asynchronous patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolProfile {
    pub id: String,
    pub pool_size: usize,
}

impl Default for ThreadPoolProfile {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            pool_size: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotentConfig {
    pub max_cache_size: usize,
}

impl Default for IdempotentConfig {
    fn default() -> Self {
        Self { max_cache_size: 1000 }
    }
}

// ============================================================================
// Engine configuration
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub name: Option<String>,
    pub redelivery: RedeliveryConfig,
    pub shutdown: ShutdownConfig,
    pub thread_pool: ThreadPoolProfile,
    pub thread_pools: Vec<ThreadPoolProfile>,
    pub idempotent: IdempotentConfig,
}

impl EngineConfig {
    /// Load from a TOML file, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        info!(path = %path.display(), "Loaded engine configuration");
        Ok(config)
    }

    /// Configuration from defaults and environment only.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_parse::<i32>("SWITCHYARD_MAXIMUM_REDELIVERIES")? {
            self.redelivery.maximum_redeliveries = v;
        }
        if let Some(v) = env_parse::<u64>("SWITCHYARD_REDELIVERY_DELAY_MS")? {
            self.redelivery.redelivery_delay_ms = v;
        }
        if let Ok(v) = std::env::var("SWITCHYARD_DELAY_PATTERN") {
            self.redelivery.delay_pattern = Some(v);
        }
        if let Some(v) = env_parse::<bool>("SWITCHYARD_ALLOW_REDELIVERY_WHILE_STOPPING")? {
            self.redelivery.allow_redelivery_while_stopping = v;
        }
        if let Some(v) = env_parse::<u64>("SWITCHYARD_SHUTDOWN_TIMEOUT_SECS")? {
            self.shutdown.timeout_secs = v;
        }
        if let Some(v) = env_parse::<bool>("SWITCHYARD_SHUTDOWN_NOW_ON_TIMEOUT")? {
            self.shutdown.shutdown_now_on_timeout = v;
        }
        if let Some(v) = env_parse::<usize>("SWITCHYARD_THREAD_POOL_SIZE")? {
            self.thread_pool.pool_size = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.shutdown.timeout_secs == 0 {
            return Err(ConfigLoadError::Invalid("shutdown.timeout_secs must be greater than 0".into()));
        }
        if self.shutdown.poll_interval_ms == 0 {
            return Err(ConfigLoadError::Invalid("shutdown.poll_interval_ms must be greater than 0".into()));
        }
        for profile in std::iter::once(&self.thread_pool).chain(self.thread_pools.iter()) {
            if profile.pool_size == 0 {
                return Err(ConfigLoadError::Invalid(format!(
                    "thread pool '{}' must have pool_size greater than 0",
                    profile.id
                )));
            }
        }
        if self.redelivery.maximum_redeliveries < -1 {
            return Err(ConfigLoadError::Invalid(
                "redelivery.maximum_redeliveries must be -1 or greater".into(),
            ));
        }
        if self.redelivery.back_off_multiplier < 1.0 {
            return Err(ConfigLoadError::Invalid("redelivery.back_off_multiplier must be at least 1.0".into()));
        }
        if let Some(pattern) = &self.redelivery.delay_pattern {
            validate_delay_pattern(pattern)?;
        }
        if self.idempotent.max_cache_size == 0 {
            return Err(ConfigLoadError::Invalid("idempotent.max_cache_size must be greater than 0".into()));
        }
        debug!(pools = self.thread_pools.len() + 1, "Engine configuration validated");
        Ok(())
    }

    /// Look up a thread pool profile by id; the default profile answers to its own id.
    pub fn thread_pool_profile(&self, id: &str) -> Option<&ThreadPoolProfile> {
        if self.thread_pool.id == id {
            return Some(&self.thread_pool);
        }
        self.thread_pools.iter().find(|p| p.id == id)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigLoadError::InvalidEnv { name: name.to_string(), value }),
        Err(_) => Ok(None),
    }
}

fn validate_delay_pattern(pattern: &str) -> Result<()> {
    for group in pattern.split(';').map(str::trim).filter(|g| !g.is_empty()) {
        let valid = group
            .split_once(':')
            .map(|(limit, delay)| limit.trim().parse::<u32>().is_ok() && delay.trim().parse::<u64>().is_ok())
            .unwrap_or(false);
        if !valid {
            return Err(ConfigLoadError::Invalid(format!(
                "redelivery.delay_pattern group '{}' must be <limit>:<delay>",
                group
            )));
        }
    }
    Ok(())
}
