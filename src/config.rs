use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Settings for pooled backend connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections in use at once
    pub capacity: usize,
    /// Idle connections are closed after this long without use
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Gateway configuration; an empty YAML document is valid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Private URI scheme served by the gateway
    pub scheme: String,
    /// Version prefix of persistent cache keys
    pub cache_version: String,
    /// Removals in flight while clearing the persistent cache
    pub delete_concurrency: usize,
    pub pool: PoolConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            scheme: "hlasm-external".to_string(),
            cache_version: "v3".to_string(),
            delete_concurrency: 16,
            pool: PoolConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(source: &str) -> Result<Self> {
        let config: Self = if source.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(source)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file
    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        let scheme_ok = self
            .scheme
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            && self
                .scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !scheme_ok {
            return Err(invalid(format!("invalid scheme `{}`", self.scheme)));
        }
        if self.cache_version.is_empty() || self.cache_version.contains('.') {
            return Err(invalid(format!(
                "invalid cache version `{}`",
                self.cache_version
            )));
        }
        if self.delete_concurrency == 0 {
            return Err(invalid("delete_concurrency must be positive"));
        }
        if self.pool.capacity == 0 {
            return Err(invalid("pool.capacity must be positive"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> GatewayError {
    GatewayError::InvalidConfig {
        message: message.into(),
    }
}
