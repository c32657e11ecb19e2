//! udipe runtime configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder methods (programmatic)
//! 2. Environment variables
//! 3. Library defaults
//!
//! # Environment variables
//!
//! - `UDIPE_NUM_WORKERS` - Number of worker threads
//! - `UDIPE_PIN_WORKERS` - Pin workers to CPUs (0/1)
//!
//! Logging is configured separately through `UDIPE_LOG_LEVEL`,
//! `UDIPE_LOG_FLUSH` and `UDIPE_LOG_TIME`.

use std::fmt;

use udipe_core::constants::MAX_WORKERS;
use udipe_core::env::{env_get, env_get_bool};

use crate::buffer::BufferConfigurator;
use crate::topology::online_cpus;

/// Context configuration with builder pattern
///
/// Use `from_env()` to start with library defaults and apply environment
/// overrides, then refine programmatically.
#[derive(Clone)]
pub struct UdipeConfig {
    /// Number of worker threads
    pub num_workers: usize,
    /// Pin worker i to CPU i modulo the CPU count
    pub pin_workers: bool,
    /// Per-worker buffer sizing callback, `None` = cache-derived defaults
    pub buffer_config: Option<BufferConfigurator>,
}

impl Default for UdipeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl UdipeConfig {
    /// Create config from library defaults with environment overrides
    pub fn from_env() -> Self {
        Self {
            num_workers: env_get("UDIPE_NUM_WORKERS", default_num_workers()),
            pin_workers: env_get_bool("UDIPE_PIN_WORKERS", true),
            buffer_config: None,
        }
    }

    /// Create config with explicit defaults (no env override)
    ///
    /// Useful for testing or when you want full control.
    pub fn new() -> Self {
        Self {
            num_workers: default_num_workers(),
            pin_workers: true,
            buffer_config: None,
        }
    }

    // Builder methods

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.pin_workers = pin;
        self
    }

    pub fn buffer_config(mut self, configurator: BufferConfigurator) -> Self {
        self.buffer_config = Some(configurator);
        self
    }

    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue("num_workers must be > 0"));
        }
        if self.num_workers > MAX_WORKERS {
            return Err(ConfigError::InvalidValue("num_workers exceeds the maximum"));
        }
        Ok(())
    }
}

impl fmt::Debug for UdipeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdipeConfig")
            .field("num_workers", &self.num_workers)
            .field("pin_workers", &self.pin_workers)
            .field("buffer_config", &self.buffer_config.is_some())
            .finish()
    }
}

fn default_num_workers() -> usize {
    online_cpus().min(MAX_WORKERS)
}

/// Configuration error
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env() {
        let config = UdipeConfig::from_env();
        assert!(config.num_workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = UdipeConfig::new().num_workers(4).pin_workers(false);
        assert_eq!(config.num_workers, 4);
        assert!(!config.pin_workers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(UdipeConfig::new().num_workers(0).validate().is_err());
        assert!(UdipeConfig::new().num_workers(1000).validate().is_err());
    }
}
