/*!
 * Configuration types for objvault
 */

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Result, VaultError};
use crate::partition::{MAX_PART_SIZE, MIN_PART_SIZE};

/// Client-wide configuration shared by every operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Service endpoint, used when generating presigned URLs
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Maximum retry attempts per request (0 = no retries)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    /// Upper bound for any single retry delay, in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Backoff strategy between retries
    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Jitter factor (0.0-1.0) for jittered backoff
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Verify aggregate CRC-32 after uploads and full downloads
    #[serde(default = "default_true")]
    pub crc_check_enabled: bool,

    /// Part size used when a transfer request does not set one
    #[serde(default = "default_part_size")]
    pub default_part_size: u64,

    /// Worker count used when a transfer request does not set one
    #[serde(default = "default_thread_num")]
    pub default_thread_num: usize,

    /// Threads shared by the async call API; extra calls queue
    #[serde(default = "default_async_threads")]
    pub async_threads: usize,

    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    #[serde(default)]
    pub verbose: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            max_retries: default_max_retries(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            backoff: BackoffStrategy::default(),
            jitter_factor: default_jitter_factor(),
            crc_check_enabled: true,
            default_part_size: default_part_size(),
            default_thread_num: default_thread_num(),
            async_threads: default_async_threads(),
            log_level: LogLevel::Info,
            log_file: None,
            verbose: false,
        }
    }
}

/// Backoff strategy for retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,

    /// Linear increase in delay
    Linear,

    /// Exponential increase in delay (2^n)
    Exponential,

    /// Exponential with random jitter to prevent thundering herd
    #[default]
    ExponentialWithJitter,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_endpoint() -> String {
    "memory://objvault".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    20_000
}

fn default_jitter_factor() -> f64 {
    0.3
}

fn default_part_size() -> u64 {
    MIN_PART_SIZE
}

fn default_thread_num() -> usize {
    1
}

fn default_async_threads() -> usize {
    4
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&contents)
            .map_err(|e| VaultError::Validate(format!("invalid config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &PathBuf) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| VaultError::Validate(format!("cannot serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check the configuration for values no transfer could run with
    pub fn validate(&self) -> Result<()> {
        if self.default_thread_num == 0 {
            return Err(VaultError::Validate(
                "default_thread_num must be at least 1".to_string(),
            ));
        }
        if self.async_threads == 0 {
            return Err(VaultError::Validate(
                "async_threads must be at least 1".to_string(),
            ));
        }
        if self.default_part_size < MIN_PART_SIZE || self.default_part_size > MAX_PART_SIZE {
            return Err(VaultError::Validate(format!(
                "default_part_size {} outside [{}, {}]",
                self.default_part_size, MIN_PART_SIZE, MAX_PART_SIZE
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(VaultError::Validate(format!(
                "jitter_factor {} outside [0.0, 1.0]",
                self.jitter_factor
            )));
        }
        Ok(())
    }

    /// Short retry waits, for latency-sensitive callers
    pub fn fast_preset() -> Self {
        Self {
            max_retries: 2,
            retry_initial_delay_ms: 10,
            retry_max_delay_ms: 200,
            backoff: BackoffStrategy::Fixed,
            ..Default::default()
        }
    }

    /// Patient retries for flaky links
    pub fn network_preset() -> Self {
        Self {
            max_retries: 10,
            retry_initial_delay_ms: 100,
            retry_max_delay_ms: 30_000,
            backoff: BackoffStrategy::ExponentialWithJitter,
            jitter_factor: 0.5,
            default_thread_num: get_cpu_count().min(8),
            ..Default::default()
        }
    }
}

/// Get the number of available CPU cores
fn get_cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.max_retries, 3);
        assert!(config.crc_check_enabled);
        assert_eq!(config.default_part_size, 100 * 1024);
        assert_eq!(config.default_thread_num, 1);
        assert_eq!(config.backoff, BackoffStrategy::ExponentialWithJitter);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(ClientConfig::fast_preset().validate().is_ok());
        let network = ClientConfig::network_preset();
        assert!(network.validate().is_ok());
        assert_eq!(network.max_retries, 10);
        assert!(network.default_thread_num >= 1);
    }

    #[test]
    fn test_validate_rejects_zero_threads() {
        let config = ClientConfig {
            default_thread_num: 0,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().code(), "ValidateError");
        let config = ClientConfig {
            async_threads: 0,
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().code(), "ValidateError");
    }

    #[test]
    fn test_validate_rejects_small_part_size() {
        let config = ClientConfig {
            default_part_size: 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("objvault.toml");

        let config = ClientConfig {
            max_retries: 7,
            crc_check_enabled: false,
            ..Default::default()
        };
        config.to_file(&path).unwrap();

        let loaded = ClientConfig::from_file(&path).unwrap();
        assert_eq!(loaded.max_retries, 7);
        assert!(!loaded.crc_check_enabled);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
endpoint = "https://storage.example.com"
max_retries = 5
backoff = "linear"
log_level = "debug"
"#;
        let config: ClientConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.endpoint, "https://storage.example.com");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.backoff, BackoffStrategy::Linear);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.retry_initial_delay_ms, 200);
        assert!(config.crc_check_enabled);
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }
}
