use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::contract::ContextOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid fingerprint (expected 64 hex digits): {0}")]
    InvalidFingerprint(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// How install requests are decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallPolicy {
    /// Accept only anchors listed in `allowed_fingerprints`.
    #[default]
    Fingerprints,
    AcceptAll,
    DenyAll,
}

/// Install review settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    #[serde(default)]
    pub policy: InstallPolicy,

    /// SHA-256 fingerprints (hex) accepted under the `fingerprints` policy.
    #[serde(default)]
    pub allowed_fingerprints: Vec<String>,

    /// How long a worker waits for a decision.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            policy: InstallPolicy::default(),
            allowed_fingerprints: Vec::new(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Diagnostic log delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Records queued for the log sink before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Trust evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Start from the bundled Mozilla root set.
    #[serde(default = "default_true")]
    pub webpki_roots: bool,

    /// Certificate files (PEM or DER) installed at startup.
    #[serde(default)]
    pub anchors: Vec<PathBuf>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            webpki_roots: true,
            anchors: Vec::new(),
        }
    }
}

/// Configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Config version for future compatibility.
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub install: InstallConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub trust: TrustConfig,

    /// Interception worker threads.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_version() -> u32 {
    1
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    2
}

impl Config {
    /// Loads config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Options for the interaction context.
    pub fn context_options(&self) -> ContextOptions {
        ContextOptions {
            install_timeout: Duration::from_millis(self.install.timeout_ms),
            log_queue_capacity: self.logging.queue_capacity,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for fingerprint in &self.install.allowed_fingerprints {
            if fingerprint.len() != 64 || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::InvalidFingerprint(fingerprint.clone()));
            }
        }

        if self.install.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "install.timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.logging.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "logging.queue_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "workers",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            install: InstallConfig::default(),
            logging: LoggingConfig::default(),
            trust: TrustConfig::default(),
            workers: default_workers(),
        }
    }
}
