//! Fleet configuration loaded from TOML files with environment overrides.
//!
//! ## Loading Order
//!
//! 1. `FLEET_CONFIG` environment variable (path to TOML file)
//! 2. `fleet.toml` in the current working directory
//! 3. Built-in defaults
//!
//! After file loading, individual `FLEET_*` environment variables override
//! the forwarding knobs so a single container image can be retuned per
//! deployment without editing files.

use crate::forward::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Root configuration for a fleet deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Per-stage server bindings and downstream wiring.
    #[serde(default)]
    pub stages: StagesConfig,

    /// Forwarding retry tuning.
    #[serde(default)]
    pub forwarding: ForwardingConfig,

    /// Memory index tuning.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Data directory for the fleet-wide sled database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            stages: StagesConfig::default(),
            forwarding: ForwardingConfig::default(),
            memory: MemoryConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// Bind addresses for the five stages. Downstream targets are derived from
/// the next stage's address unless overridden per stage at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_ingest_port")]
    pub ingest_port: u16,
    #[serde(default = "default_verifier_port")]
    pub verifier_port: u16,
    #[serde(default = "default_summarizer_port")]
    pub summarizer_port: u16,
    #[serde(default = "default_triage_port")]
    pub triage_port: u16,
    #[serde(default = "default_dispatcher_port")]
    pub dispatcher_port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_ingest_port() -> u16 {
    8001
}
fn default_verifier_port() -> u16 {
    8002
}
fn default_summarizer_port() -> u16 {
    8003
}
fn default_triage_port() -> u16 {
    8004
}
fn default_dispatcher_port() -> u16 {
    8005
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            ingest_port: default_ingest_port(),
            verifier_port: default_verifier_port(),
            summarizer_port: default_summarizer_port(),
            triage_port: default_triage_port(),
            dispatcher_port: default_dispatcher_port(),
        }
    }
}

/// Retry knobs for the stage forwarder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ForwardingConfig {
    /// Apply `FLEET_*` environment overrides on top of file/default values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<u32>("FLEET_MAX_RETRIES") {
            self.max_retries = v;
        }
        if let Some(v) = env_parse::<u64>("FLEET_INITIAL_DELAY_MS") {
            self.initial_delay_ms = v;
        }
        if let Some(v) = env_parse::<f64>("FLEET_BACKOFF_MULTIPLIER") {
            self.backoff_multiplier = v;
        }
        if let Some(v) = env_parse::<u64>("FLEET_MAX_DELAY_MS") {
            self.max_delay_ms = v;
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key, value = %raw, "unparseable environment override ignored");
                None
            }
        },
        Err(_) => None,
    }
}

/// Similarity-search tuning for the memory index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    /// Soft deadline for a single similarity query, in milliseconds.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

fn default_top_k() -> usize {
    3
}
fn default_min_similarity() -> f32 {
    0.3
}
fn default_query_timeout_ms() -> u64 {
    250
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_similarity: default_min_similarity(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl MemoryConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// Configuration load/parse failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
}

impl FleetConfig {
    /// Load configuration using the standard search order, then apply
    /// environment overrides.
    pub fn load() -> Self {
        let mut config = Self::load_file();
        config.forwarding.apply_env_overrides();
        config
    }

    fn load_file() -> Self {
        if let Ok(path) = std::env::var("FLEET_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "loaded fleet config from FLEET_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "failed to load FLEET_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "FLEET_CONFIG points to non-existent file, falling back");
            }
        }

        let local = Path::new("fleet.toml");
        if local.exists() {
            match Self::load_from_file(local) {
                Ok(config) => {
                    info!(path = %local.display(), "loaded fleet config");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "failed to load ./fleet.toml, using defaults");
                }
            }
        }

        Self::default()
    }

    /// Load and parse a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_parses_to_defaults() {
        let config: FleetConfig = toml::from_str("").unwrap();
        assert_eq!(config.forwarding.max_retries, 3);
        assert_eq!(config.stages.ingest_port, 8001);
        assert_eq!(config.stages.dispatcher_port, 8005);
        assert_eq!(config.memory.top_k, 3);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config: FleetConfig = toml::from_str(
            r#"
            [forwarding]
            max_retries = 5
            initial_delay_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.forwarding.max_retries, 5);
        assert_eq!(config.forwarding.initial_delay_ms, 50);
        assert_eq!(config.forwarding.backoff_multiplier, 2.0);
        assert_eq!(config.stages.triage_port, 8004);
    }

    #[test]
    fn test_retry_policy_conversion() {
        let forwarding = ForwardingConfig {
            max_retries: 0,
            initial_delay_ms: 500,
            backoff_multiplier: 3.0,
            max_delay_ms: 2000,
        };
        let policy = forwarding.retry_policy();
        // At least one attempt regardless of misconfiguration.
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.initial_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_millis(2000));
    }
}
