//! Configuration Management
//!
//! Loads and validates the monitor configuration from TOML files.
//! Configuration includes:
//! - Scheduling (tick interval, sample timeout)
//! - Recovery policy (auto-cleanup, retries, inter-cycle throttle)
//! - History retention
//! - Per-domain thresholds and system limits for derived ratios

pub mod store;
pub mod thresholds;

pub use store::{ConfigStore, InMemoryConfigStore, WatchHandle};
pub use thresholds::{default_domain_thresholds, ThresholdSet};

use crate::errors::ConfigError;
use crate::resource::{Domain, ErrorKind};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Key under which the monitor configuration lives in a [`ConfigStore`].
pub const MONITOR_CONFIG_KEY: &str = "monitor";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Tick interval for every scheduled domain
    #[serde(default = "default_monitoring_interval_ms")]
    pub monitoring_interval_ms: u64,
    /// Run recovery automatically when a tick classifies warning or worse
    #[serde(default = "default_true")]
    pub enable_auto_cleanup: bool,
    #[serde(default = "default_history_retention_ms")]
    pub history_retention_ms: u64,
    /// Cap on retained history entries per domain
    #[serde(default = "default_max_history_records")]
    pub max_history_records: usize,
    /// Total attempts per strategy within one cycle
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_min_inter_cycle_interval_ms")]
    pub min_inter_cycle_interval_ms: u64,
    /// Hard timeout for one provider read; must stay below the tick interval
    #[serde(default = "default_sample_timeout_ms")]
    pub sample_timeout_ms: u64,
    /// Bounded capacity of the event bus
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Domains armed by `start_all`
    #[serde(default = "default_domains")]
    pub domains: Vec<Domain>,
    /// Fallback thresholds for domains missing from `thresholds`
    #[serde(default)]
    pub default_thresholds: ThresholdSet,
    #[serde(default = "default_domain_thresholds")]
    pub thresholds: BTreeMap<Domain, ThresholdSet>,
    #[serde(default)]
    pub errors: ErrorChannelConfig,
    #[serde(default)]
    pub limits: SystemLimits,
}

/// Sliding-window settings for error channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorChannelConfig {
    #[serde(default = "default_error_window_ms")]
    pub window_ms: u64,
    /// Errors per window that count as fully exhausted
    #[serde(default = "default_error_budget")]
    pub budget: u32,
}

impl Default for ErrorChannelConfig {
    fn default() -> Self {
        Self {
            window_ms: default_error_window_ms(),
            budget: default_error_budget(),
        }
    }
}

/// Maxima for domains whose ceiling is not reported by the OS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemLimits {
    /// Network throughput treated as saturation
    #[serde(default = "default_network_bytes_per_sec")]
    pub network_bytes_per_sec: u64,
    /// Process disk throughput treated as saturation
    #[serde(default = "default_disk_io_bytes_per_sec")]
    pub disk_io_bytes_per_sec: u64,
    /// Used when the open-file rlimit cannot be read
    #[serde(default = "default_max_file_handles")]
    pub max_file_handles: u64,
    /// Base size of the shared concurrency limiter
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Floor the limiter never shrinks below
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,
}

impl Default for SystemLimits {
    fn default() -> Self {
        Self {
            network_bytes_per_sec: default_network_bytes_per_sec(),
            disk_io_bytes_per_sec: default_disk_io_bytes_per_sec(),
            max_file_handles: default_max_file_handles(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_monitoring_interval_ms() -> u64 {
    30_000
}
fn default_history_retention_ms() -> u64 {
    6 * 60 * 60 * 1000
}
fn default_max_history_records() -> usize {
    720
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1_000
}
fn default_min_inter_cycle_interval_ms() -> u64 {
    60_000
}
fn default_sample_timeout_ms() -> u64 {
    5_000
}
fn default_event_buffer() -> usize {
    256
}
fn default_domains() -> Vec<Domain> {
    let mut domains = Domain::RESOURCES.to_vec();
    domains.push(Domain::Errors(ErrorKind::AiService));
    domains
}
fn default_error_window_ms() -> u64 {
    60_000
}
fn default_error_budget() -> u32 {
    20
}
fn default_network_bytes_per_sec() -> u64 {
    100 * 1024 * 1024
}
fn default_disk_io_bytes_per_sec() -> u64 {
    200 * 1024 * 1024
}
fn default_max_file_handles() -> u64 {
    1024
}
fn default_max_connections() -> usize {
    8
}
fn default_min_connections() -> usize {
    1
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            monitoring_interval_ms: default_monitoring_interval_ms(),
            enable_auto_cleanup: true,
            history_retention_ms: default_history_retention_ms(),
            max_history_records: default_max_history_records(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            min_inter_cycle_interval_ms: default_min_inter_cycle_interval_ms(),
            sample_timeout_ms: default_sample_timeout_ms(),
            event_buffer: default_event_buffer(),
            domains: default_domains(),
            default_thresholds: ThresholdSet::default(),
            thresholds: default_domain_thresholds(),
            errors: ErrorChannelConfig::default(),
            limits: SystemLimits::default(),
        }
    }
}

impl MonitorConfig {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config: Self = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config from {}", p))?;
                Self::from_toml(&content)?
            }
            None => {
                let mut default_paths = vec![std::path::PathBuf::from("vigil.toml")];
                if let Some(home) = dirs::home_dir() {
                    default_paths.push(home.join(".config/vigil/config.toml"));
                }

                let mut loaded = None;
                for p in &default_paths {
                    if let Ok(content) = std::fs::read_to_string(p) {
                        loaded = Some(Self::from_toml(&content).with_context(|| {
                            format!("Failed to parse config {}", p.display())
                        })?);
                        break;
                    }
                }
                loaded.unwrap_or_else(|| {
                    tracing::debug!("No config file found, using defaults");
                    Self::default()
                })
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse without environment overrides or validation.
    pub fn from_toml(content: &str) -> std::result::Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_toml(&self) -> std::result::Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VIGIL_INTERVAL_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                self.monitoring_interval_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("VIGIL_AUTO_CLEANUP") {
            if let Ok(enabled) = v.parse::<bool>() {
                self.enable_auto_cleanup = enabled;
            }
        }
        if let Ok(v) = std::env::var("VIGIL_MAX_HISTORY") {
            if let Ok(n) = v.parse::<usize>() {
                self.max_history_records = n;
            }
        }
        if let Ok(v) = std::env::var("VIGIL_MAX_RETRIES") {
            if let Ok(n) = v.parse::<u32>() {
                self.max_retries = n;
            }
        }
    }

    /// Reject the whole configuration if any field is out of range.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
            ConfigError::InvalidValue {
                field: field.to_string(),
                reason: reason.into(),
            }
        }

        if self.monitoring_interval_ms == 0 {
            return Err(invalid("monitoring_interval_ms", "must be greater than 0"));
        }
        if self.sample_timeout_ms == 0 || self.sample_timeout_ms >= self.monitoring_interval_ms {
            return Err(invalid(
                "sample_timeout_ms",
                format!(
                    "must be in 1..{} (shorter than the monitoring interval)",
                    self.monitoring_interval_ms
                ),
            ));
        }
        if self.max_history_records == 0 {
            return Err(invalid("max_history_records", "must be greater than 0"));
        }
        if self.history_retention_ms == 0 {
            return Err(invalid("history_retention_ms", "must be greater than 0"));
        }
        if self.max_retries == 0 {
            return Err(invalid("max_retries", "at least one attempt is required"));
        }
        if self.event_buffer == 0 {
            return Err(invalid("event_buffer", "must be greater than 0"));
        }
        if self.errors.budget == 0 || self.errors.window_ms == 0 {
            return Err(invalid("errors", "budget and window_ms must be greater than 0"));
        }
        if self.limits.min_connections == 0
            || self.limits.min_connections > self.limits.max_connections
        {
            return Err(invalid(
                "limits.min_connections",
                "must be in 1..=limits.max_connections",
            ));
        }

        self.default_thresholds.validate("default")?;
        for (domain, set) in &self.thresholds {
            set.validate(&domain.to_string())?;
        }
        Ok(())
    }

    /// Thresholds in effect for `domain`.
    pub fn thresholds_for(&self, domain: Domain) -> ThresholdSet {
        self.thresholds
            .get(&domain)
            .copied()
            .unwrap_or(self.default_thresholds)
    }

    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_interval_ms)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn min_inter_cycle_interval(&self) -> Duration {
        Duration::from_millis(self.min_inter_cycle_interval_ms)
    }

    pub fn history_retention(&self) -> Duration {
        Duration::from_millis(self.history_retention_ms)
    }
}
