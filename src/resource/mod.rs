//! Monitored domains, snapshots, and the stats-provider seam

use crate::errors::{ConfigError, ResourceError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub mod classifier;
pub mod error_channel;
pub mod limits;
pub mod sampler;
pub mod system;

pub use classifier::{classify, classify_ratio};
pub use error_channel::{ErrorEvent, ErrorTracker};
pub use limits::{ConcurrencyLimiter, SlotPermit};
pub use sampler::Sampler;

/// Application error channels the engine can watch alongside resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AiService,
    FileSystem,
    Network,
    Ipc,
    Other,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::AiService,
        ErrorKind::FileSystem,
        ErrorKind::Network,
        ErrorKind::Ipc,
        ErrorKind::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiService => "ai_service",
            Self::FileSystem => "file_system",
            Self::Network => "network",
            Self::Ipc => "ipc",
            Self::Other => "other",
        }
    }
}

impl FromStr for ErrorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownDomain(format!("errors/{}", s)))
    }
}

/// A monitored resource category or error channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Domain {
    Memory,
    Cpu,
    Connections,
    DiskIo,
    FileHandles,
    Network,
    Errors(ErrorKind),
}

impl Domain {
    /// Every resource domain (error channels excluded).
    pub const RESOURCES: [Domain; 6] = [
        Domain::Memory,
        Domain::Cpu,
        Domain::Connections,
        Domain::DiskIo,
        Domain::FileHandles,
        Domain::Network,
    ];

    pub fn is_error_channel(&self) -> bool {
        matches!(self, Self::Errors(_))
    }

    /// Unit reported by providers for this domain.
    pub fn default_unit(&self) -> &'static str {
        match self {
            Self::Memory => "bytes",
            Self::Cpu => "percent",
            Self::Connections => "connections",
            Self::DiskIo => "bytes/s",
            Self::FileHandles => "handles",
            Self::Network => "bytes/s",
            Self::Errors(_) => "errors",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Cpu => write!(f, "cpu"),
            Self::Connections => write!(f, "connections"),
            Self::DiskIo => write!(f, "disk_io"),
            Self::FileHandles => write!(f, "file_handles"),
            Self::Network => write!(f, "network"),
            Self::Errors(kind) => write!(f, "errors/{}", kind.as_str()),
        }
    }
}

impl FromStr for Domain {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if let Some(kind) = s.strip_prefix("errors/") {
            return kind.parse().map(Domain::Errors);
        }
        match s.as_str() {
            "memory" => Ok(Self::Memory),
            "cpu" => Ok(Self::Cpu),
            "connections" => Ok(Self::Connections),
            "disk_io" | "disk" => Ok(Self::DiskIo),
            "file_handles" | "handles" => Ok(Self::FileHandles),
            "network" => Ok(Self::Network),
            _ => Err(ConfigError::UnknownDomain(s)),
        }
    }
}

// Domains are map keys in TOML, so they travel as plain strings.
impl Serialize for Domain {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Domain {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Discrete load classification, ordered by severity.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Normal,
    Warning,
    Critical,
    Exhausted,
}

impl Status {
    /// Check if the status calls for recovery
    pub fn requires_action(&self) -> bool {
        *self >= Status::Warning
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw reading returned by a stats provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceStats {
    pub current: f64,
    pub maximum: f64,
    pub unit: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ResourceStats {
    pub fn new(current: f64, maximum: f64, unit: impl Into<String>) -> Self {
        Self {
            current,
            maximum,
            unit: unit.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Point-in-time reading of one domain.
///
/// A snapshot with `error` set is "unknown": the provider failed and the
/// counters are meaningless. Its status is carried over from the previous
/// classification, never escalated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub domain: Domain,
    pub current: f64,
    pub maximum: f64,
    pub usage_ratio: f64,
    pub status: Status,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Snapshot {
    /// Build a snapshot from a provider reading. Non-finite readings become
    /// unknown snapshots.
    pub fn measured(domain: Domain, stats: ResourceStats) -> Self {
        if !stats.current.is_finite() || !stats.maximum.is_finite() {
            return Self::unknown(
                domain,
                &ResourceError::read(domain, "provider returned a non-finite reading"),
            );
        }

        let usage_ratio = if stats.maximum > 0.0 {
            (stats.current / stats.maximum).clamp(0.0, 1.0)
        } else {
            0.0
        };

        Self {
            domain,
            current: stats.current,
            maximum: stats.maximum,
            usage_ratio,
            status: Status::Normal,
            unit: stats.unit,
            timestamp: Utc::now(),
            metadata: stats.metadata,
            error: None,
        }
    }

    /// Designated snapshot for a failed read.
    pub fn unknown(domain: Domain, reason: &ResourceError) -> Self {
        Self {
            domain,
            current: 0.0,
            maximum: 0.0,
            usage_ratio: 0.0,
            status: Status::Normal,
            unit: domain.default_unit().to_string(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            error: Some(reason.to_string()),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.error.is_some()
    }

    /// Consume the snapshot and return it tagged with `status`.
    pub fn classified(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Source of live counters for one domain.
#[async_trait::async_trait]
pub trait ResourceStatsProvider: Send + Sync {
    /// Domain this provider reports on
    fn domain(&self) -> Domain;

    /// Read the current counters
    async fn stats(&self) -> Result<ResourceStats, ResourceError>;
}
