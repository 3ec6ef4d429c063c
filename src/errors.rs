use thiserror::Error;

use crate::resource::Domain;

/// The central error type for the vigil engine.
///
/// Only configuration problems and cycle rejections ever reach a caller;
/// sample failures are folded into "unknown" snapshots and strategy failures
/// into recovery outcomes.
#[derive(Error, Debug)]
pub enum VigilError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Recovery cycle rejected: {0}")]
    Rejected(#[from] CycleRejected),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error(
        "Thresholds for {domain} must satisfy 0 <= warning < critical < exhausted <= 1 \
         (got {warning}, {critical}, {exhausted})"
    )]
    InvalidThresholds {
        domain: String,
        warning: f64,
        critical: f64,
        exhausted: f64,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Unknown domain '{0}'")]
    UnknownDomain(String),
}

/// Failure to read a resource counter. Never escalates a domain's status.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    #[error("No stats provider registered for {0}")]
    NoProvider(Domain),

    #[error("Sampling {domain} timed out after {timeout_ms}ms")]
    Timeout { domain: Domain, timeout_ms: u64 },

    #[error("Failed to read {domain}: {message}")]
    Read { domain: Domain, message: String },

    #[error("Resource unavailable: {0}")]
    Unavailable(String),
}

impl ResourceError {
    pub fn read(domain: Domain, message: impl Into<String>) -> Self {
        Self::Read {
            domain,
            message: message.into(),
        }
    }
}

/// Synchronous rejection of a recovery cycle. No state is mutated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CycleRejected {
    #[error("a recovery cycle for {domain} is already in progress")]
    Busy { domain: Domain },

    #[error("recovery for {domain} throttled, next cycle allowed in {retry_after_ms}ms")]
    Throttled { domain: Domain, retry_after_ms: u64 },
}

impl CycleRejected {
    pub fn domain(&self) -> Domain {
        match self {
            Self::Busy { domain } | Self::Throttled { domain, .. } => *domain,
        }
    }

    /// Short code matching the rejection kind (`BUSY` / `THROTTLED`).
    pub fn code(&self) -> &'static str {
        match self {
            Self::Busy { .. } => "BUSY",
            Self::Throttled { .. } => "THROTTLED",
        }
    }
}

pub type Result<T> = std::result::Result<T, VigilError>;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_ERROR: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_RESOURCE_ERROR: u8 = 3;
pub const EXIT_REJECTED: u8 = 4;

/// Determine the appropriate process exit code for an error.
pub fn get_exit_code(e: &anyhow::Error) -> u8 {
    if let Some(err) = e.downcast_ref::<VigilError>() {
        return match err {
            VigilError::Config(_) => EXIT_CONFIG_ERROR,
            VigilError::Resource(_) => EXIT_RESOURCE_ERROR,
            VigilError::Rejected(_) => EXIT_REJECTED,
            VigilError::Other(inner) => get_exit_code(inner),
            VigilError::Internal(_) => EXIT_ERROR,
        };
    }

    if e.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG_ERROR;
    }
    if e.downcast_ref::<ResourceError>().is_some() {
        return EXIT_RESOURCE_ERROR;
    }
    if e.downcast_ref::<CycleRejected>().is_some() {
        return EXIT_REJECTED;
    }

    // toml / io errors surface through anyhow context only
    let msg = e.to_string().to_lowercase();
    if msg.contains("config") {
        return EXIT_CONFIG_ERROR;
    }

    EXIT_ERROR
}
