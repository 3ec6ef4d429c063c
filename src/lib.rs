//! Vigil - adaptive health monitoring and self-healing
//!
//! Watches a process's resources and error channels, classifies each reading
//! against per-domain thresholds, and runs prioritized recovery strategies
//! under cooldown, retry and single-flight rules.
//!
//! - **Sampling**: memory, CPU, connections, disk I/O, file handles, network,
//!   and windowed application error channels
//! - **Classification**: `normal` / `warning` / `critical` / `exhausted`
//! - **Recovery**: prioritized strategies, per-domain single-flight cycles
//! - **History**: bounded, time-windowed statistics per domain
//! - **Events**: lossy broadcast of every state change
//!
//! # Quick Start
//!
//! ```ignore
//! use vigil::{HealthMonitor, MonitorConfig};
//!
//! let config = MonitorConfig::load(None)?;
//! let monitor = HealthMonitor::builder(config)
//!     .system_providers()
//!     .default_strategies()
//!     .build()?;
//! monitor.start_all()?;
//! ```

pub mod cli;
pub mod config;
pub mod errors;
pub mod history;
pub mod observability;
pub mod resource;
pub mod self_healing;
pub mod supervision;

pub use config::{MonitorConfig, ThresholdSet};
pub use errors::{ConfigError, CycleRejected, ResourceError, VigilError};
pub use history::{HistoryEntry, HistoryQuery, HistoryStore, Statistics};
pub use resource::{Domain, ErrorKind, Snapshot, Status};
pub use self_healing::{CycleReport, RecoveryOutcome, Strategy};
pub use supervision::{HealthMonitor, MonitorBuilder, MonitorEvent, TickReport};

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Ask long-running commands to wind down.
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
