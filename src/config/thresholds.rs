use crate::errors::ConfigError;
use crate::resource::{Domain, ErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Usage ratios at which a domain moves to the next status.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    pub warning: f64,
    pub critical: f64,
    pub exhausted: f64,
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self {
            warning: 0.75,
            critical: 0.85,
            exhausted: 0.95,
        }
    }
}

impl ThresholdSet {
    pub fn new(warning: f64, critical: f64, exhausted: f64) -> Self {
        Self {
            warning,
            critical,
            exhausted,
        }
    }

    /// Enforce `0 <= warning < critical < exhausted <= 1`.
    pub fn validate(&self, domain: &str) -> Result<(), ConfigError> {
        let ordered = 0.0 <= self.warning
            && self.warning < self.critical
            && self.critical < self.exhausted
            && self.exhausted <= 1.0;

        if ordered {
            Ok(())
        } else {
            Err(ConfigError::InvalidThresholds {
                domain: domain.to_string(),
                warning: self.warning,
                critical: self.critical,
                exhausted: self.exhausted,
            })
        }
    }
}

/// Built-in per-domain thresholds.
pub fn default_domain_thresholds() -> BTreeMap<Domain, ThresholdSet> {
    let mut map = BTreeMap::new();
    map.insert(Domain::Memory, ThresholdSet::new(0.75, 0.85, 0.95));
    map.insert(Domain::Cpu, ThresholdSet::new(0.80, 0.90, 0.98));
    map.insert(Domain::Connections, ThresholdSet::new(0.70, 0.85, 0.95));
    map.insert(Domain::DiskIo, ThresholdSet::new(0.70, 0.85, 0.95));
    map.insert(Domain::FileHandles, ThresholdSet::new(0.70, 0.85, 0.95));
    map.insert(Domain::Network, ThresholdSet::new(0.80, 0.90, 0.98));
    // error channels: ratio is errors-in-window over the error budget
    map.insert(
        Domain::Errors(ErrorKind::AiService),
        ThresholdSet::new(0.25, 0.50, 0.90),
    );
    map
}
